// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(unused, reason = "not used by all tests")]

use kwrt::{Backend, Config, Engine, Instance, Linker, Module, Store, Val};

pub const BACKENDS: [Backend; 2] = [Backend::Interpreter, Backend::Aot];

pub fn engine(backend: Backend) -> Engine {
    let mut config = Config::new();
    config.backend(backend);
    Engine::new(config)
}

/// Instantiates `wat` with no imports on `backend`.
pub fn instantiate(backend: Backend, wat: &str) -> (Store, Instance) {
    let engine = engine(backend);
    instantiate_with(&engine, &Linker::new(&engine), wat)
}

pub fn instantiate_with(engine: &Engine, linker: &Linker, wat: &str) -> (Store, Instance) {
    let bytes = wat::parse_str(wat).unwrap();
    let module = Module::from_bytes(engine, &bytes).unwrap();
    let mut store = Store::new(engine);
    let instance = linker.instantiate(&mut store, &module).unwrap();
    (store, instance)
}

pub fn call(store: &mut Store, instance: Instance, name: &str, args: &[Val]) -> kwrt::Result<Vec<Val>> {
    let func = instance
        .get_func(store, name)
        .unwrap_or_else(|| panic!("missing export {name}"));
    func.call(store, args)
}
