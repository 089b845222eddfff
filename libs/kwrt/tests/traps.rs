// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::{BACKENDS, call, instantiate, instantiate_with};
use kwrt::{Backend, Config, Engine, Error, Linker, Trap, Val};

const TRAPS: &str = r#"
(module
  (type $i (func (result i32)))
  (type $l (func (result i64)))
  (memory 1)
  (table 3 funcref)
  (elem (i32.const 0) $answer)
  (func $answer (result i32) i32.const 42)
  (func (export "unreachable") unreachable)
  (func (export "ok") (result i32) i32.const 7)
  (func (export "div") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.div_s)
  (func (export "trunc") (param f32) (result i32)
    local.get 0
    i32.trunc_f32_s)
  (func (export "indirect") (param i32) (result i32)
    local.get 0
    call_indirect (type $i))
  (func (export "mismatch") (result i64)
    i32.const 0
    call_indirect (type $l))
  (func (export "load") (param i32) (result i32)
    local.get 0
    i32.load)
  (func $forever (export "forever") (result i32)
    call $forever))
"#;

fn trap_of(result: kwrt::Result<Vec<Val>>) -> Trap {
    match result {
        Err(err) => err
            .trap()
            .unwrap_or_else(|| panic!("expected a trap, got {err}")),
        Ok(values) => panic!("expected a trap, got {values:?}"),
    }
}

#[test]
fn unreachable_leaves_the_instance_usable() {
    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, TRAPS);
        assert_eq!(
            trap_of(call(&mut store, instance, "unreachable", &[])),
            Trap::UnreachableCodeReached
        );
        assert_eq!(call(&mut store, instance, "ok", &[]).unwrap(), vec![Val::I32(7)]);
    }
}

#[test]
fn arithmetic_traps() {
    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, TRAPS);
        assert_eq!(
            trap_of(call(&mut store, instance, "div", &[Val::I32(1), Val::I32(0)])),
            Trap::IntegerDivisionByZero
        );
        assert_eq!(
            trap_of(call(&mut store, instance, "div", &[Val::I32(i32::MIN), Val::I32(-1)])),
            Trap::IntegerOverflow
        );
        assert_eq!(
            trap_of(call(&mut store, instance, "trunc", &[Val::F32(f32::NAN.to_bits())])),
            Trap::BadConversionToInteger
        );
        assert_eq!(
            trap_of(call(&mut store, instance, "trunc", &[Val::F32(3e9f32.to_bits())])),
            Trap::IntegerOverflow
        );
    }
}

#[test]
fn indirect_calls() {
    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, TRAPS);
        assert_eq!(
            call(&mut store, instance, "indirect", &[Val::I32(0)]).unwrap(),
            vec![Val::I32(42)]
        );
        assert_eq!(
            trap_of(call(&mut store, instance, "indirect", &[Val::I32(1)])),
            Trap::UndefinedElement
        );
        assert_eq!(
            trap_of(call(&mut store, instance, "indirect", &[Val::I32(5)])),
            Trap::UndefinedElement
        );
        assert_eq!(
            trap_of(call(&mut store, instance, "mismatch", &[])),
            Trap::IndirectCallTypeMismatch
        );
    }
}

#[test]
fn out_of_bounds_memory() {
    for backend in BACKENDS {
        let (mut store, instance) = instantiate(backend, TRAPS);
        assert_eq!(
            call(&mut store, instance, "load", &[Val::I32(65532)]).unwrap(),
            vec![Val::I32(0)]
        );
        assert_eq!(
            trap_of(call(&mut store, instance, "load", &[Val::I32(65533)])),
            Trap::MemoryOutOfBounds
        );
        assert_eq!(
            trap_of(call(&mut store, instance, "load", &[Val::I32(-1)])),
            Trap::MemoryOutOfBounds
        );
    }
}

#[test]
fn call_depth_is_bounded() {
    for backend in BACKENDS {
        let mut config = Config::new();
        config.backend(backend).max_call_depth(64);
        let engine = Engine::new(config);
        let (mut store, instance) = instantiate_with(&engine, &Linker::new(&engine), TRAPS);

        assert_eq!(
            trap_of(call(&mut store, instance, "forever", &[])),
            Trap::StackOverflow
        );
        // the depth counter is restored after the trap
        assert_eq!(call(&mut store, instance, "ok", &[]).unwrap(), vec![Val::I32(7)]);
    }
}

#[test]
fn interpreter_traps_carry_a_backtrace() {
    let (mut store, instance) = instantiate(Backend::Interpreter, TRAPS);
    let err = call(&mut store, instance, "div", &[Val::I32(1), Val::I32(0)]).unwrap_err();
    let Error::Trap { backtrace, .. } = err else {
        panic!("expected a trap, got {err}");
    };
    let frames = backtrace.frames();
    assert_eq!(frames.len(), 1);
    // local.get, local.get, i32.div_s
    assert_eq!(frames[0].instruction_offset, 2);
}
