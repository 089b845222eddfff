// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A WebAssembly 1.0 engine with an interpreter and an ahead-of-time closure
//! compiler sharing one store, one module representation and one set of
//! numeric semantics.

#![cfg_attr(not(test), no_std)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::float_arithmetic,
    clippy::float_cmp,
    reason = "raw 64-bit cells are reinterpreted as every WebAssembly value type"
)]

extern crate alloc;

mod builtins;
mod config;
mod const_eval;
mod engine;
mod errors;
mod exec_stack;
mod func;
mod global;
mod indices;
mod instance;
mod linker;
mod machine;
mod memory;
mod module;
mod ops;
mod store;
mod table;
mod translate;
mod trap;
mod types;
mod utils;
mod validate;
mod values;

pub use config::{Backend, Config, DEFAULT_MAX_CALL_DEPTH, InstantiateFlags};
pub use engine::Engine;
pub use errors::Error;
pub use exec_stack::{ArrayQueue, OperandStack};
pub use func::{Caller, Func, HostFunc};
pub use global::Global;
pub use indices::{
    DataIndex, DefinedFuncIndex, DefinedGlobalIndex, DefinedTableIndex, ElemIndex, EntityIndex,
    FuncIndex, GlobalIndex, MemoryIndex, TableIndex, TypeIndex,
};
pub use instance::{Export, Instance};
pub use linker::Linker;
pub use machine::ExecutionListener;
pub use memory::{Memory, WASM_PAGE_SIZE, WASM32_MAX_PAGES};
pub use module::Module;
pub use store::Store;
pub use table::Table;
pub use translate::{
    BlockType, ConstExpr, ConstOp, DataKind, DataSegment, ElementKind, ElementSegment,
    FunctionBody, Import, Instruction, LoadKind, MemArg, NumericOp, StoreKind, TranslatedModule,
};
pub use trap::{FrameInfo, Trap, WasmBacktrace};
pub use types::{
    EntityKind, EntityType, FuncType, GlobalType, Limits, MemoryType, Mutability, RefType,
    TableType, ValType,
};
pub use values::{Ref, Val};

use crate::utils::{enum_accessors, owned_enum_accessors};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A WebAssembly external value which is just any type that can be imported or exported between modules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extern {
    /// A WebAssembly `func` which can be called.
    Func(Func),
    /// A WebAssembly `table` which is an array of `Ref` values.
    Table(Table),
    /// A WebAssembly linear memory.
    Memory(Memory),
    /// A WebAssembly `global` which acts like a `Cell<T>` of sorts.
    Global(Global),
}

impl Extern {
    enum_accessors! {
        e
        (Func(Func) is_func get_func unwrap_func *e)
        (Table(Table) is_table get_table unwrap_table *e)
        (Memory(Memory) is_memory get_memory unwrap_memory *e)
        (Global(Global) is_global get_global unwrap_global *e)
    }

    owned_enum_accessors! {
        e
        (Func(Func) into_func e)
        (Table(Table) into_table e)
        (Memory(Memory) into_memory e)
        (Global(Global) into_global e)
    }

    /// Returns the kind of entity this is.
    pub fn kind(&self) -> EntityKind {
        match self {
            Extern::Func(_) => EntityKind::Function,
            Extern::Table(_) => EntityKind::Table,
            Extern::Memory(_) => EntityKind::Memory,
            Extern::Global(_) => EntityKind::Global,
        }
    }

    /// Returns the type of this external value as seen by an importing module.
    pub fn ty(&self, store: &Store) -> EntityType {
        match self {
            Extern::Func(f) => EntityType::Function(f.ty(store)),
            Extern::Table(t) => EntityType::Table(t.ty(store)),
            Extern::Memory(m) => EntityType::Memory(m.ty(store)),
            Extern::Global(g) => EntityType::Global(g.ty(store)),
        }
    }
}

impl From<Func> for Extern {
    fn from(f: Func) -> Self {
        Extern::Func(f)
    }
}

impl From<Table> for Extern {
    fn from(t: Table) -> Self {
        Extern::Table(t)
    }
}

impl From<Memory> for Extern {
    fn from(m: Memory) -> Self {
        Extern::Memory(m)
    }
}

impl From<Global> for Extern {
    fn from(g: Global) -> Self {
        Extern::Global(g)
    }
}
