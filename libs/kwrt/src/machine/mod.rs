// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Execution backends.
//!
//! A [`Machine`] executes the locally defined functions of one instance. Both
//! backends share the numeric semantics in [`crate::ops`], the bulk operations
//! in [`crate::builtins`] and the helpers in this module, so they can only
//! differ in how they walk control flow.

mod aot;
mod interpreter;

use alloc::sync::Arc;
use alloc::vec::Vec;

pub(crate) use aot::AotMachine;
pub(crate) use interpreter::Interpreter;

use crate::config::{Backend, Config};
use crate::errors::Error;
use crate::exec_stack::OperandStack;
use crate::func::Func;
use crate::indices::{FuncIndex, GlobalIndex, TableIndex, TypeIndex};
use crate::instance::Instance;
use crate::store::Store;
use crate::translate::{Instruction, LoadKind, MemArg, StoreKind, TranslatedModule};
use crate::trap::{FrameInfo, Trap};
use crate::values::Val;

/// The calling contract shared by every execution backend.
pub trait Machine: Send + Sync {
    /// Calls the locally defined function `func` of `instance` with arguments
    /// that have already been checked against its type.
    ///
    /// # Errors
    ///
    /// Returns the trap raised by the call, annotated with a backtrace when the
    /// backend tracks frames, or the error a host function reported.
    fn call(
        &self,
        store: &mut Store,
        instance: Instance,
        func: FuncIndex,
        args: &[Val],
    ) -> crate::Result<Vec<Val>>;

    /// The frames of `instance` that are currently executing, innermost first.
    fn stack_trace(&self, store: &Store, instance: Instance) -> Vec<FrameInfo>;
}

/// Observes every instruction the interpreter executes.
pub trait ExecutionListener: Send + Sync {
    /// Called before `instr` at position `pc` of `func` executes, with the
    /// operand stack as it is at that point.
    fn on_instruction(&self, func: FuncIndex, pc: usize, instr: &Instruction, stack: &OperandStack);
}

/// Builds the machine configured for `module`.
///
/// # Errors
///
/// The ahead-of-time backend fails with `Error::Compile` or
/// `Error::Verification` if a function cannot be compiled.
pub(crate) fn build(config: &Config, module: &TranslatedModule) -> crate::Result<Arc<dyn Machine>> {
    Ok(match config.get_backend() {
        Backend::Interpreter => Arc::new(Interpreter::new(config)),
        Backend::Aot => Arc::new(AotMachine::compile(config, module)?),
    })
}

/// Enters a new WebAssembly frame.
pub(crate) fn enter_frame(store: &mut Store, max_call_depth: u32) -> Result<(), Trap> {
    if store.depth >= max_call_depth {
        return Err(Trap::StackOverflow);
    }
    store.depth += 1;
    Ok(())
}

/// Leaves a frame entered with [`enter_frame`].
pub(crate) fn exit_frame(store: &mut Store) {
    store.depth = store.depth.saturating_sub(1);
}

/// Calls `func` with raw arguments on behalf of `caller`, boxing arguments and
/// results into [`Val`]s.
///
/// This is the calling convention for imported functions and functions of other
/// instances.
pub(crate) fn call_boxed(
    store: &mut Store,
    caller: Instance,
    func: Func,
    args: &[u64],
) -> crate::Result<Vec<u64>> {
    let ty = func.ty(store);
    let args: Vec<Val> = ty
        .params()
        .iter()
        .zip(args)
        .map(|(ty, raw)| Val::from_raw(*raw, *ty))
        .collect();
    let results = func.call_unchecked(store, Some(caller), &args)?;
    Ok(results.iter().map(Val::to_raw).collect())
}

/// Resolves the target of a `call_indirect` through slot `index` of `table`.
///
/// # Errors
///
/// Traps with "undefined element" for out of range or null slots and with
/// "indirect call type mismatch" if the function doesn't have type `ty`.
pub(crate) fn indirect_target(
    store: &Store,
    instance: Instance,
    ty: TypeIndex,
    table: TableIndex,
    index: u32,
) -> crate::Result<Func> {
    let table = instance.table(store, table)?;
    let raw = store[table.0]
        .get_raw(index)
        .map_err(|_| Trap::UndefinedElement)?;
    let func = Func::from_raw(raw).ok_or(Trap::UndefinedElement)?;

    let expected = instance.func_type(store, ty)?;
    if func.ty_ref(store) != expected {
        return Err(Trap::IndirectCallTypeMismatch.into());
    }
    Ok(func)
}

#[inline]
pub(crate) fn global_get(store: &Store, instance: Instance, index: GlobalIndex) -> crate::Result<u64> {
    let global = instance.global(store, index)?;
    Ok(store[global.0].get_raw())
}

#[inline]
pub(crate) fn global_set(
    store: &mut Store,
    instance: Instance,
    index: GlobalIndex,
    value: u64,
) -> crate::Result<()> {
    let global = instance.global(store, index)?;
    store[global.0].set_raw(value);
    Ok(())
}

#[inline]
pub(crate) fn mem_load(
    store: &Store,
    instance: Instance,
    kind: LoadKind,
    memarg: MemArg,
    addr: u64,
) -> crate::Result<u64> {
    let memory = instance.memory(store)?;
    let bytes = store[memory.0].load(addr as u32, memarg.offset, kind.width())?;
    Ok(kind.extend(bytes))
}

#[inline]
pub(crate) fn mem_store(
    store: &mut Store,
    instance: Instance,
    kind: StoreKind,
    memarg: MemArg,
    addr: u64,
    value: u64,
) -> crate::Result<()> {
    let memory = instance.memory(store)?;
    store[memory.0].store(addr as u32, memarg.offset, kind.width(), value)?;
    Ok(())
}

#[inline]
pub(crate) fn ref_func(store: &Store, instance: Instance, func: FuncIndex) -> crate::Result<u64> {
    Ok(instance.func(store, func)?.to_raw())
}

/// Decodes the raw results of a call of type `results`.
pub(crate) fn box_results(results: &[crate::types::ValType], raw: &[u64]) -> crate::Result<Vec<Val>> {
    if results.len() != raw.len() {
        return Err(Error::Invalid("result count does not match function type".into()));
    }
    Ok(results
        .iter()
        .zip(raw)
        .map(|(ty, raw)| Val::from_raw(*raw, *ty))
        .collect())
}
