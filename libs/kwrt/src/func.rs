// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::errors::Error;
use crate::indices::FuncIndex;
use crate::instance::Instance;
use crate::store::{Store, Stored};
use crate::types::FuncType;
use crate::values::Val;
use crate::Extern;

/// The signature of host-implemented functions.
///
/// Host functions receive the calling context and the boxed arguments and return
/// the boxed results. Any error they return is surfaced as a
/// [`Trap::HostFunctionFailed`](crate::Trap::HostFunctionFailed) trap that keeps
/// the error as its cause.
pub type HostFunc = dyn Fn(Caller<'_>, &[Val]) -> anyhow::Result<Vec<Val>> + Send + Sync;

/// A WebAssembly or host function owned by a [`Store`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Func(pub(crate) Stored<FuncData>);

pub struct FuncData {
    ty: FuncType,
    kind: FuncKind,
}

#[derive(Clone)]
pub(crate) enum FuncKind {
    /// A function defined by a WebAssembly instance.
    Wasm { instance: Instance, index: FuncIndex },
    /// A function implemented by the host.
    Host(Arc<HostFunc>),
}

impl fmt::Debug for FuncData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("FuncData");
        s.field("ty", &self.ty);
        match &self.kind {
            FuncKind::Wasm { instance, index } => s.field("instance", instance).field("index", index),
            FuncKind::Host(_) => s.field("host", &true),
        };
        s.finish()
    }
}

/// The context handed to host functions.
pub struct Caller<'a> {
    store: &'a mut Store,
    instance: Option<Instance>,
}

impl<'a> Caller<'a> {
    pub(crate) fn new(store: &'a mut Store, instance: Option<Instance>) -> Self {
        Self { store, instance }
    }

    /// The store the call happens in.
    pub fn store(&mut self) -> &mut Store {
        &mut *self.store
    }

    /// The instance whose code called this function, or `None` for calls made
    /// directly by the host.
    pub fn instance(&self) -> Option<Instance> {
        self.instance
    }

    /// Looks up an export of the calling instance.
    pub fn get_export(&self, name: &str) -> Option<Extern> {
        self.instance?.get_export(&*self.store, name)
    }
}

// ===== impl Func =====

impl Func {
    /// Creates a new host function with the given signature.
    pub fn new<F>(store: &mut Store, ty: FuncType, func: F) -> Func
    where
        F: Fn(Caller<'_>, &[Val]) -> anyhow::Result<Vec<Val>> + Send + Sync + 'static,
    {
        Self::from_host(store, ty, Arc::new(func))
    }

    pub(crate) fn from_host(store: &mut Store, ty: FuncType, func: Arc<HostFunc>) -> Func {
        Func(store.add_function(FuncData {
            ty,
            kind: FuncKind::Host(func),
        }))
    }

    pub(crate) fn from_wasm(
        store: &mut Store,
        instance: Instance,
        index: FuncIndex,
        ty: FuncType,
    ) -> Func {
        Func(store.add_function(FuncData {
            ty,
            kind: FuncKind::Wasm { instance, index },
        }))
    }

    /// The type of this function.
    pub fn ty(self, store: &Store) -> FuncType {
        store[self.0].ty.clone()
    }

    pub(crate) fn ty_ref(self, store: &Store) -> &FuncType {
        &store[self.0].ty
    }

    pub fn matches_ty(self, store: &Store, ty: &FuncType) -> bool {
        store[self.0].ty == *ty
    }

    pub(crate) fn kind(self, store: &Store) -> &FuncKind {
        &store[self.0].kind
    }

    /// The defining instance and index if this is a WebAssembly function.
    pub(crate) fn wasm_target(self, store: &Store) -> Option<(Instance, FuncIndex)> {
        match store[self.0].kind {
            FuncKind::Wasm { instance, index } => Some((instance, index)),
            FuncKind::Host(_) => None,
        }
    }

    /// Calls this function with the given arguments.
    ///
    /// # Errors
    ///
    /// Fails if the arguments don't match the function's parameters, if the call
    /// traps, or if a host function reports an error.
    pub fn call(self, store: &mut Store, params: &[Val]) -> crate::Result<Vec<Val>> {
        check_values(self.ty_ref(store).params(), params, "argument")?;
        self.call_unchecked(store, None, params)
    }

    /// Calls this function without checking the arguments, on behalf of `caller`.
    pub(crate) fn call_unchecked(
        self,
        store: &mut Store,
        caller: Option<Instance>,
        params: &[Val],
    ) -> crate::Result<Vec<Val>> {
        match self.kind(store).clone() {
            FuncKind::Wasm { instance, index } => {
                let machine = instance.machine(store)?;
                machine.call(store, instance, index, params)
            }
            FuncKind::Host(func) => {
                let results = func(Caller::new(store, caller), params)
                    .map_err(Error::host)?;
                check_values(self.ty_ref(store).results(), &results, "result")?;
                Ok(results)
            }
        }
    }

    /// Encodes this function as a non-null raw reference cell.
    pub(crate) fn to_raw(self) -> u64 {
        self.0.index() as u64 + 1
    }

    /// Decodes a raw reference cell, zero being the null reference.
    pub(crate) fn from_raw(raw: u64) -> Option<Func> {
        raw.checked_sub(1)
            .map(|index| Func(Stored::new(index as usize)))
    }
}

/// Checks count and types of values crossing the host boundary.
pub(crate) fn check_values(
    expected: &[crate::types::ValType],
    actual: &[Val],
    what: &str,
) -> crate::Result<()> {
    if expected.len() != actual.len() {
        return Err(Error::Invalid(format!(
            "expected {} {what}s, got {}",
            expected.len(),
            actual.len()
        )));
    }
    for (ty, val) in expected.iter().zip(actual) {
        val.ty().ensure_matches(*ty)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValType;
    use crate::Engine;

    #[test]
    fn host_functions_check_arguments() {
        let mut store = Store::new(&Engine::default());
        let add = Func::new(
            &mut store,
            FuncType::new([ValType::I32, ValType::I32], [ValType::I32]),
            |_caller, args| Ok(alloc::vec![Val::I32(args[0].unwrap_i32() + args[1].unwrap_i32())]),
        );

        assert_eq!(
            add.call(&mut store, &[Val::I32(1), Val::I32(2)]).unwrap(),
            [Val::I32(3)]
        );
        assert!(matches!(
            add.call(&mut store, &[Val::I32(1)]),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            add.call(&mut store, &[Val::I32(1), Val::I64(2)]),
            Err(Error::TypeMismatch {
                expected: ValType::I32,
                actual: ValType::I64
            })
        ));
    }

    #[test]
    fn host_errors_are_wrapped() {
        let mut store = Store::new(&Engine::default());
        let fail = Func::new(&mut store, FuncType::new([], []), |_caller, _args| {
            Err(anyhow::anyhow!("host failure"))
        });

        let err = fail.call(&mut store, &[]).unwrap_err();
        assert_eq!(err.trap(), Some(crate::Trap::HostFunctionFailed));
        assert_eq!(
            core::error::Error::source(&err).unwrap().to_string(),
            "host failure"
        );
    }

    #[test]
    fn raw_encoding_reserves_null() {
        assert_eq!(Func::from_raw(0), None);
        let func = Func(Stored::new(4));
        assert_eq!(Func::from_raw(func.to_raw()), Some(func));
    }
}
