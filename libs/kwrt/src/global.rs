// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::errors::Error;
use crate::instance::Instance;
use crate::store::{Store, Stored};
use crate::types::{GlobalType, Mutability};
use crate::values::Val;

/// A global variable owned by a [`Store`].
///
/// Instances that import a global share the same handle, so mutations are
/// visible across the import boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Global(pub(crate) Stored<GlobalData>);

#[derive(Debug)]
pub struct GlobalData {
    ty: GlobalType,
    value: u64,
    owner: Option<Instance>,
}

impl GlobalData {
    #[inline]
    pub(crate) fn get_raw(&self) -> u64 {
        self.value
    }

    #[inline]
    pub(crate) fn set_raw(&mut self, value: u64) {
        self.value = value;
    }

    #[inline]
    pub(crate) fn ty(&self) -> GlobalType {
        self.ty
    }
}

impl Global {
    /// Creates a new host-owned global.
    ///
    /// # Errors
    ///
    /// Returns a type mismatch error if `init` doesn't have the global's content type.
    pub fn new(store: &mut Store, ty: GlobalType, init: Val) -> crate::Result<Global> {
        init.ty().ensure_matches(ty.content())?;
        Ok(Self::new_raw(store, ty, init.to_raw(), None))
    }

    pub(crate) fn new_raw(
        store: &mut Store,
        ty: GlobalType,
        value: u64,
        owner: Option<Instance>,
    ) -> Global {
        Global(store.add_global(GlobalData { ty, value, owner }))
    }

    pub fn ty(self, store: &Store) -> GlobalType {
        store[self.0].ty
    }

    /// The instance that defined this global, `None` for host-created globals.
    pub fn owner(self, store: &Store) -> Option<Instance> {
        store[self.0].owner
    }

    /// Reads the current value.
    pub fn get(self, store: &Store) -> Val {
        let data = &store[self.0];
        Val::from_raw(data.value, data.ty.content())
    }

    /// Writes a new value.
    ///
    /// # Errors
    ///
    /// Fails if the global is immutable or `val` has the wrong type.
    pub fn set(self, store: &mut Store, val: Val) -> crate::Result<()> {
        let data = &mut store[self.0];
        if data.ty.mutability() != Mutability::Var {
            return Err(Error::Invalid("immutable global cannot be set".into()));
        }
        val.ty().ensure_matches(data.ty.content())?;
        data.value = val.to_raw();
        Ok(())
    }
}
