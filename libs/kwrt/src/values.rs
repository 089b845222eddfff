// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::func::Func;
use crate::types::{RefType, ValType};
use crate::utils::{enum_accessors, owned_enum_accessors};

/// Possible runtime values that a WebAssembly module can either consume or
/// produce.
///
/// Note that we inline the `enum Ref { ... }` variants into `enum Val { ... }`
/// here as a size optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Val {
    /// A 32-bit integer.
    I32(i32),

    /// A 64-bit integer.
    I64(i64),

    /// A 32-bit float.
    ///
    /// Note that the raw bits of the float are stored here, and you can use
    /// `f32::from_bits` to create an `f32` value.
    F32(u32),

    /// A 64-bit float.
    ///
    /// Note that the raw bits of the float are stored here, and you can use
    /// `f64::from_bits` to create an `f64` value.
    F64(u64),

    /// A function reference.
    FuncRef(Option<Func>),

    /// An opaque host reference.
    ExternRef(Option<u32>),
}

/// A reference value, as stored in tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ref {
    /// A first-class reference to a WebAssembly or host function.
    Func(Option<Func>),
    /// A reference to a value outside of the Wasm heap, identified by a host-chosen id.
    Extern(Option<u32>),
}

// === impl Val ===

impl Val {
    /// Returns the null reference for the given reference type.
    #[inline]
    pub fn null_ref(ty: RefType) -> Val {
        Ref::null(ty).into()
    }

    /// Returns the default (zero or null) value for the given type.
    pub fn default_for_ty(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            ValType::FuncRef => Val::FuncRef(None),
            ValType::ExternRef => Val::ExternRef(None),
        }
    }

    /// Returns the corresponding [`ValType`] for this `Val`.
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
            Val::FuncRef(_) => ValType::FuncRef,
            Val::ExternRef(_) => ValType::ExternRef,
        }
    }

    /// Encodes this value into the untyped 64-bit cell representation used by the
    /// execution machines.
    ///
    /// Integers are zero-extended, floats keep their bit pattern and references
    /// are encoded as `id + 1`, with zero being the null reference.
    pub fn to_raw(&self) -> u64 {
        match *self {
            Val::I32(v) => u64::from(v as u32),
            Val::I64(v) => v as u64,
            Val::F32(bits) => u64::from(bits),
            Val::F64(bits) => bits,
            Val::FuncRef(func) => func.map_or(0, Func::to_raw),
            Val::ExternRef(ext) => ext.map_or(0, |id| u64::from(id) + 1),
        }
    }

    /// Decodes a raw cell produced by [`Val::to_raw`] as a value of type `ty`.
    pub fn from_raw(raw: u64, ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(raw as u32 as i32),
            ValType::I64 => Val::I64(raw as i64),
            ValType::F32 => Val::F32(raw as u32),
            ValType::F64 => Val::F64(raw),
            ValType::FuncRef => Val::FuncRef(Func::from_raw(raw)),
            ValType::ExternRef => Val::ExternRef(raw.checked_sub(1).map(|id| id as u32)),
        }
    }

    /// Returns the `f32` stored in this value, if it is one.
    pub fn f32(&self) -> Option<f32> {
        if let Val::F32(bits) = self {
            Some(f32::from_bits(*bits))
        } else {
            None
        }
    }

    /// Returns the `f64` stored in this value, if it is one.
    pub fn f64(&self) -> Option<f64> {
        if let Val::F64(bits) = self {
            Some(f64::from_bits(*bits))
        } else {
            None
        }
    }

    /// Returns this value as a table reference, if it is one.
    pub fn ref_(&self) -> Option<Ref> {
        match *self {
            Val::FuncRef(f) => Some(Ref::Func(f)),
            Val::ExternRef(e) => Some(Ref::Extern(e)),
            _ => None,
        }
    }

    enum_accessors! {
        e
        (I32(i32) is_i32 i32 unwrap_i32 *e)
        (I64(i64) is_i64 i64 unwrap_i64 *e)
        (FuncRef(Option<Func>) is_func_ref func_ref unwrap_func_ref *e)
        (ExternRef(Option<u32>) is_extern_ref extern_ref unwrap_extern_ref *e)
    }

    owned_enum_accessors! {
        e
        (I32(i32) into_i32 e)
        (I64(i64) into_i64 e)
    }
}

impl From<i32> for Val {
    fn from(v: i32) -> Self {
        Val::I32(v)
    }
}

impl From<i64> for Val {
    fn from(v: i64) -> Self {
        Val::I64(v)
    }
}

impl From<f32> for Val {
    fn from(v: f32) -> Self {
        Val::F32(v.to_bits())
    }
}

impl From<f64> for Val {
    fn from(v: f64) -> Self {
        Val::F64(v.to_bits())
    }
}

impl From<Func> for Val {
    fn from(f: Func) -> Self {
        Val::FuncRef(Some(f))
    }
}

impl From<Ref> for Val {
    fn from(r: Ref) -> Self {
        match r {
            Ref::Func(f) => Val::FuncRef(f),
            Ref::Extern(e) => Val::ExternRef(e),
        }
    }
}

// === impl Ref ===

impl Ref {
    pub fn null(ty: RefType) -> Ref {
        match ty {
            RefType::Func => Ref::Func(None),
            RefType::Extern => Ref::Extern(None),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Ref::Func(None) | Ref::Extern(None))
    }

    pub fn ty(&self) -> RefType {
        match self {
            Ref::Func(_) => RefType::Func,
            Ref::Extern(_) => RefType::Extern,
        }
    }

    pub fn to_raw(&self) -> u64 {
        Val::from(*self).to_raw()
    }

    pub fn from_raw(raw: u64, ty: RefType) -> Ref {
        match Val::from_raw(raw, ty.into()) {
            Val::FuncRef(f) => Ref::Func(f),
            Val::ExternRef(e) => Ref::Extern(e),
            _ => unreachable!("reference types decode to references"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_cells_keep_bit_patterns() {
        assert_eq!(Val::I32(-1).to_raw(), 0xffff_ffff);
        assert_eq!(Val::from_raw(0xffff_ffff, ValType::I32), Val::I32(-1));
        assert_eq!(Val::from_raw(u64::MAX, ValType::I64), Val::I64(-1));

        let nan = f32::from_bits(0x7fc0_0001);
        assert_eq!(Val::from(nan).to_raw(), 0x7fc0_0001);
    }

    #[test]
    fn null_references_are_zero() {
        assert_eq!(Val::null_ref(RefType::Func).to_raw(), 0);
        assert_eq!(Val::null_ref(RefType::Extern).to_raw(), 0);
        assert_eq!(Val::ExternRef(Some(0)).to_raw(), 1);
        assert_eq!(Val::from_raw(1, ValType::ExternRef), Val::ExternRef(Some(0)));
        assert!(Ref::from_raw(0, RefType::Func).is_null());
    }
}
