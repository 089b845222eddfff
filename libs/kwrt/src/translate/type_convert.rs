// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Conversions from `wasmparser` types to the types of this crate.
//!
//! Anything outside of the core instruction set (SIMD, GC and typed function
//! references, memory64, shared memories, custom page sizes) is rejected here.

use alloc::vec::Vec;

use crate::errors::wasm_unsupported;
use crate::types::{FuncType, GlobalType, MemoryType, Mutability, RefType, TableType, ValType};

pub fn convert_val_type(ty: wasmparser::ValType) -> crate::Result<ValType> {
    use wasmparser::ValType as V;
    Ok(match ty {
        V::I32 => ValType::I32,
        V::I64 => ValType::I64,
        V::F32 => ValType::F32,
        V::F64 => ValType::F64,
        V::Ref(ty) => convert_ref_type(ty)?.into(),
        V::V128 => return Err(wasm_unsupported!("SIMD value type v128")),
    })
}

pub fn convert_ref_type(ty: wasmparser::RefType) -> crate::Result<RefType> {
    if !ty.is_nullable() {
        return Err(wasm_unsupported!("non-nullable reference type {ty}"));
    }
    convert_heap_type(ty.heap_type())
}

pub fn convert_heap_type(ty: wasmparser::HeapType) -> crate::Result<RefType> {
    use wasmparser::{AbstractHeapType, HeapType};
    match ty {
        HeapType::Abstract {
            shared: false,
            ty: AbstractHeapType::Func,
        } => Ok(RefType::Func),
        HeapType::Abstract {
            shared: false,
            ty: AbstractHeapType::Extern,
        } => Ok(RefType::Extern),
        ty => Err(wasm_unsupported!("heap type {ty:?}")),
    }
}

pub fn convert_func_type(ty: &wasmparser::FuncType) -> crate::Result<FuncType> {
    let params = ty
        .params()
        .iter()
        .map(|ty| convert_val_type(*ty))
        .collect::<crate::Result<Vec<_>>>()?;
    let results = ty
        .results()
        .iter()
        .map(|ty| convert_val_type(*ty))
        .collect::<crate::Result<Vec<_>>>()?;
    Ok(FuncType::new(params, results))
}

pub fn convert_global_type(ty: &wasmparser::GlobalType) -> crate::Result<GlobalType> {
    if ty.shared {
        return Err(wasm_unsupported!("shared globals"));
    }
    let mutability = if ty.mutable {
        Mutability::Var
    } else {
        Mutability::Const
    };
    Ok(GlobalType::new(convert_val_type(ty.content_type)?, mutability))
}

pub fn convert_table_type(ty: &wasmparser::TableType) -> crate::Result<TableType> {
    if ty.table64 {
        return Err(wasm_unsupported!("64-bit tables"));
    }
    if ty.shared {
        return Err(wasm_unsupported!("shared tables"));
    }
    Ok(TableType::new(
        convert_ref_type(ty.element_type)?,
        limit(ty.initial)?,
        ty.maximum.map(limit).transpose()?,
    ))
}

pub fn convert_memory_type(ty: &wasmparser::MemoryType) -> crate::Result<MemoryType> {
    if ty.memory64 {
        return Err(wasm_unsupported!("64-bit memories"));
    }
    if ty.shared {
        return Err(wasm_unsupported!("shared memories"));
    }
    if ty.page_size_log2.is_some() {
        return Err(wasm_unsupported!("custom page sizes"));
    }
    Ok(MemoryType::new(
        limit(ty.initial)?,
        ty.maximum.map(limit).transpose()?,
    ))
}

fn limit(value: u64) -> crate::Result<u32> {
    u32::try_from(value).map_err(|_| wasm_unsupported!("limit {value} exceeds 32 bits"))
}
