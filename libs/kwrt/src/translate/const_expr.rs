// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use smallvec::SmallVec;

use crate::errors::wasm_unsupported;
use crate::indices::{FuncIndex, GlobalIndex};
use crate::translate::type_convert::convert_heap_type;
use crate::types::RefType;

/// A constant expression.
///
/// These are used to initialize globals, table elements, and segment offsets.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConstExpr {
    ops: SmallVec<[ConstOp; 2]>,
}

impl ConstExpr {
    /// Create a new const expression from a `wasmparser` const expression.
    ///
    /// Returns the new const expression as well as the escaping function
    /// indices that appeared in `ref.func` instructions, if any.
    pub fn from_wasmparser(
        expr: &wasmparser::ConstExpr<'_>,
    ) -> crate::Result<(Self, SmallVec<[FuncIndex; 1]>)> {
        let mut iter = expr
            .get_operators_reader()
            .into_iter_with_offsets()
            .peekable();

        let mut ops = SmallVec::<[ConstOp; 2]>::new();
        let mut escaped = SmallVec::<[FuncIndex; 1]>::new();
        while let Some(res) = iter.next() {
            let (op, offset) = res?;

            // The final `end` terminates the expression.
            if matches!(op, wasmparser::Operator::End) && iter.peek().is_none() {
                break;
            }

            if let wasmparser::Operator::RefFunc { function_index } = &op {
                escaped.push(FuncIndex::from_u32(*function_index));
            }

            ops.push(ConstOp::from_wasmparser(op, offset)?);
        }
        Ok((Self { ops }, escaped))
    }

    /// A single-op expression, used for the `ref.func` items of function element segments.
    pub fn ref_func(func: FuncIndex) -> Self {
        Self {
            ops: SmallVec::from_elem(ConstOp::RefFunc(func), 1),
        }
    }

    pub fn ops(&self) -> impl ExactSizeIterator<Item = ConstOp> + use<'_> {
        self.ops.iter().copied()
    }
}

/// Operators that may appear inside a constant expression.
///
/// Extended-constant arithmetic and any other operator are decoded so that
/// linking can reject them with a precise message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConstOp {
    I32Const(i32),
    I64Const(i64),
    F32Const(u32),
    F64Const(u64),
    GlobalGet(GlobalIndex),
    RefNull(RefType),
    RefFunc(FuncIndex),
    I32Add,
    I32Sub,
    I32Mul,
    I64Add,
    I64Sub,
    I64Mul,
    /// Any operator that is never constant, with its byte offset.
    Other { offset: usize },
}

impl ConstOp {
    /// Convert a `wasmparser::Operator` to a `ConstOp`.
    pub fn from_wasmparser(op: wasmparser::Operator<'_>, offset: usize) -> crate::Result<Self> {
        use wasmparser::Operator as O;
        Ok(match op {
            O::I32Const { value } => Self::I32Const(value),
            O::I64Const { value } => Self::I64Const(value),
            O::F32Const { value } => Self::F32Const(value.bits()),
            O::F64Const { value } => Self::F64Const(value.bits()),
            O::RefNull { hty } => Self::RefNull(convert_heap_type(hty)?),
            O::RefFunc { function_index } => Self::RefFunc(FuncIndex::from_u32(function_index)),
            O::GlobalGet { global_index } => Self::GlobalGet(GlobalIndex::from_u32(global_index)),
            O::I32Add => Self::I32Add,
            O::I32Sub => Self::I32Sub,
            O::I32Mul => Self::I32Mul,
            O::I64Add => Self::I64Add,
            O::I64Sub => Self::I64Sub,
            O::I64Mul => Self::I64Mul,
            O::RefI31 => {
                return Err(wasm_unsupported!(
                    "unsupported opcode in const expression at offset {offset:#x}: {op:?}",
                ));
            }
            _ => Self::Other { offset },
        })
    }
}
