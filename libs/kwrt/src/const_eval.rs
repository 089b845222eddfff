// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::format;

use smallvec::SmallVec;

use crate::errors::Error;
use crate::func::Func;
use crate::global::Global;
use crate::store::Store;
use crate::translate::{ConstExpr, ConstOp, TranslatedModule};
use crate::types::{EntityKind, ValType};

/// The resolved entities a constant expression may refer to.
pub(crate) struct ConstEvalContext<'a> {
    pub store: &'a Store,
    pub module: &'a TranslatedModule,
    /// Handles of all globals resolved so far, imports first.
    pub globals: &'a [Global],
    /// Handles of all functions, imports first.
    pub funcs: &'a [Func],
}

/// Simple interpreter for constant expressions.
///
/// Permitted are numeric constants, `ref.null`, `ref.func` and `global.get` of an
/// imported immutable global, producing exactly one value.
#[derive(Debug, Default)]
pub(crate) struct ConstExprEvaluator {
    stack: SmallVec<[(u64, ValType); 2]>,
}

impl ConstExprEvaluator {
    /// Evaluate a `ConstExpr` returning the raw result cell.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConstExpr` for operators outside the permitted set,
    /// for expressions that don't produce exactly one value, and for reads of
    /// locally defined or mutable globals. Returns a type mismatch if the value
    /// is not of type `expected`.
    pub fn eval(
        &mut self,
        ctx: &ConstEvalContext<'_>,
        expr: &ConstExpr,
        expected: ValType,
    ) -> crate::Result<u64> {
        self.stack.clear();

        for op in expr.ops() {
            if !self.stack.is_empty() {
                return Err(Error::InvalidConstExpr(
                    "constant expression must produce exactly one value".into(),
                ));
            }

            let value = match op {
                ConstOp::I32Const(value) => (u64::from(value as u32), ValType::I32),
                ConstOp::I64Const(value) => (value as u64, ValType::I64),
                ConstOp::F32Const(bits) => (u64::from(bits), ValType::F32),
                ConstOp::F64Const(bits) => (bits, ValType::F64),
                ConstOp::RefNull(ty) => (0, ty.into()),
                ConstOp::RefFunc(index) => {
                    let func = ctx
                        .funcs
                        .get(index.as_u32() as usize)
                        .ok_or_else(|| Error::unknown(EntityKind::Function, index.as_u32()))?;
                    (func.to_raw(), ValType::FuncRef)
                }
                ConstOp::GlobalGet(index) => {
                    if !ctx.module.globals.is_valid(index) {
                        return Err(Error::unknown(EntityKind::Global, index.as_u32()));
                    }
                    if !ctx.module.is_imported_global(index) {
                        return Err(Error::InvalidConstExpr(format!(
                            "global.get {} can only reference an imported global",
                            index.as_u32()
                        )));
                    }
                    let global = ctx.globals[index.as_u32() as usize];
                    let ty = global.ty(ctx.store);
                    if ty.is_mutable() {
                        return Err(Error::InvalidConstExpr(format!(
                            "global.get {} cannot reference a mutable global",
                            index.as_u32()
                        )));
                    }
                    (ctx.store[global.0].get_raw(), ty.content())
                }
                ConstOp::I32Add
                | ConstOp::I32Sub
                | ConstOp::I32Mul
                | ConstOp::I64Add
                | ConstOp::I64Sub
                | ConstOp::I64Mul => {
                    return Err(Error::InvalidConstExpr(
                        "extended constant expressions are not supported".into(),
                    ));
                }
                ConstOp::Other { offset } => {
                    return Err(Error::InvalidConstExpr(format!(
                        "non-constant operator at offset {offset:#x}"
                    )));
                }
            };
            self.stack.push(value);
        }

        let Some((raw, ty)) = self.stack.pop() else {
            return Err(Error::InvalidConstExpr(
                "constant expression must produce exactly one value".into(),
            ));
        };
        ty.ensure_matches(expected)?;
        Ok(raw)
    }
}
