// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Load-time verification of lowered functions.
//!
//! Checks that every slot an op touches lies within the frame, that jumps
//! land inside the function, and that calls and builtins agree with the
//! signatures they're bound to. Loading never proceeds past a failed check.

use alloc::format;
use alloc::string::String;

use super::lower::{Jump, LoweredFunction, Move, Op, Slot};
use crate::errors::Error;
use crate::translate::TranslatedModule;

struct Verifier<'a> {
    module: &'a TranslatedModule,
    function: &'a LoweredFunction,
}

pub(super) fn verify(module: &TranslatedModule, function: &LoweredFunction) -> crate::Result<()> {
    if function.num_params > function.num_locals() {
        return Err(verification_error(function, "more parameters than locals"));
    }
    if function.results_base() + function.num_results > function.frame_size {
        return Err(verification_error(function, "results exceed the frame"));
    }

    let verifier = Verifier { module, function };
    for op in &function.body {
        verifier.op(op)?;
    }
    Ok(())
}

fn verification_error(function: &LoweredFunction, message: impl Into<String>) -> Error {
    Error::Verification {
        func: function.func,
        message: message.into(),
    }
}

impl Verifier<'_> {
    fn error(&self, message: impl Into<String>) -> Error {
        verification_error(self.function, message)
    }

    fn slot(&self, slot: Slot) -> crate::Result<()> {
        if slot < self.function.frame_size {
            Ok(())
        } else {
            Err(self.error(format!(
                "slot {slot} outside of frame of size {}",
                self.function.frame_size
            )))
        }
    }

    fn range(&self, start: Slot, count: u32) -> crate::Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.function.frame_size => Ok(()),
            _ => Err(self.error(format!(
                "slots {start}..{start}+{count} outside of frame of size {}",
                self.function.frame_size
            ))),
        }
    }

    fn moves(&self, moves: Move) -> crate::Result<()> {
        self.range(moves.src, moves.count)?;
        self.range(moves.dst, moves.count)
    }

    /// Jumps may land on any op or just past the last one, which returns.
    fn target(&self, target: u32) -> crate::Result<()> {
        let len = self.function.body.len();
        if target as usize > len {
            return Err(self.error(format!("jump to {target} outside of body of length {len}")));
        }
        Ok(())
    }

    fn jump(&self, jump: &Jump) -> crate::Result<()> {
        self.target(jump.target)?;
        self.moves(jump.values)
    }

    fn op(&self, op: &Op) -> crate::Result<()> {
        match op {
            Op::Trap(_) => {}
            Op::Const { dst, .. } | Op::RefFunc { dst, .. } | Op::GlobalGet { dst, .. } => {
                self.slot(*dst)?;
            }
            Op::GlobalSet { src, .. } => self.slot(*src)?,
            Op::Copy { dst, src }
            | Op::Unary { dst, src, .. }
            | Op::RefIsNull { dst, src } => {
                self.slot(*dst)?;
                self.slot(*src)?;
            }
            Op::Binary { dst, lhs, rhs, .. } => {
                self.slot(*dst)?;
                self.slot(*lhs)?;
                self.slot(*rhs)?;
            }
            Op::Select {
                dst,
                a,
                b,
                condition,
            } => {
                self.slot(*dst)?;
                self.slot(*a)?;
                self.slot(*b)?;
                self.slot(*condition)?;
            }
            Op::Load { dst, addr, .. } => {
                self.slot(*dst)?;
                self.slot(*addr)?;
            }
            Op::Store { addr, value, .. } => {
                self.slot(*addr)?;
                self.slot(*value)?;
            }
            Op::Builtin { builtin, args, .. } => {
                let count = (builtin.arity() as u32).max(u32::from(builtin.has_result()));
                self.range(*args, count)?;
            }
            Op::Call {
                func,
                args,
                params,
                results,
            } => {
                let ty = self.module.func_type(*func)?;
                if ty.params().len() != *params as usize || ty.results().len() != *results as usize
                {
                    return Err(self.error(format!(
                        "call of function {} doesn't match its type {ty}",
                        func.as_u32()
                    )));
                }
                self.range(*args, (*params).max(*results))?;
            }
            Op::CallIndirect {
                ty,
                index,
                args,
                params,
                results,
                ..
            } => {
                let func_ty = self.module.types.get(*ty).ok_or_else(|| {
                    self.error(format!("call_indirect of unknown type {}", ty.as_u32()))
                })?;
                if func_ty.params().len() != *params as usize
                    || func_ty.results().len() != *results as usize
                {
                    return Err(self.error(format!(
                        "call_indirect doesn't match its type {func_ty}"
                    )));
                }
                self.slot(*index)?;
                self.range(*args, (*params).max(*results))?;
            }
            Op::Jump(jump) => self.jump(jump)?,
            Op::JumpIf { condition, jump } => {
                self.slot(*condition)?;
                self.jump(jump)?;
            }
            Op::JumpUnless { condition, target } => {
                self.slot(*condition)?;
                self.target(*target)?;
            }
            Op::JumpTable {
                index,
                targets,
                default,
            } => {
                self.slot(*index)?;
                for jump in targets {
                    self.jump(jump)?;
                }
                self.jump(default)?;
            }
            Op::Return(moves) => {
                if moves.count != self.function.num_results
                    || moves.dst != self.function.results_base()
                {
                    return Err(self.error("return doesn't produce the function results"));
                }
                self.moves(*moves)?;
            }
        }
        Ok(())
    }
}
