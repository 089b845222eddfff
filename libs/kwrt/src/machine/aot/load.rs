// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Loading of verified slot code into executable units.
//!
//! Each op becomes a boxed closure over its slot operands. Inline emissions
//! spell out their semantics in the closure; shared emissions call the
//! implementation in [`crate::ops`] or [`crate::builtins`]. Nodes never call
//! functions of their own instance themselves: they return [`Flow::Call`] and
//! the caller's activation loop pushes the callee frame.

use alloc::boxed::Box;
use alloc::format;

use super::emission::Emission;
use super::lower::{Jump, LoweredFunction, Move, Op, Slot};
use super::AotContext;
use crate::errors::Error;
use crate::indices::{DefinedFuncIndex, FuncIndex};
use crate::ops::{self, OpFn, f32, f64, from_bool, from_f32, from_f64, from_i32, i32, u32};
use crate::translate::{NumericOp, TranslatedModule};

/// What the activation loop does after a node ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Next,
    /// Continue at this op, or return if it is one past the last op.
    Jump(u32),
    Return,
    /// Call a function of this instance with the arguments starting at slot
    /// `args`. Its results replace the arguments.
    Call {
        callee: DefinedFuncIndex,
        args: Slot,
    },
}

pub(super) type Node =
    Box<dyn Fn(&mut AotContext<'_>, &mut [u64]) -> crate::Result<Flow> + Send + Sync>;

fn node<F>(f: F) -> Node
where
    F: Fn(&mut AotContext<'_>, &mut [u64]) -> crate::Result<Flow> + Send + Sync + 'static,
{
    Box::new(f)
}

/// A compiled function.
pub(super) struct Unit {
    pub func: FuncIndex,
    pub num_params: usize,
    /// Default values of all locals, parameters first.
    pub locals: Box<[u64]>,
    pub frame_size: usize,
    pub num_results: usize,
    pub body: Box<[Node]>,
}

impl core::fmt::Debug for Unit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Unit")
            .field("func", &self.func)
            .field("frame_size", &self.frame_size)
            .field("nodes", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl Unit {
    /// The slot of the first result once the function returned.
    pub fn results_base(&self) -> usize {
        self.locals.len()
    }
}

#[inline]
fn apply_move(slots: &mut [u64], moves: Move) {
    let src = moves.src as usize;
    slots.copy_within(src..src + moves.count as usize, moves.dst as usize);
}

#[inline]
fn take_jump(slots: &mut [u64], jump: Jump) -> Flow {
    apply_move(slots, jump.values);
    Flow::Jump(jump.target)
}

/// The `br_table` entry for `index`, out of range indices taking `default`.
#[inline]
fn select_jump(targets: &[Jump], default: Jump, index: u32) -> Jump {
    targets.get(index as usize).copied().unwrap_or(default)
}

pub(super) fn load(module: &TranslatedModule, lowered: LoweredFunction) -> crate::Result<Unit> {
    let func = lowered.func;
    let body = lowered
        .body
        .into_iter()
        .map(|op| load_op(module, func, op))
        .collect::<crate::Result<Box<[_]>>>()?;
    Ok(Unit {
        func,
        num_params: lowered.num_params as usize,
        frame_size: lowered.frame_size as usize,
        num_results: lowered.num_results as usize,
        locals: lowered.locals,
        body,
    })
}

#[expect(clippy::too_many_lines, reason = "one arm per op")]
fn load_op(module: &TranslatedModule, func: FuncIndex, op: Op) -> crate::Result<Node> {
    Ok(match op {
        Op::Trap(trap) => node(move |_, _| Err(trap.into())),
        Op::Const { dst, value } => node(move |_, slots| {
            slots[dst as usize] = value;
            Ok(Flow::Next)
        }),
        Op::Copy { dst, src } => node(move |_, slots| {
            slots[dst as usize] = slots[src as usize];
            Ok(Flow::Next)
        }),
        Op::Unary {
            op,
            emission,
            dst,
            src,
        } => load_unary(func, op, emission, dst as usize, src as usize)?,
        Op::Binary {
            op,
            emission,
            dst,
            lhs,
            rhs,
        } => load_binary(func, op, emission, dst as usize, lhs as usize, rhs as usize)?,
        Op::Select {
            dst,
            a,
            b,
            condition,
        } => node(move |_, slots| {
            slots[dst as usize] = if u32(slots[condition as usize]) != 0 {
                slots[a as usize]
            } else {
                slots[b as usize]
            };
            Ok(Flow::Next)
        }),
        Op::RefIsNull { dst, src } => node(move |_, slots| {
            slots[dst as usize] = from_bool(slots[src as usize] == 0);
            Ok(Flow::Next)
        }),
        Op::RefFunc { dst, func } => node(move |ctx, slots| {
            slots[dst as usize] = crate::machine::ref_func(ctx.store, ctx.instance, func)?;
            Ok(Flow::Next)
        }),
        Op::GlobalGet { dst, global } => node(move |ctx, slots| {
            slots[dst as usize] = crate::machine::global_get(ctx.store, ctx.instance, global)?;
            Ok(Flow::Next)
        }),
        Op::GlobalSet { src, global } => node(move |ctx, slots| {
            crate::machine::global_set(ctx.store, ctx.instance, global, slots[src as usize])?;
            Ok(Flow::Next)
        }),
        Op::Load {
            dst,
            addr,
            kind,
            memarg,
        } => node(move |ctx, slots| {
            slots[dst as usize] = crate::machine::mem_load(
                ctx.store,
                ctx.instance,
                kind,
                memarg,
                slots[addr as usize],
            )?;
            Ok(Flow::Next)
        }),
        Op::Store {
            addr,
            value,
            kind,
            memarg,
        } => node(move |ctx, slots| {
            crate::machine::mem_store(
                ctx.store,
                ctx.instance,
                kind,
                memarg,
                slots[addr as usize],
                slots[value as usize],
            )?;
            Ok(Flow::Next)
        }),
        Op::Builtin {
            builtin,
            immediates,
            args,
        } => {
            let (start, end) = (args as usize, args as usize + builtin.arity());
            node(move |ctx, slots| {
                let result = builtin.call(ctx.store, ctx.instance, immediates, &slots[start..end])?;
                if let Some(result) = result {
                    slots[start] = result;
                }
                Ok(Flow::Next)
            })
        }
        Op::Call {
            func: callee,
            args,
            params,
            results,
        } => match module.defined_func_index(callee) {
            Some(callee) => node(move |_, _| Ok(Flow::Call { callee, args })),
            None => {
                let (start, end) = (args as usize, args as usize + params as usize);
                let results = results as usize;
                node(move |ctx, slots| {
                    let values = ctx.call_import(callee, &slots[start..end])?;
                    slots[start..start + results].copy_from_slice(&values);
                    Ok(Flow::Next)
                })
            }
        },
        Op::CallIndirect {
            ty,
            table,
            index,
            args,
            params,
            results,
        } => {
            let (start, end) = (args as usize, args as usize + params as usize);
            let results = results as usize;
            node(move |ctx, slots| {
                let callee = crate::machine::indirect_target(
                    ctx.store,
                    ctx.instance,
                    ty,
                    table,
                    u32(slots[index as usize]),
                )?;
                if let Some(callee) = ctx.local_target(callee) {
                    return Ok(Flow::Call { callee, args });
                }
                let values = ctx.call_boxed(callee, &slots[start..end])?;
                slots[start..start + results].copy_from_slice(&values);
                Ok(Flow::Next)
            })
        }
        Op::Jump(jump) => node(move |_, slots| Ok(take_jump(slots, jump))),
        Op::JumpIf { condition, jump } => node(move |_, slots| {
            if u32(slots[condition as usize]) != 0 {
                Ok(take_jump(slots, jump))
            } else {
                Ok(Flow::Next)
            }
        }),
        Op::JumpUnless { condition, target } => node(move |_, slots| {
            if u32(slots[condition as usize]) == 0 {
                Ok(Flow::Jump(target))
            } else {
                Ok(Flow::Next)
            }
        }),
        Op::JumpTable {
            index,
            targets,
            default,
        } => node(move |_, slots| {
            let jump = select_jump(&targets, default, u32(slots[index as usize]));
            Ok(take_jump(slots, jump))
        }),
        Op::Return(moves) => node(move |_, slots| {
            apply_move(slots, moves);
            Ok(Flow::Return)
        }),
    })
}

fn missing_emission(func: FuncIndex, op: NumericOp) -> Error {
    Error::Compile {
        func,
        message: format!("no inline emission for {}", op.name()),
    }
}

macro_rules! inline_unary {
    ($dst:ident, $src:ident, |$a:ident| $body:expr) => {
        node(move |_, slots| {
            let $a = slots[$src];
            slots[$dst] = $body;
            Ok(Flow::Next)
        })
    };
}

macro_rules! inline_binary {
    ($dst:ident, $lhs:ident, $rhs:ident, |$a:ident, $b:ident| $body:expr) => {
        node(move |_, slots| {
            let ($a, $b) = (slots[$lhs], slots[$rhs]);
            slots[$dst] = $body;
            Ok(Flow::Next)
        })
    };
}

fn load_unary(
    func: FuncIndex,
    op: NumericOp,
    emission: Emission,
    dst: usize,
    src: usize,
) -> crate::Result<Node> {
    use NumericOp::*;

    if emission == Emission::Shared {
        let OpFn::Unary(f) = ops::lookup(op) else {
            return Err(missing_emission(func, op));
        };
        return Ok(node(move |_, slots| {
            slots[dst] = f(slots[src])?;
            Ok(Flow::Next)
        }));
    }

    Ok(match op {
        I32Eqz => inline_unary!(dst, src, |a| from_bool(u32(a) == 0)),
        I64Eqz => inline_unary!(dst, src, |a| from_bool(a == 0)),
        I32Clz => inline_unary!(dst, src, |a| u64::from(u32(a).leading_zeros())),
        I32Ctz => inline_unary!(dst, src, |a| u64::from(u32(a).trailing_zeros())),
        I32Popcnt => inline_unary!(dst, src, |a| u64::from(u32(a).count_ones())),
        I64Clz => inline_unary!(dst, src, |a| u64::from(a.leading_zeros())),
        I64Ctz => inline_unary!(dst, src, |a| u64::from(a.trailing_zeros())),
        I64Popcnt => inline_unary!(dst, src, |a| u64::from(a.count_ones())),
        F32Abs => inline_unary!(dst, src, |a| a & 0x7fff_ffff),
        F32Neg => inline_unary!(dst, src, |a| (a ^ 0x8000_0000) & 0xffff_ffff),
        F64Abs => inline_unary!(dst, src, |a| a & 0x7fff_ffff_ffff_ffff),
        F64Neg => inline_unary!(dst, src, |a| a ^ 0x8000_0000_0000_0000),
        I32WrapI64 | I64ExtendI32U | I32ReinterpretF32 | F32ReinterpretI32 => {
            inline_unary!(dst, src, |a| a & 0xffff_ffff)
        }
        I64ReinterpretF64 | F64ReinterpretI64 => inline_unary!(dst, src, |a| a),
        I64ExtendI32S => inline_unary!(dst, src, |a| i64::from(i32(a)) as u64),
        I32Extend8S => inline_unary!(dst, src, |a| from_i32(i32::from(a as u8 as i8))),
        I32Extend16S => inline_unary!(dst, src, |a| from_i32(i32::from(a as u16 as i16))),
        I64Extend8S => inline_unary!(dst, src, |a| i64::from(a as u8 as i8) as u64),
        I64Extend16S => inline_unary!(dst, src, |a| i64::from(a as u16 as i16) as u64),
        I64Extend32S => inline_unary!(dst, src, |a| i64::from(i32(a)) as u64),
        F32DemoteF64 => inline_unary!(dst, src, |a| from_f32(f64(a) as f32)),
        F64PromoteF32 => inline_unary!(dst, src, |a| from_f64(f64::from(f32(a)))),
        F32ConvertI32S => inline_unary!(dst, src, |a| from_f32(i32(a) as f32)),
        F32ConvertI64S => inline_unary!(dst, src, |a| from_f32(a as i64 as f32)),
        F64ConvertI32S => inline_unary!(dst, src, |a| from_f64(f64::from(i32(a)))),
        F64ConvertI64S => inline_unary!(dst, src, |a| from_f64(a as i64 as f64)),
        _ => return Err(missing_emission(func, op)),
    })
}

fn load_binary(
    func: FuncIndex,
    op: NumericOp,
    emission: Emission,
    dst: usize,
    lhs: usize,
    rhs: usize,
) -> crate::Result<Node> {
    use NumericOp::*;

    if emission == Emission::Shared {
        let OpFn::Binary(f) = ops::lookup(op) else {
            return Err(missing_emission(func, op));
        };
        return Ok(node(move |_, slots| {
            slots[dst] = f(slots[lhs], slots[rhs])?;
            Ok(Flow::Next)
        }));
    }

    Ok(match op {
        I32Eq => inline_binary!(dst, lhs, rhs, |a, b| from_bool(u32(a) == u32(b))),
        I32Ne => inline_binary!(dst, lhs, rhs, |a, b| from_bool(u32(a) != u32(b))),
        I32LtS => inline_binary!(dst, lhs, rhs, |a, b| from_bool(i32(a) < i32(b))),
        I32LtU => inline_binary!(dst, lhs, rhs, |a, b| from_bool(u32(a) < u32(b))),
        I32GtS => inline_binary!(dst, lhs, rhs, |a, b| from_bool(i32(a) > i32(b))),
        I32GtU => inline_binary!(dst, lhs, rhs, |a, b| from_bool(u32(a) > u32(b))),
        I32LeS => inline_binary!(dst, lhs, rhs, |a, b| from_bool(i32(a) <= i32(b))),
        I32LeU => inline_binary!(dst, lhs, rhs, |a, b| from_bool(u32(a) <= u32(b))),
        I32GeS => inline_binary!(dst, lhs, rhs, |a, b| from_bool(i32(a) >= i32(b))),
        I32GeU => inline_binary!(dst, lhs, rhs, |a, b| from_bool(u32(a) >= u32(b))),

        I64Eq => inline_binary!(dst, lhs, rhs, |a, b| from_bool(a == b)),
        I64Ne => inline_binary!(dst, lhs, rhs, |a, b| from_bool(a != b)),
        I64LtS => inline_binary!(dst, lhs, rhs, |a, b| from_bool((a as i64) < (b as i64))),
        I64LtU => inline_binary!(dst, lhs, rhs, |a, b| from_bool(a < b)),
        I64GtS => inline_binary!(dst, lhs, rhs, |a, b| from_bool((a as i64) > (b as i64))),
        I64GtU => inline_binary!(dst, lhs, rhs, |a, b| from_bool(a > b)),
        I64LeS => inline_binary!(dst, lhs, rhs, |a, b| from_bool((a as i64) <= (b as i64))),
        I64LeU => inline_binary!(dst, lhs, rhs, |a, b| from_bool(a <= b)),
        I64GeS => inline_binary!(dst, lhs, rhs, |a, b| from_bool((a as i64) >= (b as i64))),
        I64GeU => inline_binary!(dst, lhs, rhs, |a, b| from_bool(a >= b)),

        F32Eq => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f32(a) == f32(b))),
        F32Ne => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f32(a) != f32(b))),
        F32Lt => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f32(a) < f32(b))),
        F32Gt => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f32(a) > f32(b))),
        F32Le => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f32(a) <= f32(b))),
        F32Ge => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f32(a) >= f32(b))),
        F64Eq => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f64(a) == f64(b))),
        F64Ne => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f64(a) != f64(b))),
        F64Lt => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f64(a) < f64(b))),
        F64Gt => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f64(a) > f64(b))),
        F64Le => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f64(a) <= f64(b))),
        F64Ge => inline_binary!(dst, lhs, rhs, |a, b| from_bool(f64(a) >= f64(b))),

        I32Add => inline_binary!(dst, lhs, rhs, |a, b| u64::from(u32(a).wrapping_add(u32(b)))),
        I32Sub => inline_binary!(dst, lhs, rhs, |a, b| u64::from(u32(a).wrapping_sub(u32(b)))),
        I32Mul => inline_binary!(dst, lhs, rhs, |a, b| u64::from(u32(a).wrapping_mul(u32(b)))),
        I32And => inline_binary!(dst, lhs, rhs, |a, b| a & b),
        I32Or => inline_binary!(dst, lhs, rhs, |a, b| a | b),
        I32Xor => inline_binary!(dst, lhs, rhs, |a, b| a ^ b),
        I32Shl => inline_binary!(dst, lhs, rhs, |a, b| u64::from(u32(a).wrapping_shl(u32(b)))),
        I32ShrS => inline_binary!(dst, lhs, rhs, |a, b| from_i32(i32(a).wrapping_shr(u32(b)))),
        I32ShrU => inline_binary!(dst, lhs, rhs, |a, b| u64::from(u32(a).wrapping_shr(u32(b)))),

        I64Add => inline_binary!(dst, lhs, rhs, |a, b| a.wrapping_add(b)),
        I64Sub => inline_binary!(dst, lhs, rhs, |a, b| a.wrapping_sub(b)),
        I64Mul => inline_binary!(dst, lhs, rhs, |a, b| a.wrapping_mul(b)),
        I64And => inline_binary!(dst, lhs, rhs, |a, b| a & b),
        I64Or => inline_binary!(dst, lhs, rhs, |a, b| a | b),
        I64Xor => inline_binary!(dst, lhs, rhs, |a, b| a ^ b),
        I64Shl => inline_binary!(dst, lhs, rhs, |a, b| a.wrapping_shl(b as u32)),
        I64ShrS => inline_binary!(dst, lhs, rhs, |a, b| (a as i64).wrapping_shr(b as u32) as u64),
        I64ShrU => inline_binary!(dst, lhs, rhs, |a, b| a.wrapping_shr(b as u32)),

        F32Add => inline_binary!(dst, lhs, rhs, |a, b| from_f32(f32(a) + f32(b))),
        F32Sub => inline_binary!(dst, lhs, rhs, |a, b| from_f32(f32(a) - f32(b))),
        F32Mul => inline_binary!(dst, lhs, rhs, |a, b| from_f32(f32(a) * f32(b))),
        F32Div => inline_binary!(dst, lhs, rhs, |a, b| from_f32(f32(a) / f32(b))),
        F64Add => inline_binary!(dst, lhs, rhs, |a, b| from_f64(f64(a) + f64(b))),
        F64Sub => inline_binary!(dst, lhs, rhs, |a, b| from_f64(f64(a) - f64(b))),
        F64Mul => inline_binary!(dst, lhs, rhs, |a, b| from_f64(f64(a) * f64(b))),
        F64Div => inline_binary!(dst, lhs, rhs, |a, b| from_f64(f64(a) / f64(b))),

        _ => return Err(missing_emission(func, op)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::aot::emission;

    #[test]
    fn every_inline_operator_has_an_emission() {
        use NumericOp::*;

        let func = FuncIndex::from_u32(0);
        for op in [
            I32Eqz, I32Add, I32ShrU, I64Popcnt, I64GeS, F32Neg, F64Div, F32Ge, I32WrapI64,
            I64Extend32S, F64ConvertI64S, F32DemoteF64, I64ReinterpretF64,
        ] {
            assert_eq!(emission::numeric(op), Emission::Inline, "{}", op.name());
            let loaded = if op.arity() == 1 {
                load_unary(func, op, Emission::Inline, 0, 1)
            } else {
                load_binary(func, op, Emission::Inline, 0, 1, 2)
            };
            assert!(loaded.is_ok(), "{}", op.name());
        }
    }

    #[test]
    fn branch_tables_fall_back_to_the_default() {
        let jump = |target| Jump {
            target,
            values: Move {
                src: 0,
                dst: 0,
                count: 0,
            },
        };
        let targets = [jump(3), jump(5)];
        assert_eq!(select_jump(&targets, jump(9), 1).target, 5);
        assert_eq!(select_jump(&targets, jump(9), 2).target, 9);
        assert_eq!(select_jump(&targets, jump(9), u32::MAX).target, 9);
    }

    #[test]
    fn jumps_move_branch_values() {
        let mut slots = [1, 2, 3, 4];
        let flow = take_jump(
            &mut slots,
            Jump {
                target: 7,
                values: Move {
                    src: 2,
                    dst: 0,
                    count: 2,
                },
            },
        );
        assert_eq!(flow, Flow::Jump(7));
        assert_eq!(slots, [3, 4, 3, 4]);
    }
}
