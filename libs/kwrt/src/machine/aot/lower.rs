// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lowering of stack-based function bodies into slot code.
//!
//! Every local and every operand stack position gets a fixed slot in the
//! function's frame: locals occupy slots `0..num_locals`, and the operand at
//! stack height `h` lives in slot `num_locals + h`. Because WebAssembly
//! operand heights are static, each instruction becomes an [`Op`] that names
//! the slots it reads and writes.
//!
//! Structured control flow is flattened into jumps between op indices, so a
//! lowered body is a flat list no matter how deeply its blocks nest. A jump to
//! the index one past the last op leaves the function.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::emission::{self, Emission};
use crate::builtins::BuiltinFunctionIndex;
use crate::errors::Error;
use crate::indices::{FuncIndex, GlobalIndex, TableIndex, TypeIndex};
use crate::translate::{
    FunctionBody, Instruction, LoadKind, MemArg, NumericOp, StoreKind, TranslatedModule,
};
use crate::trap::Trap;
use crate::values::Val;

pub(super) type Slot = u32;

/// Copies `count` consecutive slots starting at `src` to `dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Move {
    pub src: Slot,
    pub dst: Slot,
    pub count: u32,
}

/// A branch: move the branch values into place, then continue at op `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Jump {
    pub target: u32,
    pub values: Move,
}

#[derive(Debug)]
pub(super) enum Op {
    Trap(Trap),
    Const {
        dst: Slot,
        value: u64,
    },
    Copy {
        dst: Slot,
        src: Slot,
    },
    Unary {
        op: NumericOp,
        emission: Emission,
        dst: Slot,
        src: Slot,
    },
    Binary {
        op: NumericOp,
        emission: Emission,
        dst: Slot,
        lhs: Slot,
        rhs: Slot,
    },
    Select {
        dst: Slot,
        a: Slot,
        b: Slot,
        condition: Slot,
    },
    RefIsNull {
        dst: Slot,
        src: Slot,
    },
    RefFunc {
        dst: Slot,
        func: FuncIndex,
    },
    GlobalGet {
        dst: Slot,
        global: GlobalIndex,
    },
    GlobalSet {
        src: Slot,
        global: GlobalIndex,
    },
    Load {
        dst: Slot,
        addr: Slot,
        kind: LoadKind,
        memarg: MemArg,
    },
    Store {
        addr: Slot,
        value: Slot,
        kind: StoreKind,
        memarg: MemArg,
    },
    /// Arguments start at `args`, the result (if any) is written to `args`.
    Builtin {
        builtin: BuiltinFunctionIndex,
        immediates: [u32; 2],
        args: Slot,
    },
    /// Arguments start at `args`, results replace them.
    Call {
        func: FuncIndex,
        args: Slot,
        params: u32,
        results: u32,
    },
    CallIndirect {
        ty: TypeIndex,
        table: TableIndex,
        index: Slot,
        args: Slot,
        params: u32,
        results: u32,
    },
    Jump(Jump),
    JumpIf {
        condition: Slot,
        jump: Jump,
    },
    /// Continues at `target` if `condition` is zero, the entry of an `if`.
    JumpUnless {
        condition: Slot,
        target: u32,
    },
    JumpTable {
        index: Slot,
        targets: Box<[Jump]>,
        default: Jump,
    },
    Return(Move),
}

impl Op {
    fn targets_mut(&mut self) -> impl Iterator<Item = &mut u32> {
        let (first, rest): (Option<&mut u32>, &mut [Jump]) = match self {
            Op::Jump(jump) | Op::JumpIf { jump, .. } => (Some(&mut jump.target), &mut []),
            Op::JumpUnless { target, .. } => (Some(target), &mut []),
            Op::JumpTable {
                targets, default, ..
            } => (Some(&mut default.target), &mut **targets),
            _ => (None, &mut []),
        };
        first
            .into_iter()
            .chain(rest.iter_mut().map(|jump| &mut jump.target))
    }
}

#[derive(Debug)]
pub(super) struct LoweredFunction {
    pub func: FuncIndex,
    pub num_params: u32,
    /// Raw default values of all locals, parameters first.
    pub locals: Box<[u64]>,
    pub num_results: u32,
    /// Total number of slots the function needs.
    pub frame_size: u32,
    pub body: Vec<Op>,
}

impl LoweredFunction {
    pub fn num_locals(&self) -> u32 {
        self.locals.len() as u32
    }

    /// The first slot of the operand stack, where results end up on return.
    pub fn results_base(&self) -> Slot {
        self.num_locals()
    }
}

/// An open `block`, `loop`, `if` or the function body itself.
#[derive(Debug, Clone, Copy)]
struct LabelInfo {
    /// Operand height below the block's parameters.
    height: u32,
    params: u32,
    results: u32,
    /// The number of values a branch to this label carries.
    arity: u32,
    /// The jump label branches to this block resolve to.
    id: u32,
    is_loop: bool,
    /// Position of the closing `end` instruction.
    end: usize,
    /// Position of the `else` instruction while lowering the `then` arm.
    else_pos: Option<usize>,
    /// The jump label of the `else` arm until it is placed.
    else_id: Option<u32>,
}

struct Lowerer<'a> {
    module: &'a TranslatedModule,
    func: FuncIndex,
    instructions: &'a [Instruction],
    num_locals: u32,
    height: u32,
    max_height: u32,
    labels: Vec<LabelInfo>,
    /// Op index of every jump label, once known.
    resolved: Vec<Option<u32>>,
    ops: Vec<Op>,
}

pub(super) fn lower(
    module: &TranslatedModule,
    func: FuncIndex,
    body: &FunctionBody,
) -> crate::Result<LoweredFunction> {
    let ty = module.func_type(func)?;
    let locals: Box<[u64]> = body
        .local_types(ty)
        .map(|ty| Val::default_for_ty(ty).to_raw())
        .collect();
    let num_results = ty.results().len() as u32;

    let mut lowerer = Lowerer {
        module,
        func,
        instructions: &body.instructions,
        num_locals: locals.len() as u32,
        height: 0,
        max_height: num_results,
        labels: Vec::new(),
        resolved: Vec::new(),
        ops: Vec::new(),
    };
    let id = lowerer.new_label();
    lowerer.labels.push(LabelInfo {
        height: 0,
        params: 0,
        results: num_results,
        arity: num_results,
        id,
        is_loop: false,
        // the final `end` closes the function body itself
        end: body.instructions.len().saturating_sub(1),
        else_pos: None,
        else_id: None,
    });

    lowerer.lower_body()?;
    let ops = lowerer.resolve_jumps()?;

    Ok(LoweredFunction {
        func,
        num_params: ty.params().len() as u32,
        frame_size: lowerer.num_locals + lowerer.max_height,
        locals,
        num_results,
        body: ops,
    })
}

impl Lowerer<'_> {
    fn error(&self, message: impl Into<String>) -> Error {
        Error::Compile {
            func: self.func,
            message: message.into(),
        }
    }

    fn slot(&self, height: u32) -> Slot {
        self.num_locals + height
    }

    fn push(&mut self) -> Slot {
        let slot = self.slot(self.height);
        self.height += 1;
        self.max_height = self.max_height.max(self.height);
        slot
    }

    fn pop(&mut self) -> crate::Result<Slot> {
        self.height = self
            .height
            .checked_sub(1)
            .ok_or_else(|| self.error("operand stack underflow"))?;
        Ok(self.slot(self.height))
    }

    fn pop_n(&mut self, n: u32) -> crate::Result<Slot> {
        self.height = self
            .height
            .checked_sub(n)
            .ok_or_else(|| self.error("operand stack underflow"))?;
        Ok(self.slot(self.height))
    }

    fn local(&self, index: u32) -> crate::Result<Slot> {
        if index < self.num_locals {
            Ok(index)
        } else {
            Err(self.error(format!("unknown local {index}")))
        }
    }

    fn target(&self, depth: u32) -> crate::Result<Jump> {
        let label = self
            .labels
            .len()
            .checked_sub(depth as usize + 1)
            .and_then(|idx| self.labels.get(idx))
            .ok_or_else(|| self.error(format!("unknown label {depth}")))?;
        let src = self
            .height
            .checked_sub(label.arity)
            .ok_or_else(|| self.error("operand stack underflow"))?;
        Ok(Jump {
            target: label.id,
            values: Move {
                src: self.slot(src),
                dst: self.slot(label.height),
                count: label.arity,
            },
        })
    }

    fn block_signature(&self, ty: &crate::translate::BlockType) -> crate::Result<(u32, u32)> {
        let (params, results) = ty.signature(&self.module.types)?;
        Ok((params.len() as u32, results.len() as u32))
    }

    fn new_label(&mut self) -> u32 {
        self.resolved.push(None);
        (self.resolved.len() - 1) as u32
    }

    /// Places jump label `id` at the next op.
    fn place(&mut self, id: u32) {
        if let Some(slot) = self.resolved.get_mut(id as usize) {
            *slot = Some(self.ops.len() as u32);
        }
    }

    fn enter(&mut self, params: u32, results: u32, end: u32) -> crate::Result<LabelInfo> {
        let height = self
            .height
            .checked_sub(params)
            .ok_or_else(|| self.error("operand stack underflow"))?;
        let id = self.new_label();
        Ok(LabelInfo {
            height,
            params,
            results,
            arity: results,
            id,
            is_loop: false,
            end: end as usize,
            else_pos: None,
            else_id: None,
        })
    }

    fn innermost(&mut self) -> crate::Result<&mut LabelInfo> {
        let func = self.func;
        self.labels.last_mut().ok_or_else(|| Error::Compile {
            func,
            message: "no open block".into(),
        })
    }

    /// Where lowering continues after an instruction that never falls through:
    /// the `else` or `end` of the innermost block.
    fn skip_unreachable(&self) -> crate::Result<usize> {
        let label = self
            .labels
            .last()
            .ok_or_else(|| self.error("no open block"))?;
        Ok(label.else_pos.unwrap_or(label.end))
    }

    /// Replaces jump label ids by op indices.
    fn resolve_jumps(&mut self) -> crate::Result<Vec<Op>> {
        let mut ops = core::mem::take(&mut self.ops);
        for op in &mut ops {
            for target in op.targets_mut() {
                let id = *target;
                *target = self
                    .resolved
                    .get(id as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| self.error(format!("unplaced jump label {id}")))?;
            }
        }
        Ok(ops)
    }

    fn lower_body(&mut self) -> crate::Result<()> {
        let instructions = self.instructions;
        let mut pc = 0;

        while let Some(instr) = instructions.get(pc) {
            match instr {
                Instruction::Block { ty, end } => {
                    let (params, results) = self.block_signature(ty)?;
                    let label = self.enter(params, results, *end)?;
                    self.labels.push(label);
                }
                Instruction::Loop { ty, end } => {
                    let (params, results) = self.block_signature(ty)?;
                    let mut label = self.enter(params, results, *end)?;
                    label.arity = params;
                    label.is_loop = true;
                    self.place(label.id);
                    self.labels.push(label);
                }
                Instruction::If { ty, else_, end } => {
                    let (params, results) = self.block_signature(ty)?;
                    let condition = self.pop()?;
                    let mut label = self.enter(params, results, *end)?;
                    let else_id = self.new_label();
                    label.else_pos = else_.map(|pos| pos as usize);
                    label.else_id = Some(else_id);
                    self.ops.push(Op::JumpUnless {
                        condition,
                        target: else_id,
                    });
                    self.labels.push(label);
                }
                Instruction::Else { .. } => {
                    let label = *self.innermost()?;
                    let else_id = label
                        .else_id
                        .ok_or_else(|| self.error(format!("unexpected else at {pc}")))?;
                    // the `then` arm falls through past the `else` arm
                    let results = self.slot(label.height);
                    self.ops.push(Op::Jump(Jump {
                        target: label.id,
                        values: Move {
                            src: results,
                            dst: results,
                            count: 0,
                        },
                    }));
                    self.place(else_id);
                    let open = self.innermost()?;
                    open.else_pos = None;
                    open.else_id = None;
                    self.height = label.height + label.params;
                }
                Instruction::End => {
                    let label = self
                        .labels
                        .pop()
                        .ok_or_else(|| self.error(format!("unexpected end at {pc}")))?;
                    if let Some(else_id) = label.else_id {
                        self.place(else_id);
                    }
                    if !label.is_loop {
                        self.place(label.id);
                    }
                    self.height = label.height + label.results;
                    self.max_height = self.max_height.max(self.height);
                    if self.labels.is_empty() {
                        return Ok(());
                    }
                }

                Instruction::Unreachable => {
                    self.ops.push(Op::Trap(Trap::UnreachableCodeReached));
                    pc = self.skip_unreachable()?;
                    continue;
                }
                Instruction::Br { depth } => {
                    let jump = self.target(*depth)?;
                    self.ops.push(Op::Jump(jump));
                    pc = self.skip_unreachable()?;
                    continue;
                }
                Instruction::BrTable { targets, default } => {
                    let index = self.pop()?;
                    let targets = targets
                        .iter()
                        .map(|depth| self.target(*depth))
                        .collect::<crate::Result<Box<[_]>>>()?;
                    let default = self.target(*default)?;
                    self.ops.push(Op::JumpTable {
                        index,
                        targets,
                        default,
                    });
                    pc = self.skip_unreachable()?;
                    continue;
                }
                Instruction::Return => {
                    let arity = self.labels.first().map_or(0, |label| label.arity);
                    let src = self
                        .height
                        .checked_sub(arity)
                        .ok_or_else(|| self.error("operand stack underflow"))?;
                    self.ops.push(Op::Return(Move {
                        src: self.slot(src),
                        dst: self.slot(0),
                        count: arity,
                    }));
                    pc = self.skip_unreachable()?;
                    continue;
                }
                Instruction::BrIf { depth } => {
                    let condition = self.pop()?;
                    let jump = self.target(*depth)?;
                    self.ops.push(Op::JumpIf { condition, jump });
                }

                Instruction::Nop => {}
                Instruction::Call { func } => {
                    let ty = self.module.func_type(*func)?;
                    let (params, results) = (ty.params().len() as u32, ty.results().len() as u32);
                    let args = self.pop_n(params)?;
                    self.ops.push(Op::Call {
                        func: *func,
                        args,
                        params,
                        results,
                    });
                    self.push_n(results);
                }
                Instruction::CallIndirect { ty, table } => {
                    let func_ty = self
                        .module
                        .types
                        .get(*ty)
                        .ok_or_else(|| self.error(format!("unknown type {}", ty.as_u32())))?;
                    let (params, results) =
                        (func_ty.params().len() as u32, func_ty.results().len() as u32);
                    let index = self.pop()?;
                    let args = self.pop_n(params)?;
                    self.ops.push(Op::CallIndirect {
                        ty: *ty,
                        table: *table,
                        index,
                        args,
                        params,
                        results,
                    });
                    self.push_n(results);
                }

                Instruction::Drop => {
                    self.pop()?;
                }
                Instruction::Select | Instruction::TypedSelect { .. } => {
                    let condition = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let dst = self.push();
                    self.ops.push(Op::Select {
                        dst,
                        a,
                        b,
                        condition,
                    });
                }

                Instruction::LocalGet { index } => {
                    let src = self.local(*index)?;
                    let dst = self.push();
                    self.ops.push(Op::Copy { dst, src });
                }
                Instruction::LocalSet { index } => {
                    let dst = self.local(*index)?;
                    let src = self.pop()?;
                    self.ops.push(Op::Copy { dst, src });
                }
                Instruction::LocalTee { index } => {
                    let dst = self.local(*index)?;
                    let src = self
                        .height
                        .checked_sub(1)
                        .map(|height| self.slot(height))
                        .ok_or_else(|| self.error("operand stack underflow"))?;
                    self.ops.push(Op::Copy { dst, src });
                }
                Instruction::GlobalGet { global } => {
                    let dst = self.push();
                    self.ops.push(Op::GlobalGet {
                        dst,
                        global: *global,
                    });
                }
                Instruction::GlobalSet { global } => {
                    let src = self.pop()?;
                    self.ops.push(Op::GlobalSet {
                        src,
                        global: *global,
                    });
                }

                Instruction::Load { kind, memarg } => {
                    let addr = self.pop()?;
                    let dst = self.push();
                    self.ops.push(Op::Load {
                        dst,
                        addr,
                        kind: *kind,
                        memarg: *memarg,
                    });
                }
                Instruction::Store { kind, memarg } => {
                    let value = self.pop()?;
                    let addr = self.pop()?;
                    self.ops.push(Op::Store {
                        addr,
                        value,
                        kind: *kind,
                        memarg: *memarg,
                    });
                }

                Instruction::TableGet { .. }
                | Instruction::TableSet { .. }
                | Instruction::TableSize { .. }
                | Instruction::TableGrow { .. }
                | Instruction::TableFill { .. }
                | Instruction::TableCopy { .. }
                | Instruction::TableInit { .. }
                | Instruction::ElemDrop { .. }
                | Instruction::MemorySize
                | Instruction::MemoryGrow
                | Instruction::MemoryInit { .. }
                | Instruction::DataDrop { .. }
                | Instruction::MemoryCopy
                | Instruction::MemoryFill => {
                    debug_assert_eq!(emission::emission(instr), Emission::Shared);
                    let (builtin, immediates) = BuiltinFunctionIndex::for_instruction(instr)
                        .ok_or_else(|| self.error(format!("no builtin for {instr:?}")))?;
                    let args = self.pop_n(builtin.arity() as u32)?;
                    if builtin.has_result() {
                        self.push();
                    }
                    self.ops.push(Op::Builtin {
                        builtin,
                        immediates,
                        args,
                    });
                }

                Instruction::I32Const { value } => {
                    let dst = self.push();
                    self.ops.push(Op::Const {
                        dst,
                        value: u64::from(*value as u32),
                    });
                }
                Instruction::I64Const { value } => {
                    let dst = self.push();
                    self.ops.push(Op::Const {
                        dst,
                        value: *value as u64,
                    });
                }
                Instruction::F32Const { bits } => {
                    let dst = self.push();
                    self.ops.push(Op::Const {
                        dst,
                        value: u64::from(*bits),
                    });
                }
                Instruction::F64Const { bits } => {
                    let dst = self.push();
                    self.ops.push(Op::Const { dst, value: *bits });
                }
                Instruction::RefNull { .. } => {
                    let dst = self.push();
                    self.ops.push(Op::Const { dst, value: 0 });
                }
                Instruction::RefIsNull => {
                    let src = self.pop()?;
                    let dst = self.push();
                    self.ops.push(Op::RefIsNull { dst, src });
                }
                Instruction::RefFunc { func } => {
                    let dst = self.push();
                    self.ops.push(Op::RefFunc { dst, func: *func });
                }

                Instruction::Numeric(op) => {
                    let emission = emission::numeric(*op);
                    if op.arity() == 1 {
                        let src = self.pop()?;
                        let dst = self.push();
                        self.ops.push(Op::Unary {
                            op: *op,
                            emission,
                            dst,
                            src,
                        });
                    } else {
                        let rhs = self.pop()?;
                        let lhs = self.pop()?;
                        let dst = self.push();
                        self.ops.push(Op::Binary {
                            op: *op,
                            emission,
                            dst,
                            lhs,
                            rhs,
                        });
                    }
                }
            }

            pc += 1;
        }

        Err(self.error("function body is not terminated by `end`"))
    }

    fn push_n(&mut self, n: u32) {
        for _ in 0..n {
            self.push();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::ModuleTranslator;

    fn lower_first(wat: &str) -> LoweredFunction {
        let bytes = wat::parse_str(wat).unwrap();
        let module = ModuleTranslator::new().translate(&bytes).unwrap();
        let (defined, body) = module.function_bodies.iter().next().unwrap();
        lower(&module, module.func_index(defined), body).unwrap()
    }

    #[test]
    fn operands_follow_locals() {
        let lowered = lower_first(
            r#"(module (func (param i32 i32) (result i32) local.get 0 local.get 1 i32.add))"#,
        );
        assert_eq!(lowered.num_locals(), 2);
        assert_eq!(lowered.frame_size, 4);
        assert!(matches!(lowered.body[0], Op::Copy { dst: 2, src: 0 }));
        assert!(matches!(lowered.body[1], Op::Copy { dst: 3, src: 1 }));
        assert!(matches!(
            lowered.body[2],
            Op::Binary {
                dst: 2,
                lhs: 2,
                rhs: 3,
                ..
            }
        ));
    }

    #[test]
    fn code_after_a_branch_is_skipped() {
        let lowered = lower_first(
            r#"(module (func (result i32) (block (result i32) i32.const 1 br 0 drop i32.const 2)))"#,
        );
        assert_eq!(lowered.body.len(), 2);
        assert!(matches!(lowered.body[0], Op::Const { dst: 0, value: 1 }));
        assert!(matches!(
            lowered.body[1],
            Op::Jump(Jump {
                target: 2,
                values: Move {
                    src: 0,
                    dst: 0,
                    count: 1
                }
            })
        ));
    }

    #[test]
    fn if_arms_become_jumps() {
        let lowered = lower_first(
            r#"(module (func (param i32) (result i32)
                (if (result i32) (local.get 0)
                  (then i32.const 10)
                  (else i32.const 20))))"#,
        );
        // local.get, jump_unless, const, jump, const
        assert_eq!(lowered.body.len(), 5);
        assert!(matches!(
            lowered.body[1],
            Op::JumpUnless {
                condition: 1,
                target: 4
            }
        ));
        assert!(matches!(lowered.body[3], Op::Jump(Jump { target: 5, .. })));
    }

    #[test]
    fn loops_jump_backwards() {
        let lowered = lower_first(
            r#"(module (func (param i32)
                (loop $l
                  local.get 0
                  i32.const 1
                  i32.sub
                  local.tee 0
                  br_if $l)))"#,
        );
        let Some(Op::JumpIf { jump, .. }) = lowered.body.last() else {
            panic!("expected a conditional jump");
        };
        assert_eq!(jump.target, 0);
    }

    #[test]
    fn nesting_does_not_deepen_the_code() {
        let depth = 10_000;
        let wat = alloc::format!(
            "(module (func (result i32) i32.const 7 {} {}))",
            "block (param i32) (result i32) ".repeat(depth),
            "end ".repeat(depth)
        );
        let lowered = lower_first(&wat);
        assert_eq!(lowered.body.len(), 1);
        assert!(matches!(lowered.body[0], Op::Const { dst: 0, value: 7 }));
    }

    #[test]
    fn declared_locals_get_defaults() {
        let lowered = lower_first(r#"(module (func (param i64) (local f32 externref)))"#);
        assert_eq!(&*lowered.locals, &[0, 0, 0]);
        assert_eq!(lowered.num_params, 1);
    }
}
