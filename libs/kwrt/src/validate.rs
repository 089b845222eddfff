// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Type validation of function bodies.
//!
//! An abstract interpretation of the operand stack over value types. Every
//! structured instruction opens a control frame recording the stack height at
//! entry; values below that height are invisible inside the frame. After an
//! unconditional branch the frame becomes unreachable and its stack is
//! polymorphic: pops beyond the frame's height yield an unknown type that
//! matches anything.

use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::errors::Error;
use crate::indices::FuncIndex;
use crate::translate::{BlockType, FunctionBody, Instruction, TranslatedModule};
use crate::types::{EntityKind, RefType, ValType};

/// Validate the body of the locally defined function `func`.
///
/// # Errors
///
/// Returns `Error::TypeMismatch` or `Error::MissingOperand` for ill-typed
/// operand stacks, `Error::Unknown` for references to entities that don't exist
/// and `Error::Invalid` for the remaining validation rules.
pub(crate) fn validate_function(
    module: &TranslatedModule,
    func: FuncIndex,
    body: &FunctionBody,
) -> crate::Result<()> {
    let ty = module.func_type(func)?;
    let mut validator = FuncValidator {
        module,
        locals: body.local_types(ty).collect(),
        operands: Vec::new(),
        controls: Vec::new(),
    };
    validator.push_ctrl(FrameKind::Function, &[], ty.results());

    for (pc, instr) in body.instructions.iter().enumerate() {
        if validator.controls.is_empty() {
            return Err(Error::Invalid(
                "operators remaining after end of function".into(),
            ));
        }
        validator.instruction(instr).inspect_err(|err| {
            tracing::trace!(func = func.as_u32(), pc, ?instr, %err, "validation failed");
        })?;
    }

    if !validator.controls.is_empty() {
        return Err(Error::Invalid("control frames remain at end of function".into()));
    }

    tracing::trace!(func = func.as_u32(), "validated function");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If,
    Else,
}

#[derive(Debug)]
struct ControlFrame {
    kind: FrameKind,
    params: SmallVec<[ValType; 2]>,
    results: SmallVec<[ValType; 2]>,
    /// The operand stack height when the frame was entered.
    height: usize,
    unreachable: bool,
}

impl ControlFrame {
    /// Branching to a loop re-enters it, every other frame is exited.
    fn label_types(&self) -> &[ValType] {
        if self.kind == FrameKind::Loop {
            &self.params
        } else {
            &self.results
        }
    }
}

struct FuncValidator<'a> {
    module: &'a TranslatedModule,
    locals: Vec<ValType>,
    /// `None` is the unknown type produced by a polymorphic stack.
    operands: Vec<Option<ValType>>,
    controls: Vec<ControlFrame>,
}

impl FuncValidator<'_> {
    fn push(&mut self, ty: ValType) {
        self.operands.push(Some(ty));
    }

    fn push_all(&mut self, tys: &[ValType]) {
        self.operands.extend(tys.iter().copied().map(Some));
    }

    fn pop(&mut self) -> crate::Result<Option<ValType>> {
        let frame = self.controls.last().ok_or(Error::MissingOperand)?;
        if self.operands.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(Error::MissingOperand);
        }
        self.operands.pop().ok_or(Error::MissingOperand)
    }

    fn pop_expect(&mut self, expected: ValType) -> crate::Result<Option<ValType>> {
        match self.pop()? {
            Some(actual) => {
                actual.ensure_matches(expected)?;
                Ok(Some(actual))
            }
            None => Ok(Some(expected)),
        }
    }

    fn pop_all(&mut self, tys: &[ValType]) -> crate::Result<()> {
        for ty in tys.iter().rev() {
            self.pop_expect(*ty)?;
        }
        Ok(())
    }

    fn pop_ref(&mut self) -> crate::Result<Option<ValType>> {
        match self.pop()? {
            Some(ty) if !ty.is_ref() => Err(Error::Invalid(alloc::format!(
                "type mismatch: expected a reference, found {ty}"
            ))),
            ty => Ok(ty),
        }
    }

    fn push_ctrl(&mut self, kind: FrameKind, params: &[ValType], results: &[ValType]) {
        self.controls.push(ControlFrame {
            kind,
            params: params.into(),
            results: results.into(),
            height: self.operands.len(),
            unreachable: false,
        });
        self.push_all(params);
    }

    fn pop_ctrl(&mut self) -> crate::Result<ControlFrame> {
        let frame = self
            .controls
            .last()
            .ok_or_else(|| Error::Invalid("unbalanced control frames".into()))?;
        let (results, height) = (frame.results.clone(), frame.height);
        self.pop_all(&results)?;
        if self.operands.len() != height {
            return Err(Error::Invalid(
                "type mismatch: values remaining on stack at end of block".into(),
            ));
        }
        self.controls
            .pop()
            .ok_or_else(|| Error::Invalid("unbalanced control frames".into()))
    }

    fn set_unreachable(&mut self) {
        if let Some(frame) = self.controls.last_mut() {
            self.operands.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    fn label(&self, depth: u32) -> crate::Result<SmallVec<[ValType; 2]>> {
        let frame = self
            .controls
            .len()
            .checked_sub(1 + depth as usize)
            .and_then(|idx| self.controls.get(idx))
            .ok_or_else(|| Error::unknown(EntityKind::Label, depth))?;
        Ok(frame.label_types().into())
    }

    fn block_type(&self, ty: &BlockType) -> crate::Result<(SmallVec<[ValType; 2]>, SmallVec<[ValType; 2]>)> {
        let (params, results) = ty.signature(&self.module.types)?;
        Ok((params.into(), results.into()))
    }

    fn local(&self, index: u32) -> crate::Result<ValType> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::unknown(EntityKind::Local, index))
    }

    fn table_elem(&self, table: crate::indices::TableIndex) -> crate::Result<RefType> {
        self.module
            .tables
            .get(table)
            .map(|ty| ty.element())
            .ok_or_else(|| Error::unknown(EntityKind::Table, table.as_u32()))
    }

    fn check_memory(&self) -> crate::Result<()> {
        if self.module.num_memories() == 0 {
            return Err(Error::unknown(EntityKind::Memory, 0));
        }
        Ok(())
    }

    fn check_align(align: u8, width: u32) -> crate::Result<()> {
        if u32::from(align) >= 32 || 1_u32 << align > width {
            return Err(Error::Invalid(
                "alignment must not be larger than natural".into(),
            ));
        }
        Ok(())
    }

    fn check_data(&self, data: crate::indices::DataIndex) -> crate::Result<()> {
        if self.module.data_count.is_none() {
            return Err(Error::Invalid("data count section required".into()));
        }
        if self.module.data.get(data).is_none() {
            return Err(Error::unknown(EntityKind::Data, data.as_u32()));
        }
        Ok(())
    }

    fn elem_type(&self, elem: crate::indices::ElemIndex) -> crate::Result<RefType> {
        self.module
            .elements
            .get(elem)
            .map(|segment| segment.ty)
            .ok_or_else(|| Error::unknown(EntityKind::Element, elem.as_u32()))
    }

    #[expect(clippy::too_many_lines, reason = "one arm per instruction")]
    fn instruction(&mut self, instr: &Instruction) -> crate::Result<()> {
        match instr {
            Instruction::Unreachable => self.set_unreachable(),
            Instruction::Nop => {}
            Instruction::Block { ty, .. } => {
                let (params, results) = self.block_type(ty)?;
                self.pop_all(&params)?;
                self.push_ctrl(FrameKind::Block, &params, &results);
            }
            Instruction::Loop { ty, .. } => {
                let (params, results) = self.block_type(ty)?;
                self.pop_all(&params)?;
                self.push_ctrl(FrameKind::Loop, &params, &results);
            }
            Instruction::If { ty, .. } => {
                let (params, results) = self.block_type(ty)?;
                self.pop_expect(ValType::I32)?;
                self.pop_all(&params)?;
                self.push_ctrl(FrameKind::If, &params, &results);
            }
            Instruction::Else { .. } => {
                let frame = self.pop_ctrl()?;
                if frame.kind != FrameKind::If {
                    return Err(Error::Invalid("else found outside of an `if` block".into()));
                }
                self.push_ctrl(FrameKind::Else, &frame.params, &frame.results);
            }
            Instruction::End => {
                let frame = self.pop_ctrl()?;
                if frame.kind == FrameKind::If && frame.params != frame.results {
                    return Err(Error::Invalid(
                        "type mismatch: `if` without `else` must leave its parameters".into(),
                    ));
                }
                self.push_all(&frame.results);
            }
            Instruction::Br { depth } => {
                let tys = self.label(*depth)?;
                self.pop_all(&tys)?;
                self.set_unreachable();
            }
            Instruction::BrIf { depth } => {
                self.pop_expect(ValType::I32)?;
                let tys = self.label(*depth)?;
                self.pop_all(&tys)?;
                self.push_all(&tys);
            }
            Instruction::BrTable { targets, default } => {
                self.pop_expect(ValType::I32)?;
                let default_tys = self.label(*default)?;
                for depth in targets.iter() {
                    let tys = self.label(*depth)?;
                    if tys.len() != default_tys.len() {
                        return Err(Error::Invalid(
                            "type mismatch: br_table target labels have different number of types"
                                .into(),
                        ));
                    }
                    // check each target against a copy of the stack
                    let snapshot = self.operands.clone();
                    self.pop_all(&tys)?;
                    self.operands = snapshot;
                }
                self.pop_all(&default_tys)?;
                self.set_unreachable();
            }
            Instruction::Return => {
                let results = self.controls.first().map(|f| f.results.clone()).unwrap_or_default();
                self.pop_all(&results)?;
                self.set_unreachable();
            }
            Instruction::Call { func } => {
                let ty = self.module.func_type(*func)?;
                self.pop_all(ty.params())?;
                self.push_all(ty.results());
            }
            Instruction::CallIndirect { ty, table } => {
                if self.table_elem(*table)? != RefType::Func {
                    return Err(Error::Invalid(
                        "type mismatch: indirect calls must go through a table of funcref".into(),
                    ));
                }
                let ty = self
                    .module
                    .types
                    .get(*ty)
                    .ok_or_else(|| Error::unknown(EntityKind::Type, ty.as_u32()))?;
                self.pop_expect(ValType::I32)?;
                self.pop_all(ty.params())?;
                self.push_all(ty.results());
            }

            Instruction::Drop => {
                self.pop()?;
            }
            Instruction::Select => {
                self.pop_expect(ValType::I32)?;
                let a = self.pop()?;
                let b = self.pop()?;
                for ty in [a, b].into_iter().flatten() {
                    if ty.is_ref() {
                        return Err(Error::Invalid(
                            "type mismatch: select only takes integral types".into(),
                        ));
                    }
                }
                match (a, b) {
                    (Some(a), Some(b)) => {
                        a.ensure_matches(b)?;
                        self.push(a);
                    }
                    (Some(ty), None) | (None, Some(ty)) => self.push(ty),
                    (None, None) => self.operands.push(None),
                }
            }
            Instruction::TypedSelect { ty } => {
                self.pop_expect(ValType::I32)?;
                self.pop_expect(*ty)?;
                self.pop_expect(*ty)?;
                self.push(*ty);
            }

            Instruction::LocalGet { index } => {
                let ty = self.local(*index)?;
                self.push(ty);
            }
            Instruction::LocalSet { index } => {
                let ty = self.local(*index)?;
                self.pop_expect(ty)?;
            }
            Instruction::LocalTee { index } => {
                let ty = self.local(*index)?;
                self.pop_expect(ty)?;
                self.push(ty);
            }
            Instruction::GlobalGet { global } => {
                let ty = self
                    .module
                    .globals
                    .get(*global)
                    .ok_or_else(|| Error::unknown(EntityKind::Global, global.as_u32()))?;
                self.push(ty.content());
            }
            Instruction::GlobalSet { global } => {
                let ty = *self
                    .module
                    .globals
                    .get(*global)
                    .ok_or_else(|| Error::unknown(EntityKind::Global, global.as_u32()))?;
                if !ty.is_mutable() {
                    return Err(Error::Invalid(
                        "global is immutable: cannot modify it with `global.set`".into(),
                    ));
                }
                self.pop_expect(ty.content())?;
            }

            Instruction::TableGet { table } => {
                let elem = self.table_elem(*table)?;
                self.pop_expect(ValType::I32)?;
                self.push(elem.into());
            }
            Instruction::TableSet { table } => {
                let elem = self.table_elem(*table)?;
                self.pop_expect(elem.into())?;
                self.pop_expect(ValType::I32)?;
            }
            Instruction::TableSize { table } => {
                self.table_elem(*table)?;
                self.push(ValType::I32);
            }
            Instruction::TableGrow { table } => {
                let elem = self.table_elem(*table)?;
                self.pop_expect(ValType::I32)?;
                self.pop_expect(elem.into())?;
                self.push(ValType::I32);
            }
            Instruction::TableFill { table } => {
                let elem = self.table_elem(*table)?;
                self.pop_expect(ValType::I32)?;
                self.pop_expect(elem.into())?;
                self.pop_expect(ValType::I32)?;
            }
            Instruction::TableCopy { dst, src } => {
                let dst = self.table_elem(*dst)?;
                let src = self.table_elem(*src)?;
                ValType::from(src).ensure_matches(dst.into())?;
                self.pop_all(&[ValType::I32; 3])?;
            }
            Instruction::TableInit { elem, table } => {
                let dst = self.table_elem(*table)?;
                let src = self.elem_type(*elem)?;
                ValType::from(src).ensure_matches(dst.into())?;
                self.pop_all(&[ValType::I32; 3])?;
            }
            Instruction::ElemDrop { elem } => {
                self.elem_type(*elem)?;
            }

            Instruction::Load { kind, memarg } => {
                self.check_memory()?;
                Self::check_align(memarg.align, kind.width())?;
                self.pop_expect(ValType::I32)?;
                self.push(kind.result_type());
            }
            Instruction::Store { kind, memarg } => {
                self.check_memory()?;
                Self::check_align(memarg.align, kind.width())?;
                self.pop_expect(kind.value_type())?;
                self.pop_expect(ValType::I32)?;
            }
            Instruction::MemorySize => {
                self.check_memory()?;
                self.push(ValType::I32);
            }
            Instruction::MemoryGrow => {
                self.check_memory()?;
                self.pop_expect(ValType::I32)?;
                self.push(ValType::I32);
            }
            Instruction::MemoryInit { data } => {
                self.check_memory()?;
                self.check_data(*data)?;
                self.pop_all(&[ValType::I32; 3])?;
            }
            Instruction::DataDrop { data } => {
                self.check_data(*data)?;
            }
            Instruction::MemoryCopy | Instruction::MemoryFill => {
                self.check_memory()?;
                self.pop_all(&[ValType::I32; 3])?;
            }

            Instruction::I32Const { .. } => self.push(ValType::I32),
            Instruction::I64Const { .. } => self.push(ValType::I64),
            Instruction::F32Const { .. } => self.push(ValType::F32),
            Instruction::F64Const { .. } => self.push(ValType::F64),

            Instruction::RefNull { ty } => self.push((*ty).into()),
            Instruction::RefIsNull => {
                self.pop_ref()?;
                self.push(ValType::I32);
            }
            Instruction::RefFunc { func } => {
                let desc = self
                    .module
                    .functions
                    .get(*func)
                    .ok_or_else(|| Error::unknown(EntityKind::Function, func.as_u32()))?;
                if !desc.escaping {
                    return Err(Error::Invalid(alloc::format!(
                        "undeclared function reference {}",
                        func.as_u32()
                    )));
                }
                self.push(ValType::FuncRef);
            }

            Instruction::Numeric(op) => {
                let (params, result) = op.signature();
                self.pop_all(params)?;
                self.push(result);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::ModuleTranslator;

    fn validate(wat: &str) -> crate::Result<()> {
        let bytes = wat::parse_str(wat).unwrap();
        let module = ModuleTranslator::new().translate(&bytes)?;
        for (defined, body) in module.function_bodies.iter() {
            validate_function(&module, module.func_index(defined), body)?;
        }
        Ok(())
    }

    #[test]
    fn accepts_well_typed_code() {
        validate(
            r#"(module
                (memory 1)
                (func (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add)
                (func (result i64)
                    (block (result i64)
                        i64.const 1
                        i32.const 0
                        br_if 0
                        drop
                        i64.const 2))
                (func (param i32) (result i32)
                    (if (result i32) (local.get 0)
                        (then (i32.const 1))
                        (else (i32.load (i32.const 0))))))"#,
        )
        .unwrap();
    }

    #[test]
    fn code_after_branches_is_polymorphic() {
        validate(
            r#"(module
                (func (result i32)
                    (block (result i32)
                        i32.const 1
                        br 0
                        i64.add
                        drop
                        i32.const 2)))"#,
        )
        .unwrap();
    }

    #[test]
    fn rejects_type_mismatch() {
        let err = validate(
            r#"(module
                (func (result i32)
                    i64.const 1))"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                expected: ValType::I32,
                actual: ValType::I64
            }
        ));
    }

    #[test]
    fn rejects_missing_operand() {
        let err = validate(
            r#"(module
                (func (param i32) (result i32)
                    (block (result i32)
                        i32.add)))"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingOperand));
    }

    #[test]
    fn values_below_the_frame_are_invisible() {
        let err = validate(
            r#"(module
                (func (result i32)
                    i32.const 1
                    (block (result i32)
                        i32.eqz)))"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingOperand));
    }

    #[test]
    fn rejects_immutable_global_set() {
        let err = validate(
            r#"(module
                (global i32 (i32.const 0))
                (func i32.const 1 global.set 0))"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn rejects_memory_access_without_memory() {
        let err = validate(r#"(module (func (result i32) (i32.load (i32.const 0))))"#).unwrap_err();
        assert!(matches!(
            err,
            Error::Unknown {
                kind: EntityKind::Memory,
                index: 0
            }
        ));
    }

    #[test]
    fn rejects_overaligned_access() {
        let err = validate(
            r#"(module (memory 1) (func (result i32) (i32.load8_u align=2 (i32.const 0))))"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_labels() {
        let err = validate(r#"(module (func br 1))"#).unwrap_err();
        assert!(matches!(
            err,
            Error::Unknown {
                kind: EntityKind::Label,
                ..
            }
        ));
    }

    #[test]
    fn ref_func_needs_a_declaration() {
        let err = validate(r#"(module (func (result funcref) ref.func 0))"#).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));

        validate(
            r#"(module
                (func (result funcref) ref.func 0)
                (elem declare func 0))"#,
        )
        .unwrap();
    }
}
