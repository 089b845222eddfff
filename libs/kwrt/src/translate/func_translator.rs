// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::vec::Vec;

use wasmparser::{FunctionBody as WasmFunctionBody, Operator};

use crate::errors::{Error, wasm_unsupported};
use crate::indices::{DataIndex, ElemIndex, FuncIndex, GlobalIndex, TableIndex, TypeIndex};
use crate::translate::type_convert::{convert_heap_type, convert_val_type};
use crate::translate::{
    BlockType, FunctionBody, Instruction, LoadKind, MemArg, NumericOp, StoreKind,
};

/// The maximum number of locals a single function may declare.
const MAX_LOCALS: u64 = 50_000;

/// An open structured instruction waiting for its `end`.
struct OpenBlock {
    start: usize,
    else_: Option<usize>,
}

/// Translates a single function body from `wasmparser` operators into [`Instruction`]s.
pub struct FuncTranslator {
    instructions: Vec<Instruction>,
    offsets: Vec<usize>,
    /// `None` marks the implicit block of the function body itself.
    blocks: Vec<Option<OpenBlock>>,
}

impl FuncTranslator {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            offsets: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn translate(mut self, body: &WasmFunctionBody<'_>) -> crate::Result<FunctionBody> {
        let mut locals = Vec::new();
        let mut total = 0_u64;
        for entry in body.get_locals_reader()? {
            let (count, ty) = entry?;
            total += u64::from(count);
            if total > MAX_LOCALS {
                return Err(Error::Malformed {
                    message: "too many locals".into(),
                    offset: body.range().start,
                });
            }
            let ty = convert_val_type(ty)?;
            locals.extend(core::iter::repeat_n(ty, count as usize));
        }

        self.blocks.push(None);

        let mut reader = body.get_operators_reader()?;
        while !reader.eof() {
            if self.blocks.is_empty() {
                return Err(Error::Malformed {
                    message: "operators remaining after end of function".into(),
                    offset: reader.original_position(),
                });
            }

            let (op, offset) = reader.read_with_offset()?;
            let instruction = self.translate_operator(op, offset)?;
            self.instructions.push(instruction);
            self.offsets.push(offset);
        }

        if !self.blocks.is_empty() {
            return Err(Error::Malformed {
                message: "control frames remain at end of function".into(),
                offset: body.range().end,
            });
        }

        Ok(FunctionBody {
            locals: locals.into_boxed_slice(),
            instructions: self.instructions.into_boxed_slice(),
            offsets: self.offsets.into_boxed_slice(),
        })
    }

    fn pc(&self) -> usize {
        self.instructions.len()
    }

    fn open(&mut self) {
        self.blocks.push(Some(OpenBlock {
            start: self.pc(),
            else_: None,
        }));
    }

    fn translate_else(&mut self, offset: usize) -> crate::Result<Instruction> {
        let pc = self.pc();
        match self.blocks.last_mut() {
            Some(Some(block))
                if block.else_.is_none()
                    && matches!(self.instructions[block.start], Instruction::If { .. }) =>
            {
                block.else_ = Some(pc);
                Ok(Instruction::Else { end: 0 })
            }
            _ => Err(Error::Malformed {
                message: "else found outside of an `if` block".into(),
                offset,
            }),
        }
    }

    fn translate_end(&mut self, offset: usize) -> crate::Result<Instruction> {
        let end = self.pc() as u32;
        match self.blocks.pop() {
            Some(Some(block)) => {
                match &mut self.instructions[block.start] {
                    Instruction::Block { end: e, .. } | Instruction::Loop { end: e, .. } => *e = end,
                    Instruction::If { else_, end: e, .. } => {
                        *else_ = block.else_.map(|pc| pc as u32);
                        *e = end;
                    }
                    _ => unreachable!("open blocks always start at a structured instruction"),
                }
                if let Some(pc) = block.else_ {
                    self.instructions[pc] = Instruction::Else { end };
                }
                Ok(Instruction::End)
            }
            Some(None) => Ok(Instruction::End),
            None => Err(Error::Malformed {
                message: "unexpected end".into(),
                offset,
            }),
        }
    }

    #[expect(clippy::too_many_lines, reason = "big match statement")]
    fn translate_operator(&mut self, op: Operator<'_>, offset: usize) -> crate::Result<Instruction> {
        use Operator as O;

        if let Some(op) = NumericOp::from_operator(&op) {
            return Ok(Instruction::Numeric(op));
        }

        Ok(match op {
            O::Unreachable => Instruction::Unreachable,
            O::Nop => Instruction::Nop,
            O::Block { blockty } => {
                let ty = convert_block_type(blockty)?;
                self.open();
                Instruction::Block { ty, end: 0 }
            }
            O::Loop { blockty } => {
                let ty = convert_block_type(blockty)?;
                self.open();
                Instruction::Loop { ty, end: 0 }
            }
            O::If { blockty } => {
                let ty = convert_block_type(blockty)?;
                self.open();
                Instruction::If {
                    ty,
                    else_: None,
                    end: 0,
                }
            }
            O::Else => self.translate_else(offset)?,
            O::End => self.translate_end(offset)?,
            O::Br { relative_depth } => Instruction::Br {
                depth: relative_depth,
            },
            O::BrIf { relative_depth } => Instruction::BrIf {
                depth: relative_depth,
            },
            O::BrTable { targets } => Instruction::BrTable {
                default: targets.default(),
                targets: targets
                    .targets()
                    .collect::<Result<Box<[u32]>, _>>()?,
            },
            O::Return => Instruction::Return,
            O::Call { function_index } => Instruction::Call {
                func: FuncIndex::from_u32(function_index),
            },
            O::CallIndirect {
                type_index,
                table_index,
            } => Instruction::CallIndirect {
                ty: TypeIndex::from_u32(type_index),
                table: TableIndex::from_u32(table_index),
            },

            O::Drop => Instruction::Drop,
            O::Select => Instruction::Select,
            O::TypedSelect { ty } => Instruction::TypedSelect {
                ty: convert_val_type(ty)?,
            },

            O::LocalGet { local_index } => Instruction::LocalGet { index: local_index },
            O::LocalSet { local_index } => Instruction::LocalSet { index: local_index },
            O::LocalTee { local_index } => Instruction::LocalTee { index: local_index },
            O::GlobalGet { global_index } => Instruction::GlobalGet {
                global: GlobalIndex::from_u32(global_index),
            },
            O::GlobalSet { global_index } => Instruction::GlobalSet {
                global: GlobalIndex::from_u32(global_index),
            },

            O::TableGet { table } => Instruction::TableGet {
                table: TableIndex::from_u32(table),
            },
            O::TableSet { table } => Instruction::TableSet {
                table: TableIndex::from_u32(table),
            },
            O::TableSize { table } => Instruction::TableSize {
                table: TableIndex::from_u32(table),
            },
            O::TableGrow { table } => Instruction::TableGrow {
                table: TableIndex::from_u32(table),
            },
            O::TableFill { table } => Instruction::TableFill {
                table: TableIndex::from_u32(table),
            },
            O::TableCopy {
                dst_table,
                src_table,
            } => Instruction::TableCopy {
                dst: TableIndex::from_u32(dst_table),
                src: TableIndex::from_u32(src_table),
            },
            O::TableInit { elem_index, table } => Instruction::TableInit {
                elem: ElemIndex::from_u32(elem_index),
                table: TableIndex::from_u32(table),
            },
            O::ElemDrop { elem_index } => Instruction::ElemDrop {
                elem: ElemIndex::from_u32(elem_index),
            },

            O::I32Load { memarg } => load(LoadKind::I32, memarg)?,
            O::I64Load { memarg } => load(LoadKind::I64, memarg)?,
            O::F32Load { memarg } => load(LoadKind::F32, memarg)?,
            O::F64Load { memarg } => load(LoadKind::F64, memarg)?,
            O::I32Load8S { memarg } => load(LoadKind::I32S8, memarg)?,
            O::I32Load8U { memarg } => load(LoadKind::I32U8, memarg)?,
            O::I32Load16S { memarg } => load(LoadKind::I32S16, memarg)?,
            O::I32Load16U { memarg } => load(LoadKind::I32U16, memarg)?,
            O::I64Load8S { memarg } => load(LoadKind::I64S8, memarg)?,
            O::I64Load8U { memarg } => load(LoadKind::I64U8, memarg)?,
            O::I64Load16S { memarg } => load(LoadKind::I64S16, memarg)?,
            O::I64Load16U { memarg } => load(LoadKind::I64U16, memarg)?,
            O::I64Load32S { memarg } => load(LoadKind::I64S32, memarg)?,
            O::I64Load32U { memarg } => load(LoadKind::I64U32, memarg)?,
            O::I32Store { memarg } => store(StoreKind::I32, memarg)?,
            O::I64Store { memarg } => store(StoreKind::I64, memarg)?,
            O::F32Store { memarg } => store(StoreKind::F32, memarg)?,
            O::F64Store { memarg } => store(StoreKind::F64, memarg)?,
            O::I32Store8 { memarg } => store(StoreKind::I32N8, memarg)?,
            O::I32Store16 { memarg } => store(StoreKind::I32N16, memarg)?,
            O::I64Store8 { memarg } => store(StoreKind::I64N8, memarg)?,
            O::I64Store16 { memarg } => store(StoreKind::I64N16, memarg)?,
            O::I64Store32 { memarg } => store(StoreKind::I64N32, memarg)?,
            O::MemorySize { mem } => {
                single_memory(mem)?;
                Instruction::MemorySize
            }
            O::MemoryGrow { mem } => {
                single_memory(mem)?;
                Instruction::MemoryGrow
            }
            O::MemoryInit { data_index, mem } => {
                single_memory(mem)?;
                Instruction::MemoryInit {
                    data: DataIndex::from_u32(data_index),
                }
            }
            O::DataDrop { data_index } => Instruction::DataDrop {
                data: DataIndex::from_u32(data_index),
            },
            O::MemoryCopy { dst_mem, src_mem } => {
                single_memory(dst_mem)?;
                single_memory(src_mem)?;
                Instruction::MemoryCopy
            }
            O::MemoryFill { mem } => {
                single_memory(mem)?;
                Instruction::MemoryFill
            }

            O::I32Const { value } => Instruction::I32Const { value },
            O::I64Const { value } => Instruction::I64Const { value },
            O::F32Const { value } => Instruction::F32Const { bits: value.bits() },
            O::F64Const { value } => Instruction::F64Const { bits: value.bits() },

            O::RefNull { hty } => Instruction::RefNull {
                ty: convert_heap_type(hty)?,
            },
            O::RefIsNull => Instruction::RefIsNull,
            O::RefFunc { function_index } => Instruction::RefFunc {
                func: FuncIndex::from_u32(function_index),
            },

            op => {
                return Err(wasm_unsupported!(
                    "unsupported opcode at offset {offset:#x}: {op:?}"
                ));
            }
        })
    }
}

fn convert_block_type(ty: wasmparser::BlockType) -> crate::Result<BlockType> {
    Ok(match ty {
        wasmparser::BlockType::Empty => BlockType::Empty,
        wasmparser::BlockType::Type(ty) => BlockType::Value(convert_val_type(ty)?),
        wasmparser::BlockType::FuncType(index) => BlockType::Func(TypeIndex::from_u32(index)),
    })
}

fn convert_memarg(memarg: wasmparser::MemArg) -> crate::Result<MemArg> {
    single_memory(memarg.memory)?;
    let offset = u32::try_from(memarg.offset)
        .map_err(|_| wasm_unsupported!("64-bit memory offset {:#x}", memarg.offset))?;
    Ok(MemArg {
        offset,
        align: memarg.align,
    })
}

fn load(kind: LoadKind, memarg: wasmparser::MemArg) -> crate::Result<Instruction> {
    Ok(Instruction::Load {
        kind,
        memarg: convert_memarg(memarg)?,
    })
}

fn store(kind: StoreKind, memarg: wasmparser::MemArg) -> crate::Result<Instruction> {
    Ok(Instruction::Store {
        kind,
        memarg: convert_memarg(memarg)?,
    })
}

fn single_memory(index: u32) -> crate::Result<()> {
    if index == 0 {
        Ok(())
    } else {
        Err(wasm_unsupported!("multiple memories (memory index {index})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate_single(wat: &str) -> FunctionBody {
        let bytes = wat::parse_str(wat).unwrap();
        let mut translated = None;
        for payload in wasmparser::Parser::new(0).parse_all(&bytes) {
            if let wasmparser::Payload::CodeSectionEntry(body) = payload.unwrap() {
                translated = Some(FuncTranslator::new().translate(&body).unwrap());
            }
        }
        translated.unwrap()
    }

    #[test]
    fn structured_instructions_are_patched() {
        let body = translate_single(
            r#"(module (func (param i32) (result i32)
                local.get 0
                if (result i32)
                    i32.const 1
                else
                    i32.const 2
                end))"#,
        );
        assert_eq!(
            &*body.instructions,
            &[
                Instruction::LocalGet { index: 0 },
                Instruction::If {
                    ty: BlockType::Value(crate::types::ValType::I32),
                    else_: Some(3),
                    end: 5
                },
                Instruction::I32Const { value: 1 },
                Instruction::Else { end: 5 },
                Instruction::I32Const { value: 2 },
                Instruction::End,
                Instruction::End,
            ]
        );
        assert_eq!(body.offsets.len(), body.instructions.len());
    }

    #[test]
    fn locals_are_expanded() {
        let body = translate_single("(module (func (local i32 i32 f64)))");
        assert_eq!(body.locals.len(), 3);
    }

    #[test]
    fn unsupported_opcodes_are_rejected() {
        let bytes = wat::parse_str(
            "(module (memory 1 1 shared) (func (drop (i32.atomic.load (i32.const 0)))))",
        )
        .unwrap();
        for payload in wasmparser::Parser::new(0).parse_all(&bytes) {
            if let wasmparser::Payload::CodeSectionEntry(body) = payload.unwrap() {
                let err = FuncTranslator::new().translate(&body).unwrap_err();
                assert!(matches!(err, Error::Unsupported(_)), "{err}");
            }
        }
    }
}
