// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use core::slice;

use cranelift_entity::PrimaryMap;

use crate::errors::Error;
use crate::indices::{DataIndex, ElemIndex, FuncIndex, GlobalIndex, TableIndex, TypeIndex};
use crate::types::{EntityKind, FuncType, RefType, ValType};

/// The type of a structured control instruction (`block`, `loop`, `if`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
    Func(TypeIndex),
}

impl BlockType {
    /// Resolve this block type into its parameter and result types.
    ///
    /// # Errors
    ///
    /// Returns an "unknown type" error if a multi-value block type refers to a
    /// type index that does not exist.
    pub fn signature<'a>(
        &'a self,
        types: &'a PrimaryMap<TypeIndex, FuncType>,
    ) -> crate::Result<(&'a [ValType], &'a [ValType])> {
        match self {
            BlockType::Empty => Ok((&[], &[])),
            BlockType::Value(ty) => Ok((&[], slice::from_ref(ty))),
            BlockType::Func(index) => {
                let ty = types
                    .get(*index)
                    .ok_or_else(|| Error::unknown(EntityKind::Type, index.as_u32()))?;
                Ok((ty.params(), ty.results()))
            }
        }
    }
}

/// Immediate of memory instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    pub offset: u32,
    /// Alignment hint as a power of two.
    pub align: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    I32,
    I64,
    F32,
    F64,
    I32S8,
    I32U8,
    I32S16,
    I32U16,
    I64S8,
    I64U8,
    I64S16,
    I64U16,
    I64S32,
    I64U32,
}

impl LoadKind {
    pub fn result_type(self) -> ValType {
        match self {
            LoadKind::I32 | LoadKind::I32S8 | LoadKind::I32U8 | LoadKind::I32S16 | LoadKind::I32U16 => {
                ValType::I32
            }
            LoadKind::F32 => ValType::F32,
            LoadKind::F64 => ValType::F64,
            LoadKind::I64
            | LoadKind::I64S8
            | LoadKind::I64U8
            | LoadKind::I64S16
            | LoadKind::I64U16
            | LoadKind::I64S32
            | LoadKind::I64U32 => ValType::I64,
        }
    }

    /// Width of the memory access in bytes.
    pub fn width(self) -> u32 {
        match self {
            LoadKind::I32S8 | LoadKind::I32U8 | LoadKind::I64S8 | LoadKind::I64U8 => 1,
            LoadKind::I32S16 | LoadKind::I32U16 | LoadKind::I64S16 | LoadKind::I64U16 => 2,
            LoadKind::I32 | LoadKind::F32 | LoadKind::I64S32 | LoadKind::I64U32 => 4,
            LoadKind::I64 | LoadKind::F64 => 8,
        }
    }

    /// Turns the little-endian bytes read from memory into a raw cell, applying
    /// sign or zero extension.
    pub fn extend(self, bytes: u64) -> u64 {
        match self {
            LoadKind::I32 | LoadKind::F32 | LoadKind::I64 | LoadKind::F64 => bytes,
            LoadKind::I32U8 | LoadKind::I32U16 | LoadKind::I64U8 | LoadKind::I64U16 | LoadKind::I64U32 => bytes,
            LoadKind::I32S8 => u64::from(i32::from(bytes as u8 as i8) as u32),
            LoadKind::I32S16 => u64::from(i32::from(bytes as u16 as i16) as u32),
            LoadKind::I64S8 => i64::from(bytes as u8 as i8) as u64,
            LoadKind::I64S16 => i64::from(bytes as u16 as i16) as u64,
            LoadKind::I64S32 => i64::from(bytes as u32 as i32) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    I32,
    I64,
    F32,
    F64,
    I32N8,
    I32N16,
    I64N8,
    I64N16,
    I64N32,
}

impl StoreKind {
    pub fn value_type(self) -> ValType {
        match self {
            StoreKind::I32 | StoreKind::I32N8 | StoreKind::I32N16 => ValType::I32,
            StoreKind::I64 | StoreKind::I64N8 | StoreKind::I64N16 | StoreKind::I64N32 => ValType::I64,
            StoreKind::F32 => ValType::F32,
            StoreKind::F64 => ValType::F64,
        }
    }

    /// Width of the memory access in bytes.
    pub fn width(self) -> u32 {
        match self {
            StoreKind::I32N8 | StoreKind::I64N8 => 1,
            StoreKind::I32N16 | StoreKind::I64N16 => 2,
            StoreKind::I32 | StoreKind::F32 | StoreKind::I64N32 => 4,
            StoreKind::I64 | StoreKind::F64 => 8,
        }
    }
}

macro_rules! numeric_ops {
    ($( $name:ident ),* $(,)?) => {
        /// Numeric instructions: pure functions from one or two operands to one result.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NumericOp {
            $( $name, )*
        }

        impl NumericOp {
            /// Mnemonic-like name used in diagnostics.
            pub fn name(self) -> &'static str {
                match self {
                    $( NumericOp::$name => stringify!($name), )*
                }
            }

            /// The numeric operator corresponding to a decoded `wasmparser` operator.
            pub(crate) fn from_operator(op: &wasmparser::Operator<'_>) -> Option<Self> {
                match op {
                    $( wasmparser::Operator::$name => Some(NumericOp::$name), )*
                    _ => None,
                }
            }
        }
    };
}

numeric_ops! {
    I32Eqz, I32Eq, I32Ne, I32LtS, I32LtU, I32GtS, I32GtU, I32LeS, I32LeU, I32GeS, I32GeU,
    I64Eqz, I64Eq, I64Ne, I64LtS, I64LtU, I64GtS, I64GtU, I64LeS, I64LeU, I64GeS, I64GeU,
    F32Eq, F32Ne, F32Lt, F32Gt, F32Le, F32Ge,
    F64Eq, F64Ne, F64Lt, F64Gt, F64Le, F64Ge,
    I32Clz, I32Ctz, I32Popcnt, I32Add, I32Sub, I32Mul, I32DivS, I32DivU, I32RemS, I32RemU,
    I32And, I32Or, I32Xor, I32Shl, I32ShrS, I32ShrU, I32Rotl, I32Rotr,
    I64Clz, I64Ctz, I64Popcnt, I64Add, I64Sub, I64Mul, I64DivS, I64DivU, I64RemS, I64RemU,
    I64And, I64Or, I64Xor, I64Shl, I64ShrS, I64ShrU, I64Rotl, I64Rotr,
    F32Abs, F32Neg, F32Ceil, F32Floor, F32Trunc, F32Nearest, F32Sqrt,
    F32Add, F32Sub, F32Mul, F32Div, F32Min, F32Max, F32Copysign,
    F64Abs, F64Neg, F64Ceil, F64Floor, F64Trunc, F64Nearest, F64Sqrt,
    F64Add, F64Sub, F64Mul, F64Div, F64Min, F64Max, F64Copysign,
    I32WrapI64, I32TruncF32S, I32TruncF32U, I32TruncF64S, I32TruncF64U,
    I64ExtendI32S, I64ExtendI32U, I64TruncF32S, I64TruncF32U, I64TruncF64S, I64TruncF64U,
    F32ConvertI32S, F32ConvertI32U, F32ConvertI64S, F32ConvertI64U, F32DemoteF64,
    F64ConvertI32S, F64ConvertI32U, F64ConvertI64S, F64ConvertI64U, F64PromoteF32,
    I32ReinterpretF32, I64ReinterpretF64, F32ReinterpretI32, F64ReinterpretI64,
    I32Extend8S, I32Extend16S, I64Extend8S, I64Extend16S, I64Extend32S,
    I32TruncSatF32S, I32TruncSatF32U, I32TruncSatF64S, I32TruncSatF64U,
    I64TruncSatF32S, I64TruncSatF32U, I64TruncSatF64S, I64TruncSatF64U,
}

const I32: &[ValType] = &[ValType::I32];
const I64: &[ValType] = &[ValType::I64];
const F32: &[ValType] = &[ValType::F32];
const F64: &[ValType] = &[ValType::F64];
const I32_I32: &[ValType] = &[ValType::I32, ValType::I32];
const I64_I64: &[ValType] = &[ValType::I64, ValType::I64];
const F32_F32: &[ValType] = &[ValType::F32, ValType::F32];
const F64_F64: &[ValType] = &[ValType::F64, ValType::F64];

impl NumericOp {
    /// The operand types and the result type of this operator.
    #[expect(clippy::too_many_lines, reason = "one arm per operand signature")]
    pub fn signature(self) -> (&'static [ValType], ValType) {
        use NumericOp::*;
        match self {
            I32Eqz | I32Clz | I32Ctz | I32Popcnt | I32Extend8S | I32Extend16S => (I32, ValType::I32),
            I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
            | I32GeU | I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU
            | I32And | I32Or | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => {
                (I32_I32, ValType::I32)
            }
            I64Eqz | I32WrapI64 => (I64, ValType::I32),
            I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU | I64GeS
            | I64GeU => (I64_I64, ValType::I32),
            I64Clz | I64Ctz | I64Popcnt | I64Extend8S | I64Extend16S | I64Extend32S => {
                (I64, ValType::I64)
            }
            I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And | I64Or
            | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => (I64_I64, ValType::I64),
            F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => (F32_F32, ValType::I32),
            F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => (F64_F64, ValType::I32),
            F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt => {
                (F32, ValType::F32)
            }
            F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => {
                (F32_F32, ValType::F32)
            }
            F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt => {
                (F64, ValType::F64)
            }
            F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => {
                (F64_F64, ValType::F64)
            }
            I32TruncF32S | I32TruncF32U | I32TruncSatF32S | I32TruncSatF32U
            | I32ReinterpretF32 => (F32, ValType::I32),
            I32TruncF64S | I32TruncF64U | I32TruncSatF64S | I32TruncSatF64U => {
                (F64, ValType::I32)
            }
            I64ExtendI32S | I64ExtendI32U => (I32, ValType::I64),
            I64TruncF32S | I64TruncF32U | I64TruncSatF32S | I64TruncSatF32U => {
                (F32, ValType::I64)
            }
            I64TruncF64S | I64TruncF64U | I64TruncSatF64S | I64TruncSatF64U
            | I64ReinterpretF64 => (F64, ValType::I64),
            F32ConvertI32S | F32ConvertI32U | F32ReinterpretI32 => (I32, ValType::F32),
            F32ConvertI64S | F32ConvertI64U => (I64, ValType::F32),
            F32DemoteF64 => (F64, ValType::F32),
            F64ConvertI32S | F64ConvertI32U => (I32, ValType::F64),
            F64ConvertI64S | F64ConvertI64U | F64ReinterpretI64 => (I64, ValType::F64),
            F64PromoteF32 => (F32, ValType::F64),
        }
    }

    /// Number of operands this operator consumes.
    pub fn arity(self) -> usize {
        self.signature().0.len()
    }
}

/// A decoded WebAssembly instruction.
///
/// Structured instructions carry the positions of their matching `else`/`end`
/// (as indices into the function's instruction sequence).
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Unreachable,
    Nop,
    Block { ty: BlockType, end: u32 },
    Loop { ty: BlockType, end: u32 },
    If { ty: BlockType, else_: Option<u32>, end: u32 },
    Else { end: u32 },
    End,
    Br { depth: u32 },
    BrIf { depth: u32 },
    BrTable { targets: Box<[u32]>, default: u32 },
    Return,
    Call { func: FuncIndex },
    CallIndirect { ty: TypeIndex, table: TableIndex },

    Drop,
    Select,
    TypedSelect { ty: ValType },

    LocalGet { index: u32 },
    LocalSet { index: u32 },
    LocalTee { index: u32 },
    GlobalGet { global: GlobalIndex },
    GlobalSet { global: GlobalIndex },

    TableGet { table: TableIndex },
    TableSet { table: TableIndex },
    TableSize { table: TableIndex },
    TableGrow { table: TableIndex },
    TableFill { table: TableIndex },
    TableCopy { dst: TableIndex, src: TableIndex },
    TableInit { elem: ElemIndex, table: TableIndex },
    ElemDrop { elem: ElemIndex },

    Load { kind: LoadKind, memarg: MemArg },
    Store { kind: StoreKind, memarg: MemArg },
    MemorySize,
    MemoryGrow,
    MemoryInit { data: DataIndex },
    DataDrop { data: DataIndex },
    MemoryCopy,
    MemoryFill,

    I32Const { value: i32 },
    I64Const { value: i64 },
    F32Const { bits: u32 },
    F64Const { bits: u64 },

    RefNull { ty: RefType },
    RefIsNull,
    RefFunc { func: FuncIndex },

    Numeric(NumericOp),
}

impl Instruction {
    /// Whether control can never fall through to the next instruction.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Instruction::Unreachable
                | Instruction::Br { .. }
                | Instruction::BrTable { .. }
                | Instruction::Return
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_signatures() {
        assert_eq!(NumericOp::I32Add.signature(), (I32_I32, ValType::I32));
        assert_eq!(NumericOp::I64Eqz.signature(), (I64, ValType::I32));
        assert_eq!(NumericOp::F64PromoteF32.signature(), (F32, ValType::F64));
        assert_eq!(NumericOp::I32TruncSatF64U.arity(), 1);
        assert_eq!(NumericOp::F32Copysign.arity(), 2);
        assert_eq!(NumericOp::I64Rotl.name(), "I64Rotl");
    }

    #[test]
    fn sign_extending_loads() {
        assert_eq!(LoadKind::I32S8.extend(0x80), 0xffff_ff80);
        assert_eq!(LoadKind::I32U8.extend(0x80), 0x80);
        assert_eq!(LoadKind::I64S16.extend(0x8000), 0xffff_ffff_ffff_8000);
        assert_eq!(LoadKind::I64S32.extend(0x7fff_ffff), 0x7fff_ffff);
    }
}
