// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-instruction emission table.
//!
//! Every instruction is emitted either inline, with its semantics written out
//! directly in the compiled unit, or shared, where the unit calls the canonical
//! implementation in [`crate::ops`] or [`crate::builtins`]. The matches below
//! are exhaustive, so an instruction without an emission strategy doesn't
//! compile.

use crate::translate::{Instruction, NumericOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Emission {
    Inline,
    Shared,
}

pub(super) fn emission(instr: &Instruction) -> Emission {
    match instr {
        Instruction::Numeric(op) => numeric(*op),

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
        | Instruction::MemoryFill => Emission::Shared,

        Instruction::Unreachable
        | Instruction::Nop
        | Instruction::Block { .. }
        | Instruction::Loop { .. }
        | Instruction::If { .. }
        | Instruction::Else { .. }
        | Instruction::End
        | Instruction::Br { .. }
        | Instruction::BrIf { .. }
        | Instruction::BrTable { .. }
        | Instruction::Return
        | Instruction::Call { .. }
        | Instruction::CallIndirect { .. }
        | Instruction::Drop
        | Instruction::Select
        | Instruction::TypedSelect { .. }
        | Instruction::LocalGet { .. }
        | Instruction::LocalSet { .. }
        | Instruction::LocalTee { .. }
        | Instruction::GlobalGet { .. }
        | Instruction::GlobalSet { .. }
        | Instruction::Load { .. }
        | Instruction::Store { .. }
        | Instruction::I32Const { .. }
        | Instruction::I64Const { .. }
        | Instruction::F32Const { .. }
        | Instruction::F64Const { .. }
        | Instruction::RefNull { .. }
        | Instruction::RefIsNull
        | Instruction::RefFunc { .. } => Emission::Inline,
    }
}

/// Hot, branch-free arithmetic is inlined; rounding, division, truncation,
/// rotation and unsigned conversions go through [`crate::ops`].
pub(super) fn numeric(op: NumericOp) -> Emission {
    use NumericOp::*;
    match op {
        I32Eqz | I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
        | I32GeU | I64Eqz | I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS
        | I64LeU | I64GeS | I64GeU | F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge | F64Eq
        | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => Emission::Inline,

        I32Add | I32Sub | I32Mul | I32And | I32Or | I32Xor | I32Shl | I32ShrS | I32ShrU
        | I32Clz | I32Ctz | I32Popcnt | I64Add | I64Sub | I64Mul | I64And | I64Or | I64Xor
        | I64Shl | I64ShrS | I64ShrU | I64Clz | I64Ctz | I64Popcnt => Emission::Inline,

        F32Abs | F32Neg | F32Add | F32Sub | F32Mul | F32Div | F64Abs | F64Neg | F64Add
        | F64Sub | F64Mul | F64Div => Emission::Inline,

        I32WrapI64 | I64ExtendI32S | I64ExtendI32U | I32ReinterpretF32 | I64ReinterpretF64
        | F32ReinterpretI32 | F64ReinterpretI64 | I32Extend8S | I32Extend16S | I64Extend8S
        | I64Extend16S | I64Extend32S | F32DemoteF64 | F64PromoteF32 | F64ConvertI32S
        | F64ConvertI64S | F32ConvertI32S | F32ConvertI64S => Emission::Inline,

        I32DivS | I32DivU | I32RemS | I32RemU | I32Rotl | I32Rotr | I64DivS | I64DivU
        | I64RemS | I64RemU | I64Rotl | I64Rotr => Emission::Shared,

        F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt | F32Min | F32Max | F32Copysign
        | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt | F64Min | F64Max
        | F64Copysign => Emission::Shared,

        I32TruncF32S | I32TruncF32U | I32TruncF64S | I32TruncF64U | I64TruncF32S
        | I64TruncF32U | I64TruncF64S | I64TruncF64U | I32TruncSatF32S | I32TruncSatF32U
        | I32TruncSatF64S | I32TruncSatF64U | I64TruncSatF32S | I64TruncSatF32U
        | I64TruncSatF64S | I64TruncSatF64U => Emission::Shared,

        F32ConvertI32U | F32ConvertI64U | F64ConvertI32U | F64ConvertI64U => Emission::Shared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_operations_are_shared() {
        assert_eq!(emission(&Instruction::MemoryFill), Emission::Shared);
        assert_eq!(emission(&Instruction::Numeric(NumericOp::F32Nearest)), Emission::Shared);
        assert_eq!(emission(&Instruction::Numeric(NumericOp::I32Add)), Emission::Inline);
        assert_eq!(emission(&Instruction::Return), Emission::Inline);
    }
}
