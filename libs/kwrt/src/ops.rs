// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Numeric semantics shared by every execution backend.
//!
//! Operands and results are raw 64-bit cells: 32-bit integers are
//! zero-extended and floats are carried as their bit patterns, so NaN payloads
//! survive every operation that doesn't produce a new NaN.

use crate::translate::NumericOp;
use crate::trap::Trap;

pub type UnaryFn = fn(u64) -> Result<u64, Trap>;
pub type BinaryFn = fn(u64, u64) -> Result<u64, Trap>;

/// The implementation of one numeric operator.
#[derive(Clone, Copy)]
pub enum OpFn {
    Unary(UnaryFn),
    Binary(BinaryFn),
}

impl core::fmt::Debug for OpFn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            OpFn::Unary(_) => f.write_str("Unary"),
            OpFn::Binary(_) => f.write_str("Binary"),
        }
    }
}

#[inline]
pub(crate) fn i32(raw: u64) -> i32 {
    raw as u32 as i32
}

#[inline]
pub(crate) fn u32(raw: u64) -> u32 {
    raw as u32
}

#[inline]
pub(crate) fn f32(raw: u64) -> f32 {
    f32::from_bits(raw as u32)
}

#[inline]
pub(crate) fn f64(raw: u64) -> f64 {
    f64::from_bits(raw)
}

#[inline]
pub(crate) fn from_i32(v: i32) -> u64 {
    u64::from(v as u32)
}

#[inline]
pub(crate) fn from_f32(v: f32) -> u64 {
    u64::from(v.to_bits())
}

#[inline]
pub(crate) fn from_f64(v: f64) -> u64 {
    v.to_bits()
}

#[inline]
pub(crate) fn from_bool(v: bool) -> u64 {
    u64::from(v)
}

macro_rules! unary {
    (|$a:ident| $body:expr) => {
        OpFn::Unary(|$a| Ok($body))
    };
}

macro_rules! binary {
    (|$a:ident, $b:ident| $body:expr) => {
        OpFn::Binary(|$a, $b| Ok($body))
    };
}

/// Returns the implementation of `op`.
#[expect(clippy::too_many_lines, reason = "one arm per numeric operator")]
pub fn lookup(op: NumericOp) -> OpFn {
    use NumericOp::*;

    match op {
        I32Eqz => unary!(|a| from_bool(u32(a) == 0)),
        I32Eq => binary!(|a, b| from_bool(u32(a) == u32(b))),
        I32Ne => binary!(|a, b| from_bool(u32(a) != u32(b))),
        I32LtS => binary!(|a, b| from_bool(i32(a) < i32(b))),
        I32LtU => binary!(|a, b| from_bool(u32(a) < u32(b))),
        I32GtS => binary!(|a, b| from_bool(i32(a) > i32(b))),
        I32GtU => binary!(|a, b| from_bool(u32(a) > u32(b))),
        I32LeS => binary!(|a, b| from_bool(i32(a) <= i32(b))),
        I32LeU => binary!(|a, b| from_bool(u32(a) <= u32(b))),
        I32GeS => binary!(|a, b| from_bool(i32(a) >= i32(b))),
        I32GeU => binary!(|a, b| from_bool(u32(a) >= u32(b))),

        I64Eqz => unary!(|a| from_bool(a == 0)),
        I64Eq => binary!(|a, b| from_bool(a == b)),
        I64Ne => binary!(|a, b| from_bool(a != b)),
        I64LtS => binary!(|a, b| from_bool((a as i64) < (b as i64))),
        I64LtU => binary!(|a, b| from_bool(a < b)),
        I64GtS => binary!(|a, b| from_bool((a as i64) > (b as i64))),
        I64GtU => binary!(|a, b| from_bool(a > b)),
        I64LeS => binary!(|a, b| from_bool((a as i64) <= (b as i64))),
        I64LeU => binary!(|a, b| from_bool(a <= b)),
        I64GeS => binary!(|a, b| from_bool((a as i64) >= (b as i64))),
        I64GeU => binary!(|a, b| from_bool(a >= b)),

        F32Eq => binary!(|a, b| from_bool(f32(a) == f32(b))),
        F32Ne => binary!(|a, b| from_bool(f32(a) != f32(b))),
        F32Lt => binary!(|a, b| from_bool(f32(a) < f32(b))),
        F32Gt => binary!(|a, b| from_bool(f32(a) > f32(b))),
        F32Le => binary!(|a, b| from_bool(f32(a) <= f32(b))),
        F32Ge => binary!(|a, b| from_bool(f32(a) >= f32(b))),
        F64Eq => binary!(|a, b| from_bool(f64(a) == f64(b))),
        F64Ne => binary!(|a, b| from_bool(f64(a) != f64(b))),
        F64Lt => binary!(|a, b| from_bool(f64(a) < f64(b))),
        F64Gt => binary!(|a, b| from_bool(f64(a) > f64(b))),
        F64Le => binary!(|a, b| from_bool(f64(a) <= f64(b))),
        F64Ge => binary!(|a, b| from_bool(f64(a) >= f64(b))),

        I32Clz => unary!(|a| u64::from(u32(a).leading_zeros())),
        I32Ctz => unary!(|a| u64::from(u32(a).trailing_zeros())),
        I32Popcnt => unary!(|a| u64::from(u32(a).count_ones())),
        I32Add => binary!(|a, b| u64::from(u32(a).wrapping_add(u32(b)))),
        I32Sub => binary!(|a, b| u64::from(u32(a).wrapping_sub(u32(b)))),
        I32Mul => binary!(|a, b| u64::from(u32(a).wrapping_mul(u32(b)))),
        I32DivS => OpFn::Binary(|a, b| {
            let (a, b) = (i32(a), i32(b));
            if b == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            a.checked_div(b).map(from_i32).ok_or(Trap::IntegerOverflow)
        }),
        I32DivU => OpFn::Binary(|a, b| {
            u32(a)
                .checked_div(u32(b))
                .map(u64::from)
                .ok_or(Trap::IntegerDivisionByZero)
        }),
        I32RemS => OpFn::Binary(|a, b| {
            let (a, b) = (i32(a), i32(b));
            if b == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            Ok(from_i32(a.wrapping_rem(b)))
        }),
        I32RemU => OpFn::Binary(|a, b| {
            u32(a)
                .checked_rem(u32(b))
                .map(u64::from)
                .ok_or(Trap::IntegerDivisionByZero)
        }),
        I32And => binary!(|a, b| u64::from(u32(a) & u32(b))),
        I32Or => binary!(|a, b| u64::from(u32(a) | u32(b))),
        I32Xor => binary!(|a, b| u64::from(u32(a) ^ u32(b))),
        I32Shl => binary!(|a, b| u64::from(u32(a).wrapping_shl(u32(b)))),
        I32ShrS => binary!(|a, b| from_i32(i32(a).wrapping_shr(u32(b)))),
        I32ShrU => binary!(|a, b| u64::from(u32(a).wrapping_shr(u32(b)))),
        I32Rotl => binary!(|a, b| u64::from(u32(a).rotate_left(u32(b) & 31))),
        I32Rotr => binary!(|a, b| u64::from(u32(a).rotate_right(u32(b) & 31))),

        I64Clz => unary!(|a| u64::from(a.leading_zeros())),
        I64Ctz => unary!(|a| u64::from(a.trailing_zeros())),
        I64Popcnt => unary!(|a| u64::from(a.count_ones())),
        I64Add => binary!(|a, b| a.wrapping_add(b)),
        I64Sub => binary!(|a, b| a.wrapping_sub(b)),
        I64Mul => binary!(|a, b| a.wrapping_mul(b)),
        I64DivS => OpFn::Binary(|a, b| {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            a.checked_div(b).map(|v| v as u64).ok_or(Trap::IntegerOverflow)
        }),
        I64DivU => OpFn::Binary(|a, b| a.checked_div(b).ok_or(Trap::IntegerDivisionByZero)),
        I64RemS => OpFn::Binary(|a, b| {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                return Err(Trap::IntegerDivisionByZero);
            }
            Ok(a.wrapping_rem(b) as u64)
        }),
        I64RemU => OpFn::Binary(|a, b| a.checked_rem(b).ok_or(Trap::IntegerDivisionByZero)),
        I64And => binary!(|a, b| a & b),
        I64Or => binary!(|a, b| a | b),
        I64Xor => binary!(|a, b| a ^ b),
        I64Shl => binary!(|a, b| a.wrapping_shl(b as u32)),
        I64ShrS => binary!(|a, b| (a as i64).wrapping_shr(b as u32) as u64),
        I64ShrU => binary!(|a, b| a.wrapping_shr(b as u32)),
        I64Rotl => binary!(|a, b| a.rotate_left((b & 63) as u32)),
        I64Rotr => binary!(|a, b| a.rotate_right((b & 63) as u32)),

        F32Abs => unary!(|a| a & 0x7fff_ffff),
        F32Neg => unary!(|a| (a ^ 0x8000_0000) & 0xffff_ffff),
        F32Ceil => unary!(|a| from_f32(libm::ceilf(f32(a)))),
        F32Floor => unary!(|a| from_f32(libm::floorf(f32(a)))),
        F32Trunc => unary!(|a| from_f32(libm::truncf(f32(a)))),
        F32Nearest => unary!(|a| from_f32(libm::rintf(f32(a)))),
        F32Sqrt => unary!(|a| from_f32(libm::sqrtf(f32(a)))),
        F32Add => binary!(|a, b| from_f32(f32(a) + f32(b))),
        F32Sub => binary!(|a, b| from_f32(f32(a) - f32(b))),
        F32Mul => binary!(|a, b| from_f32(f32(a) * f32(b))),
        F32Div => binary!(|a, b| from_f32(f32(a) / f32(b))),
        F32Min => binary!(|a, b| from_f32(f32_min(f32(a), f32(b)))),
        F32Max => binary!(|a, b| from_f32(f32_max(f32(a), f32(b)))),
        F32Copysign => binary!(|a, b| (a & 0x7fff_ffff) | (b & 0x8000_0000)),

        F64Abs => unary!(|a| a & 0x7fff_ffff_ffff_ffff),
        F64Neg => unary!(|a| a ^ 0x8000_0000_0000_0000),
        F64Ceil => unary!(|a| from_f64(libm::ceil(f64(a)))),
        F64Floor => unary!(|a| from_f64(libm::floor(f64(a)))),
        F64Trunc => unary!(|a| from_f64(libm::trunc(f64(a)))),
        F64Nearest => unary!(|a| from_f64(libm::rint(f64(a)))),
        F64Sqrt => unary!(|a| from_f64(libm::sqrt(f64(a)))),
        F64Add => binary!(|a, b| from_f64(f64(a) + f64(b))),
        F64Sub => binary!(|a, b| from_f64(f64(a) - f64(b))),
        F64Mul => binary!(|a, b| from_f64(f64(a) * f64(b))),
        F64Div => binary!(|a, b| from_f64(f64(a) / f64(b))),
        F64Min => binary!(|a, b| from_f64(f64_min(f64(a), f64(b)))),
        F64Max => binary!(|a, b| from_f64(f64_max(f64(a), f64(b)))),
        F64Copysign => {
            binary!(|a, b| (a & 0x7fff_ffff_ffff_ffff) | (b & 0x8000_0000_0000_0000))
        }

        I32WrapI64 => unary!(|a| a & 0xffff_ffff),
        I32TruncF32S => OpFn::Unary(|a| {
            let x = f32(a);
            check_trunc(x.is_nan(), x < -2_147_483_648.0 || x >= 2_147_483_648.0)?;
            Ok(from_i32(x as i32))
        }),
        I32TruncF32U => OpFn::Unary(|a| {
            let x = f32(a);
            check_trunc(x.is_nan(), x <= -1.0 || x >= 4_294_967_296.0)?;
            Ok(u64::from(x as u32))
        }),
        I32TruncF64S => OpFn::Unary(|a| {
            let x = f64(a);
            check_trunc(x.is_nan(), x <= -2_147_483_649.0 || x >= 2_147_483_648.0)?;
            Ok(from_i32(x as i32))
        }),
        I32TruncF64U => OpFn::Unary(|a| {
            let x = f64(a);
            check_trunc(x.is_nan(), x <= -1.0 || x >= 4_294_967_296.0)?;
            Ok(u64::from(x as u32))
        }),
        I64ExtendI32S => unary!(|a| i64::from(i32(a)) as u64),
        I64ExtendI32U => unary!(|a| a & 0xffff_ffff),
        I64TruncF32S => OpFn::Unary(|a| {
            let x = f32(a);
            check_trunc(
                x.is_nan(),
                x < -9_223_372_036_854_775_808.0 || x >= 9_223_372_036_854_775_808.0,
            )?;
            Ok(x as i64 as u64)
        }),
        I64TruncF32U => OpFn::Unary(|a| {
            let x = f32(a);
            check_trunc(x.is_nan(), x <= -1.0 || x >= 18_446_744_073_709_551_616.0)?;
            Ok(x as u64)
        }),
        I64TruncF64S => OpFn::Unary(|a| {
            let x = f64(a);
            check_trunc(
                x.is_nan(),
                x < -9_223_372_036_854_775_808.0 || x >= 9_223_372_036_854_775_808.0,
            )?;
            Ok(x as i64 as u64)
        }),
        I64TruncF64U => OpFn::Unary(|a| {
            let x = f64(a);
            check_trunc(x.is_nan(), x <= -1.0 || x >= 18_446_744_073_709_551_616.0)?;
            Ok(x as u64)
        }),
        F32ConvertI32S => unary!(|a| from_f32(i32(a) as f32)),
        F32ConvertI32U => unary!(|a| from_f32(u32(a) as f32)),
        F32ConvertI64S => unary!(|a| from_f32(a as i64 as f32)),
        F32ConvertI64U => unary!(|a| from_f32(a as f32)),
        F32DemoteF64 => unary!(|a| from_f32(f64(a) as f32)),
        F64ConvertI32S => unary!(|a| from_f64(f64::from(i32(a)))),
        F64ConvertI32U => unary!(|a| from_f64(f64::from(u32(a)))),
        F64ConvertI64S => unary!(|a| from_f64(a as i64 as f64)),
        F64ConvertI64U => unary!(|a| from_f64(a as f64)),
        F64PromoteF32 => unary!(|a| from_f64(f64::from(f32(a)))),

        I32ReinterpretF32 | F32ReinterpretI32 => unary!(|a| a & 0xffff_ffff),
        I64ReinterpretF64 | F64ReinterpretI64 => unary!(|a| a),

        I32Extend8S => unary!(|a| from_i32(i32::from(a as u8 as i8))),
        I32Extend16S => unary!(|a| from_i32(i32::from(a as u16 as i16))),
        I64Extend8S => unary!(|a| i64::from(a as u8 as i8) as u64),
        I64Extend16S => unary!(|a| i64::from(a as u16 as i16) as u64),
        I64Extend32S => unary!(|a| i64::from(a as u32 as i32) as u64),

        I32TruncSatF32S => unary!(|a| from_i32(f32(a) as i32)),
        I32TruncSatF32U => unary!(|a| u64::from(f32(a) as u32)),
        I32TruncSatF64S => unary!(|a| from_i32(f64(a) as i32)),
        I32TruncSatF64U => unary!(|a| u64::from(f64(a) as u32)),
        I64TruncSatF32S => unary!(|a| f32(a) as i64 as u64),
        I64TruncSatF32U => unary!(|a| f32(a) as u64),
        I64TruncSatF64S => unary!(|a| f64(a) as i64 as u64),
        I64TruncSatF64U => unary!(|a| f64(a) as u64),
    }
}

#[inline]
fn check_trunc(is_nan: bool, out_of_range: bool) -> Result<(), Trap> {
    if is_nan {
        Err(Trap::BadConversionToInteger)
    } else if out_of_range {
        Err(Trap::IntegerOverflow)
    } else {
        Ok(())
    }
}

fn f32_min(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        a + b
    } else if a == b {
        f32::from_bits(a.to_bits() | b.to_bits())
    } else {
        a.min(b)
    }
}

fn f32_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        a + b
    } else if a == b {
        f32::from_bits(a.to_bits() & b.to_bits())
    } else {
        a.max(b)
    }
}

fn f64_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        a + b
    } else if a == b {
        f64::from_bits(a.to_bits() | b.to_bits())
    } else {
        a.min(b)
    }
}

fn f64_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        a + b
    } else if a == b {
        f64::from_bits(a.to_bits() & b.to_bits())
    } else {
        a.max(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unary(op: NumericOp, a: u64) -> Result<u64, Trap> {
        let OpFn::Unary(f) = lookup(op) else {
            panic!("{} is not unary", op.name());
        };
        f(a)
    }

    fn binary(op: NumericOp, a: u64, b: u64) -> Result<u64, Trap> {
        let OpFn::Binary(f) = lookup(op) else {
            panic!("{} is not binary", op.name());
        };
        f(a, b)
    }

    #[test]
    fn signed_division_traps() {
        let min = from_i32(i32::MIN);
        let minus_one = from_i32(-1);
        assert_eq!(binary(NumericOp::I32DivS, min, minus_one), Err(Trap::IntegerOverflow));
        assert_eq!(binary(NumericOp::I32DivS, 1, 0), Err(Trap::IntegerDivisionByZero));
        assert_eq!(binary(NumericOp::I32RemS, min, minus_one), Ok(0));
        assert_eq!(binary(NumericOp::I64DivU, 1, 0), Err(Trap::IntegerDivisionByZero));
        assert_eq!(
            binary(NumericOp::I32DivS, from_i32(-7), 2),
            Ok(from_i32(-3))
        );
    }

    #[test]
    fn results_stay_zero_extended() {
        assert_eq!(binary(NumericOp::I32Sub, 0, 1), Ok(0xffff_ffff));
        assert_eq!(unary(NumericOp::I32Extend8S, 0x80), Ok(0xffff_ff80));
        assert_eq!(unary(NumericOp::I32WrapI64, u64::MAX), Ok(0xffff_ffff));
        assert_eq!(unary(NumericOp::F32Neg, 0), Ok(0x8000_0000));
    }

    #[test]
    fn shift_counts_are_masked() {
        assert_eq!(binary(NumericOp::I32Shl, 1, 33), Ok(2));
        assert_eq!(binary(NumericOp::I64ShrU, 4, 65), Ok(2));
        assert_eq!(binary(NumericOp::I32Rotl, 0x8000_0000, 1), Ok(1));
        assert_eq!(
            binary(NumericOp::I32ShrS, 0x8000_0000, 31),
            Ok(0xffff_ffff)
        );
    }

    #[test]
    fn float_min_max_handle_zero_signs_and_nan() {
        let pos = from_f32(0.0);
        let neg = from_f32(-0.0);
        assert_eq!(binary(NumericOp::F32Min, pos, neg), Ok(neg));
        assert_eq!(binary(NumericOp::F32Max, neg, pos), Ok(pos));

        let nan = binary(NumericOp::F64Min, from_f64(f64::NAN), from_f64(1.0)).unwrap();
        assert!(f64(nan).is_nan());
    }

    #[test]
    fn nearest_rounds_half_to_even() {
        assert_eq!(unary(NumericOp::F32Nearest, from_f32(2.5)), Ok(from_f32(2.0)));
        assert_eq!(unary(NumericOp::F64Nearest, from_f64(-3.5)), Ok(from_f64(-4.0)));
    }

    #[test]
    fn trapping_truncation_boundaries() {
        assert_eq!(
            unary(NumericOp::I32TruncF32S, from_f32(f32::NAN)),
            Err(Trap::BadConversionToInteger)
        );
        assert_eq!(
            unary(NumericOp::I32TruncF32S, from_f32(2_147_483_648.0)),
            Err(Trap::IntegerOverflow)
        );
        assert_eq!(
            unary(NumericOp::I32TruncF64S, from_f64(-2_147_483_648.9)),
            Ok(from_i32(i32::MIN))
        );
        assert_eq!(
            unary(NumericOp::I32TruncF64U, from_f64(-0.9)),
            Ok(0)
        );
        assert_eq!(
            unary(NumericOp::I64TruncF64U, from_f64(-1.0)),
            Err(Trap::IntegerOverflow)
        );
    }

    #[test]
    fn saturating_truncation_clamps() {
        assert_eq!(unary(NumericOp::I32TruncSatF32S, from_f32(f32::NAN)), Ok(0));
        assert_eq!(
            unary(NumericOp::I32TruncSatF64U, from_f64(1e20)),
            Ok(0xffff_ffff)
        );
        assert_eq!(
            unary(NumericOp::I64TruncSatF32S, from_f32(f32::NEG_INFINITY)),
            Ok(i64::MIN as u64)
        );
    }

    #[test]
    fn reinterpret_preserves_nan_payloads() {
        let bits = 0x7fa0_0001;
        assert_eq!(unary(NumericOp::I32ReinterpretF32, bits), Ok(bits));
        assert_eq!(unary(NumericOp::F32Abs, bits | 0x8000_0000), Ok(bits));
    }

    #[test]
    fn every_operator_matches_its_arity() {
        use NumericOp::*;
        for op in [I32Add, I64Eqz, F32Sqrt, F64Copysign, I64TruncSatF64U, I32WrapI64] {
            let matches = matches!(
                (lookup(op), op.arity()),
                (OpFn::Unary(_), 1) | (OpFn::Binary(_), 2)
            );
            assert!(matches, "{}", op.name());
        }
    }
}
