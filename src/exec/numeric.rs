// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Pure arithmetic, comparison, and conversion opcode semantics.
//!
//! These opcodes only pop and push values on the current activation's
//! operand stack; they never touch the store or the instruction cursor,
//! unlike the control-flow, call, memory, and table opcodes the parent
//! module handles directly.

use crate::store::Value;
use crate::types::Opcode;

use super::Trap;

/// Executes one numeric opcode against `stack`. Never called with a
/// control-flow, call, reference, variable, table, memory, or bulk opcode;
/// the parent module's dispatch only reaches here for the range this
/// handles.
pub(super) fn exec(op: Opcode, stack: &mut Vec<Value>) -> Result<(), Trap> {
    macro_rules! pop {
        () => {
            stack.pop().expect("operand stack underflow")
        };
    }
    macro_rules! unop_i32 {
        ($f:expr) => {{
            let a = pop!().as_i32();
            stack.push(Value::I32($f(a)));
        }};
    }
    macro_rules! binop_i32 {
        ($f:expr) => {{
            let b = pop!().as_i32();
            let a = pop!().as_i32();
            stack.push(Value::I32($f(a, b)));
        }};
    }
    macro_rules! cmp_i32 {
        ($f:expr) => {{
            let b = pop!().as_i32();
            let a = pop!().as_i32();
            stack.push(Value::I32(i32::from($f(a, b))));
        }};
    }
    macro_rules! binop_i64 {
        ($f:expr) => {{
            let b = pop!().as_i64();
            let a = pop!().as_i64();
            stack.push(Value::I64($f(a, b)));
        }};
    }
    macro_rules! cmp_i64 {
        ($f:expr) => {{
            let b = pop!().as_i64();
            let a = pop!().as_i64();
            stack.push(Value::I32(i32::from($f(a, b))));
        }};
    }
    macro_rules! unop_f32 {
        ($f:expr) => {{
            let a = pop!().as_f32();
            stack.push(Value::F32($f(a)));
        }};
    }
    macro_rules! binop_f32 {
        ($f:expr) => {{
            let b = pop!().as_f32();
            let a = pop!().as_f32();
            stack.push(Value::F32($f(a, b)));
        }};
    }
    macro_rules! cmp_f32 {
        ($f:expr) => {{
            let b = pop!().as_f32();
            let a = pop!().as_f32();
            stack.push(Value::I32(i32::from($f(a, b))));
        }};
    }
    macro_rules! unop_f64 {
        ($f:expr) => {{
            let a = pop!().as_f64();
            stack.push(Value::F64($f(a)));
        }};
    }
    macro_rules! binop_f64 {
        ($f:expr) => {{
            let b = pop!().as_f64();
            let a = pop!().as_f64();
            stack.push(Value::F64($f(a, b)));
        }};
    }
    macro_rules! cmp_f64 {
        ($f:expr) => {{
            let b = pop!().as_f64();
            let a = pop!().as_f64();
            stack.push(Value::I32(i32::from($f(a, b))));
        }};
    }

    match op {
        Opcode::I32Eqz => unop_i32!(|a: i32| i32::from(a == 0)),
        Opcode::I32Eq => cmp_i32!(|a, b| a == b),
        Opcode::I32Ne => cmp_i32!(|a, b| a != b),
        Opcode::I32LtS => cmp_i32!(|a, b| a < b),
        Opcode::I32LtU => cmp_i32!(|a: i32, b: i32| (a as u32) < (b as u32)),
        Opcode::I32GtS => cmp_i32!(|a, b| a > b),
        Opcode::I32GtU => cmp_i32!(|a: i32, b: i32| (a as u32) > (b as u32)),
        Opcode::I32LeS => cmp_i32!(|a, b| a <= b),
        Opcode::I32LeU => cmp_i32!(|a: i32, b: i32| (a as u32) <= (b as u32)),
        Opcode::I32GeS => cmp_i32!(|a, b| a >= b),
        Opcode::I32GeU => cmp_i32!(|a: i32, b: i32| (a as u32) >= (b as u32)),

        Opcode::I64Eqz => {
            let a = pop!().as_i64();
            stack.push(Value::I32(i32::from(a == 0)));
        }
        Opcode::I64Eq => cmp_i64!(|a, b| a == b),
        Opcode::I64Ne => cmp_i64!(|a, b| a != b),
        Opcode::I64LtS => cmp_i64!(|a, b| a < b),
        Opcode::I64LtU => cmp_i64!(|a: i64, b: i64| (a as u64) < (b as u64)),
        Opcode::I64GtS => cmp_i64!(|a, b| a > b),
        Opcode::I64GtU => cmp_i64!(|a: i64, b: i64| (a as u64) > (b as u64)),
        Opcode::I64LeS => cmp_i64!(|a, b| a <= b),
        Opcode::I64LeU => cmp_i64!(|a: i64, b: i64| (a as u64) <= (b as u64)),
        Opcode::I64GeS => cmp_i64!(|a, b| a >= b),
        Opcode::I64GeU => cmp_i64!(|a: i64, b: i64| (a as u64) >= (b as u64)),

        Opcode::F32Eq => cmp_f32!(|a, b| a == b),
        Opcode::F32Ne => cmp_f32!(|a, b| a != b),
        Opcode::F32Lt => cmp_f32!(|a, b| a < b),
        Opcode::F32Gt => cmp_f32!(|a, b| a > b),
        Opcode::F32Le => cmp_f32!(|a, b| a <= b),
        Opcode::F32Ge => cmp_f32!(|a, b| a >= b),
        Opcode::F64Eq => cmp_f64!(|a, b| a == b),
        Opcode::F64Ne => cmp_f64!(|a, b| a != b),
        Opcode::F64Lt => cmp_f64!(|a, b| a < b),
        Opcode::F64Gt => cmp_f64!(|a, b| a > b),
        Opcode::F64Le => cmp_f64!(|a, b| a <= b),
        Opcode::F64Ge => cmp_f64!(|a, b| a >= b),

        Opcode::I32Clz => unop_i32!(|a: i32| a.leading_zeros() as i32),
        Opcode::I32Ctz => unop_i32!(|a: i32| a.trailing_zeros() as i32),
        Opcode::I32Popcnt => unop_i32!(|a: i32| a.count_ones() as i32),
        Opcode::I32Add => binop_i32!(i32::wrapping_add),
        Opcode::I32Sub => binop_i32!(i32::wrapping_sub),
        Opcode::I32Mul => binop_i32!(i32::wrapping_mul),
        Opcode::I32DivS => {
            let b = pop!().as_i32();
            let a = pop!().as_i32();
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            if a == i32::MIN && b == -1 {
                return Err(Trap::IntegerOverflow);
            }
            stack.push(Value::I32(a.wrapping_div(b)));
        }
        Opcode::I32DivU => {
            let b = pop!().as_u32();
            let a = pop!().as_u32();
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            stack.push(Value::I32((a / b) as i32));
        }
        Opcode::I32RemS => {
            let b = pop!().as_i32();
            let a = pop!().as_i32();
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            stack.push(Value::I32(a.wrapping_rem(b)));
        }
        Opcode::I32RemU => {
            let b = pop!().as_u32();
            let a = pop!().as_u32();
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            stack.push(Value::I32((a % b) as i32));
        }
        Opcode::I32And => binop_i32!(|a: i32, b: i32| a & b),
        Opcode::I32Or => binop_i32!(|a: i32, b: i32| a | b),
        Opcode::I32Xor => binop_i32!(|a: i32, b: i32| a ^ b),
        Opcode::I32Shl => binop_i32!(|a: i32, b: i32| a.wrapping_shl(b as u32)),
        Opcode::I32ShrS => binop_i32!(|a: i32, b: i32| a.wrapping_shr(b as u32)),
        Opcode::I32ShrU => {
            binop_i32!(|a: i32, b: i32| (a as u32).wrapping_shr(b as u32) as i32);
        }
        Opcode::I32Rotl => binop_i32!(|a: i32, b: i32| a.rotate_left(b as u32)),
        Opcode::I32Rotr => binop_i32!(|a: i32, b: i32| a.rotate_right(b as u32)),

        Opcode::I64Clz => {
            let a = pop!().as_i64();
            stack.push(Value::I64(i64::from(a.leading_zeros())));
        }
        Opcode::I64Ctz => {
            let a = pop!().as_i64();
            stack.push(Value::I64(i64::from(a.trailing_zeros())));
        }
        Opcode::I64Popcnt => {
            let a = pop!().as_i64();
            stack.push(Value::I64(i64::from(a.count_ones())));
        }
        Opcode::I64Add => binop_i64!(i64::wrapping_add),
        Opcode::I64Sub => binop_i64!(i64::wrapping_sub),
        Opcode::I64Mul => binop_i64!(i64::wrapping_mul),
        Opcode::I64DivS => {
            let b = pop!().as_i64();
            let a = pop!().as_i64();
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            if a == i64::MIN && b == -1 {
                return Err(Trap::IntegerOverflow);
            }
            stack.push(Value::I64(a.wrapping_div(b)));
        }
        Opcode::I64DivU => {
            let b = pop!().as_u64();
            let a = pop!().as_u64();
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            stack.push(Value::I64((a / b) as i64));
        }
        Opcode::I64RemS => {
            let b = pop!().as_i64();
            let a = pop!().as_i64();
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            stack.push(Value::I64(a.wrapping_rem(b)));
        }
        Opcode::I64RemU => {
            let b = pop!().as_u64();
            let a = pop!().as_u64();
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            stack.push(Value::I64((a % b) as i64));
        }
        Opcode::I64And => binop_i64!(|a: i64, b: i64| a & b),
        Opcode::I64Or => binop_i64!(|a: i64, b: i64| a | b),
        Opcode::I64Xor => binop_i64!(|a: i64, b: i64| a ^ b),
        Opcode::I64Shl => binop_i64!(|a: i64, b: i64| a.wrapping_shl(b as u32)),
        Opcode::I64ShrS => binop_i64!(|a: i64, b: i64| a.wrapping_shr(b as u32)),
        Opcode::I64ShrU => {
            binop_i64!(|a: i64, b: i64| (a as u64).wrapping_shr(b as u32) as i64);
        }
        Opcode::I64Rotl => binop_i64!(|a: i64, b: i64| a.rotate_left(b as u32)),
        Opcode::I64Rotr => binop_i64!(|a: i64, b: i64| a.rotate_right(b as u32)),

        Opcode::F32Abs => unop_f32!(f32::abs),
        Opcode::F32Neg => unop_f32!(|a: f32| -a),
        Opcode::F32Ceil => unop_f32!(f32::ceil),
        Opcode::F32Floor => unop_f32!(f32::floor),
        Opcode::F32Trunc => unop_f32!(f32::trunc),
        Opcode::F32Nearest => unop_f32!(f32::round_ties_even),
        Opcode::F32Sqrt => unop_f32!(f32::sqrt),
        Opcode::F32Add => binop_f32!(|a: f32, b: f32| a + b),
        Opcode::F32Sub => binop_f32!(|a: f32, b: f32| a - b),
        Opcode::F32Mul => binop_f32!(|a: f32, b: f32| a * b),
        Opcode::F32Div => binop_f32!(|a: f32, b: f32| a / b),
        Opcode::F32Min => binop_f32!(f32_min),
        Opcode::F32Max => binop_f32!(f32_max),
        Opcode::F32Copysign => binop_f32!(f32::copysign),

        Opcode::F64Abs => unop_f64!(f64::abs),
        Opcode::F64Neg => unop_f64!(|a: f64| -a),
        Opcode::F64Ceil => unop_f64!(f64::ceil),
        Opcode::F64Floor => unop_f64!(f64::floor),
        Opcode::F64Trunc => unop_f64!(f64::trunc),
        Opcode::F64Nearest => unop_f64!(f64::round_ties_even),
        Opcode::F64Sqrt => unop_f64!(f64::sqrt),
        Opcode::F64Add => binop_f64!(|a: f64, b: f64| a + b),
        Opcode::F64Sub => binop_f64!(|a: f64, b: f64| a - b),
        Opcode::F64Mul => binop_f64!(|a: f64, b: f64| a * b),
        Opcode::F64Div => binop_f64!(|a: f64, b: f64| a / b),
        Opcode::F64Min => binop_f64!(f64_min),
        Opcode::F64Max => binop_f64!(f64_max),
        Opcode::F64Copysign => binop_f64!(f64::copysign),

        Opcode::I32WrapI64 => {
            let a = pop!().as_i64();
            stack.push(Value::I32(a as i32));
        }
        Opcode::I32TruncF32S => {
            let a = pop!().as_f32();
            stack.push(Value::I32(trunc_to_i32(f64::from(a), true)?));
        }
        Opcode::I32TruncF32U => {
            let a = pop!().as_f32();
            stack.push(Value::I32(trunc_to_i32(f64::from(a), false)?));
        }
        Opcode::I32TruncF64S => {
            let a = pop!().as_f64();
            stack.push(Value::I32(trunc_to_i32(a, true)?));
        }
        Opcode::I32TruncF64U => {
            let a = pop!().as_f64();
            stack.push(Value::I32(trunc_to_i32(a, false)?));
        }
        Opcode::I64ExtendI32S => {
            let a = pop!().as_i32();
            stack.push(Value::I64(i64::from(a)));
        }
        Opcode::I64ExtendI32U => {
            let a = pop!().as_u32();
            stack.push(Value::I64(i64::from(a)));
        }
        Opcode::I64TruncF32S => {
            let a = pop!().as_f32();
            stack.push(Value::I64(trunc_to_i64(f64::from(a), true)?));
        }
        Opcode::I64TruncF32U => {
            let a = pop!().as_f32();
            stack.push(Value::I64(trunc_to_i64(f64::from(a), false)?));
        }
        Opcode::I64TruncF64S => {
            let a = pop!().as_f64();
            stack.push(Value::I64(trunc_to_i64(a, true)?));
        }
        Opcode::I64TruncF64U => {
            let a = pop!().as_f64();
            stack.push(Value::I64(trunc_to_i64(a, false)?));
        }
        Opcode::F32ConvertI32S => {
            let a = pop!().as_i32();
            stack.push(Value::F32(a as f32));
        }
        Opcode::F32ConvertI32U => {
            let a = pop!().as_u32();
            stack.push(Value::F32(a as f32));
        }
        Opcode::F32ConvertI64S => {
            let a = pop!().as_i64();
            stack.push(Value::F32(a as f32));
        }
        Opcode::F32ConvertI64U => {
            let a = pop!().as_u64();
            stack.push(Value::F32(a as f32));
        }
        Opcode::F32DemoteF64 => {
            let a = pop!().as_f64();
            stack.push(Value::F32(a as f32));
        }
        Opcode::F64ConvertI32S => {
            let a = pop!().as_i32();
            stack.push(Value::F64(f64::from(a)));
        }
        Opcode::F64ConvertI32U => {
            let a = pop!().as_u32();
            stack.push(Value::F64(f64::from(a)));
        }
        Opcode::F64ConvertI64S => {
            let a = pop!().as_i64();
            stack.push(Value::F64(a as f64));
        }
        Opcode::F64ConvertI64U => {
            let a = pop!().as_u64();
            stack.push(Value::F64(a as f64));
        }
        Opcode::F64PromoteF32 => {
            let a = pop!().as_f32();
            stack.push(Value::F64(f64::from(a)));
        }
        Opcode::I32ReinterpretF32 => {
            let a = pop!().as_f32();
            stack.push(Value::I32(a.to_bits() as i32));
        }
        Opcode::I64ReinterpretF64 => {
            let a = pop!().as_f64();
            stack.push(Value::I64(a.to_bits() as i64));
        }
        Opcode::F32ReinterpretI32 => {
            let a = pop!().as_i32();
            stack.push(Value::F32(f32::from_bits(a as u32)));
        }
        Opcode::F64ReinterpretI64 => {
            let a = pop!().as_i64();
            stack.push(Value::F64(f64::from_bits(a as u64)));
        }
        Opcode::I32Extend8S => unop_i32!(|a: i32| i32::from(a as i8)),
        Opcode::I32Extend16S => unop_i32!(|a: i32| i32::from(a as i16)),
        Opcode::I64Extend8S => {
            let a = pop!().as_i64();
            stack.push(Value::I64(i64::from(a as i8)));
        }
        Opcode::I64Extend16S => {
            let a = pop!().as_i64();
            stack.push(Value::I64(i64::from(a as i16)));
        }
        Opcode::I64Extend32S => {
            let a = pop!().as_i64();
            stack.push(Value::I64(i64::from(a as i32)));
        }

        _ => unreachable!("{op:?} is not a numeric opcode"),
    }
    Ok(())
}

fn f32_min(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_negative() || b.is_sign_negative() {
            -0.0
        } else {
            0.0
        };
    }
    a.min(b)
}

fn f32_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_positive() || b.is_sign_positive() {
            0.0
        } else {
            -0.0
        };
    }
    a.max(b)
}

fn f64_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_negative() || b.is_sign_negative() {
            -0.0
        } else {
            0.0
        };
    }
    a.min(b)
}

fn f64_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_positive() || b.is_sign_positive() {
            0.0
        } else {
            -0.0
        };
    }
    a.max(b)
}

// WebAssembly's trapping truncation requires an exact bounds check against
// the target integer's representable range; promoting to f64 keeps every
// comparison exact for both f32 and f64 inputs.
fn trunc_to_i32(v: f64, signed: bool) -> Result<i32, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if signed {
        if t < -2_147_483_648.0 || t >= 2_147_483_648.0 {
            return Err(Trap::InvalidConversionToInteger);
        }
        Ok(t as i32)
    } else {
        if !(0.0..4_294_967_296.0).contains(&t) {
            return Err(Trap::InvalidConversionToInteger);
        }
        Ok((t as u32) as i32)
    }
}

fn trunc_to_i64(v: f64, signed: bool) -> Result<i64, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    let t = v.trunc();
    if signed {
        if t < -9_223_372_036_854_775_808.0 || t >= 9_223_372_036_854_775_808.0 {
            return Err(Trap::InvalidConversionToInteger);
        }
        Ok(t as i64)
    } else {
        if !(0.0..18_446_744_073_709_551_616.0).contains(&t) {
            return Err(Trap::InvalidConversionToInteger);
        }
        Ok((t as u64) as i64)
    }
}

/// Non-trapping counterpart used by the saturating bulk-opcode family: NaN
/// saturates to zero, out-of-range values clamp to the target's min/max.
pub(super) fn sat_trunc_to_i32(v: f64, signed: bool) -> i32 {
    if v.is_nan() {
        return 0;
    }
    let t = v.trunc();
    if signed {
        if t < -2_147_483_648.0 {
            i32::MIN
        } else if t >= 2_147_483_648.0 {
            i32::MAX
        } else {
            t as i32
        }
    } else if t < 0.0 {
        0
    } else if t >= 4_294_967_296.0 {
        u32::MAX as i32
    } else {
        (t as u32) as i32
    }
}

pub(super) fn sat_trunc_to_i64(v: f64, signed: bool) -> i64 {
    if v.is_nan() {
        return 0;
    }
    let t = v.trunc();
    if signed {
        if t < -9_223_372_036_854_775_808.0 {
            i64::MIN
        } else if t >= 9_223_372_036_854_775_808.0 {
            i64::MAX
        } else {
            t as i64
        }
    } else if t < 0.0 {
        0
    } else if t >= 18_446_744_073_709_551_616.0 {
        u64::MAX as i64
    } else {
        (t as u64) as i64
    }
}
