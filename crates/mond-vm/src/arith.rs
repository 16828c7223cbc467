//! Arithmetic with Lua 5.1 number semantics (doubles throughout).

use crate::coerce;
use mond_core::string::StringInterner;
use mond_core::value::TValue;

/// Binary arithmetic operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl ArithOp {
    pub fn name(&self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Mod => "mod",
            ArithOp::Pow => "pow",
        }
    }
}

/// Result of a raw arithmetic attempt.
pub enum ArithResult {
    Ok(TValue),
    /// Type mismatch; caller should try the metamethod.
    NeedMetamethod,
}

/// Raw binary arithmetic: numbers, or strings with numeric syntax.
/// Division by zero follows IEEE 754 (produces an infinity or NaN).
pub fn arith_op(op: ArithOp, a: TValue, b: TValue, strings: &StringInterner) -> ArithResult {
    let fa = coerce::to_number(a, strings);
    let fb = coerce::to_number(b, strings);
    match (fa, fb) {
        (Some(fa), Some(fb)) => ArithResult::Ok(TValue::from_number(float_arith(op, fa, fb))),
        _ => ArithResult::NeedMetamethod,
    }
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Pow => a.powf(b),
        ArithOp::Mod => lua_fmod(a, b),
    }
}

/// Lua modulo: a - floor(a/b)*b, computed from the truncated remainder
/// to avoid the precision loss of the naive formula.
fn lua_fmod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r > 0.0) != (b > 0.0)) {
        r + b
    } else {
        r
    }
}

/// Raw unary minus.
pub fn arith_unm(v: TValue, strings: &StringInterner) -> ArithResult {
    match coerce::to_number(v, strings) {
        Some(f) => ArithResult::Ok(TValue::from_number(-f)),
        None => ArithResult::NeedMetamethod,
    }
}

/// String length for the # operator, if the operand is a string.
pub fn str_len(v: TValue, strings: &StringInterner) -> Option<i64> {
    v.as_string_id().map(|sid| strings.get_bytes(sid).len() as i64)
}
