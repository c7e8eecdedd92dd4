//! The integer-like value lattices.
//!
//! An `int` (or `long`) is either a single known constant or the top
//! element of its sort. Arithmetic stays exact as long as both operands
//! are exact; division and remainder additionally surface division by a
//! known zero as a guaranteed `ArithmeticException`.

use std::fmt::Display;

use crate::types::Answer;

/// An abstract `int`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum IntValue {
    /// Any `int`.
    Any,
    /// Exactly the given constant.
    Exact(i32),
}

/// An abstract `long`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum LongValue {
    /// Any `long`.
    Any,
    /// Exactly the given constant.
    Exact(i64),
}

/// The outcome of a division or remainder.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DivisionOutcome<V> {
    /// The operation completes with the given value.
    Value(V),
    /// The divisor is known to be zero; the operation always throws
    /// `java/lang/ArithmeticException`.
    DivisionByZero,
    /// The divisor may be zero; the operation either completes with the
    /// given value or throws.
    MaybeDivisionByZero(V),
}

impl IntValue {
    /// Joins two abstract ints.
    #[must_use]
    pub fn join(self, other: IntValue) -> IntValue {
        match (self, other) {
            (IntValue::Exact(a), IntValue::Exact(b)) if a == b => IntValue::Exact(a),
            _ => IntValue::Any,
        }
    }

    /// Checks whether this value over-approximates `other`.
    #[must_use]
    pub fn abstracts_over(self, other: IntValue) -> bool {
        match (self, other) {
            (IntValue::Any, _) => true,
            (IntValue::Exact(a), IntValue::Exact(b)) => a == b,
            (IntValue::Exact(_), IntValue::Any) => false,
        }
    }

    fn binop(self, other: IntValue, op: impl FnOnce(i32, i32) -> i32) -> IntValue {
        match (self, other) {
            (IntValue::Exact(a), IntValue::Exact(b)) => IntValue::Exact(op(a, b)),
            _ => IntValue::Any,
        }
    }

    /// `iadd`.
    #[must_use]
    pub fn add(self, other: IntValue) -> IntValue {
        self.binop(other, i32::wrapping_add)
    }

    /// `isub`.
    #[must_use]
    pub fn sub(self, other: IntValue) -> IntValue {
        self.binop(other, i32::wrapping_sub)
    }

    /// `imul`.
    #[must_use]
    pub fn mul(self, other: IntValue) -> IntValue {
        self.binop(other, i32::wrapping_mul)
    }

    /// `idiv`. Division by a known zero throws unconditionally.
    #[must_use]
    pub fn div(self, divisor: IntValue) -> DivisionOutcome<IntValue> {
        match divisor {
            IntValue::Exact(0) => DivisionOutcome::DivisionByZero,
            IntValue::Exact(d) => DivisionOutcome::Value(match self {
                IntValue::Exact(n) => IntValue::Exact(n.wrapping_div(d)),
                IntValue::Any => IntValue::Any,
            }),
            IntValue::Any => DivisionOutcome::MaybeDivisionByZero(IntValue::Any),
        }
    }

    /// `irem`.
    #[must_use]
    pub fn rem(self, divisor: IntValue) -> DivisionOutcome<IntValue> {
        match divisor {
            IntValue::Exact(0) => DivisionOutcome::DivisionByZero,
            IntValue::Exact(d) => DivisionOutcome::Value(match self {
                IntValue::Exact(n) => IntValue::Exact(n.wrapping_rem(d)),
                IntValue::Any => IntValue::Any,
            }),
            IntValue::Any => DivisionOutcome::MaybeDivisionByZero(IntValue::Any),
        }
    }

    /// `ineg`.
    #[must_use]
    pub fn neg(self) -> IntValue {
        match self {
            IntValue::Exact(v) => IntValue::Exact(v.wrapping_neg()),
            IntValue::Any => IntValue::Any,
        }
    }

    /// `ishl`. Only the low five bits of the shift count are used.
    #[must_use]
    pub fn shl(self, shift: IntValue) -> IntValue {
        self.binop(shift, |v, s| v.wrapping_shl(s as u32))
    }

    /// `ishr`.
    #[must_use]
    pub fn shr(self, shift: IntValue) -> IntValue {
        self.binop(shift, |v, s| v.wrapping_shr(s as u32))
    }

    /// `iushr`.
    #[must_use]
    pub fn ushr(self, shift: IntValue) -> IntValue {
        self.binop(shift, |v, s| ((v as u32).wrapping_shr(s as u32)) as i32)
    }

    /// `iand`.
    #[must_use]
    pub fn and(self, other: IntValue) -> IntValue {
        self.binop(other, |a, b| a & b)
    }

    /// `ior`.
    #[must_use]
    pub fn or(self, other: IntValue) -> IntValue {
        self.binop(other, |a, b| a | b)
    }

    /// `ixor`.
    #[must_use]
    pub fn xor(self, other: IntValue) -> IntValue {
        self.binop(other, |a, b| a ^ b)
    }

    /// `iinc`.
    #[must_use]
    pub fn inc(self, constant: i16) -> IntValue {
        self.add(IntValue::Exact(i32::from(constant)))
    }

    /// `i2b`.
    #[must_use]
    pub fn to_byte(self) -> IntValue {
        self.convert(|v| i32::from(v as i8))
    }

    /// `i2c`.
    #[must_use]
    pub fn to_char(self) -> IntValue {
        self.convert(|v| v & 0xFFFF)
    }

    /// `i2s`.
    #[must_use]
    pub fn to_short(self) -> IntValue {
        self.convert(|v| i32::from(v as i16))
    }

    /// `i2l`.
    #[must_use]
    pub fn to_long(self) -> LongValue {
        match self {
            IntValue::Exact(v) => LongValue::Exact(i64::from(v)),
            IntValue::Any => LongValue::Any,
        }
    }

    fn convert(self, op: impl FnOnce(i32) -> i32) -> IntValue {
        match self {
            IntValue::Exact(v) => IntValue::Exact(op(v)),
            IntValue::Any => IntValue::Any,
        }
    }

    fn compare(self, other: IntValue, op: impl FnOnce(i32, i32) -> bool) -> Answer {
        match (self, other) {
            (IntValue::Exact(a), IntValue::Exact(b)) => Answer::from(op(a, b)),
            _ => Answer::Unknown,
        }
    }

    /// Whether this value equals `other`.
    #[must_use]
    pub fn is_equal_to(self, other: IntValue) -> Answer {
        self.compare(other, |a, b| a == b)
    }

    /// Whether this value is strictly less than `other`.
    #[must_use]
    pub fn is_less_than(self, other: IntValue) -> Answer {
        self.compare(other, |a, b| a < b)
    }

    /// Whether this value is less than or equal to `other`.
    #[must_use]
    pub fn is_less_or_equal(self, other: IntValue) -> Answer {
        self.compare(other, |a, b| a <= b)
    }
}

impl LongValue {
    /// Joins two abstract longs.
    #[must_use]
    pub fn join(self, other: LongValue) -> LongValue {
        match (self, other) {
            (LongValue::Exact(a), LongValue::Exact(b)) if a == b => LongValue::Exact(a),
            _ => LongValue::Any,
        }
    }

    /// Checks whether this value over-approximates `other`.
    #[must_use]
    pub fn abstracts_over(self, other: LongValue) -> bool {
        match (self, other) {
            (LongValue::Any, _) => true,
            (LongValue::Exact(a), LongValue::Exact(b)) => a == b,
            (LongValue::Exact(_), LongValue::Any) => false,
        }
    }

    fn binop(self, other: LongValue, op: impl FnOnce(i64, i64) -> i64) -> LongValue {
        match (self, other) {
            (LongValue::Exact(a), LongValue::Exact(b)) => LongValue::Exact(op(a, b)),
            _ => LongValue::Any,
        }
    }

    /// `ladd`.
    #[must_use]
    pub fn add(self, other: LongValue) -> LongValue {
        self.binop(other, i64::wrapping_add)
    }

    /// `lsub`.
    #[must_use]
    pub fn sub(self, other: LongValue) -> LongValue {
        self.binop(other, i64::wrapping_sub)
    }

    /// `lmul`.
    #[must_use]
    pub fn mul(self, other: LongValue) -> LongValue {
        self.binop(other, i64::wrapping_mul)
    }

    /// `ldiv`.
    #[must_use]
    pub fn div(self, divisor: LongValue) -> DivisionOutcome<LongValue> {
        match divisor {
            LongValue::Exact(0) => DivisionOutcome::DivisionByZero,
            LongValue::Exact(d) => DivisionOutcome::Value(match self {
                LongValue::Exact(n) => LongValue::Exact(n.wrapping_div(d)),
                LongValue::Any => LongValue::Any,
            }),
            LongValue::Any => DivisionOutcome::MaybeDivisionByZero(LongValue::Any),
        }
    }

    /// `lrem`.
    #[must_use]
    pub fn rem(self, divisor: LongValue) -> DivisionOutcome<LongValue> {
        match divisor {
            LongValue::Exact(0) => DivisionOutcome::DivisionByZero,
            LongValue::Exact(d) => DivisionOutcome::Value(match self {
                LongValue::Exact(n) => LongValue::Exact(n.wrapping_rem(d)),
                LongValue::Any => LongValue::Any,
            }),
            LongValue::Any => DivisionOutcome::MaybeDivisionByZero(LongValue::Any),
        }
    }

    /// `lneg`.
    #[must_use]
    pub fn neg(self) -> LongValue {
        match self {
            LongValue::Exact(v) => LongValue::Exact(v.wrapping_neg()),
            LongValue::Any => LongValue::Any,
        }
    }

    /// `lshl`, with an `int` shift count.
    #[must_use]
    pub fn shl(self, shift: IntValue) -> LongValue {
        self.shift(shift, i64::wrapping_shl)
    }

    /// `lshr`.
    #[must_use]
    pub fn shr(self, shift: IntValue) -> LongValue {
        self.shift(shift, i64::wrapping_shr)
    }

    /// `lushr`.
    #[must_use]
    pub fn ushr(self, shift: IntValue) -> LongValue {
        self.shift(shift, |v, s| ((v as u64).wrapping_shr(s)) as i64)
    }

    fn shift(self, shift: IntValue, op: impl FnOnce(i64, u32) -> i64) -> LongValue {
        match (self, shift) {
            (LongValue::Exact(v), IntValue::Exact(s)) => LongValue::Exact(op(v, s as u32)),
            _ => LongValue::Any,
        }
    }

    /// `land`.
    #[must_use]
    pub fn and(self, other: LongValue) -> LongValue {
        self.binop(other, |a, b| a & b)
    }

    /// `lor`.
    #[must_use]
    pub fn or(self, other: LongValue) -> LongValue {
        self.binop(other, |a, b| a | b)
    }

    /// `lxor`.
    #[must_use]
    pub fn xor(self, other: LongValue) -> LongValue {
        self.binop(other, |a, b| a ^ b)
    }

    /// `l2i`.
    #[must_use]
    pub fn to_int(self) -> IntValue {
        match self {
            LongValue::Exact(v) => IntValue::Exact(v as i32),
            LongValue::Any => IntValue::Any,
        }
    }

    /// `lcmp`.
    #[must_use]
    pub fn cmp_value(self, other: LongValue) -> IntValue {
        match (self, other) {
            (LongValue::Exact(a), LongValue::Exact(b)) => {
                IntValue::Exact(match a.cmp(&b) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                })
            }
            _ => IntValue::Any,
        }
    }
}

impl Display for IntValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntValue::Any => write!(f, "int"),
            IntValue::Exact(v) => write!(f, "int = {v}"),
        }
    }
}

impl Display for LongValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LongValue::Any => write!(f, "long"),
            LongValue::Exact(v) => write!(f, "long = {v}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Answer;

    #[test]
    fn join_of_distinct_constants_widens() {
        assert_eq!(
            IntValue::Exact(1).join(IntValue::Exact(2)),
            IntValue::Any
        );
        assert_eq!(
            IntValue::Exact(7).join(IntValue::Exact(7)),
            IntValue::Exact(7)
        );
        assert_eq!(IntValue::Any.join(IntValue::Exact(7)), IntValue::Any);
    }

    #[test]
    fn exact_arithmetic() {
        assert_eq!(
            IntValue::Exact(20).add(IntValue::Exact(22)),
            IntValue::Exact(42)
        );
        assert_eq!(
            IntValue::Exact(i32::MAX).add(IntValue::Exact(1)),
            IntValue::Exact(i32::MIN)
        );
        assert_eq!(IntValue::Exact(20).mul(IntValue::Any), IntValue::Any);
    }

    #[test]
    fn division_by_exact_zero_always_throws() {
        assert_eq!(
            IntValue::Any.div(IntValue::Exact(0)),
            DivisionOutcome::DivisionByZero
        );
        assert_eq!(
            IntValue::Exact(10).div(IntValue::Exact(3)),
            DivisionOutcome::Value(IntValue::Exact(3))
        );
        assert_eq!(
            IntValue::Exact(10).div(IntValue::Any),
            DivisionOutcome::MaybeDivisionByZero(IntValue::Any)
        );
        // Overflow division follows JVM semantics.
        assert_eq!(
            IntValue::Exact(i32::MIN).div(IntValue::Exact(-1)),
            DivisionOutcome::Value(IntValue::Exact(i32::MIN))
        );
    }

    #[test]
    fn comparisons_on_concrete_inputs_are_definite() {
        assert_eq!(
            IntValue::Exact(1).is_less_than(IntValue::Exact(2)),
            Answer::Yes
        );
        assert_eq!(
            IntValue::Exact(2).is_less_than(IntValue::Exact(2)),
            Answer::No
        );
        assert_eq!(IntValue::Any.is_less_than(IntValue::Exact(2)), Answer::Unknown);
    }

    #[test]
    fn narrowing_conversions() {
        assert_eq!(IntValue::Exact(0x1FF).to_byte(), IntValue::Exact(-1));
        assert_eq!(IntValue::Exact(-1).to_char(), IntValue::Exact(0xFFFF));
        assert_eq!(IntValue::Exact(0x1_0000).to_short(), IntValue::Exact(0));
    }

    #[test]
    fn long_comparison_produces_the_cmp_constant() {
        assert_eq!(
            LongValue::Exact(1).cmp_value(LongValue::Exact(2)),
            IntValue::Exact(-1)
        );
        assert_eq!(
            LongValue::Exact(2).cmp_value(LongValue::Exact(2)),
            IntValue::Exact(0)
        );
        assert_eq!(LongValue::Any.cmp_value(LongValue::Exact(2)), IntValue::Any);
    }
}
