//! Exact rational numbers over `i64`.
//!
//! Only what Gauss-Jordan elimination needs: field operations with a
//! checked reciprocal in place of division, normalization and integrality
//! checks. Values stay small in practice
//! (access-map coefficients), so there is no overflow promotion.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use snafu::ensure;

use crate::error::*;

/// Normalized rational `num / den` with `den > 0` and `gcd(num, den) == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    num: i64,
    den: i64,
}

const fn gcd(mut a: i64, mut b: i64) -> i64 {
    a = a.abs();
    b = b.abs();
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl Rational {
    pub const ZERO: Self = Self { num: 0, den: 1 };
    pub const ONE: Self = Self { num: 1, den: 1 };

    /// Create `num / den`.
    pub fn new(num: i64, den: i64) -> Result<Self> {
        ensure!(den != 0, ZeroDenominatorSnafu { num });
        Ok(Self::normalized(num, den))
    }

    /// `num / den` in lowest terms; `den` is non-zero.
    fn normalized(num: i64, den: i64) -> Self {
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd(num, den).max(1);
        Self { num: sign * num / g, den: sign * den / g }
    }

    pub const fn integer(value: i64) -> Self {
        Self { num: value, den: 1 }
    }

    pub const fn numer(&self) -> i64 {
        self.num
    }

    pub const fn denom(&self) -> i64 {
        self.den
    }

    pub const fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub const fn is_integer(&self) -> bool {
        self.den == 1
    }

    /// The integer value, if this rational is integral.
    pub const fn to_integer(&self) -> Option<i64> {
        if self.den == 1 { Some(self.num) } else { None }
    }

    /// `1 / self`; fails for zero.
    pub fn recip(self) -> Result<Self> {
        Self::new(self.den, self.num)
    }
}

impl From<i64> for Rational {
    fn from(value: i64) -> Self {
        Self::integer(value)
    }
}

impl Add for Rational {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::normalized(self.num * rhs.den + rhs.num * self.den, self.den * rhs.den)
    }
}

impl Sub for Rational {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

impl Mul for Rational {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self::normalized(self.num * rhs.num, self.den * rhs.den)
    }
}

impl Neg for Rational {
    type Output = Self;

    fn neg(self) -> Self {
        Self { num: -self.num, den: self.den }
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 { write!(f, "{}", self.num) } else { write!(f, "{}/{}", self.num, self.den) }
    }
}
