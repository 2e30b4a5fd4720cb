//! Single affine expression over a fixed number of dimensions.

use std::fmt;

use smallvec::{SmallVec, smallvec};

use crate::error::*;

/// `Σ coeffs[i]·d_i + constant` over `coeffs.len()` input dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffineExpr {
    coeffs: SmallVec<[i64; 4]>,
    constant: i64,
}

impl AffineExpr {
    pub fn new(coeffs: impl Into<SmallVec<[i64; 4]>>, constant: i64) -> Self {
        Self { coeffs: coeffs.into(), constant }
    }

    /// The expression `d_dim` over `num_dims` dimensions.
    pub fn dim(num_dims: usize, dim: usize) -> Result<Self> {
        snafu::ensure!(dim < num_dims, DimOutOfRangeSnafu { dim, num_dims });
        let mut coeffs: SmallVec<[i64; 4]> = smallvec![0; num_dims];
        coeffs[dim] = 1;
        Ok(Self { coeffs, constant: 0 })
    }

    pub fn constant(num_dims: usize, value: i64) -> Self {
        Self { coeffs: smallvec![0; num_dims], constant: value }
    }

    pub fn num_dims(&self) -> usize {
        self.coeffs.len()
    }

    pub fn coeffs(&self) -> &[i64] {
        &self.coeffs
    }

    pub fn coeff(&self, dim: usize) -> i64 {
        self.coeffs.get(dim).copied().unwrap_or(0)
    }

    pub fn offset(&self) -> i64 {
        self.constant
    }

    /// Dimensions with a non-zero coefficient.
    pub fn used_dims(&self) -> impl Iterator<Item = usize> + '_ {
        self.coeffs.iter().enumerate().filter(|(_, c)| **c != 0).map(|(d, _)| d)
    }

    /// `Some((dim, coeff))` if exactly one dimension appears.
    pub fn single_dim(&self) -> Option<(usize, i64)> {
        let mut used = self.used_dims();
        let dim = used.next()?;
        if used.next().is_some() {
            return None;
        }
        Some((dim, self.coeffs[dim]))
    }

    pub fn eval(&self, point: &[i64]) -> i64 {
        debug_assert_eq!(point.len(), self.coeffs.len());
        self.coeffs.iter().zip(point).map(|(c, x)| c * x).sum::<i64>() + self.constant
    }

    /// Substitute `d_i := inner[i]`; the result ranges over `inner`'s dimensions.
    pub fn substitute(&self, inner: &[AffineExpr], inner_dims: usize) -> Result<AffineExpr> {
        snafu::ensure!(
            inner.len() == self.coeffs.len(),
            ArityMismatchSnafu { expected: self.coeffs.len(), found: inner.len() }
        );
        let mut coeffs: SmallVec<[i64; 4]> = smallvec![0; inner_dims];
        let mut constant = self.constant;
        for (&c, e) in self.coeffs.iter().zip(inner) {
            if c == 0 {
                continue;
            }
            snafu::ensure!(
                e.num_dims() == inner_dims,
                ArityMismatchSnafu { expected: inner_dims, found: e.num_dims() }
            );
            for (acc, ec) in coeffs.iter_mut().zip(&e.coeffs) {
                *acc += c * ec;
            }
            constant += c * e.constant;
        }
        Ok(AffineExpr { coeffs, constant })
    }

    /// Number of distinct values taken over a box of per-dimension `extents`.
    ///
    /// `Σ |cᵢ|·(extentᵢ − 1) + 1`, exact for a single dimension and an upper
    /// bound otherwise.
    pub fn footprint(&self, extents: &[i64]) -> i64 {
        self.coeffs.iter().zip(extents).map(|(c, e)| c.abs() * (e - 1)).sum::<i64>() + 1
    }
}

impl fmt::Display for AffineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (d, &c) in self.coeffs.iter().enumerate() {
            if c == 0 {
                continue;
            }
            let sep = match (first, c < 0) {
                (true, true) => "-",
                (true, false) => "",
                (false, true) => " - ",
                (false, false) => " + ",
            };
            match c.abs() {
                1 => write!(f, "{sep}d{d}")?,
                a => write!(f, "{sep}{a}*d{d}")?,
            }
            first = false;
        }
        match (first, self.constant) {
            (true, k) => write!(f, "{k}"),
            (false, 0) => Ok(()),
            (false, k) if k < 0 => write!(f, " - {}", -k),
            (false, k) => write!(f, " + {k}"),
        }
    }
}
