//! Multi-result affine maps `Zⁿ → Zᵐ`.

use std::fmt;

use smallvec::SmallVec;
use snafu::ensure;

use crate::error::*;
use crate::expr::AffineExpr;
use crate::rational::Rational;

/// An affine map from `num_dims` input dimensions to `results.len()` outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffineMap {
    num_dims: usize,
    results: SmallVec<[AffineExpr; 4]>,
}

impl AffineMap {
    pub fn new(num_dims: usize, results: impl IntoIterator<Item = AffineExpr>) -> Result<Self> {
        let results: SmallVec<[AffineExpr; 4]> = results.into_iter().collect();
        for r in &results {
            ensure!(r.num_dims() == num_dims, ArityMismatchSnafu { expected: num_dims, found: r.num_dims() });
        }
        Ok(Self { num_dims, results })
    }

    pub fn identity(num_dims: usize) -> Self {
        let results = (0..num_dims)
            .map(|d| {
                let mut coeffs: SmallVec<[i64; 4]> = SmallVec::from_elem(0, num_dims);
                coeffs[d] = 1;
                AffineExpr::new(coeffs, 0)
            })
            .collect();
        Self { num_dims, results }
    }

    /// Map whose `i`-th result is `d_{dims[i]}`.
    pub fn projection(num_dims: usize, dims: &[usize]) -> Result<Self> {
        let results = dims.iter().map(|&d| AffineExpr::dim(num_dims, d)).collect::<Result<_>>()?;
        Ok(Self { num_dims, results })
    }

    /// Build from coefficient rows; each row holds `num_dims` coefficients
    /// followed by the constant term.
    pub fn from_rows(num_dims: usize, rows: &[&[i64]]) -> Result<Self> {
        let results = rows
            .iter()
            .map(|row| {
                ensure!(row.len() == num_dims + 1, ArityMismatchSnafu { expected: num_dims + 1, found: row.len() });
                Ok(AffineExpr::new(row[..num_dims].to_vec(), row[num_dims]))
            })
            .collect::<Result<SmallVec<[AffineExpr; 4]>>>()?;
        Ok(Self { num_dims, results })
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    pub fn results(&self) -> &[AffineExpr] {
        &self.results
    }

    pub fn result(&self, i: usize) -> &AffineExpr {
        &self.results[i]
    }

    pub fn is_identity(&self) -> bool {
        self.num_dims == self.results.len()
            && self.results.iter().enumerate().all(|(i, r)| r.single_dim() == Some((i, 1)) && r.offset() == 0)
    }

    pub fn apply(&self, point: &[i64]) -> SmallVec<[i64; 4]> {
        self.results.iter().map(|r| r.eval(point)).collect()
    }

    /// `self ∘ inner`: apply `inner` first, then `self`.
    pub fn compose(&self, inner: &AffineMap) -> Result<AffineMap> {
        ensure!(
            inner.num_results() == self.num_dims,
            ArityMismatchSnafu { expected: self.num_dims, found: inner.num_results() }
        );
        let results = self
            .results
            .iter()
            .map(|r| r.substitute(&inner.results, inner.num_dims))
            .collect::<Result<SmallVec<[AffineExpr; 4]>>>()?;
        Ok(AffineMap { num_dims: inner.num_dims, results })
    }

    /// Exact inverse over the box `0 ≤ dᵢ < domain[i]`.
    ///
    /// Returns a map from this map's result space back to its input space.
    /// Input dimensions with extent 1 are pinned to 0 when the results do not
    /// determine them. Fails if a dimension with extent > 1 is not recoverable
    /// or the inverse needs fractional coefficients.
    pub fn invert(&self, domain: &[i64]) -> Result<AffineMap> {
        ensure!(domain.len() == self.num_dims, DomainAritySnafu { expected: self.num_dims, found: domain.len() });
        for (dim, &extent) in domain.iter().enumerate() {
            ensure!(extent > 0, EmptyDomainSnafu { dim, extent });
        }

        let n = self.num_dims;
        let m = self.results.len();

        // Augmented [M | I] so the row operations are recorded in the right block.
        let mut rows: Vec<Vec<Rational>> = self
            .results
            .iter()
            .enumerate()
            .map(|(j, r)| {
                let mut row: Vec<Rational> = r.coeffs().iter().map(|&c| Rational::integer(c)).collect();
                row.extend((0..m).map(|k| if k == j { Rational::ONE } else { Rational::ZERO }));
                row
            })
            .collect();

        let mut pivots: Vec<(usize, usize)> = Vec::new();
        let mut next_row = 0;
        for col in 0..n {
            let Some(found) = (next_row..m).find(|&r| !rows[r][col].is_zero()) else {
                continue;
            };
            rows.swap(next_row, found);
            let inv = rows[next_row][col].recip()?;
            for v in rows[next_row].iter_mut() {
                *v = *v * inv;
            }
            for r in 0..m {
                if r != next_row && !rows[r][col].is_zero() {
                    let factor = rows[r][col];
                    for c in 0..n + m {
                        let delta = factor * rows[next_row][c];
                        rows[r][c] = rows[r][c] - delta;
                    }
                }
            }
            pivots.push((next_row, col));
            next_row += 1;
        }

        let is_pivot = |col: usize| pivots.iter().any(|&(_, c)| c == col);
        for (dim, &extent) in domain.iter().enumerate() {
            if !is_pivot(dim) && extent > 1 {
                return NotInjectiveSnafu { dim }.fail();
            }
        }

        // x_p = Σ_j A[r][j]·(y_j − c_j); free dimensions are pinned to 0.
        let mut results: SmallVec<[AffineExpr; 4]> = (0..n).map(|_| AffineExpr::constant(m, 0)).collect();
        for &(r, p) in &pivots {
            let mut coeffs: SmallVec<[i64; 4]> = SmallVec::with_capacity(m);
            let mut constant = Rational::ZERO;
            for j in 0..m {
                let a = rows[r][n + j];
                coeffs.push(a.to_integer().ok_or(AffineError::NonIntegral { dim: p })?);
                constant = constant - a * Rational::integer(self.results[j].offset());
            }
            let constant = constant.to_integer().ok_or(AffineError::NonIntegral { dim: p })?;
            results[p] = AffineExpr::new(coeffs, constant);
        }

        Ok(AffineMap { num_dims: m, results })
    }

    /// Each result is a distinct input dimension with unit coefficient and no offset.
    pub fn is_projected_permutation(&self) -> bool {
        self.projected_dims().is_some()
    }

    /// For a projected permutation, the input dimension feeding each result.
    pub fn projected_dims(&self) -> Option<SmallVec<[usize; 4]>> {
        let mut seen: SmallVec<[bool; 8]> = SmallVec::from_elem(false, self.num_dims);
        let mut dims = SmallVec::with_capacity(self.results.len());
        for r in &self.results {
            let (d, c) = r.single_dim()?;
            if c != 1 || r.offset() != 0 || seen[d] {
                return None;
            }
            seen[d] = true;
            dims.push(d);
        }
        Some(dims)
    }
}

impl fmt::Display for AffineMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for d in 0..self.num_dims {
            if d > 0 {
                write!(f, ", ")?;
            }
            write!(f, "d{d}")?;
        }
        write!(f, ") -> (")?;
        for (i, r) in self.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, ")")
    }
}
