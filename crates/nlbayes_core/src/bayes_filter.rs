//! Linear MMSE (Bayesian) correction of a patch group.
//!
//! For every member `x` of a group with mean `μ`, signal covariance `Σs` and noise
//! covariance `Σn` the estimate is
//!
//! ```text
//! x̂ = μ + Σs · (Σs + Σn + λI)⁻¹ · (x − μ)
//! ```
//!
//! The regularised system matrix is factorised once per group (Cholesky) and the
//! factor is reused for every member. The ridge `λ` is always added; when the
//! factorisation still fails it is escalated a bounded number of times.

use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewMut2, Zip};

use crate::error::GroupError;
use crate::float_trait::NlBayesFloat;

/// Default ridge as a fraction of the mean noise variance.
pub const DEFAULT_RIDGE_FACTOR: f64 = 1e-2;

/// Ridge floor as a fraction of the mean diagonal of the system matrix.
const RIDGE_RELATIVE: f64 = 1e-6;

/// Absolute ridge floor (all-zero groups with zero noise).
const RIDGE_ABSOLUTE: f64 = 1e-10;

/// Ridge multiplier applied after a failed factorisation.
const RIDGE_ESCALATION: f64 = 10.0;

/// Number of factorisation attempts before giving up on a group.
const MAX_RIDGE_ATTEMPTS: usize = 8;

/// Per-worker scratch for the filter, sized once.
pub struct FilterWorkspace<F: NlBayesFloat> {
    factor: Array2<F>,
    solved: Array2<F>,
}

impl<F: NlBayesFloat> FilterWorkspace<F> {
    pub fn new(max_members: usize, dimension: usize) -> Self {
        Self {
            factor: Array2::zeros((dimension, dimension)),
            solved: Array2::zeros((max_members.max(1), dimension)),
        }
    }
}

/// In-place lower Cholesky factorisation `A = L·Lᵀ`.
///
/// Only the lower triangle of `a` is read. Returns `false` on a non-positive or
/// non-finite pivot; `a` is then left partially overwritten.
pub fn cholesky_in_place<F: NlBayesFloat>(a: &mut Array2<F>) -> bool {
    let d = a.nrows();
    for j in 0..d {
        let mut diag = a[[j, j]];
        for k in 0..j {
            let l = a[[j, k]];
            diag -= l * l;
        }
        if !(diag > F::zero()) || !diag.is_finite() {
            return false;
        }
        let l_jj = diag.sqrt();
        a[[j, j]] = l_jj;
        let inv = F::one() / l_jj;
        for i in (j + 1)..d {
            let mut v = a[[i, j]];
            for k in 0..j {
                v -= a[[i, k]] * a[[j, k]];
            }
            a[[i, j]] = v * inv;
        }
    }
    for i in 0..d {
        for j in (i + 1)..d {
            a[[i, j]] = F::zero();
        }
    }
    true
}

/// Solve `L·Lᵀ·z = b` in place for one right-hand side.
pub fn cholesky_solve<F: NlBayesFloat>(factor: &Array2<F>, b: &mut [F]) {
    let d = factor.nrows();
    debug_assert_eq!(b.len(), d);
    // forward: L y = b
    for i in 0..d {
        let mut v = b[i];
        for k in 0..i {
            v -= factor[[i, k]] * b[k];
        }
        b[i] = v / factor[[i, i]];
    }
    // backward: Lᵀ z = y
    for i in (0..d).rev() {
        let mut v = b[i];
        for k in (i + 1)..d {
            v -= factor[[k, i]] * b[k];
        }
        b[i] = v / factor[[i, i]];
    }
}

/// Ridge for a group: proportional to the noise level with a relative floor.
pub fn ridge_for<F: NlBayesFloat>(
    signal_covariance: &Array2<F>,
    noise_diagonal: &[F],
    ridge_factor: F,
) -> F {
    let d = noise_diagonal.len().max(1);
    let inv_d = F::one() / F::usize_as(d);
    let noise_mean = noise_diagonal.iter().copied().sum::<F>() * inv_d;
    let signal_mean = signal_covariance.diag().iter().copied().sum::<F>() * inv_d;
    ridge_factor * noise_mean
        + F::from_f64_c(RIDGE_RELATIVE) * (signal_mean + noise_mean)
        + F::from_f64_c(RIDGE_ABSOLUTE)
}

/// Outcome of a successful filter application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterOutcome<F> {
    /// Ridge actually used.
    pub ridge: F,
    /// Number of escalations beyond the initial ridge.
    pub escalations: usize,
}

/// Factorise `Σs + diag(noise) + λI`, escalating `λ` on failure.
fn factorise<F: NlBayesFloat>(
    signal_covariance: &Array2<F>,
    noise_diagonal: &[F],
    ridge: F,
    factor: &mut Array2<F>,
) -> Result<FilterOutcome<F>, GroupError> {
    let d = noise_diagonal.len();
    let mut lambda = ridge;
    for attempt in 0..MAX_RIDGE_ATTEMPTS {
        factor.assign(signal_covariance);
        for (i, &n) in noise_diagonal.iter().enumerate() {
            factor[[i, i]] += n + lambda;
        }
        if cholesky_in_place(factor) {
            return Ok(FilterOutcome {
                ridge: lambda,
                escalations: attempt,
            });
        }
        lambda *= F::from_f64_c(RIDGE_ESCALATION);
    }
    Err(GroupError::NumericalInstability {
        dimension: d,
        attempts: MAX_RIDGE_ATTEMPTS,
    })
}

/// Apply the MMSE correction to every member of a group.
///
/// * `members`: `k × d` values to filter (noisy patches).
/// * `center`: mean subtracted from and added back to each member.
/// * `signal_covariance`: `Σs`, `d × d`.
/// * `noise_diagonal`: diagonal of `Σn`, already scaled.
/// * `out`: `k × d` estimates.
pub fn apply_mmse<F: NlBayesFloat>(
    members: ArrayView2<F>,
    center: &Array1<F>,
    signal_covariance: &Array2<F>,
    noise_diagonal: &[F],
    ridge: F,
    workspace: &mut FilterWorkspace<F>,
    mut out: ArrayViewMut2<F>,
) -> Result<FilterOutcome<F>, GroupError> {
    let (k, d) = members.dim();
    debug_assert_eq!(signal_covariance.dim(), (d, d));
    debug_assert_eq!(out.dim(), (k, d));

    let outcome = factorise(signal_covariance, noise_diagonal, ridge, &mut workspace.factor)?;

    let mut solved = workspace.solved.slice_mut(s![..k, ..]);
    Zip::from(&mut solved)
        .and(&members)
        .and_broadcast(center)
        .for_each(|z, &x, &m| *z = x - m);
    for mut row in solved.rows_mut() {
        match row.as_slice_mut() {
            Some(b) => cholesky_solve(&workspace.factor, b),
            None => {
                let mut b = row.to_vec();
                cholesky_solve(&workspace.factor, &mut b);
                row.assign(&Array1::from(b));
            }
        }
    }

    // Σs symmetric: rows of Z·Σs are (Σs·z)ᵀ
    general_mat_mul(F::one(), &solved, signal_covariance, F::zero(), &mut out);
    Zip::from(&mut out)
        .and_broadcast(center)
        .for_each(|o, &m| *o += m);
    Ok(outcome)
}
