//! Empirical statistics of patch groups.
//!
//! A group is a `k × d` matrix, one flattened patch per row. Covariances use the
//! biased estimator (divide by `k`), which is what the Bayesian derivation
//! subtracts the noise covariance from.
//!
//! Two forms are provided:
//! - [`estimate_single`]: stage 1, noisy group only. The signal covariance is
//!   `C_noisy - β·Σn`, clipped back towards positive semi-definite.
//! - [`estimate_joint`]: stage 2, paired noisy and guide groups. The guide is
//!   already a denoised estimate, so its covariance is the signal covariance;
//!   the noisy group only supplies the centring mean.

use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2, ArrayView2, Zip};

use crate::error::GroupError;
use crate::float_trait::NlBayesFloat;

/// Per-dimension mean of `group` (`k × d`) into `mean`.
pub fn group_mean<F: NlBayesFloat>(group: ArrayView2<F>, mean: &mut Array1<F>) {
    debug_assert_eq!(group.ncols(), mean.len());
    mean.fill(F::zero());
    let k = group.nrows();
    if k == 0 {
        return;
    }
    for row in group.outer_iter() {
        Zip::from(&mut *mean).and(&row).for_each(|m, &v| *m += v);
    }
    let inv_k = F::one() / F::usize_as(k);
    mean.mapv_inplace(|v| v * inv_k);
}

/// Mean and covariance of one group, sized once per worker.
#[derive(Debug, Clone)]
pub struct GroupStatistics<F: NlBayesFloat> {
    pub mean: Array1<F>,
    pub covariance: Array2<F>,
    centered: Array2<F>,
}

impl<F: NlBayesFloat> GroupStatistics<F> {
    /// Buffers for groups of up to `max_members` patches of dimension `dimension`.
    pub fn new(max_members: usize, dimension: usize) -> Self {
        Self {
            mean: Array1::zeros(dimension),
            covariance: Array2::zeros((dimension, dimension)),
            centered: Array2::zeros((max_members.max(1), dimension)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Compute the mean and biased covariance of `group` (`k × d`).
    pub fn compute(&mut self, group: ArrayView2<F>) {
        let (k, d) = group.dim();
        debug_assert_eq!(d, self.dimension());
        debug_assert!(k <= self.centered.nrows());
        if k == 0 {
            self.mean.fill(F::zero());
            self.covariance.fill(F::zero());
            return;
        }

        let inv_k = F::one() / F::usize_as(k);
        group_mean(group, &mut self.mean);

        let mut centered = self.centered.slice_mut(s![..k, ..]);
        Zip::from(centered.rows_mut())
            .and(group.rows())
            .for_each(|mut dst, src| {
                Zip::from(&mut dst)
                    .and(&src)
                    .and(&self.mean)
                    .for_each(|o, &v, &m| *o = v - m);
            });

        general_mat_mul(inv_k, &centered.t(), &centered, F::zero(), &mut self.covariance);
    }
}

/// Reject groups whose covariance cannot have full rank.
#[inline]
pub fn check_rank(members: usize, dimension: usize) -> Result<(), GroupError> {
    if members < dimension + 1 {
        return Err(GroupError::Degenerate { members, dimension });
    }
    Ok(())
}

/// Subtract `beta · diag(noise_diagonal)` from a covariance matrix.
pub fn subtract_noise<F: NlBayesFloat>(covariance: &mut Array2<F>, noise_diagonal: &[F], beta: F) {
    for (i, &n) in noise_diagonal.iter().enumerate() {
        covariance[[i, i]] -= beta * n;
    }
}

/// Push a symmetric matrix back towards positive semi-definite without an
/// eigen-decomposition.
///
/// Negative diagonal entries become zero and each off-diagonal entry is clamped
/// to the Cauchy–Schwarz bound `|c_ij| <= sqrt(c_ii · c_jj)`. The result is
/// symmetric, has a non-negative diagonal and only valid 2×2 minors; any residual
/// indefiniteness is absorbed by the ridge term of the filter.
pub fn clip_to_psd<F: NlBayesFloat>(covariance: &mut Array2<F>) {
    let d = covariance.nrows();
    for i in 0..d {
        if covariance[[i, i]] < F::zero() {
            covariance[[i, i]] = F::zero();
        }
    }
    for i in 0..d {
        let cii = covariance[[i, i]];
        for j in (i + 1)..d {
            let bound = (cii * covariance[[j, j]]).sqrt();
            let sym = (covariance[[i, j]] + covariance[[j, i]]) / F::from_f64_c(2.0);
            let clamped = sym.max(-bound).min(bound);
            covariance[[i, j]] = clamped;
            covariance[[j, i]] = clamped;
        }
    }
}

/// Stage 1 statistics: noisy mean and clipped signal covariance.
///
/// `noise_diagonal` is the unscaled group noise variance per dimension; `beta`
/// scales it before subtraction.
pub fn estimate_single<F: NlBayesFloat>(
    group: ArrayView2<F>,
    noise_diagonal: &[F],
    beta: F,
    stats: &mut GroupStatistics<F>,
) -> Result<(), GroupError> {
    let (k, d) = group.dim();
    check_rank(k, d)?;
    stats.compute(group);
    subtract_noise(&mut stats.covariance, noise_diagonal, beta);
    clip_to_psd(&mut stats.covariance);
    Ok(())
}

/// Stage 2 statistics.
///
/// Fills `guide_stats` with the guide mean and signal covariance and
/// `noisy_mean` with the per-dimension mean of the noisy group.
pub fn estimate_joint<F: NlBayesFloat>(
    noisy: ArrayView2<F>,
    guide: ArrayView2<F>,
    noisy_mean: &mut Array1<F>,
    guide_stats: &mut GroupStatistics<F>,
) -> Result<(), GroupError> {
    debug_assert_eq!(noisy.dim(), guide.dim());
    let (k, d) = guide.dim();
    check_rank(k, d)?;
    guide_stats.compute(guide);
    clip_to_psd(&mut guide_stats.covariance);
    group_mean(noisy, noisy_mean);
    Ok(())
}
