//! Homogeneous-area shortcut.
//!
//! A group whose sample variance is no larger than the expected noise variance
//! (times `gamma`) cannot be told apart from a constant patch plus noise. Its
//! covariance carries no usable signal structure, so every member is replaced
//! by the group's per-channel mean instead of running the Bayesian filter.

use ndarray::{s, ArrayView2, ArrayViewMut2};

use crate::float_trait::NlBayesFloat;

/// Default multiple of the noise variance below which a group is flat.
pub const DEFAULT_FLAT_GAMMA: f64 = 1.05;

/// Scalar mean and variance of every sample in a block.
pub fn block_mean_variance<F: NlBayesFloat>(block: ArrayView2<F>) -> (F, F) {
    let n = block.len();
    if n == 0 {
        return (F::zero(), F::zero());
    }
    let inv_n = F::one() / F::usize_as(n);
    let mean = block.iter().copied().sum::<F>() * inv_n;
    let variance = block
        .iter()
        .map(|&v| {
            let d = v - mean;
            d * d
        })
        .sum::<F>()
        * inv_n;
    (mean, variance)
}

/// `true` when `variance < gamma · noise_variance`.
#[inline]
pub fn is_flat<F: NlBayesFloat>(variance: F, noise_variance: F, gamma: F) -> bool {
    variance < gamma * noise_variance
}

/// Per-channel scalar means of a channel-major group (`k × p²·channels`).
pub fn channel_means<F: NlBayesFloat>(group: ArrayView2<F>, patch_area: usize, out: &mut [F]) {
    for (ch, slot) in out.iter_mut().enumerate() {
        let block = group.slice(s![.., ch * patch_area..(ch + 1) * patch_area]);
        *slot = block_mean_variance(block).0;
    }
}

/// Pooled variance of a channel-major group: per-channel variances around each
/// channel's own mean, averaged over channels.
pub fn pooled_channel_variance<F: NlBayesFloat>(group: ArrayView2<F>, patch_area: usize) -> F {
    let channels = group.ncols() / patch_area.max(1);
    if channels == 0 {
        return F::zero();
    }
    let mut total = F::zero();
    for ch in 0..channels {
        let block = group.slice(s![.., ch * patch_area..(ch + 1) * patch_area]);
        total += block_mean_variance(block).1;
    }
    total / F::usize_as(channels)
}

/// Write the per-channel means into every member of a channel-major estimate.
pub fn fill_channel_means<F: NlBayesFloat>(
    mut estimates: ArrayViewMut2<F>,
    patch_area: usize,
    means: &[F],
) {
    for (ch, &mean) in means.iter().enumerate() {
        estimates
            .slice_mut(s![.., ch * patch_area..(ch + 1) * patch_area])
            .fill(mean);
    }
}
