//! Noise covariance supplied to the estimators.
//!
//! Two models are supported:
//! - **Isotropic**: one scalar variance shared by every sample.
//! - **Field**: a per-sample variance image with the exact shape of the noisy
//!   image (same width, height and channel count).
//!
//! Either way the noise is treated as uncorrelated between samples, so the patch
//! noise covariance is diagonal. For a field model each diagonal entry is the
//! variance at that patch position averaged over the group's members.

use ndarray::ArrayView3;

use crate::block_matching::PatchMatch;
use crate::float_trait::NlBayesFloat;

/// Read-only noise description shared by all workers of a stage.
#[derive(Debug, Clone, Copy)]
pub enum NoiseModel<'a, F: NlBayesFloat> {
    Isotropic { variance: F },
    Field { variances: ArrayView3<'a, F> },
}

impl<'a, F: NlBayesFloat> NoiseModel<'a, F> {
    /// Isotropic model from a standard deviation.
    pub fn from_sigma(sigma: F) -> Self {
        Self::Isotropic {
            variance: sigma * sigma,
        }
    }

    /// Diagonal of the group noise covariance, channel-major like the patches.
    ///
    /// `out` must hold `patch_size² · channels` values.
    pub fn fill_group_diagonal(
        &self,
        matches: &[PatchMatch<F>],
        patch_size: usize,
        out: &mut [F],
    ) {
        match self {
            Self::Isotropic { variance } => out.fill(*variance),
            Self::Field { variances } => {
                let channels = variances.dim().2;
                let patch_area = patch_size * patch_size;
                debug_assert_eq!(out.len(), patch_area * channels);
                out.fill(F::zero());
                if matches.is_empty() {
                    return;
                }
                for m in matches {
                    for pr in 0..patch_size {
                        for pc in 0..patch_size {
                            let pix = variances.slice(ndarray::s![m.row + pr, m.col + pc, ..]);
                            for (ch, &v) in pix.iter().enumerate() {
                                out[ch * patch_area + pr * patch_size + pc] += v.max(F::zero());
                            }
                        }
                    }
                }
                let inv_k = F::one() / F::usize_as(matches.len());
                for v in out.iter_mut() {
                    *v *= inv_k;
                }
            }
        }
    }
}

/// Mean of a diagonal slice; the reference noise level of a group or channel.
#[inline]
pub fn mean_variance<F: NlBayesFloat>(diagonal: &[F]) -> F {
    if diagonal.is_empty() {
        return F::zero();
    }
    diagonal.iter().copied().sum::<F>() / F::usize_as(diagonal.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_isotropic_fills_variance() {
        let model = NoiseModel::from_sigma(3.0f32);
        let mut out = vec![0.0f32; 18];
        model.fill_group_diagonal(&[], 3, &mut out);
        assert!(out.iter().all(|&v| v == 9.0));
        assert_eq!(mean_variance(&out), 9.0);
    }

    #[test]
    fn test_field_averages_over_members() {
        // variance = 10 * row + channel
        let field = Array3::from_shape_fn((6, 6, 2), |(r, _, ch)| (10 * r + ch) as f64);
        let model = NoiseModel::Field {
            variances: field.view(),
        };
        let matches = [
            PatchMatch { row: 0, col: 0, distance: 0.0 },
            PatchMatch { row: 2, col: 3, distance: 1.0 },
        ];
        let mut out = vec![0.0f64; 2 * 4];
        model.fill_group_diagonal(&matches, 2, &mut out);
        // channel 0, patch row 0: mean(0, 20) = 10; patch row 1: mean(10, 30) = 20
        assert_eq!(&out[..4], &[10.0, 10.0, 20.0, 20.0]);
        // channel 1 adds one everywhere
        assert_eq!(&out[4..], &[11.0, 11.0, 21.0, 21.0]);
    }

    #[test]
    fn test_uniform_field_matches_isotropic() {
        let field = Array3::from_elem((8, 8, 1), 25.0f32);
        let field_model = NoiseModel::Field {
            variances: field.view(),
        };
        let iso_model = NoiseModel::from_sigma(5.0f32);
        let matches = [
            PatchMatch { row: 1, col: 1, distance: 0.0 },
            PatchMatch { row: 4, col: 0, distance: 2.0 },
        ];
        let mut a = vec![0.0f32; 9];
        let mut b = vec![0.0f32; 9];
        field_model.fill_group_diagonal(&matches, 3, &mut a);
        iso_model.fill_group_diagonal(&matches, 3, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_negative_field_values_clamped() {
        let field = Array3::from_elem((4, 4, 1), -1.0f32);
        let model = NoiseModel::Field {
            variances: field.view(),
        };
        let matches = [PatchMatch { row: 0, col: 0, distance: 0.0 }];
        let mut out = vec![1.0f32; 4];
        model.fill_group_diagonal(&matches, 2, &mut out);
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
