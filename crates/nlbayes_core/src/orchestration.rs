//! Two-stage NL-Bayes denoising.
//!
//! This module is the public entry point. It validates the request, builds the
//! noise model and drives the two stages in order:
//! - **Stage 1 (basic)**: groups, statistics and estimates from the noisy image
//! - **Stage 2 (final)**: groups on the basic estimate, signal covariance from the
//!   basic estimate, Bayesian correction of the noisy image
//!
//! A caller-supplied guide replaces stage 1; either stage can be skipped, but
//! not both.

use std::time::Instant;

use ndarray::{Array3, ArrayView3};
use tracing::{debug, info};

use crate::error::NlBayesError;
use crate::float_trait::NlBayesFloat;
use crate::image::ImageSize;
use crate::noise_model::NoiseModel;
use crate::pipeline::{run_nl_bayes_step, StageMode, StageParams};

// =============================================================================
// Constants
// =============================================================================

/// Noise standard deviation of the default configuration (8-bit scale).
const DEFAULT_SIGMA: f64 = 10.0;

/// Channel count of the default configuration.
const DEFAULT_CHANNELS: usize = 1;

// =============================================================================
// Types
// =============================================================================

/// Configuration for two-stage NL-Bayes denoising.
#[derive(Debug, Clone, PartialEq)]
pub struct NlBayesConfig<F: NlBayesFloat> {
    /// Noise standard deviation for the isotropic model. Default: 10
    pub sigma: F,
    /// Basic stage parameters.
    pub stage1: StageParams<F>,
    /// Final stage parameters.
    pub stage2: StageParams<F>,
    /// Skip stage 1 and use the input guide as the basic estimate.
    pub skip_stage1: bool,
    /// Stop after stage 1.
    pub skip_stage2: bool,
    /// Use the per-sample noise covariance image instead of `sigma`.
    pub use_custom_noise_model: bool,
}

impl<F: NlBayesFloat> Default for NlBayesConfig<F> {
    fn default() -> Self {
        Self::for_noise_level(F::from_f64_c(DEFAULT_SIGMA), DEFAULT_CHANNELS)
    }
}

impl<F: NlBayesFloat> NlBayesConfig<F> {
    /// Configuration with both stages filled from the published parameter tables.
    pub fn for_noise_level(sigma: F, channels: usize) -> Self {
        Self {
            sigma,
            stage1: StageParams::for_noise_level(sigma, channels, StageMode::Basic),
            stage2: StageParams::for_noise_level(sigma, channels, StageMode::Final),
            skip_stage1: false,
            skip_stage2: false,
            use_custom_noise_model: false,
        }
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<(), NlBayesError> {
        if self.skip_stage1 && self.skip_stage2 {
            return Err(NlBayesError::MutuallyExclusiveSteps);
        }
        if !(self.sigma.is_finite() && self.sigma >= F::zero()) {
            return Err(NlBayesError::InvalidParameter {
                name: "sigma",
                reason: "must be finite and >= 0".to_string(),
            });
        }
        if !self.skip_stage1 {
            self.stage1.validate()?;
        }
        if !self.skip_stage2 {
            self.stage2.validate()?;
        }
        Ok(())
    }
}

/// Per-sample noise variances with their own declared size.
#[derive(Debug, Clone, Copy)]
pub struct NoiseImage<'a, F: NlBayesFloat> {
    pub data: &'a [F],
    pub size: ImageSize,
}

/// Buffers for one denoising request. All buffers are channel-interleaved.
#[derive(Debug, Clone, Copy)]
pub struct DenoiseInput<'a, F: NlBayesFloat> {
    pub noisy: &'a [F],
    pub size: ImageSize,
    /// Basic estimate to use when stage 1 is skipped. Size-checked whenever
    /// present, but only read when stage 1 is skipped.
    pub guide: Option<&'a [F]>,
    /// Size-checked whenever present, but only read with a custom noise model.
    pub noise_covariance: Option<NoiseImage<'a, F>>,
}

impl<'a, F: NlBayesFloat> DenoiseInput<'a, F> {
    pub fn new(noisy: &'a [F], size: ImageSize) -> Self {
        Self {
            noisy,
            size,
            guide: None,
            noise_covariance: None,
        }
    }

    pub fn with_guide(mut self, guide: &'a [F]) -> Self {
        self.guide = Some(guide);
        self
    }

    pub fn with_noise_covariance(mut self, data: &'a [F], size: ImageSize) -> Self {
        self.noise_covariance = Some(NoiseImage { data, size });
        self
    }
}

/// Stage outputs, same layout and size as the noisy input.
#[derive(Debug, Clone, PartialEq)]
pub struct DenoiseOutput<F> {
    /// Present when stage 1 ran.
    pub basic: Option<Vec<F>>,
    /// Present when stage 2 ran.
    pub final_estimate: Option<Vec<F>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageState {
    Init,
    GuideProvided,
    Stage1,
    Stage2,
    Stage2Only,
    SkipStage2,
    Done,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn into_interleaved<F: NlBayesFloat>(image: Array3<F>) -> Vec<F> {
    if image.is_standard_layout() {
        image.into_raw_vec_and_offset().0
    } else {
        image.iter().copied().collect()
    }
}

fn resolve_noise_model<'a, F: NlBayesFloat>(
    input: &DenoiseInput<'a, F>,
    config: &NlBayesConfig<F>,
) -> Result<NoiseModel<'a, F>, NlBayesError> {
    let supplied = input
        .noise_covariance
        .map(|noise| {
            if noise.size != input.size {
                return Err(NlBayesError::NoiseSizeMismatch {
                    expected: input.size,
                    got: noise.size,
                });
            }
            noise.size.view(noise.data, "noise_covariance")
        })
        .transpose()?;
    if !config.use_custom_noise_model {
        return Ok(NoiseModel::from_sigma(config.sigma));
    }
    let variances = supplied.ok_or(NlBayesError::MissingNoiseModel)?;
    Ok(NoiseModel::Field { variances })
}

fn run_stage<F: NlBayesFloat>(
    noisy: ArrayView3<F>,
    guide: Option<ArrayView3<F>>,
    mode: StageMode,
    noise: &NoiseModel<'_, F>,
    params: &StageParams<F>,
    size: ImageSize,
) -> Result<Array3<F>, NlBayesError> {
    info!(
        ?mode,
        %size,
        patch_size = params.patch_size,
        group_size = params.group_size,
        "stage started"
    );
    let started = Instant::now();
    let output = run_nl_bayes_step(noisy, guide, mode, noise, params)?;
    info!(
        ?mode,
        groups = output.stats.groups,
        elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0,
        "stage finished"
    );
    Ok(output.estimate)
}

// =============================================================================
// Main Entry Point
// =============================================================================

/// Denoise an image with two-stage NL-Bayes.
///
/// Every configuration and buffer check happens before any pixel is processed.
///
/// # Errors
/// Returns [`NlBayesError`] when the configuration is invalid or a buffer does
/// not match its declared size.
pub fn nl_bayes_denoise<F: NlBayesFloat>(
    input: &DenoiseInput<'_, F>,
    config: &NlBayesConfig<F>,
) -> Result<DenoiseOutput<F>, NlBayesError> {
    config.validate()?;

    let size = input.size;
    if size.is_empty() {
        return Err(NlBayesError::EmptyImage(size));
    }
    let noisy = size.view(input.noisy, "noisy")?;
    let guide = input
        .guide
        .map(|guide| size.view(guide, "guide"))
        .transpose()?;
    let provided_guide = if config.skip_stage1 {
        Some(guide.ok_or(NlBayesError::MissingGuide)?)
    } else {
        None
    };
    let noise = resolve_noise_model(input, config)?;

    let mut output = DenoiseOutput {
        basic: None,
        final_estimate: None,
    };
    let mut basic: Option<Array3<F>> = None;
    let mut state = if config.skip_stage1 {
        StageState::GuideProvided
    } else {
        StageState::Init
    };
    debug!(?state, %size, "denoising started");

    loop {
        let next = match state {
            StageState::Init => StageState::Stage1,
            StageState::GuideProvided => StageState::Stage2Only,
            StageState::Stage1 => {
                basic = Some(run_stage(
                    noisy,
                    None,
                    StageMode::Basic,
                    &noise,
                    &config.stage1,
                    size,
                )?);
                if config.skip_stage2 {
                    StageState::SkipStage2
                } else {
                    StageState::Stage2
                }
            }
            StageState::Stage2 | StageState::Stage2Only => {
                let guide = basic
                    .as_ref()
                    .map(|b| b.view())
                    .or(provided_guide.map(|g| g.reborrow()));
                let estimate = run_stage(
                    noisy,
                    guide,
                    StageMode::Final,
                    &noise,
                    &config.stage2,
                    size,
                )?;
                output.final_estimate = Some(into_interleaved(estimate));
                StageState::Done
            }
            StageState::SkipStage2 => StageState::Done,
            StageState::Done => break,
        };
        debug!(from = ?state, to = ?next, "stage transition");
        state = next;
    }

    output.basic = basic.map(into_interleaved);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn smooth_image(size: ImageSize) -> Vec<f64> {
        let mut out = Vec::with_capacity(size.sample_count());
        for r in 0..size.height {
            for c in 0..size.width {
                for ch in 0..size.channels {
                    out.push(
                        120.0
                            + 50.0 * (r as f64 * 0.18).sin()
                            + 40.0 * (c as f64 * 0.11).cos()
                            + 15.0 * ch as f64,
                    );
                }
            }
        }
        out
    }

    fn add_noise(clean: &[f64], sigma: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, sigma).unwrap();
        clean.iter().map(|&v| v + normal.sample(&mut rng)).collect()
    }

    fn mse(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>() / a.len() as f64
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = NlBayesConfig::<f32>::default();
        assert!(config.validate().is_ok());
        assert!(config.stage1.flat_area);
        assert!(!config.stage2.flat_area);
    }

    #[test]
    fn test_skipping_both_stages_is_rejected_first() {
        let mut config = NlBayesConfig::<f32>::default();
        config.skip_stage1 = true;
        config.skip_stage2 = true;
        // buffer is also the wrong length: the step conflict must win
        let noisy = vec![0.0f32; 3];
        let input = DenoiseInput::new(&noisy, ImageSize::new(8, 8, 1));
        assert_eq!(
            nl_bayes_denoise(&input, &config),
            Err(NlBayesError::MutuallyExclusiveSteps)
        );
    }

    #[test]
    fn test_zero_noise_returns_input() {
        let size = ImageSize::new(32, 32, 1);
        let clean = smooth_image(size);
        let config = NlBayesConfig::for_noise_level(0.0, 1);
        let out = nl_bayes_denoise(&DenoiseInput::new(&clean, size), &config).unwrap();

        let basic = out.basic.unwrap();
        let fin = out.final_estimate.unwrap();
        for ((b, f), c) in basic.iter().zip(&fin).zip(&clean) {
            assert!((b - c).abs() < 0.5, "basic {b} vs {c}");
            assert!((f - c).abs() < 0.5, "final {f} vs {c}");
        }
    }

    #[test]
    fn test_constant_image_flat_area() {
        let size = ImageSize::new(64, 64, 1);
        let mut config = NlBayesConfig::for_noise_level(10.0, 1);
        config.stage1.patch_size = 7;
        config.stage1.step_size = 3;
        config.stage1.group_size = 32;
        config.stage1.flat_area = true;
        config.skip_stage2 = true;

        for seed in [1, 2, 3, 4, 5, 2024] {
            let noisy = add_noise(&vec![128.0; size.sample_count()], 10.0, seed);
            let out = nl_bayes_denoise(&DenoiseInput::new(&noisy, size), &config).unwrap();
            assert!(out.final_estimate.is_none());
            let basic = out.basic.unwrap();
            let worst = basic.iter().map(|v| (v - 128.0).abs()).fold(0.0, f64::max);
            assert!(worst <= 2.0, "seed {seed}: max deviation {worst}");
        }
    }

    #[test]
    fn test_two_stages_reduce_error() {
        let size = ImageSize::new(40, 40, 1);
        let clean = smooth_image(size);
        let noisy = add_noise(&clean, 20.0, 1);
        let config = NlBayesConfig::for_noise_level(20.0, 1);
        let out = nl_bayes_denoise(&DenoiseInput::new(&noisy, size), &config).unwrap();

        let noisy_mse = mse(&noisy, &clean);
        let basic_mse = mse(out.basic.as_ref().unwrap(), &clean);
        let final_mse = mse(out.final_estimate.as_ref().unwrap(), &clean);
        assert!(basic_mse < noisy_mse, "basic {basic_mse} vs noisy {noisy_mse}");
        assert!(final_mse < 0.5 * noisy_mse, "final {final_mse} vs noisy {noisy_mse}");
    }

    #[test]
    fn test_colour_image_round_trips_shape() {
        let size = ImageSize::new(24, 20, 3);
        let clean = smooth_image(size);
        let noisy = add_noise(&clean, 15.0, 5);
        let config = NlBayesConfig::for_noise_level(15.0, 3);
        let out = nl_bayes_denoise(&DenoiseInput::new(&noisy, size), &config).unwrap();
        let fin = out.final_estimate.unwrap();
        assert_eq!(fin.len(), size.sample_count());
        assert!(mse(&fin, &clean) < mse(&noisy, &clean));
    }

    #[test]
    fn test_guide_entry_matches_full_run() {
        let size = ImageSize::new(32, 28, 1);
        let clean = smooth_image(size);
        let noisy = add_noise(&clean, 15.0, 77);
        let config = NlBayesConfig::for_noise_level(15.0, 1);
        let full = nl_bayes_denoise(&DenoiseInput::new(&noisy, size), &config).unwrap();
        let basic = full.basic.clone().unwrap();

        let mut guided = config.clone();
        guided.skip_stage1 = true;
        let input = DenoiseInput::new(&noisy, size).with_guide(&basic);
        let out = nl_bayes_denoise(&input, &guided).unwrap();

        assert!(out.basic.is_none());
        assert_eq!(out.final_estimate, full.final_estimate);
    }

    #[test]
    fn test_skip_stage1_requires_guide() {
        let size = ImageSize::new(16, 16, 1);
        let noisy = vec![0.0f32; size.sample_count()];
        let mut config = NlBayesConfig::default();
        config.skip_stage1 = true;
        assert_eq!(
            nl_bayes_denoise(&DenoiseInput::new(&noisy, size), &config),
            Err(NlBayesError::MissingGuide)
        );

        let short_guide = vec![0.0f32; 10];
        let input = DenoiseInput::new(&noisy, size).with_guide(&short_guide);
        assert!(matches!(
            nl_bayes_denoise(&input, &config),
            Err(NlBayesError::BufferSizeMismatch { buffer: "guide", .. })
        ));
    }

    #[test]
    fn test_buffer_and_noise_mismatches_rejected() {
        let size = ImageSize::new(16, 16, 1);
        let noisy = vec![0.0f32; size.sample_count()];

        let config = NlBayesConfig::default();
        let input = DenoiseInput::new(&noisy[..100], size);
        assert!(matches!(
            nl_bayes_denoise(&input, &config),
            Err(NlBayesError::BufferSizeMismatch { buffer: "noisy", .. })
        ));

        let mut custom = NlBayesConfig::default();
        custom.use_custom_noise_model = true;
        assert_eq!(
            nl_bayes_denoise(&DenoiseInput::new(&noisy, size), &custom),
            Err(NlBayesError::MissingNoiseModel)
        );

        let field = vec![1.0f32; 16 * 8];
        let input = DenoiseInput::new(&noisy, size).with_noise_covariance(&field, ImageSize::new(16, 8, 1));
        assert!(matches!(
            nl_bayes_denoise(&input, &custom),
            Err(NlBayesError::NoiseSizeMismatch { .. })
        ));

        let input = DenoiseInput::new(&noisy, size).with_noise_covariance(&field, size);
        assert!(matches!(
            nl_bayes_denoise(&input, &custom),
            Err(NlBayesError::BufferSizeMismatch {
                buffer: "noise_covariance",
                ..
            })
        ));
    }

    #[test]
    fn test_unused_buffers_are_still_size_checked() {
        let size = ImageSize::new(16, 16, 1);
        let noisy = vec![0.0f32; size.sample_count()];
        let config = NlBayesConfig::default();
        assert!(!config.skip_stage1 && !config.use_custom_noise_model);

        let short_guide = vec![0.0f32; 10];
        let input = DenoiseInput::new(&noisy, size).with_guide(&short_guide);
        assert!(matches!(
            nl_bayes_denoise(&input, &config),
            Err(NlBayesError::BufferSizeMismatch { buffer: "guide", .. })
        ));

        let field = vec![1.0f32; 16 * 8];
        let input = DenoiseInput::new(&noisy, size).with_noise_covariance(&field, ImageSize::new(16, 8, 1));
        assert!(matches!(
            nl_bayes_denoise(&input, &config),
            Err(NlBayesError::NoiseSizeMismatch { .. })
        ));

        // well-sized but unused buffers are accepted
        let guide = vec![0.0f32; size.sample_count()];
        let field = vec![1.0f32; size.sample_count()];
        let input = DenoiseInput::new(&noisy, size)
            .with_guide(&guide)
            .with_noise_covariance(&field, size);
        assert!(nl_bayes_denoise(&input, &config).is_ok());
    }

    #[test]
    fn test_empty_image_rejected() {
        let size = ImageSize::new(0, 5, 1);
        let config = NlBayesConfig::<f32>::default();
        assert_eq!(
            nl_bayes_denoise(&DenoiseInput::new(&[], size), &config),
            Err(NlBayesError::EmptyImage(size))
        );
    }

    #[test]
    fn test_negative_sigma_rejected() {
        let config = NlBayesConfig::<f64>::for_noise_level(-1.0, 1);
        assert!(matches!(
            config.validate(),
            Err(NlBayesError::InvalidParameter { name: "sigma", .. })
        ));
    }

    #[test]
    fn test_uniform_noise_field_matches_isotropic() {
        let size = ImageSize::new(30, 30, 1);
        let clean = smooth_image(size);
        let sigma = 12.0;
        let noisy = add_noise(&clean, sigma, 31);
        let field = vec![sigma * sigma; size.sample_count()];

        let config = NlBayesConfig::for_noise_level(sigma, 1);
        let iso = nl_bayes_denoise(&DenoiseInput::new(&noisy, size), &config).unwrap();

        let mut custom = config.clone();
        custom.use_custom_noise_model = true;
        let input = DenoiseInput::new(&noisy, size).with_noise_covariance(&field, size);
        let fld = nl_bayes_denoise(&input, &custom).unwrap();

        let a = iso.final_estimate.unwrap();
        let b = fld.final_estimate.unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6, "{x} vs {y}");
        }
    }
}
