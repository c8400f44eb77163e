//! NL-Bayes Core Algorithm Library
//!
//! Pure Rust implementation of the two-stage NL-Bayes (Non-Local Bayesian)
//! image denoising algorithm. Groups of similar patches are modelled as Gaussian
//! draws and corrected with a linear MMSE estimator: once from the noisy image
//! alone (basic estimate), then again with statistics taken from the basic
//! estimate (final estimate).

pub mod aggregation;
pub mod bayes_filter;
pub mod block_matching;
pub mod covariance;
pub mod error;
pub mod flat_area;
pub mod float_trait;
pub mod image;
pub mod noise_model;
pub mod orchestration;
pub mod patch_grid;
pub mod pipeline;

// Re-export commonly used types at the crate root
pub use aggregation::AccumulationBuffer;
pub use block_matching::{compute_integral_images, find_similar_patches, PatchMatch};
pub use error::{GroupError, NlBayesError};
pub use float_trait::NlBayesFloat;
pub use image::ImageSize;
pub use noise_model::NoiseModel;
pub use orchestration::{nl_bayes_denoise, DenoiseInput, DenoiseOutput, NlBayesConfig, NoiseImage};
pub use patch_grid::ReferenceGrid;
pub use pipeline::{run_nl_bayes_step, StageMode, StageOutput, StageParams, StageStatistics};
