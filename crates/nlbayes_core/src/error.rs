use thiserror::Error;

use crate::image::ImageSize;

/// Configuration errors raised before any pixel is processed.
///
/// These are the only failures surfaced to the caller; every numerical edge case
/// inside a stage degrades to a local fallback instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NlBayesError {
    /// Stage 1 is skipped in favour of a guide and stage 2 is skipped too.
    #[error("skipping the first step (guide provided) and the second step are mutually exclusive")]
    MutuallyExclusiveSteps,
    /// Stage 1 skip requested without a guide image.
    #[error("skipping the first step requires a guide image")]
    MissingGuide,
    /// Guide image shape differs from the noisy image shape.
    #[error("guide image is {got}, expected {expected}")]
    GuideSizeMismatch { expected: ImageSize, got: ImageSize },
    /// Noise covariance image shape differs from the noisy image shape.
    #[error("noise covariance image is {got}, expected {expected}")]
    NoiseSizeMismatch { expected: ImageSize, got: ImageSize },
    /// Custom noise model requested without a covariance image.
    #[error("custom noise model requested but no noise covariance image was supplied")]
    MissingNoiseModel,
    /// Flat buffer length does not match its declared size.
    #[error("{buffer} buffer: expected {expected} samples, got {got}")]
    BufferSizeMismatch {
        buffer: &'static str,
        expected: usize,
        got: usize,
    },
    /// Image has a zero dimension.
    #[error("image has no samples ({0})")]
    EmptyImage(ImageSize),
    /// A stage parameter is out of its valid range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Local, recoverable failure of a single patch group.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupError {
    /// Fewer members than needed for a full-rank covariance estimate.
    #[error("patch group has {members} members, needs at least {} for dimension {dimension}", dimension + 1)]
    Degenerate { members: usize, dimension: usize },
    /// The regularised filter matrix could not be factorised.
    #[error("filter matrix of dimension {dimension} is not positive definite after {attempts} ridge attempts")]
    NumericalInstability { dimension: usize, attempts: usize },
}
