//! Float trait abstraction for f32/f64 support.
//!
//! The estimation engine is written once against [`NlBayesFloat`] so callers can
//! denoise in single precision (fast, the common case for 8/16-bit images) or in
//! double precision (covariance-heavy workloads with large patches).

use ndarray::LinalgScalar;
use num_traits::{Float, FromPrimitive, NumAssign};
use std::fmt::Debug;
use std::iter::Sum;

/// Trait alias for floating point types supported by NL-Bayes.
///
/// This trait combines all the bounds needed by the engine:
/// - Basic float operations (Float, NumAssign)
/// - Conversion from primitive types (FromPrimitive)
/// - Iteration support (Sum)
/// - Matrix products through ndarray (LinalgScalar)
/// - Thread sharing for the rayon workers (Send, Sync)
pub trait NlBayesFloat:
    Float + FromPrimitive + NumAssign + LinalgScalar + Sum + Debug + Send + Sync + 'static
{
    /// Create a value from an f64 constant.
    fn from_f64_c(val: f64) -> Self;

    /// Create a value from a usize constant.
    fn usize_as(val: usize) -> Self;

    /// Widen to f64 for logging and statistics.
    fn as_f64(self) -> f64;
}

impl NlBayesFloat for f32 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val as f32
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl NlBayesFloat for f64 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f64
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}
