//! Flat interleaved image buffers and patch extraction.
//!
//! Images cross the public boundary as flat slices with an [`ImageSize`]. Inside
//! the engine they are viewed as `(height, width, channels)` arrays, which is the
//! same memory layout as a channel-interleaved buffer.

use std::fmt;

use ndarray::{ArrayView3, ArrayViewMut1};

use crate::error::NlBayesError;
use crate::float_trait::NlBayesFloat;

/// Image dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl ImageSize {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Number of samples in a buffer of this size.
    pub fn sample_count(&self) -> usize {
        self.width * self.height * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }

    /// View a flat interleaved buffer as `(height, width, channels)`.
    pub(crate) fn view<'a, F: NlBayesFloat>(
        &self,
        buffer: &'a [F],
        name: &'static str,
    ) -> Result<ArrayView3<'a, F>, NlBayesError> {
        if buffer.len() != self.sample_count() {
            return Err(NlBayesError::BufferSizeMismatch {
                buffer: name,
                expected: self.sample_count(),
                got: buffer.len(),
            });
        }
        ArrayView3::from_shape((self.height, self.width, self.channels), buffer).map_err(|_| {
            NlBayesError::BufferSizeMismatch {
                buffer: name,
                expected: self.sample_count(),
                got: buffer.len(),
            }
        })
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// Copy the patch at `(row, col)` into `out`, channel-major:
/// `out[ch * p² + pr * p + pc] = image[row + pr, col + pc, ch]`.
#[inline]
pub(crate) fn extract_patch<F: NlBayesFloat>(
    image: ArrayView3<F>,
    row: usize,
    col: usize,
    patch_size: usize,
    mut out: ArrayViewMut1<F>,
) {
    let channels = image.dim().2;
    let patch_area = patch_size * patch_size;
    debug_assert_eq!(out.len(), patch_area * channels);
    if let (Some(src), Some(dst)) = (image.as_slice_memory_order(), out.as_slice_mut()) {
        let width = image.dim().1;
        for pr in 0..patch_size {
            let row_base = ((row + pr) * width + col) * channels;
            for pc in 0..patch_size {
                let pix_base = row_base + pc * channels;
                for ch in 0..channels {
                    dst[ch * patch_area + pr * patch_size + pc] = src[pix_base + ch];
                }
            }
        }
    } else {
        for ch in 0..channels {
            for pr in 0..patch_size {
                for pc in 0..patch_size {
                    out[ch * patch_area + pr * patch_size + pc] = image[[row + pr, col + pc, ch]];
                }
            }
        }
    }
}
