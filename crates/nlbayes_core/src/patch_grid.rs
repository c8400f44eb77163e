//! Reference patch grid.
//!
//! Reference patches are placed every `step` pixels along each axis. The last
//! position on an axis is always `extent - patch_size`, so border pixels are
//! covered by a patch shifted inward instead of being dropped.

/// Top-left positions along one axis.
///
/// Returns an empty vector when the patch does not fit (`extent < patch_size`).
pub fn axis_positions(extent: usize, patch_size: usize, step: usize) -> Vec<usize> {
    if patch_size == 0 || extent < patch_size {
        return Vec::new();
    }
    let last = extent - patch_size;
    let step = step.max(1);
    let mut positions: Vec<usize> = (0..last).step_by(step).collect();
    positions.push(last);
    positions
}

/// Raster-ordered grid of reference patch positions.
#[derive(Debug, Clone)]
pub struct ReferenceGrid {
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl ReferenceGrid {
    pub fn new(rows: usize, cols: usize, patch_size: usize, step: usize) -> Self {
        Self {
            rows: axis_positions(rows, patch_size, step),
            cols: axis_positions(cols, patch_size, step),
        }
    }

    /// Total number of reference patches.
    pub fn len(&self) -> usize {
        self.rows.len() * self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the `index`-th reference patch in raster order.
    #[inline]
    pub fn position(&self, index: usize) -> (usize, usize) {
        let n_cols = self.cols.len();
        (self.rows[index / n_cols], self.cols[index % n_cols])
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows
            .iter()
            .flat_map(move |&r| self.cols.iter().map(move |&c| (r, c)))
    }
}
