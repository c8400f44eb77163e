//! Aggregation of overlapping patch estimates.
//!
//! Every member of every processed group contributes its estimate to each
//! sample it covers with weight one. Workers accumulate into tile-local
//! numerator/denominator pairs that are allocated on first touch, so partial
//! memory stays bounded by the tiles a worker actually visits. Tiles store
//! `tile_h × (tile_w · channels)` interleaved samples.

use ndarray::{s, Array2, Array3, ArrayView3, Zip};

use crate::float_trait::NlBayesFloat;

/// Denominators at or below this are treated as "never estimated".
pub const AGGREGATION_EPSILON: f64 = 1e-6;

/// Default aggregation tile edge in pixels.
/// Larger tiles mean fewer allocations; smaller tiles reduce per-worker memory.
pub const AGGREGATION_TILE_SIZE: usize = 192;
const AGGREGATION_TILE_SIZE_ENV: &str = "NLBAYES_AGGREGATION_TILE_SIZE";

/// Resolve the aggregation tile size from the environment with a safe fallback.
pub fn resolve_aggregation_tile_size(patch_size: usize) -> usize {
    tile_size_from(
        std::env::var(AGGREGATION_TILE_SIZE_ENV).ok().as_deref(),
        patch_size,
    )
}

fn tile_size_from(value: Option<&str>, patch_size: usize) -> usize {
    value
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&v| v > 0)
        .map(|v| v.max(patch_size))
        .unwrap_or(AGGREGATION_TILE_SIZE.max(patch_size))
}

type TileAccumulator<F> = (Array2<F>, Array2<F>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TileAggregationGeometry {
    pub patch_size: usize,
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
    pub tile_size: usize,
    pub tile_cols: usize,
    pub tile_count: usize,
}

impl TileAggregationGeometry {
    pub fn new(
        (rows, cols, channels): (usize, usize, usize),
        patch_size: usize,
        tile_size: usize,
    ) -> Self {
        let tile_size = tile_size.max(1);
        let tile_rows = rows.div_ceil(tile_size).max(1);
        let tile_cols = cols.div_ceil(tile_size).max(1);
        Self {
            patch_size,
            rows,
            cols,
            channels,
            tile_size,
            tile_cols,
            tile_count: tile_rows * tile_cols,
        }
    }

    fn alloc_tile<F: NlBayesFloat>(&self, tile_row: usize, tile_col: usize) -> TileAccumulator<F> {
        let row_start = tile_row * self.tile_size;
        let col_start = tile_col * self.tile_size;
        let tile_h = (self.rows - row_start).min(self.tile_size);
        let tile_w = (self.cols - col_start).min(self.tile_size);
        let shape = (tile_h, tile_w * self.channels);
        (Array2::zeros(shape), Array2::zeros(shape))
    }
}

/// Per-worker partial sums, one lazily allocated tile at a time.
pub(crate) struct TileAccumulators<F: NlBayesFloat> {
    geom: TileAggregationGeometry,
    tiles: Vec<Option<TileAccumulator<F>>>,
}

impl<F: NlBayesFloat> TileAccumulators<F> {
    pub fn new(geom: TileAggregationGeometry) -> Self {
        Self {
            geom,
            tiles: (0..geom.tile_count).map(|_| None).collect(),
        }
    }

    fn tile_mut(&mut self, tile_row: usize, tile_col: usize) -> &mut TileAccumulator<F> {
        let geom = &self.geom;
        let tile_id = tile_row * geom.tile_cols + tile_col;
        self.tiles[tile_id].get_or_insert_with(|| geom.alloc_tile(tile_row, tile_col))
    }

    /// Add one channel-major patch estimate whose top-left corner is `(row, col)`.
    pub fn add_patch(&mut self, estimate: &[F], row: usize, col: usize) {
        let g = self.geom;
        let p = g.patch_size;
        let channels = g.channels;
        let area = p * p;
        debug_assert_eq!(estimate.len(), area * channels);

        let start_tile_row = row / g.tile_size;
        let start_tile_col = col / g.tile_size;
        let end_tile_row = (row + p - 1) / g.tile_size;
        let end_tile_col = (col + p - 1) / g.tile_size;

        // Fast path: most patches are entirely inside one tile.
        if start_tile_row == end_tile_row && start_tile_col == end_tile_col {
            let local_r0 = row - start_tile_row * g.tile_size;
            let local_c0 = col - start_tile_col * g.tile_size;
            let (num_tile, den_tile) = self.tile_mut(start_tile_row, start_tile_col);
            let stride = num_tile.ncols();
            if let (Some(num_data), Some(den_data)) = (
                num_tile.as_slice_memory_order_mut(),
                den_tile.as_slice_memory_order_mut(),
            ) {
                for pr in 0..p {
                    let dst_row = (local_r0 + pr) * stride + local_c0 * channels;
                    for pc in 0..p {
                        let dst = dst_row + pc * channels;
                        for ch in 0..channels {
                            num_data[dst + ch] += estimate[ch * area + pr * p + pc];
                            den_data[dst + ch] += F::one();
                        }
                    }
                }
                return;
            }
        }

        for pr in 0..p {
            let r = row + pr;
            let tile_row = r / g.tile_size;
            let local_r = r - tile_row * g.tile_size;
            for pc in 0..p {
                let c = col + pc;
                let tile_col = c / g.tile_size;
                let local_c = (c - tile_col * g.tile_size) * channels;
                let (num_tile, den_tile) = self.tile_mut(tile_row, tile_col);
                for ch in 0..channels {
                    num_tile[[local_r, local_c + ch]] += estimate[ch * area + pr * p + pc];
                    den_tile[[local_r, local_c + ch]] += F::one();
                }
            }
        }
    }

    /// Fold another worker's partial sums into this one.
    pub fn merge(&mut self, other: Self) {
        debug_assert_eq!(self.geom, other.geom);
        for (a_slot, b_slot) in self.tiles.iter_mut().zip(other.tiles) {
            if let Some((b_num, b_den)) = b_slot {
                if let Some((a_num, a_den)) = a_slot.as_mut() {
                    *a_num += &b_num;
                    *a_den += &b_den;
                } else {
                    *a_slot = Some((b_num, b_den));
                }
            }
        }
    }

    /// Stitch the tiles into full-image buffers.
    pub fn into_buffer(self) -> AccumulationBuffer<F> {
        let g = self.geom;
        let mut buffer = AccumulationBuffer::zeros((g.rows, g.cols, g.channels));
        for (tile_id, entry) in self.tiles.into_iter().enumerate() {
            let Some((num_tile, den_tile)) = entry else {
                continue;
            };
            let row_start = (tile_id / g.tile_cols) * g.tile_size;
            let col_start = (tile_id % g.tile_cols) * g.tile_size;
            let tile_h = num_tile.nrows();
            let tile_w = num_tile.ncols() / g.channels.max(1);
            for tr in 0..tile_h {
                for tc in 0..tile_w {
                    for ch in 0..g.channels {
                        let src = [tr, tc * g.channels + ch];
                        let dst = [row_start + tr, col_start + tc, ch];
                        buffer.numerator[dst] = num_tile[src];
                        buffer.denominator[dst] = den_tile[src];
                    }
                }
            }
        }
        buffer
    }
}

/// Full-image aggregation sums for one stage, shape `(height, width, channels)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulationBuffer<F: NlBayesFloat> {
    pub numerator: Array3<F>,
    pub denominator: Array3<F>,
}

impl<F: NlBayesFloat> AccumulationBuffer<F> {
    pub fn zeros(shape: (usize, usize, usize)) -> Self {
        Self {
            numerator: Array3::zeros(shape),
            denominator: Array3::zeros(shape),
        }
    }

    /// Smallest denominator; `None` for an empty buffer.
    pub fn min_denominator(&self) -> Option<F> {
        self.denominator
            .iter()
            .copied()
            .fold(None, |acc, v| Some(acc.map_or(v, |a: F| a.min(v))))
    }

    /// `numerator / denominator`, falling back to `fallback` where nothing was
    /// aggregated.
    pub fn normalize(&self, fallback: ArrayView3<F>) -> Array3<F> {
        debug_assert_eq!(fallback.dim(), self.numerator.dim());
        let eps = F::from_f64_c(AGGREGATION_EPSILON);
        let mut out = Array3::zeros(self.numerator.dim());
        Zip::from(&mut out)
            .and(&self.numerator)
            .and(&self.denominator)
            .and(&fallback)
            .for_each(|o, &num, &den, &noisy| {
                *o = if den > eps { num / den } else { noisy };
            });
        out
    }

    /// Accumulate one patch directly (reference path for tests and tools).
    pub fn add_patch(&mut self, estimate: &[F], row: usize, col: usize, patch_size: usize) {
        let channels = self.numerator.dim().2;
        let area = patch_size * patch_size;
        for ch in 0..channels {
            let block = &estimate[ch * area..(ch + 1) * area];
            let mut num = self
                .numerator
                .slice_mut(s![row..row + patch_size, col..col + patch_size, ch]);
            for ((pr, pc), v) in num.indexed_iter_mut() {
                *v += block[pr * patch_size + pc];
            }
            self.denominator
                .slice_mut(s![row..row + patch_size, col..col + patch_size, ch])
                .mapv_inplace(|d| d + F::one());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Lcg(u64);

    impl Lcg {
        fn next_u64(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
            self.0
        }

        fn below(&mut self, n: usize) -> usize {
            ((self.next_u64() >> 33) % n as u64) as usize
        }
    }

    /// Random patches with small integer values so sums are exact in f64.
    fn random_patches(
        count: usize,
        shape: (usize, usize, usize),
        patch_size: usize,
        seed: u64,
    ) -> Vec<(usize, usize, Vec<f64>)> {
        let mut rng = Lcg(seed);
        let d = patch_size * patch_size * shape.2;
        (0..count)
            .map(|_| {
                let r = rng.below(shape.0 - patch_size + 1);
                let c = rng.below(shape.1 - patch_size + 1);
                let est = (0..d).map(|_| rng.below(256) as f64).collect();
                (r, c, est)
            })
            .collect()
    }

    #[test]
    fn test_tile_size_from_env_value() {
        assert_eq!(tile_size_from(None, 7), AGGREGATION_TILE_SIZE);
        assert_eq!(tile_size_from(Some("64"), 7), 64);
        assert_eq!(tile_size_from(Some("4"), 7), 7);
        assert_eq!(tile_size_from(Some("0"), 7), AGGREGATION_TILE_SIZE);
        assert_eq!(tile_size_from(Some("abc"), 7), AGGREGATION_TILE_SIZE);
        assert_eq!(tile_size_from(None, 300), 300);
    }

    #[test]
    fn test_tiles_match_direct_accumulation() {
        let shape = (23, 31, 3);
        let p = 5;
        let patches = random_patches(200, shape, p, 7);

        let mut direct = AccumulationBuffer::<f64>::zeros(shape);
        for (r, c, est) in &patches {
            direct.add_patch(est, *r, *c, p);
        }

        for tile_size in [5, 8, 13, 192] {
            let geom = TileAggregationGeometry::new(shape, p, tile_size);
            let mut tiles = TileAccumulators::new(geom);
            for (r, c, est) in &patches {
                tiles.add_patch(est, *r, *c);
            }
            assert_eq!(tiles.into_buffer(), direct, "tile size {tile_size}");
        }
    }

    #[test]
    fn test_merge_is_order_independent() {
        let shape = (20, 20, 1);
        let p = 4;
        let patches = random_patches(120, shape, p, 99);
        let geom = TileAggregationGeometry::new(shape, p, 6);

        let mut single = TileAccumulators::new(geom);
        for (r, c, est) in &patches {
            single.add_patch(est, *r, *c);
        }

        // three workers, patches visited in reverse, merged out of order
        let mut workers: Vec<TileAccumulators<f64>> =
            (0..3).map(|_| TileAccumulators::new(geom)).collect();
        for (i, (r, c, est)) in patches.iter().enumerate().rev() {
            workers[i % 3].add_patch(est, *r, *c);
        }
        let mut merged = workers.pop().unwrap();
        for w in workers {
            merged.merge(w);
        }

        assert_eq!(merged.into_buffer(), single.into_buffer());
    }

    #[test]
    fn test_normalize_falls_back_where_unvisited() {
        let shape = (6, 6, 2);
        let mut buffer = AccumulationBuffer::<f32>::zeros(shape);
        let est: Vec<f32> = (0..2 * 9).map(|i| if i < 9 { 10.0 } else { 20.0 }).collect();
        buffer.add_patch(&est, 0, 0, 3);
        buffer.add_patch(&est, 1, 1, 3);

        let noisy = Array3::from_elem(shape, -1.0f32);
        let out = buffer.normalize(noisy.view());
        assert_eq!(out[[1, 1, 0]], 10.0);
        assert_eq!(out[[1, 1, 1]], 20.0);
        assert_eq!(out[[0, 0, 1]], 20.0);
        assert_eq!(out[[5, 5, 0]], -1.0);
        assert_eq!(buffer.denominator[[1, 1, 0]], 2.0);
        assert_eq!(buffer.min_denominator(), Some(0.0));
    }

    #[test]
    fn test_full_cover_has_positive_denominator() {
        let shape = (9, 9, 1);
        let geom = TileAggregationGeometry::new(shape, 3, 4);
        let mut tiles = TileAccumulators::<f32>::new(geom);
        for r in [0, 3, 6] {
            for c in [0, 3, 6] {
                tiles.add_patch(&[1.0; 9], r, c);
            }
        }
        let buffer = tiles.into_buffer();
        assert_eq!(buffer.min_denominator(), Some(1.0));
    }
}
