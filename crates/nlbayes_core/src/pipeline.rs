//! NL-Bayes stage kernel - one full pass of grouping, estimation and aggregation.

use std::collections::BinaryHeap;
use std::time::Instant;

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut2};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::aggregation::{
    resolve_aggregation_tile_size, AccumulationBuffer, TileAccumulators, TileAggregationGeometry,
};
use crate::bayes_filter::{apply_mmse, ridge_for, FilterWorkspace, DEFAULT_RIDGE_FACTOR};
use crate::block_matching::{compute_integral_images, find_similar_patches_in_place, PatchMatch};
use crate::covariance::{estimate_joint, estimate_single, GroupStatistics};
use crate::error::{GroupError, NlBayesError};
use crate::flat_area::{
    block_mean_variance, channel_means, fill_channel_means, is_flat, pooled_channel_variance,
    DEFAULT_FLAT_GAMMA,
};
use crate::float_trait::NlBayesFloat;
use crate::image::{extract_patch, ImageSize};
use crate::noise_model::{mean_variance, NoiseModel};
use crate::patch_grid::ReferenceGrid;

// =============================================================================
// Constants
// =============================================================================

/// Minimum reference patches per rayon work item.
const RAYON_MIN_CHUNK_LEN: usize = 64;

const PROFILE_TIMING_ENV: &str = "NLBAYES_PROFILE_TIMING";

// =============================================================================
// Types
// =============================================================================

/// Which of the two NL-Bayes passes a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMode {
    /// First pass: groups and statistics from the noisy image alone, each
    /// channel estimated independently.
    Basic,
    /// Second pass: groups found on the guide (basic estimate), signal covariance
    /// from the guide, all channels estimated jointly.
    Final,
}

/// Parameters of one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageParams<F: NlBayesFloat> {
    /// Patch edge in pixels.
    pub patch_size: usize,
    /// Stride between reference patches.
    pub step_size: usize,
    /// Half-width of the square search window (in top-left positions).
    pub search_radius: usize,
    /// Maximum number of patches per group, reference included.
    pub group_size: usize,
    /// Noise covariance multiplier.
    pub beta: F,
    /// Flat-area threshold as a multiple of the noise variance.
    pub gamma: F,
    /// Filter ridge as a fraction of the mean noise variance.
    pub ridge_factor: F,
    /// Enable the homogeneous-area shortcut.
    pub flat_area: bool,
}

impl<F: NlBayesFloat> StageParams<F> {
    /// Parameters from the published NL-Bayes tables for a noise level.
    ///
    /// Images with three or more channels use the colour tables. Group sizes are
    /// raised to at least one more than the dimension of the covariance the stage
    /// estimates, so the default configuration never produces rank-deficient
    /// groups by construction.
    pub fn for_noise_level(sigma: F, channels: usize, mode: StageMode) -> Self {
        let s = sigma.as_f64();
        let colour = channels >= 3;
        let (patch_size, group_size, beta) = match (mode, colour) {
            (StageMode::Basic, false) => {
                let p = if s < 30.0 { 5 } else { 7 };
                let k = if s < 10.0 {
                    35
                } else if s < 30.0 {
                    45
                } else if s < 80.0 {
                    90
                } else {
                    100
                };
                let beta = if s < 15.0 {
                    1.1
                } else if s < 70.0 {
                    1.0
                } else {
                    0.9
                };
                (p, k, beta)
            }
            (StageMode::Final, false) => {
                let k = if s < 20.0 {
                    15
                } else if s < 40.0 {
                    25
                } else if s < 80.0 {
                    30
                } else {
                    45
                };
                let beta = if s < 15.0 {
                    1.1
                } else if s < 35.0 {
                    1.0
                } else {
                    0.9
                };
                (5, k, beta)
            }
            (StageMode::Basic, true) => {
                let p = if s < 20.0 {
                    3
                } else if s < 50.0 {
                    5
                } else {
                    7
                };
                (p, p * p * 3, 1.0)
            }
            (StageMode::Final, true) => {
                let p = if s < 50.0 {
                    3
                } else if s < 70.0 {
                    5
                } else {
                    7
                };
                let beta = if s < 50.0 {
                    1.2
                } else if s < 70.0 {
                    1.1
                } else {
                    1.0
                };
                (p, p * p * 3 * 2, beta)
            }
        };

        let group_size = group_size.max(covariance_dimension(patch_size, channels, mode) + 1);
        // search window of k / 2 positions, forced odd
        let window = group_size / 2;
        let window = if window % 2 == 0 { window + 1 } else { window };

        Self {
            patch_size,
            step_size: (patch_size / 2).max(1),
            search_radius: window / 2,
            group_size,
            beta: F::from_f64_c(beta),
            gamma: F::from_f64_c(DEFAULT_FLAT_GAMMA),
            ridge_factor: F::from_f64_c(DEFAULT_RIDGE_FACTOR),
            flat_area: mode == StageMode::Basic,
        }
    }

    /// Validate the stage parameters.
    pub fn validate(&self) -> Result<(), NlBayesError> {
        let invalid = |name: &'static str, reason: &str| {
            Err(NlBayesError::InvalidParameter {
                name,
                reason: reason.to_string(),
            })
        };
        if self.patch_size == 0 {
            return invalid("patch_size", "must be > 0");
        }
        if self.step_size == 0 {
            return invalid("step_size", "must be > 0");
        }
        if self.group_size == 0 {
            return invalid("group_size", "must be > 0");
        }
        if !(self.beta.is_finite() && self.beta > F::zero()) {
            return invalid("beta", "must be finite and > 0");
        }
        if !(self.gamma.is_finite() && self.gamma >= F::zero()) {
            return invalid("gamma", "must be finite and >= 0");
        }
        if !(self.ridge_factor.is_finite() && self.ridge_factor >= F::zero()) {
            return invalid("ridge_factor", "must be finite and >= 0");
        }
        Ok(())
    }
}

/// Dimension of the covariance a stage estimates: one channel in the basic
/// stage, all channels jointly in the final stage.
pub fn covariance_dimension(patch_size: usize, channels: usize, mode: StageMode) -> usize {
    let area = patch_size * patch_size;
    match mode {
        StageMode::Basic => area,
        StageMode::Final => area * channels.max(1),
    }
}

/// Counters for one stage. In the basic stage every channel block of a group is
/// counted as its own estimate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageStatistics {
    pub groups: u64,
    pub matched_patches: u64,
    pub flat_estimates: u64,
    pub degenerate_estimates: u64,
    pub unstable_estimates: u64,
    pub ridge_escalations: u64,
}

impl StageStatistics {
    fn merge(self, other: Self) -> Self {
        Self {
            groups: self.groups + other.groups,
            matched_patches: self.matched_patches + other.matched_patches,
            flat_estimates: self.flat_estimates + other.flat_estimates,
            degenerate_estimates: self.degenerate_estimates + other.degenerate_estimates,
            unstable_estimates: self.unstable_estimates + other.unstable_estimates,
            ridge_escalations: self.ridge_escalations + other.ridge_escalations,
        }
    }
}

/// Result of one stage.
#[derive(Debug, Clone)]
pub struct StageOutput<F: NlBayesFloat> {
    /// Aggregated estimate, same shape as the noisy input.
    pub estimate: Array3<F>,
    /// Raw aggregation sums behind `estimate`.
    pub accumulation: AccumulationBuffer<F>,
    pub stats: StageStatistics,
}

#[derive(Default, Clone, Copy)]
struct KernelStageStats {
    counts: StageStatistics,
    block_matching_ns: u128,
    gather_ns: u128,
    estimation_ns: u128,
    aggregation_ns: u128,
}

impl KernelStageStats {
    fn merge(self, other: Self) -> Self {
        Self {
            counts: self.counts.merge(other.counts),
            block_matching_ns: self.block_matching_ns + other.block_matching_ns,
            gather_ns: self.gather_ns + other.gather_ns,
            estimation_ns: self.estimation_ns + other.estimation_ns,
            aggregation_ns: self.aggregation_ns + other.aggregation_ns,
        }
    }
}

fn resolve_profile_timing() -> bool {
    std::env::var(PROFILE_TIMING_ENV)
        .ok()
        .map(|value| {
            let v = value.trim();
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Work partitioning of a stage. Only changes rounding, never the estimate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelLayout {
    pub tile_size: usize,
    /// Reference patches per work item; `None` picks one chunk per rayon thread.
    pub chunk_len: Option<usize>,
}

/// Reusable per-worker buffers, sized once from `k` and `p² · channels`.
struct WorkerBuffers<F: NlBayesFloat> {
    heap: BinaryHeap<PatchMatch<F>>,
    matches: Vec<PatchMatch<F>>,
    noisy_group: Array2<F>,
    guide_group: Array2<F>,
    estimates: Array2<F>,
    noise_diagonal: Vec<F>,
    scaled_noise: Vec<F>,
    means: Vec<F>,
    noisy_stats: GroupStatistics<F>,
    noisy_mean: Array1<F>,
    guide_stats: GroupStatistics<F>,
    filter: FilterWorkspace<F>,
}

impl<F: NlBayesFloat> WorkerBuffers<F> {
    fn new(max_matches: usize, patch_size: usize, channels: usize, mode: StageMode) -> Self {
        let k = max_matches.max(1);
        let d = patch_size * patch_size * channels;
        let filter_dim = covariance_dimension(patch_size, channels, mode);
        let final_stage = mode == StageMode::Final;
        // basic keeps noisy statistics, final keeps guide statistics
        let (noisy_dim, guide_dim) = if final_stage { (0, filter_dim) } else { (filter_dim, 0) };
        Self {
            heap: BinaryHeap::with_capacity(k),
            matches: Vec::with_capacity(k),
            noisy_group: Array2::zeros((k, d)),
            guide_group: Array2::zeros((if final_stage { k } else { 0 }, d)),
            estimates: Array2::zeros((k, d)),
            noise_diagonal: vec![F::zero(); d],
            scaled_noise: vec![F::zero(); filter_dim],
            means: vec![F::zero(); channels],
            noisy_stats: GroupStatistics::new(k, noisy_dim),
            noisy_mean: Array1::zeros(guide_dim),
            guide_stats: GroupStatistics::new(k, guide_dim),
            filter: FilterWorkspace::new(k, filter_dim),
        }
    }
}

// =============================================================================
// Group estimation
// =============================================================================

fn fill_rows<F: NlBayesFloat>(mut out: ArrayViewMut2<F>, value: &Array1<F>) {
    for mut row in out.rows_mut() {
        row.assign(value);
    }
}

/// Estimate one block (all members, one covariance) with the Bayesian filter.
///
/// Falls back to `stats.mean` for every member when the filter matrix cannot be
/// factorised. `stats` must already hold the centring mean and `signal` the
/// signal covariance.
#[allow(clippy::too_many_arguments)]
fn filter_block<F: NlBayesFloat>(
    members: ArrayView2<F>,
    center: &Array1<F>,
    signal: &Array2<F>,
    noise_diagonal: &[F],
    scaled_noise: &mut [F],
    params: &StageParams<F>,
    filter: &mut FilterWorkspace<F>,
    mut out: ArrayViewMut2<F>,
    counts: &mut StageStatistics,
) {
    for (dst, &n) in scaled_noise.iter_mut().zip(noise_diagonal) {
        *dst = params.beta * n;
    }
    let ridge = ridge_for(signal, scaled_noise, params.ridge_factor);
    let result = apply_mmse(
        members,
        center,
        signal,
        scaled_noise,
        ridge,
        filter,
        out.view_mut(),
    );
    match result {
        Ok(outcome) => counts.ridge_escalations += outcome.escalations as u64,
        Err(err) => {
            debug!(%err, "falling back to group mean");
            counts.unstable_estimates += 1;
            fill_rows(out, center);
        }
    }
}

/// Basic stage: each channel block is estimated on its own. Blocks that cannot
/// support a covariance estimate are treated as flat.
fn estimate_basic_group<F: NlBayesFloat>(
    worker: &mut WorkerBuffers<F>,
    k: usize,
    patch_size: usize,
    channels: usize,
    params: &StageParams<F>,
    counts: &mut StageStatistics,
) {
    let WorkerBuffers {
        noisy_group,
        estimates,
        noise_diagonal,
        scaled_noise,
        noisy_stats,
        filter,
        ..
    } = worker;
    let area = patch_size * patch_size;

    for ch in 0..channels {
        let cols = ch * area..(ch + 1) * area;
        let block = noisy_group.slice(s![..k, cols.clone()]);
        let mut out = estimates.slice_mut(s![..k, cols.clone()]);
        let noise_ch = &noise_diagonal[cols];

        if params.flat_area {
            let (mean, variance) = block_mean_variance(block);
            if is_flat(variance, mean_variance(noise_ch), params.gamma) {
                counts.flat_estimates += 1;
                out.fill(mean);
                continue;
            }
        }

        match estimate_single(block, noise_ch, params.beta, noisy_stats) {
            Ok(()) => filter_block(
                block,
                &noisy_stats.mean,
                &noisy_stats.covariance,
                noise_ch,
                scaled_noise,
                params,
                filter,
                out,
                counts,
            ),
            Err(GroupError::Degenerate { .. }) => {
                counts.degenerate_estimates += 1;
                out.fill(block_mean_variance(block).0);
            }
            Err(err) => {
                debug!(%err, "unexpected group failure");
                counts.unstable_estimates += 1;
                out.fill(block_mean_variance(block).0);
            }
        }
    }
}

/// Final stage: all channels jointly, signal covariance from the guide.
///
/// The flat test looks at the noisy group; a flat group takes the guide's
/// channel means, a degenerate one the noisy channel means.
fn estimate_final_group<F: NlBayesFloat>(
    worker: &mut WorkerBuffers<F>,
    k: usize,
    patch_size: usize,
    params: &StageParams<F>,
    counts: &mut StageStatistics,
) {
    let WorkerBuffers {
        noisy_group,
        guide_group,
        estimates,
        noise_diagonal,
        scaled_noise,
        means,
        noisy_mean,
        guide_stats,
        filter,
        ..
    } = worker;
    let area = patch_size * patch_size;
    let noisy = noisy_group.slice(s![..k, ..]);
    let guide = guide_group.slice(s![..k, ..]);
    let out = estimates.slice_mut(s![..k, ..]);

    if params.flat_area {
        let variance = pooled_channel_variance(noisy, area);
        if is_flat(variance, mean_variance(noise_diagonal), params.gamma) {
            counts.flat_estimates += 1;
            channel_means(guide, area, means);
            fill_channel_means(out, area, means);
            return;
        }
    }

    match estimate_joint(noisy, guide, noisy_mean, guide_stats) {
        Ok(()) => filter_block(
            noisy,
            noisy_mean,
            &guide_stats.covariance,
            noise_diagonal,
            scaled_noise,
            params,
            filter,
            out,
            counts,
        ),
        Err(_) => {
            counts.degenerate_estimates += 1;
            channel_means(noisy, area, means);
            fill_channel_means(out, area, means);
        }
    }
}

fn image_size_of<F: NlBayesFloat>(image: ArrayView3<F>) -> ImageSize {
    let (h, w, c) = image.dim();
    ImageSize::new(w, h, c)
}

/// Run one NL-Bayes stage over an image.
///
/// `noisy` and `guide` are `(height, width, channels)` views. The final stage
/// requires a guide of the same shape; the basic stage ignores it. Patches
/// larger than the image are clamped to the smaller image side.
pub fn run_nl_bayes_step<F: NlBayesFloat>(
    noisy: ArrayView3<F>,
    guide: Option<ArrayView3<F>>,
    mode: StageMode,
    noise: &NoiseModel<'_, F>,
    params: &StageParams<F>,
) -> Result<StageOutput<F>, NlBayesError> {
    let tile_size = resolve_aggregation_tile_size(params.patch_size);
    run_nl_bayes_step_with_layout(
        noisy,
        guide,
        mode,
        noise,
        params,
        KernelLayout {
            tile_size,
            chunk_len: None,
        },
    )
}

pub(crate) fn run_nl_bayes_step_with_layout<F: NlBayesFloat>(
    noisy: ArrayView3<F>,
    guide: Option<ArrayView3<F>>,
    mode: StageMode,
    noise: &NoiseModel<'_, F>,
    params: &StageParams<F>,
    layout: KernelLayout,
) -> Result<StageOutput<F>, NlBayesError> {
    params.validate()?;
    let size = image_size_of(noisy);
    if size.is_empty() {
        return Err(NlBayesError::EmptyImage(size));
    }
    let search = match (mode, guide) {
        (StageMode::Basic, _) => noisy.reborrow(),
        (StageMode::Final, None) => return Err(NlBayesError::MissingGuide),
        (StageMode::Final, Some(g)) => {
            if g.dim() != noisy.dim() {
                return Err(NlBayesError::GuideSizeMismatch {
                    expected: size,
                    got: image_size_of(g),
                });
            }
            g.reborrow()
        }
    };
    if let NoiseModel::Field { variances } = noise {
        if variances.dim() != noisy.dim() {
            return Err(NlBayesError::NoiseSizeMismatch {
                expected: size,
                got: image_size_of(*variances),
            });
        }
    }

    let mut params = *params;
    let max_patch = size.height.min(size.width);
    if params.patch_size > max_patch {
        warn!(
            requested = params.patch_size,
            clamped = max_patch,
            image = %size,
            "patch size larger than image, clamping"
        );
        params.patch_size = max_patch;
    }

    Ok(run_nl_bayes_kernel(noisy, search, mode, noise, &params, layout))
}

/// Core NL-Bayes single-stage kernel. Inputs are already validated.
fn run_nl_bayes_kernel<F: NlBayesFloat>(
    noisy: ArrayView3<F>,
    search: ArrayView3<F>,
    mode: StageMode,
    noise: &NoiseModel<'_, F>,
    params: &StageParams<F>,
    layout: KernelLayout,
) -> StageOutput<F> {
    let (rows, cols, channels) = noisy.dim();
    let patch_size = params.patch_size;
    let max_matches = params.group_size;
    let grid = ReferenceGrid::new(rows, cols, patch_size, params.step_size);
    let total_refs = grid.len();

    // Integral images of the search image for the block-matching bounds
    let (integral_sum, integral_sq_sum) = compute_integral_images(search);

    let tile_geom = TileAggregationGeometry::new(
        (rows, cols, channels),
        patch_size,
        layout.tile_size.max(patch_size),
    );
    let profile_timing = resolve_profile_timing();
    let kernel_started = profile_timing.then(Instant::now);

    macro_rules! timed {
        ($enabled:expr, $acc:expr, $body:block) => {{
            if $enabled {
                let _t = Instant::now();
                let _ret = { $body };
                $acc += _t.elapsed().as_nanos();
                _ret
            } else {
                $body
            }
        }};
    }

    let partials: Vec<(TileAccumulators<F>, KernelStageStats)> = if total_refs == 0 {
        Vec::new()
    } else {
        let chunk_len = layout.chunk_len.unwrap_or_else(|| {
            let partial_count = total_refs.min(rayon::current_num_threads().max(1));
            total_refs.div_ceil(partial_count).max(RAYON_MIN_CHUNK_LEN)
        });
        let chunk_len = chunk_len.max(1);
        let chunk_count = total_refs.div_ceil(chunk_len);

        // Collected in chunk order so the merge below is deterministic.
        (0..chunk_count)
            .into_par_iter()
            .map(|chunk_idx| {
                let chunk_start = chunk_idx * chunk_len;
                let chunk_end = (chunk_start + chunk_len).min(total_refs);
                let mut tiles = TileAccumulators::<F>::new(tile_geom);
                let mut worker = WorkerBuffers::<F>::new(max_matches, patch_size, channels, mode);
                let mut stats = KernelStageStats::default();

                for ref_idx in chunk_start..chunk_end {
                    let ref_pos = grid.position(ref_idx);

                    timed!(profile_timing, stats.block_matching_ns, {
                        find_similar_patches_in_place(
                            search,
                            &integral_sum,
                            &integral_sq_sum,
                            ref_pos,
                            patch_size,
                            params.search_radius,
                            max_matches,
                            &mut worker.heap,
                            &mut worker.matches,
                        );
                    });
                    let k = worker.matches.len();
                    stats.counts.groups += 1;
                    stats.counts.matched_patches += k as u64;

                    timed!(profile_timing, stats.gather_ns, {
                        for (i, m) in worker.matches.iter().enumerate() {
                            extract_patch(noisy, m.row, m.col, patch_size, worker.noisy_group.row_mut(i));
                            if mode == StageMode::Final {
                                extract_patch(search, m.row, m.col, patch_size, worker.guide_group.row_mut(i));
                            }
                        }
                        noise.fill_group_diagonal(&worker.matches, patch_size, &mut worker.noise_diagonal);
                    });

                    timed!(profile_timing, stats.estimation_ns, {
                        match mode {
                            StageMode::Basic => estimate_basic_group(
                                &mut worker,
                                k,
                                patch_size,
                                channels,
                                params,
                                &mut stats.counts,
                            ),
                            StageMode::Final => estimate_final_group(
                                &mut worker,
                                k,
                                patch_size,
                                params,
                                &mut stats.counts,
                            ),
                        }
                    });

                    timed!(profile_timing, stats.aggregation_ns, {
                        for (i, m) in worker.matches.iter().enumerate() {
                            let row = worker.estimates.row(i);
                            match row.as_slice() {
                                Some(est) => tiles.add_patch(est, m.row, m.col),
                                None => tiles.add_patch(&row.to_vec(), m.row, m.col),
                            }
                        }
                    });
                }

                (tiles, stats)
            })
            .collect()
    };

    let mut partials = partials.into_iter();
    let (tiles, stage_stats) = match partials.next() {
        Some(first) => partials.fold(first, |(mut a_tiles, a_stats), (b_tiles, b_stats)| {
            a_tiles.merge(b_tiles);
            (a_tiles, a_stats.merge(b_stats))
        }),
        None => (TileAccumulators::new(tile_geom), KernelStageStats::default()),
    };
    let accumulation = tiles.into_buffer();
    let estimate = accumulation.normalize(noisy);

    let counts = stage_stats.counts;
    debug!(
        ?mode,
        refs = total_refs,
        groups = counts.groups,
        matched_patches = counts.matched_patches,
        flat = counts.flat_estimates,
        degenerate = counts.degenerate_estimates,
        unstable = counts.unstable_estimates,
        ridge_escalations = counts.ridge_escalations,
        "stage statistics"
    );
    if profile_timing {
        let total_ns = kernel_started
            .map(|t| t.elapsed().as_nanos())
            .unwrap_or_default();
        debug!(
            ?mode,
            size = %image_size_of(noisy),
            wall_ms = total_ns as f64 / 1_000_000.0,
            block_thread_ms = stage_stats.block_matching_ns as f64 / 1_000_000.0,
            gather_thread_ms = stage_stats.gather_ns as f64 / 1_000_000.0,
            estimate_thread_ms = stage_stats.estimation_ns as f64 / 1_000_000.0,
            agg_thread_ms = stage_stats.aggregation_ns as f64 / 1_000_000.0,
            "nlbayes_profile"
        );
    }

    StageOutput {
        estimate,
        accumulation,
        stats: counts,
    }
}
