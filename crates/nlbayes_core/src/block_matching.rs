use ndarray::{Array2, ArrayView3};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::float_trait::NlBayesFloat;

/// A group member: top-left coordinate and squared distance to the reference.
///
/// Ordered by distance, then row, then column, so equal distances resolve in
/// raster order and selection is deterministic.
#[derive(Debug, Clone, Copy)]
pub struct PatchMatch<F: NlBayesFloat> {
    pub row: usize,
    pub col: usize,
    pub distance: F,
}

impl<F: NlBayesFloat> PartialEq for PatchMatch<F> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<F: NlBayesFloat> Eq for PatchMatch<F> {}

impl<F: NlBayesFloat> Ord for PatchMatch<F> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then(self.row.cmp(&other.row))
            .then(self.col.cmp(&other.col))
    }
}

impl<F: NlBayesFloat> PartialOrd for PatchMatch<F> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compute squared L2 distance between two patches with early termination.
///
/// Returns as soon as the partial sum reaches `threshold`; the returned value is
/// then only a lower bound.
#[inline]
fn compute_squared_distance<F: NlBayesFloat>(
    image: ArrayView3<F>,
    ref_pos: (usize, usize),
    cand_pos: (usize, usize),
    patch_size: usize,
    threshold: F,
) -> F {
    let (_, width, channels) = image.dim();
    let row_len = patch_size * channels;
    let mut sum_sq = F::zero();
    if let Some(data) = image.as_slice_memory_order() {
        for pr in 0..patch_size {
            let a = ((ref_pos.0 + pr) * width + ref_pos.1) * channels;
            let b = ((cand_pos.0 + pr) * width + cand_pos.1) * channels;
            for (x, y) in data[a..a + row_len].iter().zip(&data[b..b + row_len]) {
                let diff = *x - *y;
                sum_sq += diff * diff;
            }
            if sum_sq >= threshold {
                return sum_sq;
            }
        }
    } else {
        for pr in 0..patch_size {
            for pc in 0..patch_size {
                for ch in 0..channels {
                    let diff = image[[ref_pos.0 + pr, ref_pos.1 + pc, ch]]
                        - image[[cand_pos.0 + pr, cand_pos.1 + pc, ch]];
                    sum_sq += diff * diff;
                }
            }
            if sum_sq >= threshold {
                return sum_sq;
            }
        }
    }
    sum_sq
}

/// Compute Integral Images (Sum and Squared Sum) over all channels.
///
/// Integral Image I(x, y) = sum(i(x', y', c)) for x'<=x, y'<=y and every channel c.
/// This allows O(1) computation of a patch's sum and squared norm, which give two
/// lower bounds on the patch distance used for pre-screening:
/// 1. Mean Difference Bound: (sum1 - sum2)^2 / N
/// 2. Norm Difference Bound: (norm1 - norm2)^2
///
/// Returns (Sum, SqSum). Indexing: [row+1, col+1].
pub fn compute_integral_images<F: NlBayesFloat>(image: ArrayView3<F>) -> (Array2<F>, Array2<F>) {
    let (h, w, _) = image.dim();
    let mut sum_img = Array2::<F>::zeros((h + 1, w + 1));
    let mut sq_sum_img = Array2::<F>::zeros((h + 1, w + 1));

    for r in 0..h {
        let mut row_sum = F::zero();
        let mut row_sq_sum = F::zero();
        for c in 0..w {
            for &val in image.slice(ndarray::s![r, c, ..]).iter() {
                row_sum += val;
                row_sq_sum += val * val;
            }

            sum_img[[r + 1, c + 1]] = sum_img[[r, c + 1]] + row_sum;
            sq_sum_img[[r + 1, c + 1]] = sq_sum_img[[r, c + 1]] + row_sq_sum;
        }
    }
    (sum_img, sq_sum_img)
}

#[inline(always)]
fn get_patch_sums<F: NlBayesFloat>(
    sum_img: &Array2<F>,
    sq_sum_img: &Array2<F>,
    r: usize,
    c: usize,
    size: usize,
) -> (F, F) {
    let r2 = r + size;
    let c2 = c + size;

    let sum = sum_img[[r2, c2]] - sum_img[[r, c2]] - sum_img[[r2, c]] + sum_img[[r, c]];
    let sq_sum =
        sq_sum_img[[r2, c2]] - sq_sum_img[[r, c2]] - sq_sum_img[[r2, c]] + sq_sum_img[[r, c]];

    (sum, sq_sum)
}

/// Inclusive candidate range `[center - radius, center + radius]` clamped to the
/// valid top-left positions `[0, extent - patch_size]`.
#[inline]
fn search_range(center: usize, radius: usize, extent: usize, patch_size: usize) -> (usize, usize) {
    let last = extent - patch_size;
    (center.saturating_sub(radius), (center + radius).min(last))
}

/// Find the `max_matches` patches most similar to the reference patch.
///
/// The reference patch is always the first element (distance 0). The remaining
/// members are the nearest candidates within `search_radius` of the reference,
/// sorted by `(distance, row, col)`. Fewer than `max_matches` are returned when
/// the window holds fewer candidates.
#[allow(clippy::too_many_arguments)]
pub fn find_similar_patches<F: NlBayesFloat>(
    image: ArrayView3<F>,
    integral_sum: &Array2<F>,
    integral_sq_sum: &Array2<F>,
    ref_pos: (usize, usize),
    patch_size: usize,
    search_radius: usize,
    max_matches: usize,
) -> Vec<PatchMatch<F>> {
    let mut matches = Vec::with_capacity(max_matches.max(1));
    find_similar_patches_in_place(
        image,
        integral_sum,
        integral_sq_sum,
        ref_pos,
        patch_size,
        search_radius,
        max_matches,
        &mut BinaryHeap::with_capacity(max_matches),
        &mut matches,
    );
    matches
}

/// Same as [`find_similar_patches`] but reuses caller-owned buffers.
#[allow(clippy::too_many_arguments)]
pub(crate) fn find_similar_patches_in_place<F: NlBayesFloat>(
    image: ArrayView3<F>,
    integral_sum: &Array2<F>,
    integral_sq_sum: &Array2<F>,
    ref_pos: (usize, usize),
    patch_size: usize,
    search_radius: usize,
    max_matches: usize,
    heap: &mut BinaryHeap<PatchMatch<F>>,
    out: &mut Vec<PatchMatch<F>>,
) {
    let (ref_r, ref_c) = ref_pos;
    let (h, w, channels) = image.dim();
    heap.clear();
    out.clear();
    out.push(PatchMatch {
        row: ref_r,
        col: ref_c,
        distance: F::zero(),
    });

    // Non-reference members still to pick.
    let wanted = max_matches.saturating_sub(1);
    if wanted == 0 {
        return;
    }

    let (r_start, r_end) = search_range(ref_r, search_radius, h, patch_size);
    let (c_start, c_end) = search_range(ref_c, search_radius, w, patch_size);

    let mut threshold = F::max_value();

    // Pre-calculate Reference stats
    let (ref_sum, ref_sq_sum) =
        get_patch_sums(integral_sum, integral_sq_sum, ref_r, ref_c, patch_size);
    let ref_norm = ref_sq_sum.max(F::zero()).sqrt();
    let inv_n = F::one() / F::usize_as(patch_size * patch_size * channels);

    // Raster order: a later candidate never wins a distance tie.
    for r in r_start..=r_end {
        for c in c_start..=c_end {
            if r == ref_r && c == ref_c {
                continue;
            }

            let (cand_sum, cand_sq_sum) =
                get_patch_sums(integral_sum, integral_sq_sum, r, c, patch_size);

            // Mean Bound
            let diff_sum = cand_sum - ref_sum;
            let lb_mean = (diff_sum * diff_sum) * inv_n;
            if lb_mean >= threshold {
                continue;
            }

            // Norm Bound
            let cand_norm = cand_sq_sum.max(F::zero()).sqrt();
            let diff_norm = (cand_norm - ref_norm).abs();
            if diff_norm * diff_norm >= threshold {
                continue;
            }

            let dist = compute_squared_distance(image, ref_pos, (r, c), patch_size, threshold);
            if dist >= threshold {
                continue;
            }

            let candidate = PatchMatch {
                row: r,
                col: c,
                distance: dist,
            };
            if heap.len() < wanted {
                heap.push(candidate);
            } else {
                heap.pop();
                heap.push(candidate);
            }
            if heap.len() == wanted {
                if let Some(worst) = heap.peek() {
                    threshold = worst.distance;
                }
            }
        }
    }

    let start = out.len();
    out.extend(heap.drain());
    out[start..].sort_unstable();
}
