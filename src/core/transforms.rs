//! Numeric kernels shared by the filters and the spot finder.
//!
//! All operations work on `ndarray` volumes laid out as (z, y, x). Edge
//! handling follows the "nearest" convention: samples outside the volume take
//! the value of the closest edge voxel.

use ndarray::{Array3, Axis};

/// Order-statistic percentile: `sorted[floor(p / 100 * (n - 1))]`.
///
/// Unlike linear interpolation this always returns a value present in the
/// input, which makes percentile clipping idempotent. Returns `None` for an
/// empty slice. NaN values sort last.
pub fn percentile(values: &[f32], p: f32) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut scratch = values.to_vec();
    let rank = percentile_rank(scratch.len(), p);
    let (_, nth, _) = scratch.select_nth_unstable_by(rank, |a, b| a.total_cmp(b));
    Some(*nth)
}

/// Several percentiles over the same data with a single sort.
pub fn percentiles(values: &[f32], ps: &[f32]) -> Option<Vec<f32>> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    Some(
        ps.iter()
            .map(|&p| sorted[percentile_rank(sorted.len(), p)])
            .collect(),
    )
}

#[inline]
fn percentile_rank(n: usize, p: f32) -> usize {
    let p = p.clamp(0.0, 100.0) as f64;
    let rank = (p / 100.0 * (n - 1) as f64).floor() as usize;
    rank.min(n - 1)
}

/// Normalized 1D Gaussian weights with radius `floor(truncate * sigma + 0.5)`.
///
/// Returns an empty vector when `sigma` is zero, meaning "leave untouched".
pub fn gaussian_kernel(sigma: f32, truncate: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return Vec::new();
    }
    let radius = (truncate * sigma + 0.5).floor() as isize;
    let denom = 2.0 * (sigma as f64) * (sigma as f64);
    let raw: Vec<f64> = (-radius..=radius)
        .map(|i| (-((i * i) as f64) / denom).exp())
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| (w / total) as f32).collect()
}

/// Correlate every lane along `axis` with centred `weights`, nearest edges.
///
/// `weights` must have odd length. Lanes are rewritten in place using a
/// scratch buffer so each output sample only sees original inputs.
pub fn correlate_axis_nearest(data: &mut Array3<f32>, axis: usize, weights: &[f32]) {
    let len = data.len_of(Axis(axis));
    if weights.is_empty() || len == 0 {
        return;
    }
    debug_assert!(weights.len() % 2 == 1, "kernel must have odd length");
    let radius = (weights.len() / 2) as isize;
    let last = len as isize - 1;
    let mut input = vec![0f32; len];

    for mut lane in data.lanes_mut(Axis(axis)) {
        for (dst, &v) in input.iter_mut().zip(lane.iter()) {
            *dst = v;
        }
        for (i, out) in lane.iter_mut().enumerate() {
            let mut acc = 0f64;
            for (k, &w) in weights.iter().enumerate() {
                let j = (i as isize + k as isize - radius).clamp(0, last) as usize;
                acc += w as f64 * input[j] as f64;
            }
            *out = acc as f32;
        }
    }
}

/// Separable Gaussian smoothing with per-axis sigma `[z, y, x]`.
pub fn gaussian_filter(data: &mut Array3<f32>, sigma: [f32; 3], truncate: f32) {
    for (axis, &s) in sigma.iter().enumerate() {
        let kernel = gaussian_kernel(s, truncate);
        correlate_axis_nearest(data, axis, &kernel);
    }
}

/// Separable moving average with per-axis window `[z, y, x]` (odd sizes).
pub fn uniform_filter(data: &mut Array3<f32>, size: [usize; 3]) {
    for (axis, &n) in size.iter().enumerate() {
        if n <= 1 {
            continue;
        }
        let weights = vec![1.0 / n as f32; n];
        correlate_axis_nearest(data, axis, &weights);
    }
}

/// Clamp every value to [0, 1]; NaN becomes 0.
pub fn preserve_float_range(data: &mut Array3<f32>) {
    data.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) });
}
