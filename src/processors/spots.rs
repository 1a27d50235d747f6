//! Local-maximum spot detection.
//!
//! Spots are found as local maxima of a reference image above a percentile
//! threshold, refined to sub-pixel positions by centre of mass, filtered by
//! integrated mass and radius of gyration, and thinned so that no two retained
//! spots lie closer than the configured separation. Separation queries use a
//! `kiddo` KD-tree.
//!
//! # Example
//!
//! ```no_run
//! use smfish_pipeline::config::{ExecutionConfig, SpotFinderConfig};
//! use smfish_pipeline::core::ImageStack;
//! use smfish_pipeline::processors::spots::find_spots;
//!
//! let stack = ImageStack::zeros(3, 2, 5, 32, 32);
//! let table = find_spots(&stack, &SpotFinderConfig::default(), &ExecutionConfig::default()).unwrap();
//! assert!(table.is_empty());
//! ```

use std::cmp::Ordering;

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use ndarray::{s, Array2, ArrayView3};
use rayon::prelude::*;
use rayon::ThreadPoolBuildError;
use thiserror::Error;

use super::{progress_level, with_workers};
use crate::config::{ConfigurationError, ExecutionConfig, SpotFinderConfig, SpotReference};
use crate::core::stack::ImageStack;
use crate::core::transforms::percentile;

pub use crate::config::InvalidParameterError;

/// Centre offsets above this (in pixels, on any axis) move the centre.
const SHIFT_THRESHOLD: f32 = 0.6;

/// Errors raised by the spot finder.
#[derive(Error, Debug)]
pub enum SpotFinderError {
    #[error("invalid spot finder parameter: {0}")]
    InvalidParameter(#[from] InvalidParameterError),

    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

/// Result type for spot finding.
pub type Result<T> = std::result::Result<T, SpotFinderError>;

/// A detected spot with its per-(round, ch) intensities.
#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    pub id: usize,
    pub z: f32,
    pub y: f32,
    pub x: f32,
    /// Radius of gyration over the footprint.
    pub radius: f32,
    /// Integrated intensity over the footprint.
    pub mass: f32,
    /// Peak value over the footprint.
    pub signal: f32,
    /// Shape (rounds, chs).
    pub intensities: Array2<f32>,
}

impl Spot {
    #[inline]
    pub fn position(&self) -> [f32; 3] {
        [self.z, self.y, self.x]
    }

    /// Euclidean distance between spot centres.
    pub fn distance(&self, other: &Spot) -> f32 {
        let (a, b) = (self.position(), other.position());
        a.iter()
            .zip(b.iter())
            .map(|(p, q)| (p - q) * (p - q))
            .sum::<f32>()
            .sqrt()
    }
}

/// Spots of one field of view, ordered by (z, y, x).
#[derive(Debug, Clone, PartialEq)]
pub struct SpotTable {
    pub round_labels: Vec<u32>,
    pub ch_labels: Vec<u32>,
    pub spots: Vec<Spot>,
}

impl SpotTable {
    pub fn new(round_labels: Vec<u32>, ch_labels: Vec<u32>, spots: Vec<Spot>) -> Self {
        Self {
            round_labels,
            ch_labels,
            spots,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.spots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.spots.is_empty()
    }

    #[inline]
    pub fn num_rounds(&self) -> usize {
        self.round_labels.len()
    }

    #[inline]
    pub fn num_chs(&self) -> usize {
        self.ch_labels.len()
    }
}

/// A refined local maximum before measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    center: [usize; 3],
    position: [f32; 3],
    mass: f32,
    radius: f32,
    signal: f32,
}

fn cmp_position(a: &[f32; 3], b: &[f32; 3]) -> Ordering {
    a[0].total_cmp(&b[0])
        .then_with(|| a[1].total_cmp(&b[1]))
        .then_with(|| a[2].total_cmp(&b[2]))
}

/// Offsets of a discrete ball; flat in z unless `volumetric`.
fn ball(radius: usize, volumetric: bool) -> Vec<[isize; 3]> {
    let r = radius as isize;
    let rz = if volumetric { r } else { 0 };
    let mut out = Vec::new();
    for dz in -rz..=rz {
        for dy in -r..=r {
            for dx in -r..=r {
                if dz * dz + dy * dy + dx * dx <= r * r {
                    out.push([dz, dy, dx]);
                }
            }
        }
    }
    out
}

#[inline]
fn offset_index(center: [usize; 3], offset: [isize; 3], dims: [usize; 3]) -> Option<[usize; 3]> {
    let mut out = [0usize; 3];
    for a in 0..3 {
        let p = center[a] as isize + offset[a];
        if p < 0 || p >= dims[a] as isize {
            return None;
        }
        out[a] = p as usize;
    }
    Some(out)
}

#[inline]
fn dims_of(image: &ArrayView3<'_, f32>) -> [usize; 3] {
    let (z, y, x) = image.dim();
    [z, y, x]
}

/// Maximum over the footprint around `center`, ignoring voxels out of bounds.
fn footprint_peak(image: &ArrayView3<'_, f32>, center: [usize; 3], footprint: &[[isize; 3]]) -> f32 {
    let dims = dims_of(image);
    footprint
        .iter()
        .filter_map(|&off| offset_index(center, off, dims))
        .map(|p| image[p])
        .fold(0.0f32, f32::max)
}

/// Nearest voxel to a sub-pixel position.
fn nearest_voxel(position: [f32; 3], dims: [usize; 3]) -> [usize; 3] {
    let mut out = [0usize; 3];
    for a in 0..3 {
        let hi = dims[a].saturating_sub(1) as f32;
        out[a] = position[a].round().clamp(0.0, hi) as usize;
    }
    out
}

struct Locator<'a> {
    config: &'a SpotFinderConfig,
    footprint: Vec<[isize; 3]>,
    neighbourhood: Vec<[isize; 3]>,
}

impl<'a> Locator<'a> {
    fn new(config: &'a SpotFinderConfig) -> Self {
        let r = config.radius();
        Self {
            config,
            footprint: ball(r, config.is_volume),
            neighbourhood: ball(r.max(1), config.is_volume),
        }
    }

    fn margin(&self) -> [usize; 3] {
        let r = self.config.radius();
        [if self.config.is_volume { r } else { 0 }, r, r]
    }

    /// Locate, filter and thin spots in one (z, y, x) reference image.
    fn detect(&self, image: ArrayView3<'_, f32>) -> Vec<Candidate> {
        let candidates = if self.config.is_volume {
            self.locate(&image)
        } else {
            let planes: Vec<Vec<Candidate>> = (0..image.len_of(ndarray::Axis(0)))
                .into_par_iter()
                .map(|z| {
                    let plane = image.slice(s![z..z + 1, .., ..]);
                    let mut found = self.locate(&plane);
                    for c in &mut found {
                        c.center[0] += z;
                        c.position[0] += z as f32;
                    }
                    found
                })
                .collect();
            planes.concat()
        };
        let found = candidates.len();

        let kept: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.mass >= self.config.min_mass && c.radius <= self.config.max_radius)
            .collect();
        let filtered = kept.len();

        let separated = enforce_separation(kept, self.config.separation, |c| c);
        log::debug!(
            "{} local maxima, {} after mass/radius filter, {} after separation",
            found,
            filtered,
            separated.len()
        );
        separated
    }

    fn locate(&self, image: &ArrayView3<'_, f32>) -> Vec<Candidate> {
        let dims = dims_of(image);
        let positives: Vec<f32> = image.iter().copied().filter(|&v| v > 0.0).collect();
        let Some(threshold) = percentile(&positives, self.config.percentile) else {
            return Vec::new();
        };

        let margin = self.margin();
        if (0..3).any(|a| dims[a] <= 2 * margin[a]) {
            return Vec::new();
        }

        let mut out = Vec::new();
        for z in margin[0]..dims[0] - margin[0] {
            for y in margin[1]..dims[1] - margin[1] {
                for x in margin[2]..dims[2] - margin[2] {
                    let v = image[[z, y, x]];
                    if v <= threshold || !self.is_local_max(image, [z, y, x], v) {
                        continue;
                    }
                    if let Some(c) = self.refine(image, [z, y, x]) {
                        out.push(c);
                    }
                }
            }
        }
        out
    }

    fn is_local_max(&self, image: &ArrayView3<'_, f32>, center: [usize; 3], value: f32) -> bool {
        let dims = dims_of(image);
        self.neighbourhood
            .iter()
            .filter_map(|&off| offset_index(center, off, dims))
            .all(|p| image[p] <= value)
    }

    /// Move the centre towards the centre of mass until it settles.
    fn refine(&self, image: &ArrayView3<'_, f32>, start: [usize; 3]) -> Option<Candidate> {
        let dims = dims_of(image);
        let margin = self.margin();
        let mut center = start;

        for _ in 0..self.config.max_iterations {
            let c = self.measure(image, center)?;
            let offset: Vec<f32> = (0..3).map(|a| c.position[a] - center[a] as f32).collect();
            if offset.iter().all(|o| o.abs() <= SHIFT_THRESHOLD) {
                return Some(c);
            }
            let mut next = center;
            for a in 0..3 {
                let lo = margin[a] as isize;
                let hi = (dims[a] - 1 - margin[a]) as isize;
                let shifted = center[a] as isize + offset[a].round() as isize;
                next[a] = shifted.clamp(lo, hi) as usize;
            }
            if next == center {
                return Some(c);
            }
            center = next;
        }
        self.measure(image, center)
    }

    /// Mass, centroid, radius of gyration and peak over the footprint.
    fn measure(&self, image: &ArrayView3<'_, f32>, center: [usize; 3]) -> Option<Candidate> {
        let dims = dims_of(image);
        let mut mass = 0f64;
        let mut moment = [0f64; 3];
        let mut signal = 0f32;
        let mut voxels = Vec::with_capacity(self.footprint.len());

        for &off in &self.footprint {
            let Some(p) = offset_index(center, off, dims) else {
                continue;
            };
            let v = image[p];
            signal = signal.max(v);
            mass += v as f64;
            for a in 0..3 {
                moment[a] += v as f64 * p[a] as f64;
            }
            voxels.push((p, v as f64));
        }
        if mass <= 0.0 {
            return None;
        }

        let com = [moment[0] / mass, moment[1] / mass, moment[2] / mass];
        let spread: f64 = voxels
            .iter()
            .map(|(p, v)| {
                let d2: f64 = (0..3).map(|a| (p[a] as f64 - com[a]).powi(2)).sum();
                v * d2
            })
            .sum();

        Some(Candidate {
            center,
            position: [com[0] as f32, com[1] as f32, com[2] as f32],
            mass: mass as f32,
            radius: (spread / mass).sqrt() as f32,
            signal,
        })
    }
}

/// Greedy thinning: brightest first, drop anything within `separation` of an
/// item already kept. Ties in mass keep (z, y, x) order, then input order.
fn enforce_separation<T>(mut items: Vec<T>, separation: f32, candidate: impl Fn(&T) -> &Candidate) -> Vec<T> {
    items.sort_by(|a, b| {
        let (a, b) = (candidate(a), candidate(b));
        b.mass
            .total_cmp(&a.mass)
            .then_with(|| cmp_position(&a.position, &b.position))
    });
    if items.len() < 2 {
        return items;
    }

    let coords: Vec<[f32; 3]> = items.iter().map(|item| candidate(item).position).collect();
    let tree: ImmutableKdTree<f32, 3> = ImmutableKdTree::new_from_slice(&coords);
    let sep_sq = separation * separation;

    let mut kept = vec![false; coords.len()];
    for (i, coord) in coords.iter().enumerate() {
        let blocked = tree
            .within::<SquaredEuclidean>(coord, sep_sq)
            .iter()
            .any(|nn| {
                let j = nn.item as usize;
                j != i && kept[j] && nn.distance < sep_sq
            });
        kept[i] = !blocked;
    }

    items
        .into_iter()
        .zip(kept)
        .filter_map(|(item, keep)| keep.then_some(item))
        .collect()
}

fn to_spot(c: &Candidate, intensities: Array2<f32>) -> Spot {
    Spot {
        id: 0,
        z: c.position[0],
        y: c.position[1],
        x: c.position[2],
        radius: c.radius,
        mass: c.mass,
        signal: c.signal,
        intensities,
    }
}

fn detect_on_max_projection(stack: &ImageStack, locator: &Locator<'_>) -> Vec<Spot> {
    let reference = stack.max_projection();
    let candidates = locator.detect(reference.view());
    let (rounds, chs) = (stack.num_rounds(), stack.num_chs());

    candidates
        .par_iter()
        .map(|c| {
            let intensities = Array2::from_shape_fn((rounds, chs), |(r, ch)| {
                let volume = stack.volume(r, ch);
                let center = nearest_voxel(c.position, dims_of(&volume));
                footprint_peak(&volume, center, &locator.footprint)
            });
            to_spot(c, intensities)
        })
        .collect()
}

/// Detect in every (round, ch) volume, then thin the merged set so the
/// separation holds across images too.
fn detect_per_image(stack: &ImageStack, locator: &Locator<'_>, level: log::Level) -> Vec<Spot> {
    let (rounds, chs) = (stack.num_rounds(), stack.num_chs());
    let images: Vec<(usize, usize)> = (0..rounds)
        .flat_map(|r| (0..chs).map(move |ch| (r, ch)))
        .collect();

    let per_image: Vec<Vec<((usize, usize), Candidate)>> = images
        .par_iter()
        .map(|&(r, ch)| {
            let candidates = locator.detect(stack.volume(r, ch));
            log::log!(level, "round {} ch {}: {} spots", r, ch, candidates.len());
            candidates.into_iter().map(|c| ((r, ch), c)).collect()
        })
        .collect();
    let merged = per_image.concat();
    let found = merged.len();

    let kept = enforce_separation(merged, locator.config.separation, |(_, c)| c);
    log::debug!("{} per-image spots, {} after cross-image separation", found, kept.len());

    kept.par_iter()
        .map(|&((r, ch), c)| {
            let volume = stack.volume(r, ch);
            let mut intensities = Array2::zeros((rounds, chs));
            let center = nearest_voxel(c.position, dims_of(&volume));
            intensities[[r, ch]] = footprint_peak(&volume, center, &locator.footprint);
            to_spot(&c, intensities)
        })
        .collect()
}

/// Detect spots in `stack` and measure their per-(round, ch) intensities.
///
/// Parameters are validated before any work is done. An image without
/// positive voxels yields an empty table.
pub fn find_spots(
    stack: &ImageStack,
    config: &SpotFinderConfig,
    exec: &ExecutionConfig,
) -> Result<SpotTable> {
    config.validate()?;
    exec.validate()?;
    if stack.is_empty() {
        return Err(ConfigurationError::EmptyStack {
            shape: stack.shape(),
        }
        .into());
    }

    let locator = Locator::new(config);
    let level = progress_level(exec.verbose);
    let mut spots = with_workers(exec.n_processes, || match config.reference {
        SpotReference::MaxProjection => detect_on_max_projection(stack, &locator),
        SpotReference::PerImage => detect_per_image(stack, &locator, level),
    })?;

    spots.sort_by(|a, b| cmp_position(&a.position(), &b.position()));
    for (id, spot) in spots.iter_mut().enumerate() {
        spot.id = id;
    }
    log::info!("Found {} spots ({:?} reference)", spots.len(), config.reference);

    Ok(SpotTable::new(
        stack.axis_labels(crate::core::stack::Axis::Round).to_vec(),
        stack.axis_labels(crate::core::stack::Axis::Ch).to_vec(),
        spots,
    ))
}
