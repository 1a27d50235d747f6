//! Multi-round, multi-channel image volume for a single field of view.

use std::collections::HashSet;

use ndarray::{s, Array2, Array3, Array5, ArrayView2, ArrayView3, Axis as NdAxis, Zip};
use thiserror::Error;

/// Errors raised by label-based stack access.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StackError {
    #[error("{axis} has {shape} entries but {labels} labels were given")]
    LabelCount {
        axis: Axis,
        shape: usize,
        labels: usize,
    },

    #[error("duplicate label {label} on {axis} axis")]
    DuplicateLabel { axis: Axis, label: u32 },

    #[error("no {axis} with label {label}")]
    UnknownLabel { axis: Axis, label: u32 },

    #[error("tile shape {got:?} does not match stack tile shape {expected:?}")]
    TileShape {
        expected: (usize, usize),
        got: (usize, usize),
    },
}

/// Result type for stack operations.
pub type Result<T> = std::result::Result<T, StackError>;

/// Labelled (non-spatial plus z) axes of an [`ImageStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Round,
    Ch,
    ZPlane,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Round => write!(f, "round"),
            Axis::Ch => write!(f, "ch"),
            Axis::ZPlane => write!(f, "zplane"),
        }
    }
}

/// Intensity volume with axes (round, ch, z, y, x).
///
/// Round, channel and z-plane positions carry integer labels that need not be
/// contiguous or start at zero. Index-based accessors take positions,
/// label-based accessors take labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageStack {
    data: Array5<f32>,
    round_labels: Vec<u32>,
    ch_labels: Vec<u32>,
    z_labels: Vec<u32>,
}

impl ImageStack {
    /// Creates a stack labelled `0..n` on every axis.
    pub fn new(data: Array5<f32>) -> Self {
        let (r, c, z, _, _) = data.dim();
        Self {
            data,
            round_labels: (0..r as u32).collect(),
            ch_labels: (0..c as u32).collect(),
            z_labels: (0..z as u32).collect(),
        }
    }

    /// Creates a stack with explicit axis labels.
    pub fn with_labels(
        data: Array5<f32>,
        round_labels: Vec<u32>,
        ch_labels: Vec<u32>,
        z_labels: Vec<u32>,
    ) -> Result<Self> {
        let (r, c, z, _, _) = data.dim();
        check_labels(Axis::Round, r, &round_labels)?;
        check_labels(Axis::Ch, c, &ch_labels)?;
        check_labels(Axis::ZPlane, z, &z_labels)?;
        Ok(Self {
            data,
            round_labels,
            ch_labels,
            z_labels,
        })
    }

    /// Creates an all-zero stack.
    pub fn zeros(rounds: usize, chs: usize, zplanes: usize, height: usize, width: usize) -> Self {
        Self::new(Array5::zeros((rounds, chs, zplanes, height, width)))
    }

    #[inline]
    pub fn data(&self) -> &Array5<f32> {
        &self.data
    }

    #[inline]
    pub fn shape(&self) -> [usize; 5] {
        let (r, c, z, y, x) = self.data.dim();
        [r, c, z, y, x]
    }

    #[inline]
    pub fn num_rounds(&self) -> usize {
        self.round_labels.len()
    }

    #[inline]
    pub fn num_chs(&self) -> usize {
        self.ch_labels.len()
    }

    #[inline]
    pub fn num_zplanes(&self) -> usize {
        self.z_labels.len()
    }

    /// (height, width) of every tile.
    #[inline]
    pub fn tile_shape(&self) -> (usize, usize) {
        let (_, _, _, y, x) = self.data.dim();
        (y, x)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn axis_labels(&self, axis: Axis) -> &[u32] {
        match axis {
            Axis::Round => &self.round_labels,
            Axis::Ch => &self.ch_labels,
            Axis::ZPlane => &self.z_labels,
        }
    }

    /// Position of `label` along `axis`.
    pub fn label_index(&self, axis: Axis, label: u32) -> Result<usize> {
        self.axis_labels(axis)
            .iter()
            .position(|&l| l == label)
            .ok_or(StackError::UnknownLabel { axis, label })
    }

    /// 2D tile addressed by labels.
    pub fn get_slice(&self, round: u32, ch: u32, zplane: u32) -> Result<ArrayView2<'_, f32>> {
        let r = self.label_index(Axis::Round, round)?;
        let c = self.label_index(Axis::Ch, ch)?;
        let z = self.label_index(Axis::ZPlane, zplane)?;
        Ok(self.data.slice(s![r, c, z, .., ..]))
    }

    /// Overwrite a 2D tile addressed by labels.
    pub fn set_slice(&mut self, round: u32, ch: u32, zplane: u32, tile: &Array2<f32>) -> Result<()> {
        let r = self.label_index(Axis::Round, round)?;
        let c = self.label_index(Axis::Ch, ch)?;
        let z = self.label_index(Axis::ZPlane, zplane)?;
        let expected = self.tile_shape();
        if tile.dim() != expected {
            return Err(StackError::TileShape {
                expected,
                got: tile.dim(),
            });
        }
        self.data.slice_mut(s![r, c, z, .., ..]).assign(tile);
        Ok(())
    }

    /// (z, y, x) volume of one round/channel, by index.
    #[inline]
    pub fn volume(&self, round: usize, ch: usize) -> ArrayView3<'_, f32> {
        self.data.slice(s![round, ch, .., .., ..])
    }

    /// Overwrite the (z, y, x) volume of one round/channel, by index.
    pub(crate) fn assign_volume(&mut self, round: usize, ch: usize, volume: &Array3<f32>) {
        self.data.slice_mut(s![round, ch, .., .., ..]).assign(volume);
    }

    /// Overwrite one 2D plane, by index.
    pub(crate) fn assign_plane(&mut self, round: usize, ch: usize, z: usize, plane: ArrayView2<'_, f32>) {
        self.data.slice_mut(s![round, ch, z, .., ..]).assign(&plane);
    }

    /// Maximum over rounds and channels.
    pub fn max_projection(&self) -> Array3<f32> {
        let (_, _, z, y, x) = self.data.dim();
        let mut out = Array3::<f32>::zeros((z, y, x));
        if self.data.is_empty() {
            return out;
        }
        out.fill(f32::NEG_INFINITY);
        for round in self.data.axis_iter(NdAxis(0)) {
            for volume in round.axis_iter(NdAxis(0)) {
                Zip::from(&mut out).and(&volume).for_each(|o, &v| {
                    if v > *o {
                        *o = v;
                    }
                });
            }
        }
        out
    }
}

fn check_labels(axis: Axis, shape: usize, labels: &[u32]) -> Result<()> {
    if labels.len() != shape {
        return Err(StackError::LabelCount {
            axis,
            shape,
            labels: labels.len(),
        });
    }
    let mut seen = HashSet::with_capacity(labels.len());
    for &label in labels {
        if !seen.insert(label) {
            return Err(StackError::DuplicateLabel { axis, label });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUND_LABELS: [u32; 3] = [1, 4, 6];
    const CH_LABELS: [u32; 4] = [2, 4, 6, 8];
    const ZPLANE_LABELS: [u32; 2] = [3, 4];
    const HEIGHT: usize = 2;
    const WIDTH: usize = 4;

    fn fill_value(r_idx: usize, c_idx: usize, z_idx: usize) -> f32 {
        let n = (ROUND_LABELS.len() * CH_LABELS.len() * ZPLANE_LABELS.len()) as f32;
        (((r_idx * CH_LABELS.len() + c_idx) * ZPLANE_LABELS.len() + z_idx) as f32) / n
    }

    fn labeled_stack() -> ImageStack {
        let data = Array5::from_shape_fn(
            (
                ROUND_LABELS.len(),
                CH_LABELS.len(),
                ZPLANE_LABELS.len(),
                HEIGHT,
                WIDTH,
            ),
            |(r, c, z, _, _)| fill_value(r, c, z),
        );
        ImageStack::with_labels(
            data,
            ROUND_LABELS.to_vec(),
            CH_LABELS.to_vec(),
            ZPLANE_LABELS.to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn test_labeled_indices_read() {
        let stack = labeled_stack();
        for (r_idx, &round) in stack.axis_labels(Axis::Round).iter().enumerate() {
            for (c_idx, &ch) in stack.axis_labels(Axis::Ch).iter().enumerate() {
                for (z_idx, &z) in stack.axis_labels(Axis::ZPlane).iter().enumerate() {
                    let tile = stack.get_slice(round, ch, z).unwrap();
                    assert_eq!(tile.dim(), (HEIGHT, WIDTH));
                    let expected = fill_value(r_idx, c_idx, z_idx);
                    assert!(tile.iter().all(|&v| v == expected));
                }
            }
        }
    }

    #[test]
    fn test_labeled_indices_set_slice() {
        let mut stack = labeled_stack();
        let tile = Array2::from_elem((HEIGHT, WIDTH), 0.75f32);
        stack.set_slice(4, 6, 3, &tile).unwrap();

        assert!(stack.get_slice(4, 6, 3).unwrap().iter().all(|&v| v == 0.75));
        // neighbours untouched
        let other = stack.get_slice(4, 6, 4).unwrap();
        assert!(other.iter().all(|&v| v == fill_value(1, 2, 1)));
    }

    #[test]
    fn test_unknown_label_and_bad_tile() {
        let mut stack = labeled_stack();
        assert_eq!(
            stack.get_slice(0, 2, 3).unwrap_err(),
            StackError::UnknownLabel {
                axis: Axis::Round,
                label: 0
            }
        );
        let tile = Array2::zeros((3, 3));
        assert!(matches!(
            stack.set_slice(1, 2, 3, &tile),
            Err(StackError::TileShape { .. })
        ));
    }

    #[test]
    fn test_with_labels_validation() {
        let data = Array5::<f32>::zeros((2, 1, 1, 2, 2));
        assert!(matches!(
            ImageStack::with_labels(data.clone(), vec![0], vec![0], vec![0]),
            Err(StackError::LabelCount { .. })
        ));
        assert_eq!(
            ImageStack::with_labels(data, vec![3, 3], vec![0], vec![0]).unwrap_err(),
            StackError::DuplicateLabel {
                axis: Axis::Round,
                label: 3
            }
        );
    }

    #[test]
    fn test_max_projection() {
        let mut stack = ImageStack::zeros(2, 2, 1, 2, 2);
        let mut tile = Array2::zeros((2, 2));
        tile[[0, 0]] = 0.3;
        stack.set_slice(0, 1, 0, &tile).unwrap();
        tile[[0, 0]] = 0.1;
        tile[[1, 1]] = 0.9;
        stack.set_slice(1, 0, 0, &tile).unwrap();

        let proj = stack.max_projection();
        assert_eq!(proj.dim(), (1, 2, 2));
        assert_eq!(proj[[0, 0, 0]], 0.3);
        assert_eq!(proj[[0, 1, 1]], 0.9);
        assert_eq!(proj[[0, 0, 1]], 0.0);
    }
}
