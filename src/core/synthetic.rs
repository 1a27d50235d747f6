//! Synthetic fields of view with Gaussian spots at known positions.
//!
//! Every spot is rendered into each (round, ch) volume with the "on"
//! amplitude where its code selects that channel and the "off" amplitude
//! elsewhere. Blobs are truncated at four sigma so the background outside
//! them is exactly the configured noise floor.

use ndarray::Array5;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use super::codebook::{Codebook, CodebookEntry, CodebookError};
use super::stack::ImageStack;

/// Blobs are zero beyond this many sigmas.
const TRUNCATE_SIGMAS: f32 = 4.0;

#[derive(Error, Debug)]
pub enum SyntheticError {
    #[error("codebook error: {0}")]
    Codebook(#[from] CodebookError),

    #[error("spot {index} at {position:?} lies outside the {shape:?} volume")]
    OutOfBounds {
        index: usize,
        position: [f32; 3],
        shape: [usize; 3],
    },

    #[error("spot {index} has a {got}-round code, expected {expected}")]
    CodeLength {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("spot {index} selects channel {ch}, only {num_chs} channels")]
    ChannelOutOfRange {
        index: usize,
        ch: usize,
        num_chs: usize,
    },
}

/// Result type for the synthetic generator.
pub type Result<T> = std::result::Result<T, SyntheticError>;

/// One injected spot: (z, y, x) centre and channel per round.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSpot {
    pub position: [f32; 3],
    pub code: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticParams {
    pub num_rounds: usize,
    pub num_chs: usize,
    pub num_zplanes: usize,
    pub height: usize,
    pub width: usize,
    /// Isotropic blob sigma in pixels.
    pub sigma: f32,
    pub on_amplitude: f32,
    pub off_amplitude: f32,
    /// Uniform background noise in `[0, noise)`.
    pub noise: f32,
    pub seed: u64,
    pub codebook: Vec<CodebookEntry>,
    pub spots: Vec<SyntheticSpot>,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            num_rounds: 3,
            num_chs: 2,
            num_zplanes: 5,
            height: 32,
            width: 32,
            sigma: 1.0,
            on_amplitude: 1.0,
            off_amplitude: 0.1,
            noise: 0.0,
            seed: 0,
            codebook: vec![
                CodebookEntry {
                    target: "G1".to_string(),
                    code: vec![0, 1, 0],
                },
                CodebookEntry {
                    target: "G2".to_string(),
                    code: vec![1, 1, 1],
                },
            ],
            spots: Vec::new(),
        }
    }
}

/// Every code over `num_rounds` rounds with `num_chs` channels, in
/// lexicographic order.
fn all_codes(num_rounds: usize, num_chs: usize) -> Vec<Vec<usize>> {
    let mut codes = vec![Vec::new()];
    for _ in 0..num_rounds {
        codes = codes
            .into_iter()
            .flat_map(|prefix| {
                (0..num_chs).map(move |c| {
                    let mut code = prefix.clone();
                    code.push(c);
                    code
                })
            })
            .collect();
    }
    codes
}

impl SyntheticParams {
    /// Random experiment on a 3-round, 2-channel, 5 x 64 x 64 grid.
    ///
    /// The codebook holds `n_targets` random distinct codes. Spots are
    /// placed at least 8 px apart in (y, x); fewer than `n_spots` are placed
    /// when the field is too crowded.
    pub fn random(seed: u64, n_spots: usize, n_targets: usize) -> Self {
        let mut params = Self {
            height: 64,
            width: 64,
            noise: 0.02,
            seed,
            ..Self::default()
        };
        let mut rng = StdRng::seed_from_u64(seed);

        let mut codes = all_codes(params.num_rounds, params.num_chs);
        codes.shuffle(&mut rng);
        params.codebook = codes
            .into_iter()
            .take(n_targets.max(1))
            .enumerate()
            .map(|(i, code)| CodebookEntry {
                target: format!("G{}", i + 1),
                code,
            })
            .collect();

        let border = (2.0 * params.sigma).ceil() + 1.0;
        let z_hi = (params.num_zplanes as f32 - 2.0).max(1.0);
        let (y_hi, x_hi) = (
            params.height as f32 - border,
            params.width as f32 - border,
        );
        let min_dist_sq = 64.0f32;
        let mut attempts = 0;
        while params.spots.len() < n_spots && attempts < 1000 * n_spots.max(1) {
            attempts += 1;
            let position = [
                rng.gen_range(1.0..=z_hi).round(),
                rng.gen_range(border..y_hi),
                rng.gen_range(border..x_hi),
            ];
            let crowded = params.spots.iter().any(|s| {
                let dy = s.position[1] - position[1];
                let dx = s.position[2] - position[2];
                dy * dy + dx * dx < min_dist_sq
            });
            if crowded {
                continue;
            }
            let entry = &params.codebook[rng.gen_range(0..params.codebook.len())];
            params.spots.push(SyntheticSpot {
                position,
                code: entry.code.clone(),
            });
        }
        if params.spots.len() < n_spots {
            log::warn!(
                "placed only {} of {} synthetic spots",
                params.spots.len(),
                n_spots
            );
        }
        params
    }

    fn validate_spots(&self) -> Result<()> {
        let shape = [self.num_zplanes, self.height, self.width];
        for (index, spot) in self.spots.iter().enumerate() {
            let inside = spot
                .position
                .iter()
                .zip(shape.iter())
                .all(|(&p, &n)| p >= 0.0 && p <= n as f32 - 1.0);
            if !inside {
                return Err(SyntheticError::OutOfBounds {
                    index,
                    position: spot.position,
                    shape,
                });
            }
            if spot.code.len() != self.num_rounds {
                return Err(SyntheticError::CodeLength {
                    index,
                    expected: self.num_rounds,
                    got: spot.code.len(),
                });
            }
            if let Some(&ch) = spot.code.iter().find(|&&c| c >= self.num_chs) {
                return Err(SyntheticError::ChannelOutOfRange {
                    index,
                    ch,
                    num_chs: self.num_chs,
                });
            }
        }
        Ok(())
    }
}

/// Add a truncated isotropic Gaussian to one (round, ch) volume.
fn render_blob(data: &mut Array5<f32>, round: usize, ch: usize, center: [f32; 3], sigma: f32, amplitude: f32) {
    let (_, _, nz, ny, nx) = data.dim();
    let reach = TRUNCATE_SIGMAS * sigma;
    let cutoff_sq = reach * reach;
    let two_sigma_sq = 2.0 * sigma * sigma;

    let range = |c: f32, n: usize| {
        let lo = (c - reach).floor().max(0.0) as usize;
        let hi = ((c + reach).ceil() as usize).min(n.saturating_sub(1));
        lo..=hi
    };
    for z in range(center[0], nz) {
        for y in range(center[1], ny) {
            for x in range(center[2], nx) {
                let d2 = (z as f32 - center[0]).powi(2)
                    + (y as f32 - center[1]).powi(2)
                    + (x as f32 - center[2]).powi(2);
                if d2 <= cutoff_sq {
                    data[[round, ch, z, y, x]] += amplitude * (-d2 / two_sigma_sq).exp();
                }
            }
        }
    }
}

/// Render the stack and build the codebook described by `params`.
pub fn synthetic_fov(params: &SyntheticParams) -> Result<(ImageStack, Codebook)> {
    let codebook = Codebook::new(params.num_rounds, params.num_chs, params.codebook.clone())?;
    params.validate_spots()?;

    let shape = (
        params.num_rounds,
        params.num_chs,
        params.num_zplanes,
        params.height,
        params.width,
    );
    let mut data = if params.noise > 0.0 {
        let mut rng = StdRng::seed_from_u64(params.seed);
        Array5::from_shape_simple_fn(shape, || rng.gen_range(0.0..params.noise))
    } else {
        Array5::zeros(shape)
    };

    for spot in &params.spots {
        for (round, &on_ch) in spot.code.iter().enumerate() {
            for ch in 0..params.num_chs {
                let amplitude = if ch == on_ch {
                    params.on_amplitude
                } else {
                    params.off_amplitude
                };
                if amplitude != 0.0 {
                    render_blob(&mut data, round, ch, spot.position, params.sigma, amplitude);
                }
            }
        }
    }
    data.mapv_inplace(|v| v.clamp(0.0, 1.0));

    log::debug!(
        "synthetic FOV {:?} with {} spots and {} targets",
        shape,
        params.spots.len(),
        codebook.len()
    );
    Ok((ImageStack::new(data), codebook))
}
