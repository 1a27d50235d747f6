//! Experiment loader: PNG tiles plus a JSON codebook.
//!
//! An experiment directory looks like:
//!
//! ```text
//! experiment/
//!   codebook.json
//!   fov_000/
//!     r0_c0_z0.png
//!     r0_c1_z0.png
//!     ...
//! ```
//!
//! Round, channel and z labels are parsed from the tile names and need not be
//! contiguous. Tiles are 8- or 16-bit grayscale and are normalized to [0, 1].

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{s, Array2, Array5};
use regex::Regex;
use thiserror::Error;

use super::codebook::{Codebook, CodebookError};
use super::stack::{ImageStack, StackError};

/// File name of the codebook inside an experiment directory.
pub const CODEBOOK_FILE: &str = "codebook.json";

/// Errors that can occur during loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image decode error for {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("codebook error: {0}")]
    Codebook(#[from] CodebookError),

    #[error("stack error: {0}")]
    Stack(#[from] StackError),

    #[error("directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("no tiles matching r<round>_c<ch>_z<z>.png in {0}")]
    NoTiles(PathBuf),

    #[error("missing tile for round {round}, ch {ch}, z {z} in {dir}")]
    MissingTile {
        dir: PathBuf,
        round: u32,
        ch: u32,
        z: u32,
    },

    #[error("tile {path} is {got:?}, expected {expected:?}")]
    ShapeMismatch {
        path: PathBuf,
        expected: (usize, usize),
        got: (usize, usize),
    },
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// A tile found on disk with its parsed labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRef {
    pub round: u32,
    pub ch: u32,
    pub z: u32,
    pub path: PathBuf,
}

/// Primary image and codebook for one field of view.
#[derive(Debug, Clone)]
pub struct FieldOfView {
    pub name: String,
    pub stack: ImageStack,
    pub codebook: Codebook,
}

/// Regex for tile names; shared with the tile writer.
pub fn tile_pattern() -> Regex {
    Regex::new(r"(?i)^r(\d+)_c(\d+)_z(\d+)\.png$").unwrap()
}

/// Tile file name for the given labels.
pub fn tile_file_name(round: u32, ch: u32, z: u32) -> String {
    format!("r{}_c{}_z{}.png", round, ch, z)
}

/// Find tiles in `dir`, sorted by (round, ch, z).
pub fn find_tiles(dir: &Path) -> Result<Vec<TileRef>> {
    if !dir.is_dir() {
        return Err(LoaderError::DirectoryNotFound(dir.to_path_buf()));
    }
    let pattern = tile_pattern();
    let mut tiles: Vec<TileRef> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let caps = pattern.captures(name)?;
            Some(TileRef {
                round: caps[1].parse().ok()?,
                ch: caps[2].parse().ok()?,
                z: caps[3].parse().ok()?,
                path: path.clone(),
            })
        })
        .collect();

    tiles.sort_by_key(|t| (t.round, t.ch, t.z));
    Ok(tiles)
}

/// Read one grayscale tile and normalize to [0, 1].
pub fn load_tile(path: &Path) -> Result<Array2<f32>> {
    let img = image::open(path).map_err(|e| LoaderError::Image {
        path: path.to_path_buf(),
        source: e,
    })?;
    let gray = img.to_luma16();
    let (width, height) = gray.dimensions();
    let shape = (height as usize, width as usize);
    let values: Vec<f32> = gray
        .into_raw()
        .into_iter()
        .map(|v| v as f32 / u16::MAX as f32)
        .collect();
    let len = values.len();
    Array2::from_shape_vec(shape, values).map_err(|_| LoaderError::ShapeMismatch {
        path: path.to_path_buf(),
        expected: shape,
        got: (len, 1),
    })
}

/// Assemble an [`ImageStack`] from the tiles in `dir`.
///
/// Every (round, ch, z) combination of the labels found must be present and
/// all tiles must share one shape.
pub fn load_stack(dir: &Path) -> Result<ImageStack> {
    let tiles = find_tiles(dir)?;
    if tiles.is_empty() {
        return Err(LoaderError::NoTiles(dir.to_path_buf()));
    }

    let rounds: Vec<u32> = tiles.iter().map(|t| t.round).collect::<BTreeSet<_>>().into_iter().collect();
    let chs: Vec<u32> = tiles.iter().map(|t| t.ch).collect::<BTreeSet<_>>().into_iter().collect();
    let zs: Vec<u32> = tiles.iter().map(|t| t.z).collect::<BTreeSet<_>>().into_iter().collect();

    let by_labels: HashMap<(u32, u32, u32), &TileRef> =
        tiles.iter().map(|t| ((t.round, t.ch, t.z), t)).collect();

    let (height, width) = load_tile(&tiles[0].path)?.dim();
    let mut data = Array5::<f32>::zeros((rounds.len(), chs.len(), zs.len(), height, width));

    for (ri, &round) in rounds.iter().enumerate() {
        for (ci, &ch) in chs.iter().enumerate() {
            for (zi, &z) in zs.iter().enumerate() {
                let tile = by_labels
                    .get(&(round, ch, z))
                    .ok_or_else(|| LoaderError::MissingTile {
                        dir: dir.to_path_buf(),
                        round,
                        ch,
                        z,
                    })?;
                let pixels = load_tile(&tile.path)?;
                if pixels.dim() != (height, width) {
                    return Err(LoaderError::ShapeMismatch {
                        path: tile.path.clone(),
                        expected: (height, width),
                        got: pixels.dim(),
                    });
                }
                data.slice_mut(s![ri, ci, zi, .., ..]).assign(&pixels);
            }
        }
    }

    log::debug!(
        "{}: loaded {} rounds x {} chs x {} z-planes",
        dir.display(),
        rounds.len(),
        chs.len(),
        zs.len()
    );
    Ok(ImageStack::with_labels(data, rounds, chs, zs)?)
}

/// Load the primary image of `fov_name` and the experiment codebook.
///
/// The codebook shape is taken from the image so that unused channels are
/// still accepted.
pub fn load_fov(experiment_dir: &Path, fov_name: &str) -> Result<FieldOfView> {
    if !experiment_dir.is_dir() {
        return Err(LoaderError::DirectoryNotFound(experiment_dir.to_path_buf()));
    }
    let stack = load_stack(&experiment_dir.join(fov_name))?;
    let codebook = Codebook::from_json(
        experiment_dir.join(CODEBOOK_FILE),
        Some((stack.num_rounds(), stack.num_chs())),
    )?;
    log::info!(
        "Loaded FOV '{}' with shape {:?} and {} codebook targets",
        fov_name,
        stack.shape(),
        codebook.len()
    );
    Ok(FieldOfView {
        name: fov_name.to_string(),
        stack,
        codebook,
    })
}

/// FOV subdirectories of an experiment (those containing at least one tile).
pub fn list_fovs(experiment_dir: &Path) -> Result<Vec<String>> {
    if !experiment_dir.is_dir() {
        return Err(LoaderError::DirectoryNotFound(experiment_dir.to_path_buf()));
    }
    let mut names: Vec<String> = fs::read_dir(experiment_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| find_tiles(path).map(|t| !t.is_empty()).unwrap_or(false))
        .filter_map(|path| path.file_name().and_then(|n| n.to_str()).map(String::from))
        .collect();
    names.sort();
    Ok(names)
}
