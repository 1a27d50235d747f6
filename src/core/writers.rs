//! Writers for spot tables, decoded results and image tiles.
//!
//! - CSV with one row per spot and one column per (round, ch) intensity
//! - 16-bit grayscale PNG tiles in the loader's `r<round>_c<ch>_z<z>.png` scheme
//! - JSON codebook

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{ImageBuffer, Luma};
use ndarray::s;
use thiserror::Error;

use super::codebook::{Codebook, CodebookError};
use super::loaders::{tile_file_name, CODEBOOK_FILE};
use super::stack::{Axis, ImageStack};
use crate::processors::decoding::DecodedResult;
use crate::processors::spots::{Spot, SpotTable};

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create a directory.
    #[error("failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// PNG encoding error.
    #[error("image write error for '{path}': {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("codebook serialization error: {0}")]
    Codebook(#[from] CodebookError),
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| WriteError::CreateDirectory {
        path: path.display().to_string(),
        source: e,
    })
}

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            create_dir(parent)?;
        }
    }
    Ok(())
}

fn create_csv_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>> {
    ensure_parent_dirs(path)?;
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(csv::Writer::from_writer(BufWriter::new(file)))
}

/// `r<round>_c<ch>` column names in (round, ch) row-major order.
fn intensity_columns(round_labels: &[u32], ch_labels: &[u32]) -> Vec<String> {
    round_labels
        .iter()
        .flat_map(|r| ch_labels.iter().map(move |c| format!("r{}_c{}", r, c)))
        .collect()
}

fn intensity_fields(spot: &Spot) -> impl Iterator<Item = String> + '_ {
    spot.intensities.iter().map(|v| format!("{:.6}", v))
}

fn position_fields(spot: &Spot) -> [String; 6] {
    [
        spot.id.to_string(),
        format!("{:.4}", spot.z),
        format!("{:.4}", spot.y),
        format!("{:.4}", spot.x),
        format!("{:.4}", spot.radius),
        format!("{:.6}", spot.mass),
    ]
}

/// Write undecoded spots to CSV.
///
/// Columns: `spot_id,z,y,x,radius,mass,signal` then one `r<round>_c<ch>`
/// column per intensity, using axis labels.
pub fn write_spot_table_csv(path: &Path, table: &SpotTable) -> Result<()> {
    let mut writer = create_csv_writer(path)?;
    let path_str = path.display().to_string();

    let mut header: Vec<String> = ["spot_id", "z", "y", "x", "radius", "mass", "signal"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(intensity_columns(&table.round_labels, &table.ch_labels));
    writer.write_record(&header).map_err(|e| WriteError::CsvError {
        path: path_str.clone(),
        source: e,
    })?;

    for spot in &table.spots {
        let mut record: Vec<String> = position_fields(spot).into();
        record.push(format!("{:.6}", spot.signal));
        record.extend(intensity_fields(spot));
        writer.write_record(&record).map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;
    }

    writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;
    Ok(())
}

/// Write decoded spots to CSV.
///
/// Columns: `spot_id,z,y,x,radius,mass,target,total_intensity,passes_threshold,code`
/// then one `r<round>_c<ch>` column per intensity. `target` is empty for
/// unassigned spots; `code` joins channel indices with `;`.
pub fn write_decoded_csv(path: &Path, result: &DecodedResult) -> Result<()> {
    let mut writer = create_csv_writer(path)?;
    let path_str = path.display().to_string();

    let mut header: Vec<String> = [
        "spot_id",
        "z",
        "y",
        "x",
        "radius",
        "mass",
        "target",
        "total_intensity",
        "passes_threshold",
        "code",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend(intensity_columns(&result.round_labels, &result.ch_labels));
    writer.write_record(&header).map_err(|e| WriteError::CsvError {
        path: path_str.clone(),
        source: e,
    })?;

    for decoded in &result.spots {
        let mut record: Vec<String> = position_fields(&decoded.spot).into();
        record.push(decoded.target.clone().unwrap_or_default());
        record.push(format!("{:.6}", decoded.total_intensity));
        record.push(decoded.passes_threshold.to_string());
        record.push(
            decoded
                .code
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(";"),
        );
        record.extend(intensity_fields(&decoded.spot));
        writer.write_record(&record).map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;
    }

    writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;
    Ok(())
}

/// Write every tile of `stack` into `dir` as a 16-bit PNG.
///
/// Values are clamped to [0, 1] and scaled to the full `u16` range. Returns
/// the written paths in (round, ch, z) order.
pub fn write_stack_tiles(dir: &Path, stack: &ImageStack) -> Result<Vec<PathBuf>> {
    create_dir(dir)?;
    let (height, width) = stack.tile_shape();
    let mut written = Vec::new();

    for (r, &round) in stack.axis_labels(Axis::Round).iter().enumerate() {
        for (c, &ch) in stack.axis_labels(Axis::Ch).iter().enumerate() {
            for (zi, &z) in stack.axis_labels(Axis::ZPlane).iter().enumerate() {
                let tile = stack.data().slice(s![r, c, zi, .., ..]);
                let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                        let v = tile[[y as usize, x as usize]].clamp(0.0, 1.0);
                        Luma([(v * u16::MAX as f32).round() as u16])
                    });
                let path = dir.join(tile_file_name(round, ch, z));
                img.save(&path).map_err(|e| WriteError::Image {
                    path: path.display().to_string(),
                    source: e,
                })?;
                written.push(path);
            }
        }
    }
    log::debug!("wrote {} tiles to {}", written.len(), dir.display());
    Ok(written)
}

/// Write `codebook` as JSON into `experiment_dir/codebook.json`.
pub fn write_codebook(experiment_dir: &Path, codebook: &Codebook) -> Result<PathBuf> {
    create_dir(experiment_dir)?;
    let path = experiment_dir.join(CODEBOOK_FILE);
    let json = codebook.to_json_string()?;
    let mut file = File::create(&path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    file.write_all(json.as_bytes())
        .map_err(|e| WriteError::WriteFile {
            path: path.display().to_string(),
            source: e,
        })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codebook::CodebookEntry;
    use crate::core::loaders::{load_fov, load_stack};
    use crate::processors::decoding::DecodedSpot;
    use ndarray::{array, Array5};
    use std::fs;
    use tempfile::tempdir;

    fn spot(id: usize) -> Spot {
        Spot {
            id,
            z: 1.0,
            y: 2.5,
            x: 3.25,
            radius: 0.8,
            mass: 1.5,
            signal: 0.9,
            intensities: array![[0.9, 0.1], [0.2, 0.7]],
        }
    }

    #[test]
    fn test_write_spot_table_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("spots.csv");
        let table = SpotTable::new(vec![1, 4], vec![2, 6], vec![spot(0), spot(1)]);

        write_spot_table_csv(&path, &table).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "spot_id,z,y,x,radius,mass,signal,r1_c2,r1_c6,r4_c2,r4_c6"
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0,1.0000,2.5000,3.2500,"));
        assert!(lines[2].ends_with(",0.200000,0.700000"));
    }

    #[test]
    fn test_write_decoded_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decoded.csv");
        let result = DecodedResult {
            round_labels: vec![0, 1],
            ch_labels: vec![0, 1],
            spots: vec![
                DecodedSpot {
                    spot: spot(0),
                    code: vec![0, 1],
                    target: Some("G1".into()),
                    total_intensity: 1.6,
                    normalized_intensities: array![[0.5, 0.5], [0.5, 0.5]],
                    passes_threshold: true,
                },
                DecodedSpot {
                    spot: spot(1),
                    code: vec![0, 1],
                    target: None,
                    total_intensity: 1.6,
                    normalized_intensities: array![[0.5, 0.5], [0.5, 0.5]],
                    passes_threshold: true,
                },
            ],
        };

        write_decoded_csv(&path, &result).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[6], "target");
        assert_eq!(&headers[10], "r0_c0");
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][6], "G1");
        assert_eq!(&rows[0][8], "true");
        assert_eq!(&rows[0][9], "0;1");
        assert_eq!(&rows[1][6], "");
    }

    #[test]
    fn test_stack_tiles_reload() {
        let dir = tempdir().unwrap();
        let fov = dir.path().join("fov_000");
        let data = Array5::from_shape_fn((2, 1, 2, 3, 4), |(r, _, z, y, x)| {
            ((r * 24 + z * 12 + y * 4 + x) as f32) / 48.0
        });
        let stack = ImageStack::with_labels(data, vec![1, 3], vec![5], vec![0, 2]).unwrap();

        let written = write_stack_tiles(&fov, &stack).unwrap();
        assert_eq!(written.len(), 4);
        for name in ["r1_c5_z0.png", "r1_c5_z2.png", "r3_c5_z0.png", "r3_c5_z2.png"] {
            assert!(written.contains(&fov.join(name)), "missing {}", name);
        }

        let loaded = load_stack(&fov).unwrap();
        assert_eq!(loaded.shape(), stack.shape());
        assert_eq!(loaded.axis_labels(Axis::Round), &[1, 3]);
        for (a, b) in loaded.data().iter().zip(stack.data().iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_write_codebook_reload() {
        let dir = tempdir().unwrap();
        let codebook = Codebook::new(
            1,
            1,
            vec![CodebookEntry {
                target: "A".into(),
                code: vec![0],
            }],
        )
        .unwrap();
        write_codebook(dir.path(), &codebook).unwrap();
        write_stack_tiles(&dir.path().join("fov"), &ImageStack::zeros(1, 1, 1, 2, 2)).unwrap();

        let fov = load_fov(dir.path(), "fov").unwrap();
        assert_eq!(fov.codebook.entries(), codebook.entries());
    }
}
