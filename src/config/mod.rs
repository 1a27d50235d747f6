//! Configuration types for the smFISH pipeline.
//!
//! Every stage is parameterised by an explicit struct with named fields and
//! documented defaults. Values are checked by `validate()` before any image
//! data is touched; [`PipelineConfig::from_yaml`] validates on load.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parameter or dimensionality mismatch, raised before any state is mutated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("clip percentiles must satisfy 0 <= p_min <= p_max <= 100 (got p_min={p_min}, p_max={p_max})")]
    PercentileRange { p_min: f32, p_max: f32 },

    #[error("bandpass requires 0 < lshort < llong (got lshort={lshort}, llong={llong})")]
    BandpassScales { lshort: f32, llong: usize },

    #[error("{field} must be finite and non-negative (got {value})")]
    Negative { field: &'static str, value: f32 },

    #[error("{field} must be finite and positive (got {value})")]
    NonPositive { field: &'static str, value: f32 },

    #[error("{filter} expects {expected} sigma values for is_volume={is_volume}, got {got}")]
    SigmaDimensionality {
        filter: &'static str,
        is_volume: bool,
        expected: usize,
        got: usize,
    },

    #[error("{filter} does not support volumetric operation")]
    VolumetricUnsupported { filter: &'static str },

    #[error("worker count must be at least 1")]
    WorkerCount,

    #[error("image stack is empty (shape {shape:?})")]
    EmptyStack { shape: [usize; 5] },

    #[error(
        "codebook expects {codebook_rounds} rounds x {codebook_chs} channels, \
         data has {data_rounds} rounds x {data_chs} channels"
    )]
    CodebookMismatch {
        codebook_rounds: usize,
        codebook_chs: usize,
        data_rounds: usize,
        data_chs: usize,
    },
}

/// Malformed spot detection parameters.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvalidParameterError {
    #[error("spot_diameter must be a positive odd integer (got {0})")]
    SpotDiameter(usize),

    #[error("min_mass must be finite and non-negative (got {0})")]
    MinMass(f32),

    #[error("max_radius must be finite and positive (got {0})")]
    MaxRadius(f32),

    #[error("separation must be finite and positive (got {0})")]
    Separation(f32),

    #[error("percentile must lie in [0, 100] (got {0})")]
    Percentile(f32),

    #[error("max_iterations must be at least 1")]
    MaxIterations,
}

fn check_non_negative(field: &'static str, value: f32) -> Result<(), ConfigurationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError::Negative { field, value })
    }
}

fn check_positive(field: &'static str, value: f32) -> Result<(), ConfigurationError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigurationError::NonPositive { field, value })
    }
}

fn default_truncate() -> f32 {
    4.0
}

/// Percentile clip: intensities below the `p_min` percentile are discarded
/// (set to zero after shifting), intensities above `p_max` are capped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipConfig {
    pub p_min: f32,
    pub p_max: f32,

    /// Compute percentiles over each (round, ch) volume instead of each 2D tile.
    #[serde(default)]
    pub is_volume: bool,
}

impl ClipConfig {
    pub fn new(p_min: f32, p_max: f32, is_volume: bool) -> Result<Self, ConfigurationError> {
        let config = Self {
            p_min,
            p_max,
            is_volume,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let ok = self.p_min.is_finite()
            && self.p_max.is_finite()
            && 0.0 <= self.p_min
            && self.p_min <= self.p_max
            && self.p_max <= 100.0;
        if ok {
            Ok(())
        } else {
            Err(ConfigurationError::PercentileRange {
                p_min: self.p_min,
                p_max: self.p_max,
            })
        }
    }
}

/// Gaussian-minus-boxcar bandpass on 2D tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandpassConfig {
    /// Gaussian sigma for the noise length scale, in pixels.
    #[serde(default = "default_lshort")]
    pub lshort: f32,

    /// Boxcar half-width for the background length scale, in pixels.
    #[serde(default = "default_llong")]
    pub llong: usize,

    /// Filtered values below this are zeroed.
    #[serde(default)]
    pub threshold: f32,

    #[serde(default = "default_truncate")]
    pub truncate: f32,

    /// Bandpass is planar only; `true` is rejected by `validate`.
    #[serde(default)]
    pub is_volume: bool,
}

fn default_lshort() -> f32 {
    0.5
}

fn default_llong() -> usize {
    7
}

impl Default for BandpassConfig {
    fn default() -> Self {
        Self {
            lshort: default_lshort(),
            llong: default_llong(),
            threshold: 0.0,
            truncate: default_truncate(),
            is_volume: false,
        }
    }
}

impl BandpassConfig {
    pub fn new(lshort: f32, llong: usize, threshold: f32) -> Result<Self, ConfigurationError> {
        let config = Self {
            lshort,
            llong,
            threshold,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.is_volume {
            return Err(ConfigurationError::VolumetricUnsupported { filter: "bandpass" });
        }
        if !(self.lshort.is_finite() && self.lshort > 0.0 && self.lshort < self.llong as f32) {
            return Err(ConfigurationError::BandpassScales {
                lshort: self.lshort,
                llong: self.llong,
            });
        }
        if !self.threshold.is_finite() {
            return Err(ConfigurationError::Negative {
                field: "bandpass.threshold",
                value: self.threshold,
            });
        }
        check_positive("bandpass.truncate", self.truncate)
    }
}

/// Separable Gaussian blur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowPassConfig {
    /// Per-axis sigma: `[z, y, x]` when `is_volume`, `[y, x]` otherwise.
    pub sigma: Vec<f32>,

    #[serde(default)]
    pub is_volume: bool,

    #[serde(default = "default_truncate")]
    pub truncate: f32,
}

impl LowPassConfig {
    pub fn new(sigma: Vec<f32>, is_volume: bool) -> Result<Self, ConfigurationError> {
        let config = Self {
            sigma,
            is_volume,
            truncate: default_truncate(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let expected = if self.is_volume { 3 } else { 2 };
        if self.sigma.len() != expected {
            return Err(ConfigurationError::SigmaDimensionality {
                filter: "low_pass",
                is_volume: self.is_volume,
                expected,
                got: self.sigma.len(),
            });
        }
        for &s in &self.sigma {
            check_non_negative("low_pass.sigma", s)?;
        }
        check_positive("low_pass.truncate", self.truncate)
    }

    /// Sigma expanded to `[z, y, x]`; planar filters never smooth along z.
    pub fn sigma_zyx(&self) -> [f32; 3] {
        match self.sigma.as_slice() {
            [z, y, x] => [*z, *y, *x],
            [y, x] => [0.0, *y, *x],
            _ => [0.0, 0.0, 0.0],
        }
    }
}

/// One step of the filter chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterStep {
    Clip(ClipConfig),
    Bandpass(BandpassConfig),
    LowPass(LowPassConfig),
}

impl FilterStep {
    pub fn name(&self) -> &'static str {
        match self {
            FilterStep::Clip(_) => "clip",
            FilterStep::Bandpass(_) => "bandpass",
            FilterStep::LowPass(_) => "low_pass",
        }
    }

    pub fn is_volume(&self) -> bool {
        match self {
            FilterStep::Clip(c) => c.is_volume,
            FilterStep::Bandpass(c) => c.is_volume,
            FilterStep::LowPass(c) => c.is_volume,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            FilterStep::Clip(c) => c.validate(),
            FilterStep::Bandpass(c) => c.validate(),
            FilterStep::LowPass(c) => c.validate(),
        }
    }
}

fn default_filters() -> Vec<FilterStep> {
    vec![
        FilterStep::Clip(ClipConfig {
            p_min: 50.0,
            p_max: 100.0,
            is_volume: false,
        }),
        FilterStep::Bandpass(BandpassConfig::default()),
        FilterStep::LowPass(LowPassConfig {
            sigma: vec![1.0, 0.0, 0.0],
            is_volume: true,
            truncate: default_truncate(),
        }),
        FilterStep::Clip(ClipConfig {
            p_min: 99.0,
            p_max: 100.0,
            is_volume: true,
        }),
    ]
}

/// Which image local maxima are searched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotReference {
    /// Search once in the max projection over rounds and channels, then
    /// measure every (round, ch) at the detected positions.
    MaxProjection,
    /// Search every (round, ch) volume independently.
    PerImage,
}

/// Local-maximum spot detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotFinderConfig {
    /// Expected spot diameter in pixels; must be odd.
    #[serde(default = "default_spot_diameter")]
    pub spot_diameter: usize,

    /// Minimum integrated intensity over the spot footprint.
    #[serde(default = "default_min_mass")]
    pub min_mass: f32,

    /// Maximum radius of gyration.
    #[serde(default = "default_max_radius")]
    pub max_radius: f32,

    /// Minimum distance between retained spots.
    #[serde(default = "default_separation")]
    pub separation: f32,

    /// Peaks must exceed this percentile of the positive voxels.
    #[serde(default = "default_percentile")]
    pub percentile: f32,

    /// Find maxima across z jointly instead of plane by plane.
    #[serde(default = "default_true")]
    pub is_volume: bool,

    /// Centre-of-mass refinement iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default = "default_reference")]
    pub reference: SpotReference,
}

fn default_spot_diameter() -> usize {
    3
}

fn default_min_mass() -> f32 {
    0.1
}

fn default_max_radius() -> f32 {
    3.0
}

fn default_separation() -> f32 {
    5.0
}

fn default_percentile() -> f32 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> usize {
    10
}

fn default_reference() -> SpotReference {
    SpotReference::MaxProjection
}

impl Default for SpotFinderConfig {
    fn default() -> Self {
        Self {
            spot_diameter: default_spot_diameter(),
            min_mass: default_min_mass(),
            max_radius: default_max_radius(),
            separation: default_separation(),
            percentile: default_percentile(),
            is_volume: true,
            max_iterations: default_max_iterations(),
            reference: default_reference(),
        }
    }
}

impl SpotFinderConfig {
    pub fn validate(&self) -> Result<(), InvalidParameterError> {
        if self.spot_diameter == 0 || self.spot_diameter % 2 == 0 {
            return Err(InvalidParameterError::SpotDiameter(self.spot_diameter));
        }
        if !(self.min_mass.is_finite() && self.min_mass >= 0.0) {
            return Err(InvalidParameterError::MinMass(self.min_mass));
        }
        if !(self.max_radius.is_finite() && self.max_radius > 0.0) {
            return Err(InvalidParameterError::MaxRadius(self.max_radius));
        }
        if !(self.separation.is_finite() && self.separation > 0.0) {
            return Err(InvalidParameterError::Separation(self.separation));
        }
        if !(self.percentile.is_finite() && (0.0..=100.0).contains(&self.percentile)) {
            return Err(InvalidParameterError::Percentile(self.percentile));
        }
        if self.max_iterations == 0 {
            return Err(InvalidParameterError::MaxIterations);
        }
        Ok(())
    }

    /// Footprint radius in pixels.
    #[inline]
    pub fn radius(&self) -> usize {
        self.spot_diameter / 2
    }
}

/// How per-round maximum intensities are combined into a spot's total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Mean,
    Max,
}

/// Per-round max-channel decoding parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Spots must have a total intensity strictly above this.
    #[serde(default = "default_min_total_intensity")]
    pub min_total_intensity: f32,

    #[serde(default = "default_aggregation")]
    pub aggregation: Aggregation,
}

fn default_min_total_intensity() -> f32 {
    0.025
}

fn default_aggregation() -> Aggregation {
    Aggregation::Sum
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            min_total_intensity: default_min_total_intensity(),
            aggregation: default_aggregation(),
        }
    }
}

impl DecodeConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.min_total_intensity.is_finite() {
            Ok(())
        } else {
            Err(ConfigurationError::Negative {
                field: "decode.min_total_intensity",
                value: self.min_total_intensity,
            })
        }
    }
}

/// Runtime options shared by the filter chain and the spot finder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Worker threads for data-parallel stages; `None` uses the global pool.
    #[serde(default)]
    pub n_processes: Option<usize>,

    /// Log per-chunk progress at info level.
    #[serde(default)]
    pub verbose: bool,
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self.n_processes {
            Some(0) => Err(ConfigurationError::WorkerCount),
            _ => Ok(()),
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_filters")]
    pub filters: Vec<FilterStep>,

    #[serde(default)]
    pub spots: SpotFinderConfig,

    #[serde(default)]
    pub decode: DecodeConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filters: default_filters(),
            spots: SpotFinderConfig::default(),
            decode: DecodeConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every section; the first failure is returned.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        for step in &self.filters {
            step.validate()?;
        }
        self.spots.validate()?;
        self.decode.validate()?;
        self.execution.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_chain_order() {
        let config = PipelineConfig::default();
        let names: Vec<&str> = config.filters.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["clip", "bandpass", "low_pass", "clip"]);
        assert!(!config.filters[0].is_volume());
        assert!(config.filters[2].is_volume());
        assert!(config.filters[3].is_volume());
    }

    #[test]
    fn test_default_pipeline_config_validates() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.decode.min_total_intensity, 0.025);
        assert_eq!(config.spots.spot_diameter, 3);
        assert_eq!(config.spots.radius(), 1);
    }

    #[test]
    fn test_clip_percentile_range() {
        assert!(ClipConfig::new(50.0, 100.0, false).is_ok());
        assert_eq!(
            ClipConfig::new(60.0, 40.0, false),
            Err(ConfigurationError::PercentileRange {
                p_min: 60.0,
                p_max: 40.0
            })
        );
        assert!(ClipConfig::new(-1.0, 100.0, true).is_err());
        assert!(ClipConfig::new(0.0, 101.0, true).is_err());
    }

    #[test]
    fn test_bandpass_rejects_volume_and_bad_scales() {
        let mut config = BandpassConfig::default();
        config.is_volume = true;
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::VolumetricUnsupported { filter: "bandpass" })
        );
        assert!(BandpassConfig::new(8.0, 7, 0.0).is_err());
        assert!(BandpassConfig::new(0.0, 7, 0.0).is_err());
        assert!(BandpassConfig::new(0.5, 7, 0.0).is_ok());
    }

    #[test]
    fn test_low_pass_sigma_dimensionality() {
        let err = LowPassConfig::new(vec![1.0, 1.0], true).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::SigmaDimensionality {
                filter: "low_pass",
                is_volume: true,
                expected: 3,
                got: 2
            }
        );
        assert!(LowPassConfig::new(vec![1.0, 0.0, 0.0], false).is_err());
        assert!(LowPassConfig::new(vec![-1.0, 0.0], false).is_err());

        let planar = LowPassConfig::new(vec![2.0, 3.0], false).unwrap();
        assert_eq!(planar.sigma_zyx(), [0.0, 2.0, 3.0]);
    }

    #[test]
    fn test_spot_diameter_must_be_odd() {
        let mut config = SpotFinderConfig::default();
        config.spot_diameter = 4;
        assert_eq!(
            config.validate(),
            Err(InvalidParameterError::SpotDiameter(4))
        );
        config.spot_diameter = 0;
        assert_eq!(
            config.validate(),
            Err(InvalidParameterError::SpotDiameter(0))
        );
        config.spot_diameter = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let exec = ExecutionConfig {
            n_processes: Some(0),
            verbose: false,
        };
        assert_eq!(exec.validate(), Err(ConfigurationError::WorkerCount));
    }

    #[test]
    fn test_yaml_roundtrip_and_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        PipelineConfig::default().to_yaml(&path).unwrap();
        let loaded = PipelineConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded, PipelineConfig::default());

        let partial = "decode:\n  min_total_intensity: 0.5\nspots:\n  separation: 2.0\n";
        std::fs::write(&path, partial).unwrap();
        let loaded = PipelineConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.decode.min_total_intensity, 0.5);
        assert_eq!(loaded.spots.separation, 2.0);
        assert_eq!(loaded.filters.len(), 4);
    }

    #[test]
    fn test_yaml_filter_list() {
        let yaml = r#"
filters:
  - kind: clip
    p_min: 10
    p_max: 90
  - kind: low_pass
    sigma: [1.0, 1.0]
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.filters.len(), 2);
        assert!(config.validate().is_ok());
        match &config.filters[1] {
            FilterStep::LowPass(lp) => assert_eq!(lp.truncate, 4.0),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_invalid_yaml_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "spots:\n  spot_diameter: 4\n").unwrap();
        assert!(PipelineConfig::from_yaml(&path).is_err());
    }
}
