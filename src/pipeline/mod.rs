//! End-to-end pipeline for one field of view.
//!
//! Filter chain, spot finding and decoding run in sequence over a single
//! exclusively borrowed [`ImageStack`]. Every stage's parameters, and the
//! codebook's compatibility with the stack, are checked before the first
//! stage mutates anything.

use std::path::Path;

use rayon::ThreadPoolBuildError;
use thiserror::Error;

use crate::config::{ConfigurationError, FilterStep, InvalidParameterError, PipelineConfig};
use crate::core::codebook::Codebook;
use crate::core::loaders::{load_fov, LoaderError};
use crate::core::stack::ImageStack;
use crate::processors::decoding::{decode_and_filter, DecodedResult};
use crate::processors::filtering::{FilterChain, FilterError};
use crate::processors::spots::{find_spots, SpotFinderError, SpotTable};

pub const STAGE_SPOT_FINDING: &str = "spot_finding";
pub const STAGE_DECODING: &str = "decoding";

/// A failed pipeline run, tagged with the stage and its parameters.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{stage}: configuration error: {source} (params: {params})")]
    Configuration {
        stage: String,
        params: String,
        #[source]
        source: ConfigurationError,
    },

    #[error("{stage}: invalid parameter: {source} (params: {params})")]
    InvalidParameter {
        stage: String,
        params: String,
        #[source]
        source: InvalidParameterError,
    },

    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error("{stage}: failed to build worker pool: {source}")]
    ThreadPool {
        stage: String,
        #[source]
        source: ThreadPoolBuildError,
    },
}

impl PipelineError {
    /// Stage that failed; `None` for load errors.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::Configuration { stage, .. }
            | PipelineError::InvalidParameter { stage, .. }
            | PipelineError::ThreadPool { stage, .. } => Some(stage.as_str()),
            PipelineError::Load(_) => None,
        }
    }
}

/// Result type for pipeline runs.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Spot table before decoding and the thresholded decoded result.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub spots: SpotTable,
    pub decoded: DecodedResult,
}

fn filter_stage(name: &str) -> String {
    format!("filter:{}", name)
}

fn filter_error(err: FilterError, config: &PipelineConfig) -> PipelineError {
    match err {
        FilterError::Configuration { step, source } => {
            let params = config
                .filters
                .iter()
                .find(|s| s.name() == step)
                .map(|s| format!("{:?}", s))
                .unwrap_or_else(|| format!("{:?}", config.execution));
            PipelineError::Configuration {
                stage: filter_stage(step),
                params,
                source,
            }
        }
        FilterError::ThreadPool(source) => PipelineError::ThreadPool {
            stage: "filter".to_string(),
            source,
        },
    }
}

fn spot_error(err: SpotFinderError, config: &PipelineConfig) -> PipelineError {
    let stage = STAGE_SPOT_FINDING.to_string();
    let params = format!("{:?}", config.spots);
    match err {
        SpotFinderError::InvalidParameter(source) => PipelineError::InvalidParameter {
            stage,
            params,
            source,
        },
        SpotFinderError::Configuration(source) => PipelineError::Configuration {
            stage,
            params,
            source,
        },
        SpotFinderError::ThreadPool(source) => PipelineError::ThreadPool { stage, source },
    }
}

fn decode_error(source: ConfigurationError, config: &PipelineConfig) -> PipelineError {
    PipelineError::Configuration {
        stage: STAGE_DECODING.to_string(),
        params: format!("{:?}", config.decode),
        source,
    }
}

/// Check `config` and `codebook` against `stack` without running anything.
pub fn validate(stack: &ImageStack, codebook: &Codebook, config: &PipelineConfig) -> Result<()> {
    let chain = FilterChain::new(config.filters.clone());
    chain
        .validate(stack, &config.execution)
        .map_err(|e| filter_error(e, config))?;

    config.spots.validate().map_err(|source| PipelineError::InvalidParameter {
        stage: STAGE_SPOT_FINDING.to_string(),
        params: format!("{:?}", config.spots),
        source,
    })?;

    config.decode.validate().map_err(|e| decode_error(e, config))?;
    if stack.num_rounds() != codebook.num_rounds() || stack.num_chs() != codebook.num_chs() {
        return Err(decode_error(
            ConfigurationError::CodebookMismatch {
                codebook_rounds: codebook.num_rounds(),
                codebook_chs: codebook.num_chs(),
                data_rounds: stack.num_rounds(),
                data_chs: stack.num_chs(),
            },
            config,
        ));
    }
    Ok(())
}

/// Run only the filter chain on `stack`.
pub fn run_filters<'a>(stack: &'a mut ImageStack, config: &PipelineConfig) -> Result<&'a mut ImageStack> {
    FilterChain::new(config.filters.clone())
        .apply_in_place(stack, &config.execution)
        .map_err(|e| filter_error(e, config))
}

/// Run only the spot finder on an already filtered `stack`.
pub fn run_spot_finding(stack: &ImageStack, config: &PipelineConfig) -> Result<SpotTable> {
    find_spots(stack, &config.spots, &config.execution).map_err(|e| spot_error(e, config))
}

/// Filter `stack` in place, find spots and decode them against `codebook`.
///
/// On error, `stack` is left untouched unless the error comes from a stage
/// after filtering, which can only be a worker pool failure.
pub fn run_fov(stack: &mut ImageStack, codebook: &Codebook, config: &PipelineConfig) -> Result<PipelineOutput> {
    validate(stack, codebook, config)?;

    let steps: Vec<&str> = config.filters.iter().map(FilterStep::name).collect();
    log::info!("Filtering {:?} with {:?}", stack.shape(), steps);
    run_filters(stack, config)?;

    let spots = run_spot_finding(stack, config)?;

    let decoded = decode_and_filter(&spots, codebook, &config.decode)
        .map_err(|e| decode_error(e, config))?;

    Ok(PipelineOutput { spots, decoded })
}

/// Load `fov_name` from `experiment_dir` and run the full pipeline on it.
pub fn run_experiment(experiment_dir: &Path, fov_name: &str, config: &PipelineConfig) -> Result<PipelineOutput> {
    let mut fov = load_fov(experiment_dir, fov_name)?;
    run_fov(&mut fov.stack, &fov.codebook, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, LowPassConfig, SpotFinderConfig};
    use crate::core::synthetic::{synthetic_fov, SyntheticParams, SyntheticSpot};
    use crate::core::writers::{write_codebook, write_stack_tiles};
    use tempfile::tempdir;

    fn single_g1_spot() -> SyntheticParams {
        SyntheticParams {
            spots: vec![SyntheticSpot {
                position: [2.0, 16.0, 16.0],
                code: vec![0, 1, 0],
            }],
            ..SyntheticParams::default()
        }
    }

    #[test]
    fn test_single_spot_decodes_to_g1() {
        let (mut stack, codebook) = synthetic_fov(&single_g1_spot()).unwrap();
        let output = run_fov(&mut stack, &codebook, &PipelineConfig::default()).unwrap();

        assert_eq!(output.decoded.len(), 1);
        let decoded = &output.decoded.spots[0];
        assert_eq!(decoded.target.as_deref(), Some("G1"));
        assert_eq!(decoded.code, vec![0, 1, 0]);
        assert!(decoded.passes_threshold);
        let spot = &decoded.spot;
        assert!((spot.z - 2.0).abs() <= 1.0);
        assert!((spot.y - 16.0).abs() <= 1.0);
        assert!((spot.x - 16.0).abs() <= 1.0);
    }

    #[test]
    fn test_all_zero_volume_decodes_nothing() {
        let params = SyntheticParams::default();
        let (mut stack, codebook) = synthetic_fov(&params).unwrap();
        let output = run_fov(&mut stack, &codebook, &PipelineConfig::default()).unwrap();
        assert!(output.spots.is_empty());
        assert!(output.decoded.is_empty());
        assert_eq!(output.decoded.round_labels, vec![0, 1, 2]);
    }

    #[test]
    fn test_worker_count_does_not_change_result() {
        let params = SyntheticParams::random(3, 6, 4);
        let (stack, codebook) = synthetic_fov(&params).unwrap();

        let mut config = PipelineConfig::default();
        config.execution = ExecutionConfig {
            n_processes: Some(1),
            verbose: true,
        };
        let mut a = stack.clone();
        let out_a = run_fov(&mut a, &codebook, &config).unwrap();

        config.execution.n_processes = Some(4);
        let mut b = stack.clone();
        let out_b = run_fov(&mut b, &codebook, &config).unwrap();

        assert_eq!(a, b);
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn test_errors_carry_stage_and_leave_stack_untouched() {
        let (stack, codebook) = synthetic_fov(&single_g1_spot()).unwrap();

        let mut config = PipelineConfig::default();
        config.spots = SpotFinderConfig {
            spot_diameter: 4,
            ..SpotFinderConfig::default()
        };
        let mut work = stack.clone();
        let err = run_fov(&mut work, &codebook, &config).unwrap_err();
        assert_eq!(err.stage(), Some("spot_finding"));
        assert!(matches!(err, PipelineError::InvalidParameter { .. }));
        assert!(err.to_string().contains("spot_diameter: 4"));
        assert_eq!(work, stack);

        let mut config = PipelineConfig::default();
        config.filters[2] = FilterStep::LowPass(LowPassConfig {
            sigma: vec![1.0, 0.0],
            is_volume: true,
            truncate: 4.0,
        });
        let err = run_fov(&mut work, &codebook, &config).unwrap_err();
        assert_eq!(err.stage(), Some("filter:low_pass"));
        assert_eq!(work, stack);
    }

    #[test]
    fn test_codebook_mismatch_rejected_before_filtering() {
        let (stack, _) = synthetic_fov(&single_g1_spot()).unwrap();
        let params = SyntheticParams {
            num_chs: 3,
            ..SyntheticParams::default()
        };
        let (_, wider_codebook) = synthetic_fov(&params).unwrap();

        let mut work = stack.clone();
        let err = run_fov(&mut work, &wider_codebook, &PipelineConfig::default()).unwrap_err();
        assert_eq!(err.stage(), Some("decoding"));
        assert!(matches!(
            err,
            PipelineError::Configuration {
                source: ConfigurationError::CodebookMismatch { .. },
                ..
            }
        ));
        assert_eq!(work, stack);
    }

    #[test]
    fn test_run_experiment_from_disk() {
        let dir = tempdir().unwrap();
        let (stack, codebook) = synthetic_fov(&single_g1_spot()).unwrap();
        write_codebook(dir.path(), &codebook).unwrap();
        write_stack_tiles(&dir.path().join("fov_000"), &stack).unwrap();

        let output = run_experiment(dir.path(), "fov_000", &PipelineConfig::default()).unwrap();
        assert_eq!(output.decoded.len(), 1);
        assert_eq!(output.decoded.spots[0].target.as_deref(), Some("G1"));

        let err = run_experiment(dir.path(), "missing", &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Load(_)));
        assert_eq!(err.stage(), None);
    }
}
