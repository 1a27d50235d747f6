//! Filter chain over an [`ImageStack`].
//!
//! Each step splits the stack into independent chunks, one (round, ch, z)
//! plane for planar steps or one (round, ch) volume for volumetric steps,
//! filters the chunks in parallel with `rayon` and writes them back in a fixed
//! order. Results are identical for any worker count.
//!
//! # Example
//!
//! ```no_run
//! use smfish_pipeline::config::{ExecutionConfig, PipelineConfig};
//! use smfish_pipeline::core::ImageStack;
//! use smfish_pipeline::processors::filtering::FilterChain;
//!
//! let mut stack = ImageStack::zeros(1, 1, 1, 16, 16);
//! let chain = FilterChain::new(PipelineConfig::default().filters);
//! chain.apply_in_place(&mut stack, &ExecutionConfig::default()).unwrap();
//! ```

use ndarray::{s, Array3, Axis, Zip};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError};
use thiserror::Error;

use super::{build_pool, progress_level};
use crate::config::{
    BandpassConfig, ClipConfig, ConfigurationError, ExecutionConfig, FilterStep, LowPassConfig,
};
use crate::core::stack::ImageStack;
use crate::core::transforms::{gaussian_filter, percentiles, preserve_float_range, uniform_filter};

/// Errors raised by the filter chain. Nothing is mutated when one is returned.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("{step}: {source}")]
    Configuration {
        step: &'static str,
        #[source]
        source: ConfigurationError,
    },

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

impl FilterError {
    /// Name of the step (or "execution"/"input") that was rejected.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            FilterError::Configuration { step, .. } => Some(*step),
            FilterError::ThreadPool(_) => None,
        }
    }
}

/// Result type for filter operations.
pub type Result<T> = std::result::Result<T, FilterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Volume { round: usize, ch: usize },
    Plane { round: usize, ch: usize, z: usize },
}

fn chunks(stack: &ImageStack, is_volume: bool) -> Vec<Chunk> {
    let [rounds, chs, zplanes, _, _] = stack.shape();
    let mut out = Vec::new();
    for round in 0..rounds {
        for ch in 0..chs {
            if is_volume {
                out.push(Chunk::Volume { round, ch });
            } else {
                out.extend((0..zplanes).map(|z| Chunk::Plane { round, ch, z }));
            }
        }
    }
    out
}

fn extract(stack: &ImageStack, chunk: Chunk) -> Array3<f32> {
    match chunk {
        Chunk::Volume { round, ch } => stack.volume(round, ch).to_owned(),
        Chunk::Plane { round, ch, z } => stack
            .data()
            .slice(s![round, ch, z..z + 1, .., ..])
            .to_owned(),
    }
}

fn store(stack: &mut ImageStack, chunk: Chunk, data: &Array3<f32>) {
    match chunk {
        Chunk::Volume { round, ch } => stack.assign_volume(round, ch, data),
        Chunk::Plane { round, ch, z } => stack.assign_plane(round, ch, z, data.index_axis(Axis(0), 0)),
    }
}

fn clip(config: &ClipConfig, data: &mut Array3<f32>) {
    let values: Vec<f32> = data.iter().copied().collect();
    let Some(bounds) = percentiles(&values, &[config.p_min, config.p_max]) else {
        return;
    };
    let (v_min, v_max) = (bounds[0], bounds[1]);
    data.mapv_inplace(|v| v.clamp(v_min, v_max) - v_min);
}

fn bandpass(config: &BandpassConfig, data: &mut Array3<f32>) {
    let mut smoothed = data.clone();
    gaussian_filter(&mut smoothed, [0.0, config.lshort, config.lshort], config.truncate);

    let size = 2 * config.llong + 1;
    let mut background = data.clone();
    uniform_filter(&mut background, [1, size, size]);

    let threshold = config.threshold;
    Zip::from(data)
        .and(&smoothed)
        .and(&background)
        .for_each(|out, &s, &b| {
            let v = s - b;
            *out = if v < threshold { 0.0 } else { v };
        });
}

fn low_pass(config: &LowPassConfig, data: &mut Array3<f32>) {
    gaussian_filter(data, config.sigma_zyx(), config.truncate);
}

/// Filter one chunk in place, then clamp it back into [0, 1].
fn filter_chunk(step: &FilterStep, data: &mut Array3<f32>) {
    match step {
        FilterStep::Clip(c) => clip(c, data),
        FilterStep::Bandpass(c) => bandpass(c, data),
        FilterStep::LowPass(c) => low_pass(c, data),
    }
    preserve_float_range(data);
}

fn validate_inputs(steps: &[FilterStep], stack: &ImageStack, exec: &ExecutionConfig) -> Result<()> {
    exec.validate().map_err(|source| FilterError::Configuration {
        step: "execution",
        source,
    })?;
    if stack.is_empty() {
        return Err(FilterError::Configuration {
            step: "input",
            source: ConfigurationError::EmptyStack {
                shape: stack.shape(),
            },
        });
    }
    for step in steps {
        step.validate().map_err(|source| FilterError::Configuration {
            step: step.name(),
            source,
        })?;
    }
    Ok(())
}

fn run_step(step: &FilterStep, stack: &mut ImageStack, pool: Option<&ThreadPool>, verbose: bool) {
    let work = chunks(stack, step.is_volume());
    let level = progress_level(verbose);

    let filtered: Vec<(Chunk, Array3<f32>)> = {
        let source: &ImageStack = stack;
        let process = || {
            work.par_iter()
                .map(|&chunk| {
                    let mut data = extract(source, chunk);
                    filter_chunk(step, &mut data);
                    log::log!(level, "{}: filtered {:?}", step.name(), chunk);
                    (chunk, data)
                })
                .collect::<Vec<_>>()
        };
        match pool {
            Some(pool) => pool.install(process),
            None => process(),
        }
    };

    for (chunk, data) in &filtered {
        store(stack, *chunk, data);
    }
}

/// Apply a single step in place.
pub fn apply_step<'a>(
    step: &FilterStep,
    stack: &'a mut ImageStack,
    exec: &ExecutionConfig,
) -> Result<&'a mut ImageStack> {
    validate_inputs(std::slice::from_ref(step), stack, exec)?;
    let pool = build_pool(exec.n_processes)?;
    run_step(step, stack, pool.as_ref(), exec.verbose);
    Ok(stack)
}

/// Ordered sequence of filter steps.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterChain {
    steps: Vec<FilterStep>,
}

impl FilterChain {
    pub fn new(steps: Vec<FilterStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[FilterStep] {
        &self.steps
    }

    /// Check every step against `stack` without touching it.
    pub fn validate(&self, stack: &ImageStack, exec: &ExecutionConfig) -> Result<()> {
        validate_inputs(&self.steps, stack, exec)
    }

    /// Run all steps on `stack`, returning the same handle.
    ///
    /// All steps are validated and the worker pool is built before the first
    /// step runs, so an error leaves `stack` untouched.
    pub fn apply_in_place<'a>(
        &self,
        stack: &'a mut ImageStack,
        exec: &ExecutionConfig,
    ) -> Result<&'a mut ImageStack> {
        self.validate(stack, exec)?;
        let pool = build_pool(exec.n_processes)?;
        for (i, step) in self.steps.iter().enumerate() {
            log::debug!("filter step {}/{}: {}", i + 1, self.steps.len(), step.name());
            run_step(step, stack, pool.as_ref(), exec.verbose);
        }
        Ok(stack)
    }

    /// Run all steps on a copy of `stack`.
    pub fn apply(&self, stack: &ImageStack, exec: &ExecutionConfig) -> Result<ImageStack> {
        self.validate(stack, exec)?;
        let mut out = stack.clone();
        self.apply_in_place(&mut out, exec)?;
        Ok(out)
    }
}
