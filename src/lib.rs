//! smFISH spot detection and codebook decoding.
//!
//! This crate provides tools for:
//! - Loading 5-D (round, ch, z, y, x) image stacks and their codebooks
//! - Clip, bandpass and Gaussian low-pass filtering (parallelized)
//! - Locating spots and measuring their intensity in every round and channel
//! - Decoding spots by per-round max channel and filtering on total intensity
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use smfish_pipeline::{pipeline::run_experiment, PipelineConfig};
//!
//! let output = run_experiment(Path::new("experiment"), "fov_000", &PipelineConfig::default()).unwrap();
//! for (target, count) in output.decoded.target_counts() {
//!     println!("{}: {}", target, count);
//! }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod processors;

pub use config::{DecodeConfig, ExecutionConfig, FilterStep, PipelineConfig, SpotFinderConfig};
pub use core::codebook::Codebook;
pub use core::stack::ImageStack;
pub use pipeline::{run_fov, PipelineError, PipelineOutput};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
