//! Command-line interface for the smFISH pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::core::loaders::{list_fovs, load_fov, load_stack};
use crate::core::synthetic::{synthetic_fov, SyntheticParams};
use crate::core::writers::{write_codebook, write_decoded_csv, write_spot_table_csv, write_stack_tiles};
use crate::pipeline;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "smfish-pipeline")]
#[command(about = "Spot detection and codebook decoding for smFISH image stacks", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter, find spots and decode one field of view
    Run {
        /// Experiment directory containing codebook.json and FOV folders
        experiment_dir: PathBuf,
        /// Field of view to process
        #[arg(short, long, default_value = "fov_000")]
        fov: String,
        /// Output CSV for decoded spots
        #[arg(short, long)]
        output: PathBuf,
        /// Optional CSV for all detected spots before decoding
        #[arg(long)]
        spots_output: Option<PathBuf>,
        /// Minimum total intensity (overrides config)
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Worker threads (overrides config)
        #[arg(short = 'j', long)]
        processes: Option<usize>,
    },

    /// Run only the filter chain and write the filtered tiles
    Filter {
        /// Experiment directory containing FOV folders
        experiment_dir: PathBuf,
        /// Field of view to process
        #[arg(short, long, default_value = "fov_000")]
        fov: String,
        /// Directory for the filtered PNG tiles
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Worker threads (overrides config)
        #[arg(short = 'j', long)]
        processes: Option<usize>,
    },

    /// Find spots in an already filtered field of view
    FindSpots {
        /// Experiment directory containing FOV folders
        experiment_dir: PathBuf,
        /// Field of view to process
        #[arg(short, long, default_value = "fov_000")]
        fov: String,
        /// Output CSV for the spot table
        #[arg(short, long)]
        output: PathBuf,
        /// Worker threads (overrides config)
        #[arg(short = 'j', long)]
        processes: Option<usize>,
    },

    /// Write a synthetic experiment with Gaussian spots
    Synth {
        /// Output experiment directory
        output_dir: PathBuf,
        /// Random seed
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Number of spots to inject
        #[arg(long, default_value_t = 20)]
        spots: usize,
        /// Number of codebook targets
        #[arg(long, default_value_t = 4)]
        targets: usize,
        /// Field of view name
        #[arg(short, long, default_value = "fov_000")]
        fov: String,
    },

    /// Print or save the effective configuration
    Config {
        /// Write YAML here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

fn apply_overrides(config: &mut PipelineConfig, threshold: Option<f32>, processes: Option<usize>) {
    if let Some(t) = threshold {
        config.decode.min_total_intensity = t;
    }
    if processes.is_some() {
        config.execution.n_processes = processes;
    }
}

/// Load and validate the YAML config at `path`, or the defaults when absent.
fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let config = PipelineConfig::from_yaml(path)
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    info!("Loaded config from: {}", path.display());
    Ok(config)
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    // Load config; a bad file ends the run
    let mut config = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };
    if cli.verbose >= 2 {
        config.execution.verbose = true;
    }

    // Dispatch to subcommands
    let result = match cli.command {
        Commands::Run { experiment_dir, fov, output, spots_output, threshold, processes } => {
            apply_overrides(&mut config, threshold, processes);
            cmd_run(&experiment_dir, &fov, &output, spots_output.as_deref(), &config)
        }
        Commands::Filter { experiment_dir, fov, output_dir, processes } => {
            apply_overrides(&mut config, None, processes);
            cmd_filter(&experiment_dir, &fov, &output_dir, &config)
        }
        Commands::FindSpots { experiment_dir, fov, output, processes } => {
            apply_overrides(&mut config, None, processes);
            cmd_find_spots(&experiment_dir, &fov, &output, &config)
        }
        Commands::Synth { output_dir, seed, spots, targets, fov } => {
            cmd_synth(&output_dir, seed, spots, targets, &fov)
        }
        Commands::Config { output } => cmd_config(output.as_deref(), &config),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn cmd_run(
    experiment_dir: &Path,
    fov_name: &str,
    output: &Path,
    spots_output: Option<&Path>,
    config: &PipelineConfig,
) -> Result<()> {
    let start = Instant::now();

    println!("Running pipeline...");
    println!("Experiment: {}", experiment_dir.display());
    println!("FOV: {}", fov_name);
    println!("Min total intensity: {}", config.decode.min_total_intensity);

    let spinner = create_spinner("Loading field of view...");
    let fov = load_fov(experiment_dir, fov_name);
    let mut fov = match fov {
        Ok(fov) => fov,
        Err(e) => {
            spinner.finish_and_clear();
            if let Ok(available) = list_fovs(experiment_dir) {
                warn!("Available FOVs: {:?}", available);
            }
            return Err(e).with_context(|| format!("failed to load FOV '{}'", fov_name));
        }
    };

    spinner.set_message("Filtering, finding spots and decoding...");
    let result = pipeline::run_fov(&mut fov.stack, &fov.codebook, config);
    spinner.finish_and_clear();
    let result = result.with_context(|| format!("pipeline failed on FOV '{}'", fov_name))?;

    write_decoded_csv(output, &result.decoded)
        .with_context(|| format!("failed to write {}", output.display()))?;
    if let Some(path) = spots_output {
        write_spot_table_csv(path, &result.spots)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    let targets = result.decoded.target_counts();
    let top: Vec<String> = targets.iter().take(5).map(|(t, n)| format!("{}={}", t, n)).collect();

    print_summary(
        "Pipeline Complete",
        &[
            ("FOV", fov.name.clone()),
            ("Shape", format!("{:?}", fov.stack.shape())),
            ("Spots found", result.spots.len().to_string()),
            ("Spots decoded", result.decoded.len().to_string()),
            ("Unassigned", result.decoded.unassigned().to_string()),
            ("Targets", targets.len().to_string()),
            ("Counts", top.join(", ")),
            ("Output CSV", output.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_filter(experiment_dir: &Path, fov_name: &str, output_dir: &Path, config: &PipelineConfig) -> Result<()> {
    let start = Instant::now();

    println!("Filtering field of view...");
    println!("Input: {}", experiment_dir.join(fov_name).display());
    println!("Output directory: {}", output_dir.display());

    let spinner = create_spinner("Loading tiles...");
    let loaded = load_stack(&experiment_dir.join(fov_name));
    let mut stack = match loaded {
        Ok(stack) => stack,
        Err(e) => {
            spinner.finish_and_clear();
            return Err(e).context("failed to load tiles");
        }
    };

    spinner.set_message("Applying filter chain...");
    let filtered = pipeline::run_filters(&mut stack, config).map(|_| ());
    spinner.finish_and_clear();
    filtered.context("filter chain failed")?;

    let written = write_stack_tiles(output_dir, &stack)
        .with_context(|| format!("failed to write tiles to {}", output_dir.display()))?;

    let steps: Vec<&str> = config.filters.iter().map(|s| s.name()).collect();
    print_summary(
        "Filtering Complete",
        &[
            ("Shape", format!("{:?}", stack.shape())),
            ("Steps", steps.join(" -> ")),
            ("Tiles written", written.len().to_string()),
            ("Output directory", output_dir.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_find_spots(experiment_dir: &Path, fov_name: &str, output: &Path, config: &PipelineConfig) -> Result<()> {
    let start = Instant::now();

    println!("Finding spots...");
    println!("Input: {}", experiment_dir.join(fov_name).display());
    println!("Output: {}", output.display());

    let spinner = create_spinner("Loading tiles...");
    let loaded = load_stack(&experiment_dir.join(fov_name));
    let stack = match loaded {
        Ok(stack) => stack,
        Err(e) => {
            spinner.finish_and_clear();
            return Err(e).context("failed to load tiles");
        }
    };

    spinner.set_message("Locating local maxima...");
    let table = pipeline::run_spot_finding(&stack, config);
    spinner.finish_and_clear();
    let table = table.context("spot finding failed")?;

    write_spot_table_csv(output, &table).with_context(|| format!("failed to write {}", output.display()))?;

    print_summary(
        "Spot Finding Complete",
        &[
            ("Shape", format!("{:?}", stack.shape())),
            ("Spots found", table.len().to_string()),
            ("Spot diameter", config.spots.spot_diameter.to_string()),
            ("Min mass", config.spots.min_mass.to_string()),
            ("Separation", config.spots.separation.to_string()),
            ("Output CSV", output.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_synth(output_dir: &Path, seed: u64, n_spots: usize, n_targets: usize, fov_name: &str) -> Result<()> {
    let start = Instant::now();

    let params = SyntheticParams::random(seed, n_spots, n_targets);
    let (stack, codebook) = synthetic_fov(&params).context("failed to render synthetic FOV")?;

    let codebook_path = write_codebook(output_dir, &codebook)
        .with_context(|| format!("failed to write codebook to {}", output_dir.display()))?;
    let fov_dir = output_dir.join(fov_name);
    let written = write_stack_tiles(&fov_dir, &stack)
        .with_context(|| format!("failed to write tiles to {}", fov_dir.display()))?;

    print_summary(
        "Synthetic Experiment Written",
        &[
            ("Codebook", codebook_path.display().to_string()),
            ("FOV directory", fov_dir.display().to_string()),
            ("Shape", format!("{:?}", stack.shape())),
            ("Spots", params.spots.len().to_string()),
            ("Targets", codebook.len().to_string()),
            ("Tiles", written.len().to_string()),
            ("Seed", seed.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_config(output: Option<&Path>, config: &PipelineConfig) -> Result<()> {
    match output {
        Some(path) => {
            config
                .to_yaml(path)
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            let yaml = serde_yaml::to_string(config).context("failed to serialize configuration")?;
            print!("{}", yaml);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_config_defaults_without_path() {
        assert_eq!(load_config(None).unwrap(), PipelineConfig::default());
    }

    #[test]
    fn test_load_config_rejects_invalid_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "spots:\n  spot_diameter: 4\n").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("bad.yaml"), "{}", message);
        assert!(message.contains("spot_diameter"), "{}", message);
    }

    #[test]
    fn test_load_config_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn test_load_config_reads_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("good.yaml");
        fs::write(&path, "decode:\n  min_total_intensity: 0.5\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.decode.min_total_intensity, 0.5);
        assert_eq!(config.spots, PipelineConfig::default().spots);
    }
}
