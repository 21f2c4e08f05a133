//!
//! Command-line front end for detector spectrum energy calibration.
#![allow(clippy::uninlined_format_args)]

use clap::{Parser, Subcommand, ValueEnum};

use rustcal_algorithms::{BinningMode, CurveFitConfig, HistogramConfig, PeakParametrization};
use rustcal_core::Isotope;
use rustcal_engine::{Calibrator, CalibratorConfig, LoadRequest};
use rustcal_io::ReadOutFileReader;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    RustcalIo(#[from] rustcal_io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] rustcal_engine::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown isotope `{0}` (expected e.g. Cs137, Co60, Eu152)")]
    UnknownIsotope(String),

    #[error("one or more input files failed to load")]
    LoadIncomplete,

    #[error("{failed} of {total} groups failed to calibrate")]
    Incomplete { failed: usize, total: usize },
}

/// Binning policy selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Binning {
    /// Fixed number of equal-width bins
    FixedBins,
    /// Fixed number of counts per (variable-width) bin
    CountsPerBin,
    /// Bayesian-blocks adaptive segmentation
    BayesianBlocks,
}

impl From<Binning> for BinningMode {
    fn from(value: Binning) -> Self {
        match value {
            Binning::FixedBins => BinningMode::FixedBinCount,
            Binning::CountsPerBin => BinningMode::FixedCountsPerBin,
            Binning::BayesianBlocks => BinningMode::BayesianBlocks,
        }
    }
}

/// Peak-shape model selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum PeakModel {
    /// Gaussian line shape
    Gaussian,
    /// Lorentzian line shape
    Lorentzian,
    /// Equal-weight Gaussian/Lorentzian mixture
    PseudoVoigt,
}

impl From<PeakModel> for PeakParametrization {
    fn from(value: PeakModel) -> Self {
        match value {
            PeakModel::Gaussian => PeakParametrization::Gaussian,
            PeakModel::Lorentzian => PeakParametrization::Lorentzian,
            PeakModel::PseudoVoigt => PeakParametrization::PseudoVoigt,
        }
    }
}

/// Multi-channel detector spectrum energy calibrator.
#[derive(Parser)]
#[command(name = "rustcal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate read-out files against expected isotope lines
    Calibrate {
        /// Input read-out file(s)
        #[arg(required = true)]
        input: Vec<PathBuf>,

        /// Output energy-calibration file
        #[arg(short, long)]
        output: PathBuf,

        /// Expected isotopes, comma separated (e.g. Cs137,Co60)
        #[arg(long, value_delimiter = ',', required = true)]
        isotopes: Vec<String>,

        /// Number of groups per collection the isotopes apply to
        #[arg(long, default_value = "1")]
        groups: usize,

        /// Lower histogram edge (channel units)
        #[arg(long, default_value = "0.0")]
        min: f64,

        /// Upper histogram edge (channel units)
        #[arg(long, default_value = "1024.0")]
        max: f64,

        /// Binning policy
        #[arg(long, value_enum, default_value = "fixed-bins")]
        binning: Binning,

        /// Binning parameter: bin count, counts per bin, or prior
        #[arg(long, default_value = "512.0")]
        binning_value: f64,

        /// Peak-shape model
        #[arg(long, value_enum, default_value = "gaussian")]
        peak_model: PeakModel,

        /// Maximum relative energy residual accepted by the curve fit
        #[arg(long, default_value = "0.02")]
        residual_tolerance: f64,

        /// Sigma-clipping threshold for spectral-point outliers
        #[arg(long)]
        outlier_sigma: Option<f64>,

        /// Worker threads (default: logical CPU count)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Log per-group fit diagnostics
        #[arg(long)]
        diagnostics: bool,

        /// Emit a JSON summary on stdout
        #[arg(long)]
        json: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show information about a read-out file
    Info {
        /// Input read-out file
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Calibrate {
            input,
            output,
            isotopes,
            groups,
            min,
            max,
            binning,
            binning_value,
            peak_model,
            residual_tolerance,
            outlier_sigma,
            threads,
            diagnostics,
            json,
            verbose,
        } => {
            init_logging(verbose);

            let resolved = resolve_isotopes(&isotopes)?;
            let per_group: Vec<Vec<Isotope>> = vec![resolved; groups.max(1)];

            let config = CalibratorConfig {
                histogram: HistogramConfig {
                    min,
                    max,
                    mode: binning.into(),
                    mode_value: binning_value,
                },
                parametrization: peak_model.into(),
                curve: CurveFitConfig {
                    residual_tolerance,
                    outlier_sigma,
                    ..CurveFitConfig::default()
                },
                worker_threads: threads,
            };

            if verbose {
                eprintln!("Calibrating {} file(s)...", input.len());
                eprintln!("Binning: {:?} ({})", binning, binning_value);
                eprintln!("Peak model: {}", config.parametrization);
                eprintln!("Workers: {}", config.resolve_worker_count());
            }

            let requests: Vec<LoadRequest> = input
                .iter()
                .map(|path| LoadRequest::new(path.clone(), per_group.clone()))
                .collect();

            let mut calibrator = Calibrator::new(config);

            let start = Instant::now();
            let loaded = calibrator.load(&requests)?;
            if !loaded {
                for outcome in calibrator.load_outcomes() {
                    if let Some(error) = &outcome.error {
                        eprintln!("load failed: {}: {}", outcome.path.display(), error);
                    }
                }
            }

            let calibrated = calibrator.calibrate_all(diagnostics)?;
            calibrator.save(&output)?;

            if verbose {
                eprintln!("Done in {:.2?}", start.elapsed());
            }
            eprint!("{}", calibrator);

            let (total, failed) = group_totals(&calibrator);
            if json {
                let summary = serde_json::json!({
                    "files": input.len(),
                    "collections": calibrator.number_of_collections(),
                    "groups": total,
                    "failed_groups": failed,
                    "output": output,
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }

            if !loaded {
                return Err(CliError::LoadIncomplete);
            }
            if !calibrated {
                return Err(CliError::Incomplete { failed, total });
            }
            Ok(())
        }

        Commands::Info { input } => {
            init_logging(false);
            let reader = ReadOutFileReader::open(&input, &[])?;
            let store = reader.read_store()?;

            println!("file: {}", input.display());
            println!("collections: {}", store.number_of_collections());
            println!("groups: {}", store.number_of_groups());
            for (index, collection) in store.collections().enumerate() {
                let samples: usize = collection.groups().map(|g| g.len()).sum();
                println!(
                    "  collection {index}: channel {} with {} samples in {} group(s)",
                    collection.channel_id(),
                    samples,
                    collection.number_of_groups()
                );
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn resolve_isotopes(names: &[String]) -> Result<Vec<Isotope>> {
    names
        .iter()
        .map(|name| {
            Isotope::from_name(name).ok_or_else(|| CliError::UnknownIsotope(name.clone()))
        })
        .collect()
}

/// Counts `(total, failed)` groups over all calibrated collections.
fn group_totals(calibrator: &Calibrator) -> (usize, usize) {
    let mut total = 0;
    let mut failed = 0;
    for index in 0..calibrator.number_of_collections() {
        if let Ok(outcome) = calibrator.calibration(index) {
            total += outcome.groups().len();
            failed += outcome
                .groups()
                .iter()
                .filter(|group| !group.is_calibrated())
                .count();
        }
    }
    (total, failed)
}
