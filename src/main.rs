//! Framehunt - Main Application Entrypoint
//!
//! This file is responsible for parsing command-line arguments, initializing
//! the application environment (like logging), and dispatching the stage
//! that was asked for.

use clap::{Parser, Subcommand};
use framehunt::{Config, Settings};
use log::{error, info};
use std::path::PathBuf;

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

/// A command-line tool that finds where reference still images appear inside a collection of videos.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    stage: Stage,

    /// Directory holding the originals and comparing folders and every result file
    #[arg(short, long, global = true, default_value = ".")]
    base: PathBuf,

    /// JSON settings file; missing fields keep their defaults
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Logging verbosity level
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
enum Stage {
    /// Scan every video for every reference image and write results.json
    Search {
        /// Number of search shards (overrides settings)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Maximum number of videos decoded at once (overrides settings)
        #[arg(long)]
        decode_concurrency: Option<usize>,
    },
    /// Score every detection with each enabled protocol and write parsed_results.json
    Resolve,
    /// Drop low scores and merge nearby duplicates into results.cleaned.json
    Dedup {
        /// Minimum score to keep (overrides settings)
        #[arg(long)]
        min_score: Option<f64>,
        /// Merge window in milliseconds (overrides settings)
        #[arg(long)]
        window_ms: Option<u64>,
    },
    /// Save the matched frames into dist/
    Export {
        #[arg(long, value_enum)]
        layout: Option<framehunt::settings::ExportLayout>,
    },
    /// Estimate how much disk an export would use
    Estimate,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let args = Args::parse();

    // 1. Initialize Logger
    let log_level = match args.log_level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("Starting Framehunt...");

    // 2. Load settings and apply command-line overrides
    let mut settings = match &args.settings {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Could not load settings: {}", e);
                std::process::exit(1);
            }
        },
        None => Settings::default(),
    };
    match &args.stage {
        Stage::Search { workers, decode_concurrency } => {
            if let Some(workers) = workers {
                settings.workers = *workers;
            }
            if let Some(limit) = decode_concurrency {
                settings.decode_concurrency = *limit;
            }
        }
        Stage::Dedup { min_score, window_ms } => {
            if let Some(min_score) = min_score {
                settings.dedup.min_score = *min_score;
            }
            if let Some(window_ms) = window_ms {
                settings.dedup.window_ms = *window_ms;
            }
        }
        Stage::Export { layout: Some(layout) } => settings.export.layout = *layout,
        _ => {}
    }
    if let Err(e) = settings.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    if !args.base.is_dir() {
        error!("Base directory does not exist: {:?}", args.base);
        std::process::exit(1);
    }

    // 3. Create a configuration object from arguments
    let config = Config {
        base_dir: args.base,
        settings,
    };

    // 4. Run the requested stage
    let result = match args.stage {
        Stage::Search { .. } => framehunt::run_search(&config),
        Stage::Resolve => framehunt::run_resolve(&config),
        Stage::Dedup { .. } => framehunt::run_dedup(&config),
        Stage::Export { .. } => framehunt::run_export(&config),
        Stage::Estimate => framehunt::run_estimate(&config),
    };

    if let Err(e) = result {
        error!("Application failed: {:#}", e);
        let fatal = e.downcast_ref::<framehunt::Error>().is_some_and(framehunt::Error::is_fatal);
        std::process::exit(if fatal { 1 } else { 2 });
    }

    info!("Processing completed successfully.");
}
