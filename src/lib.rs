//! Framehunt - Core Library
//!
//! Finds where reference still images appear inside a collection of videos.
//! A run is split into stages that hand JSON files to each other:
//!
//! 1. `search`: scan every frame of every video for every reference.
//! 2. `resolve`: re-read each detection and score it with every protocol.
//! 3. `dedup`: drop low scores and merge detections that are close in time.
//! 4. `export`: save the matched frames into a folder hierarchy.
//!
//! `estimate` reports how large an export would be without writing it.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub mod dedup;
pub mod error;
pub mod estimate;
pub mod export;
pub mod folders;
pub mod frame_source;
pub mod match_scorer;
pub mod resolve;
pub mod results;
pub mod search;
pub mod settings;
pub mod timecode;

pub use error::Error;
pub use settings::Settings;

use match_scorer::MatchScorer;
use results::{CLEANED_RESULTS_FILE, EXPORT_DIR, RAW_RESULTS_FILE, SCORED_RESULTS_FILE};

/// Application configuration structure.
#[derive(Debug)]
pub struct Config {
    /// Directory holding the input folders and every result file.
    pub base_dir: PathBuf,
    pub settings: Settings,
}

impl Config {
    fn path(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }
}

fn progress_bar(len: u64, message: &str) -> Result<ProgressBar> {
    let bar = if len > 0 {
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) [{elapsed_precise}<{eta}]")?
                .progress_chars("##-"),
        );
        bar
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner().template("{spinner:.green} {msg}... [{elapsed_precise}] {pos} processed")?,
        );
        bar
    };
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

/// Scans the comparing folder for the originals and writes `results.json`.
pub fn run_search(config: &Config) -> Result<()> {
    info!("Initializing search with config: {:?}", config);
    let settings = &config.settings;

    let originals_dir = config.path(&settings.originals_folder);
    let comparing_dir = config.path(&settings.comparing_folder);
    fs::create_dir_all(&originals_dir).context("Failed to create originals directory")?;
    fs::create_dir_all(&comparing_dir).context("Failed to create comparing directory")?;

    let originals = folders::walk_files(&originals_dir);
    let comparing = folders::walk_files(&comparing_dir);
    info!("Found {} originals files", originals.len());
    info!("Found {} comparing files", comparing.len());

    let protocols = settings.protocols();
    if protocols.is_empty() {
        warn!("No protocol is enabled; nothing can match.");
    }

    let engine = search::SearchEngine::new(
        MatchScorer::new(),
        protocols,
        search::SearchOptions {
            workers: settings.workers,
            decode_concurrency: settings.decode_concurrency,
        },
    )?;

    let pb = progress_bar((originals.len() * comparing.len()) as u64, "Searching")?;
    let outcome = engine.run(&originals, &comparing, &pb);
    pb.finish_with_message(format!("Found {} matches", outcome.records.len()));

    let output = config.path(RAW_RESULTS_FILE);
    results::save_raw(&outcome.records, &output).context("Failed to write search results")?;
    info!("Done! Results saved to {:?}", output);
    Ok(())
}

/// Scores every raw detection and writes `parsed_results.json`.
pub fn run_resolve(config: &Config) -> Result<()> {
    let input = config.path(RAW_RESULTS_FILE);
    info!("Results file: {:?}", input);
    if !input.exists() {
        return Err(Error::MissingFile(input).into());
    }
    let records = results::load_raw(&input).context("Failed to read search results")?;
    info!("Found {} results", records.len());

    let settings = &config.settings;
    let resolver = resolve::Resolver::new(
        MatchScorer::new(),
        settings.protocols(),
        resolve::PathAnchors {
            base: config.base_dir.clone(),
            originals: settings.originals_folder.clone(),
            comparing: settings.comparing_folder.clone(),
        },
        settings.decode_concurrency,
    )?;

    let pb = progress_bar(records.len() as u64, "Processing results")?;
    let (scored, _) = resolver.run(records, &pb);
    pb.finish_with_message("Results scored");

    let output = config.path(SCORED_RESULTS_FILE);
    results::save_scored(&scored, &output).context("Failed to write scored results")?;
    info!("Done! Scored results saved to {:?}", output);
    Ok(())
}

/// Cleans `parsed_results.json` into `results.cleaned.json`.
pub fn run_dedup(config: &Config) -> Result<()> {
    let input = config.path(SCORED_RESULTS_FILE);
    let output = config.path(CLEANED_RESULTS_FILE);
    info!("Results file: {:?}", input);
    info!("Output: {:?}", output);

    let scored = results::load_scored(&input).context("Failed to read scored results")?;
    let dedup = dedup::Deduplicator::new(
        config.settings.dedup.min_score,
        Duration::from_millis(config.settings.dedup.window_ms),
    );
    let (cleaned, _) = dedup.run(scored.into_values().flatten().collect());

    let cleaned = results::group_by_score_protocol(cleaned);
    results::save_scored(&cleaned, &output).context("Failed to write cleaned results")?;
    info!("Dist: {:?}", output);
    Ok(())
}

/// Saves the frame behind every cleaned match under `dist/`.
pub fn run_export(config: &Config) -> Result<()> {
    let settings = &config.settings.export;
    let exporter = export::Exporter::new(
        &config.path(EXPORT_DIR),
        settings.min_score,
        settings.layout,
        config.settings.decode_concurrency,
    )?;

    let input = config.path(CLEANED_RESULTS_FILE);
    info!("Results file: {:?}", input);
    let cleaned = results::load_scored(&input).context("Failed to read cleaned results")?;
    let records: Vec<_> = cleaned.into_values().flatten().collect();

    let pb = progress_bar(records.len() as u64, "Saving matched frames")?;
    exporter.run(&records, &pb).context("Failed to export frames")?;
    pb.finish_with_message("Frames saved");
    Ok(())
}

/// Estimates the size of an export from `parsed_results.json`.
pub fn run_estimate(config: &Config) -> Result<()> {
    let input = config.path(SCORED_RESULTS_FILE);
    let scored = results::load_scored(&input).context("Failed to read scored results")?;
    let records: Vec<_> = scored.into_values().flatten().collect();

    let settings = &config.settings.estimate;
    let pb = progress_bar(records.len() as u64, "Estimating result size")?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(estimate::estimate_size(
        records,
        settings.min_score,
        settings.concurrency,
        settings.timeout(),
        pb.clone(),
    ));
    pb.finish_with_message("Estimate complete");
    Ok(())
}
