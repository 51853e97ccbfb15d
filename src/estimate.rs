//! Estimate Module
//!
//! Best-effort guess of how much disk an export would take, by reading the
//! frame behind each record and counting its raw RGB bytes. Slow or broken
//! reads are skipped, never fatal.

use indicatif::ProgressBar;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::Result;
use crate::frame_source::FrameSource;
use crate::results::MatchRecord;
use crate::timecode::Timecode;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SizeEstimate {
    pub total_bytes: u64,
    pub counted: usize,
    pub skipped: usize,
}

impl SizeEstimate {
    pub fn megabytes(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }
}

fn frame_size(video: PathBuf, time: Timecode) -> Result<u64> {
    let (_, frame) = FrameSource::open(&video)?.frame_at(time)?;
    Ok(u64::from(frame.width()) * u64::from(frame.height()) * 3)
}

/// Reads one frame per qualifying record, `concurrency` at a time, giving
/// each read `timeout` before it is counted as skipped.
pub async fn estimate_size(
    records: Vec<MatchRecord>,
    min_score: f64,
    concurrency: usize,
    timeout: Duration,
    progress: ProgressBar,
) -> SizeEstimate {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for record in records {
        let semaphore = Arc::clone(&semaphore);
        let progress = progress.clone();
        tasks.spawn(async move {
            if record.score.is_none_or(|score| score < min_score) {
                progress.inc(1);
                return 0;
            }
            let Ok(_permit) = semaphore.acquire_owned().await else {
                progress.inc(1);
                return 0;
            };

            let (video, time) = (record.found_path.clone(), record.time);
            let read = tokio::task::spawn_blocking(move || frame_size(video, time));
            let size = match tokio::time::timeout(timeout, read).await {
                Ok(Ok(Ok(size))) => size,
                Ok(Ok(Err(e))) => {
                    warn!(target: "estimate", "Error on file {:?}: {}", record.found_path, e);
                    0
                }
                Ok(Err(e)) => {
                    warn!(target: "estimate", "Read task for {:?} failed: {}", record.found_path, e);
                    0
                }
                Err(_) => {
                    warn!(target: "estimate", "Timeout on file {:?} at {}", record.found_path, record.time);
                    0
                }
            };
            progress.inc(1);
            size
        });
    }

    let mut estimate = SizeEstimate::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(size) if size > 0 => {
                estimate.total_bytes += size;
                estimate.counted += 1;
            }
            _ => estimate.skipped += 1,
        }
    }

    info!(target: "estimate", "Total estimated files: {}", estimate.counted);
    info!(target: "estimate", "Skipped (score < {} or read error): {}", min_score, estimate.skipped);
    info!(target: "estimate", "Approx. total size: {:.2} MB", estimate.megabytes());
    estimate
}
