//! Search Module
//!
//! Scans every frame of every candidate video for every reference image.
//! References are split into shards that run in parallel, each against the
//! full video list; the decode and scoring work of all shards shares one
//! bounded thread pool.

use indicatif::ProgressBar;
use log::{debug, info, warn};
use image::RgbImage;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::frame_source::FrameSource;
use crate::match_scorer::{MatchScorer, ProtocolSet, ReferenceImage};
use crate::results::MatchRecord;
use crate::timecode::Timecode;

/// Splits `items` into `workers` contiguous shards of near-equal size.
///
/// The last shard also takes the remainder, so sizes differ by at most
/// `items.len() % workers`. More workers than items yields one shard per item.
pub fn partition_shards<T>(items: &[T], workers: usize) -> Vec<&[T]> {
    if items.is_empty() || workers == 0 {
        return Vec::new();
    }
    let count = workers.min(items.len());
    let size = items.len() / count;
    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == count { items.len() } else { start + size };
            &items[start..end]
        })
        .collect()
}

/// Cooperative stop flag, honored between videos.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub workers: usize,
    pub decode_concurrency: usize,
}

/// Counters for one shard, or summed over all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub pairs_scanned: usize,
    pub pairs_failed: usize,
    pub references_skipped: usize,
    pub frames_scored: u64,
    pub scoring_failures: u64,
    pub events: usize,
    pub cancelled: bool,
}

impl SearchStats {
    fn merge(&mut self, other: &SearchStats) {
        self.pairs_scanned += other.pairs_scanned;
        self.pairs_failed += other.pairs_failed;
        self.references_skipped += other.references_skipped;
        self.frames_scored += other.frames_scored;
        self.scoring_failures += other.scoring_failures;
        self.events += other.events;
        self.cancelled |= other.cancelled;
    }
}

/// Everything one shard produced.
#[derive(Debug, Clone, Default)]
pub struct ShardOutput {
    pub shard_id: usize,
    pub events: Vec<MatchRecord>,
    pub stats: SearchStats,
}

/// Aggregated result of a full search.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub records: Vec<MatchRecord>,
    pub stats: SearchStats,
    pub collapsed: usize,
}

/// Merges shard outputs once every shard has finished.
///
/// Only exact repeats are dropped: events for the same reference and video
/// at the same timecode, as produced when several protocols pass on one
/// frame. The first one encountered survives. Collapsing nearby events is
/// left to the scored deduplication pass.
pub fn aggregate(outputs: Vec<ShardOutput>) -> SearchOutcome {
    let mut stats = SearchStats::default();
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    let mut collapsed = 0;
    for output in outputs {
        stats.merge(&output.stats);
        for event in output.events {
            let key = (event.reference_name(), event.video_name(), event.time);
            if seen.insert(key) {
                records.push(event);
            } else {
                collapsed += 1;
            }
        }
    }

    SearchOutcome { records, stats, collapsed }
}

struct PairScan {
    events: Vec<MatchRecord>,
    frames: u64,
    scoring_failures: u64,
}

pub struct SearchEngine {
    scorer: MatchScorer,
    protocols: ProtocolSet,
    options: SearchOptions,
    shard_pool: ThreadPool,
    decode_pool: ThreadPool,
    cancel: CancelToken,
}

impl SearchEngine {
    pub fn new(scorer: MatchScorer, protocols: ProtocolSet, options: SearchOptions) -> Result<Self> {
        if options.workers == 0 || options.decode_concurrency == 0 {
            return Err(Error::Config("workers and decode concurrency must be at least 1".to_string()));
        }
        let shard_pool = ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|i| format!("shard-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to build shard pool: {e}")))?;
        let decode_pool = ThreadPoolBuilder::new()
            .num_threads(options.decode_concurrency)
            .thread_name(|i| format!("decode-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to build decode pool: {e}")))?;

        Ok(SearchEngine {
            scorer,
            protocols,
            options,
            shard_pool,
            decode_pool,
            cancel: CancelToken::new(),
        })
    }

    /// A handle that stops the search before the next video of every shard.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Searches every video for every reference and aggregates the events.
    ///
    /// `progress` advances once per (reference, video) pair.
    pub fn run(&self, references: &[PathBuf], videos: &[PathBuf], progress: &ProgressBar) -> SearchOutcome {
        let started = Instant::now();
        let shards = partition_shards(references, self.options.workers);
        info!(
            target: "search",
            "Searching {} references in {} videos across {} shards ({} concurrent decodes)",
            references.len(),
            videos.len(),
            shards.len(),
            self.options.decode_concurrency
        );

        let outputs: Vec<ShardOutput> = self.shard_pool.install(|| {
            shards
                .par_iter()
                .enumerate()
                .map(|(shard_id, shard)| self.run_shard(shard_id, shard, videos, progress))
                .collect()
        });

        let outcome = aggregate(outputs);
        info!(
            target: "search",
            "Search finished in {:.2?}: {} pairs scanned, {} failed, {} references skipped, {} events kept ({} collapsed)",
            started.elapsed(),
            outcome.stats.pairs_scanned,
            outcome.stats.pairs_failed,
            outcome.stats.references_skipped,
            outcome.records.len(),
            outcome.collapsed
        );
        outcome
    }

    /// Runs the full scan for one shard of references.
    pub fn run_shard(
        &self,
        shard_id: usize,
        references: &[PathBuf],
        videos: &[PathBuf],
        progress: &ProgressBar,
    ) -> ShardOutput {
        let mut output = ShardOutput { shard_id, ..ShardOutput::default() };

        for reference_path in references {
            if self.cancel.is_cancelled() {
                output.stats.cancelled = true;
                break;
            }
            debug!(target: "search", "[shard {}] Searching for {:?}", shard_id, reference_path);

            let reference = match self.scorer.load_reference(reference_path) {
                Ok(reference) => reference,
                Err(e) => {
                    warn!(target: "search", "[shard {}] Skipping reference {:?}: {}", shard_id, reference_path, e);
                    output.stats.references_skipped += 1;
                    progress.inc(videos.len() as u64);
                    continue;
                }
            };

            for video in videos {
                if self.cancel.is_cancelled() {
                    output.stats.cancelled = true;
                    break;
                }
                let scan = self.decode_pool.install(|| self.scan_pair(&reference, video, shard_id));
                match scan {
                    Ok(scan) => {
                        output.stats.pairs_scanned += 1;
                        output.stats.frames_scored += scan.frames;
                        output.stats.scoring_failures += scan.scoring_failures;
                        output.stats.events += scan.events.len();
                        output.events.extend(scan.events);
                    }
                    Err(e) => {
                        warn!(target: "search", "[shard {}] Skipping {:?}: {}", shard_id, video, e);
                        output.stats.pairs_failed += 1;
                    }
                }
                progress.inc(1);
            }
        }

        debug!(
            target: "search",
            "[shard {}] Done: {} pairs, {} events",
            shard_id, output.stats.pairs_scanned, output.stats.events
        );
        output
    }

    /// Opens one video and scores it against one reference.
    fn scan_pair(&self, reference: &ReferenceImage, video: &Path, shard_id: usize) -> Result<PairScan> {
        let source = FrameSource::open(video)?;
        let fps = source.fps();
        debug!(
            target: "search",
            "[shard {}] Comparing {:?} ({} frames)",
            shard_id,
            video,
            source.frame_count()
        );
        self.scan_frames(reference, video, source.iterate(), fps, shard_id)
    }

    /// Scores every frame against one reference, one event per passing
    /// protocol. Every passing frame is reported; repeated appearances are
    /// collapsed later, never here. A frame that fails to decode discards
    /// the whole scan.
    fn scan_frames(
        &self,
        reference: &ReferenceImage,
        video: &Path,
        frames: impl Iterator<Item = Result<(u64, RgbImage)>>,
        fps: f64,
        shard_id: usize,
    ) -> Result<PairScan> {
        let mut scan = PairScan { events: Vec::new(), frames: 0, scoring_failures: 0 };
        let mut last_failure = None;
        for frame in frames {
            let (index, pixels) = frame?;
            scan.frames += 1;
            let time = Timecode::from_frame(index.saturating_sub(1), fps);

            for (protocol, outcome) in self.scorer.compare_all(reference, &pixels, &self.protocols) {
                match outcome {
                    Ok(judgment) if judgment.is_match => {
                        scan.events.push(MatchRecord::detected(&reference.path, video, protocol, time, shard_id));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        scan.scoring_failures += 1;
                        last_failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = last_failure {
            warn!(
                target: "search",
                "[shard {}] {} comparisons failed in {:?}, last error: {}",
                shard_id, scan.scoring_failures, video, e
            );
        }
        Ok(scan)
    }
}
