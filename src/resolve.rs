//! Resolve Module
//!
//! Re-scores raw search events: each event's frame is read back by timecode
//! and compared to its reference with every enabled protocol, yielding one
//! scored record per protocol that could be evaluated.

use indicatif::ProgressBar;
use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::folders::rebase_path;
use crate::frame_source::FrameSource;
use crate::match_scorer::{MatchScorer, ProtocolSet};
use crate::results::{MatchRecord, ScoredResults, group_by_score_protocol};

/// Where recorded paths are re-rooted when they do not exist locally.
#[derive(Debug, Clone)]
pub struct PathAnchors {
    pub base: PathBuf,
    pub originals: String,
    pub comparing: String,
}

impl PathAnchors {
    fn locate(&self, path: &Path, anchor: &str) -> Result<PathBuf> {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        rebase_path(anchor, path, &self.base)
            .filter(|rebased| rebased.exists())
            .ok_or_else(|| Error::MissingFile(path.to_path_buf()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub total: usize,
    pub already_scored: usize,
    pub scored: usize,
    pub missing: usize,
    pub failed: usize,
    pub protocol_failures: usize,
}

enum Resolution {
    Unchanged(MatchRecord),
    Scored { records: Vec<MatchRecord>, protocol_failures: usize },
    Missing,
    Failed,
}

pub struct Resolver {
    scorer: MatchScorer,
    protocols: ProtocolSet,
    anchors: PathAnchors,
    pool: ThreadPool,
}

impl Resolver {
    pub fn new(scorer: MatchScorer, protocols: ProtocolSet, anchors: PathAnchors, concurrency: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("resolve-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to build resolve pool: {e}")))?;
        Ok(Resolver { scorer, protocols, anchors, pool })
    }

    /// Scores every record, at most `concurrency` at a time, and groups the
    /// results by scoring protocol.
    pub fn run(&self, records: Vec<MatchRecord>, progress: &ProgressBar) -> (ScoredResults, ResolveStats) {
        let mut stats = ResolveStats { total: records.len(), ..ResolveStats::default() };

        let resolutions: Vec<Resolution> = self.pool.install(|| {
            records
                .into_par_iter()
                .map(|record| {
                    let resolution = self.resolve(record);
                    progress.inc(1);
                    resolution
                })
                .collect()
        });

        let mut scored = Vec::new();
        for resolution in resolutions {
            match resolution {
                Resolution::Unchanged(record) => {
                    stats.already_scored += 1;
                    scored.push(record);
                }
                Resolution::Scored { records, protocol_failures } => {
                    stats.scored += 1;
                    stats.protocol_failures += protocol_failures;
                    scored.extend(records);
                }
                Resolution::Missing => stats.missing += 1,
                Resolution::Failed => stats.failed += 1,
            }
        }

        info!(
            target: "resolve",
            "Resolved {} records: {} scored, {} already scored, {} missing, {} failed",
            stats.total, stats.scored, stats.already_scored, stats.missing, stats.failed
        );
        (group_by_score_protocol(scored), stats)
    }

    fn resolve(&self, record: MatchRecord) -> Resolution {
        if record.score.is_some() {
            return Resolution::Unchanged(record);
        }
        match self.score_record(&record) {
            Ok((records, protocol_failures)) => Resolution::Scored { records, protocol_failures },
            Err(Error::MissingFile(path)) => {
                debug!(target: "resolve", "Skipping record, {:?} not found", path);
                Resolution::Missing
            }
            Err(e) => {
                warn!(
                    target: "resolve",
                    "Failed to score {:?} at {}: {}",
                    record.found_path, record.time, e
                );
                Resolution::Failed
            }
        }
    }

    /// Reads the recorded frame back and scores it with each protocol.
    ///
    /// A protocol that fails is left out; the rest still produce records.
    pub fn score_record(&self, record: &MatchRecord) -> Result<(Vec<MatchRecord>, usize)> {
        let original_path = self.anchors.locate(&record.original_path, &self.anchors.originals)?;
        let found_path = self.anchors.locate(&record.found_path, &self.anchors.comparing)?;

        let (_, frame) = FrameSource::open(&found_path)?.frame_at(record.time)?;
        let reference = self.scorer.load_reference(&original_path)?;

        let mut scored = Vec::with_capacity(self.protocols.len());
        let mut failures = 0;
        for (protocol, outcome) in self.scorer.compare_all(&reference, &frame, &self.protocols) {
            match outcome {
                Ok(judgment) => scored.push(MatchRecord {
                    original_path: original_path.clone(),
                    found_path: found_path.clone(),
                    score: Some(judgment.score),
                    score_protocol: Some(protocol),
                    ..record.clone()
                }),
                Err(e) => {
                    warn!(target: "resolve", "No {} score for {:?} at {}: {}", protocol, found_path, record.time, e);
                    failures += 1;
                }
            }
        }
        Ok((scored, failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_scorer::{Protocol, ProtocolCheck};
    use crate::timecode::Timecode;

    fn resolver(base: &Path) -> Resolver {
        let anchors = PathAnchors {
            base: base.to_path_buf(),
            originals: "samples".to_string(),
            comparing: "anime".to_string(),
        };
        let protocols = ProtocolSet::new(vec![ProtocolCheck { protocol: Protocol::Template, threshold: 0.4 }]);
        Resolver::new(MatchScorer::new(), protocols, anchors, 2).unwrap()
    }

    fn raw(original: &str, found: &str) -> MatchRecord {
        MatchRecord::detected(
            Path::new(original),
            Path::new(found),
            Protocol::Template,
            Timecode::from_millis(2_500),
            0,
        )
    }

    #[test]
    fn already_scored_records_pass_through() {
        let mut record = raw("/x/samples/a.png", "/x/anime/e1.mkv");
        record.score = Some(0.66);
        record.score_protocol = Some(Protocol::Ssim);

        let (results, stats) = resolver(Path::new("/nowhere")).run(vec![record.clone()], &ProgressBar::hidden());
        assert_eq!(stats.already_scored, 1);
        assert_eq!(results[&Protocol::Ssim], vec![record]);
    }

    #[test]
    fn unresolvable_paths_are_skipped() {
        let records = vec![
            raw("/old/samples/a.png", "/old/anime/e1.mkv"),
            raw("/old/elsewhere/a.png", "/old/anime/e1.mkv"),
        ];
        let (results, stats) = resolver(Path::new("/nowhere")).run(records, &ProgressBar::hidden());
        assert!(results.is_empty());
        assert_eq!(stats.missing, 2);
        assert_eq!(stats.scored, 0);
    }

    #[test]
    fn locate_prefers_existing_then_rebased() {
        let base = std::env::temp_dir().join(format!("framehunt-resolve-{}", std::process::id()));
        std::fs::create_dir_all(base.join("samples")).unwrap();
        std::fs::write(base.join("samples/a.png"), b"x").unwrap();

        let anchors = PathAnchors {
            base: base.clone(),
            originals: "samples".to_string(),
            comparing: "anime".to_string(),
        };
        let rebased = anchors.locate(Path::new("/other/host/samples/a.png"), "samples").unwrap();
        assert_eq!(rebased, base.join("samples/a.png"));

        let direct = anchors.locate(&base.join("samples/a.png"), "samples").unwrap();
        assert_eq!(direct, base.join("samples/a.png"));

        assert!(matches!(
            anchors.locate(Path::new("/other/host/samples/b.png"), "samples"),
            Err(Error::MissingFile(_))
        ));

        std::fs::remove_dir_all(&base).unwrap();
    }
}
