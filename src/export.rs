//! Export Module
//!
//! Writes the frame behind every cleaned match to a browsable folder
//! hierarchy of JPEG files.

use indicatif::ProgressBar;
use log::{info, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::frame_source::FrameSource;
use crate::results::MatchRecord;
use crate::settings::ExportLayout;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub total: usize,
    pub exported: usize,
    pub below_floor: usize,
    pub missing: usize,
    pub failed: usize,
}

enum Exported {
    Written,
    BelowFloor,
    Missing,
    Failed,
}

/// Score as a folder name, rounded to four decimals.
pub fn score_folder(score: f64) -> String {
    format!("{}", (score * 10_000.0).round() / 10_000.0)
}

/// Destination of one record's frame below `dist`.
pub fn export_path(dist: &Path, record: &MatchRecord, score: f64, layout: ExportLayout) -> PathBuf {
    let score = score_folder(score);
    let reference = record.reference_name();
    let video = record.video_name();
    let folder = match layout {
        ExportLayout::ScoreFirst => dist.join(score).join(reference).join(video),
        ExportLayout::ReferenceFirst => dist.join(reference).join(score).join(video),
    };
    folder.join(format!("{}.jpg", record.time.file_safe()))
}

pub struct Exporter {
    dist: PathBuf,
    min_score: f64,
    layout: ExportLayout,
    pool: ThreadPool,
}

impl Exporter {
    /// Claims `dist` for this run. Fails if it already exists, so frames
    /// from different runs never end up side by side.
    ///
    /// At most `concurrency` videos are open for decoding at once.
    pub fn new(dist: &Path, min_score: f64, layout: ExportLayout, concurrency: usize) -> Result<Self> {
        if dist.exists() {
            return Err(Error::Precondition(format!("{} already exists", dist.display())));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("export-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to build export pool: {e}")))?;
        Ok(Exporter {
            dist: dist.to_path_buf(),
            min_score,
            layout,
            pool,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn run(&self, records: &[MatchRecord], progress: &ProgressBar) -> Result<ExportStats> {
        fs::create_dir_all(&self.dist)?;

        let outcomes: Vec<Exported> = self.pool.install(|| {
            records
                .par_iter()
                .map(|record| {
                    let outcome = self.export(record);
                    progress.inc(1);
                    outcome
                })
                .collect()
        });

        let mut stats = ExportStats { total: records.len(), ..ExportStats::default() };
        for outcome in outcomes {
            match outcome {
                Exported::Written => stats.exported += 1,
                Exported::BelowFloor => stats.below_floor += 1,
                Exported::Missing => stats.missing += 1,
                Exported::Failed => stats.failed += 1,
            }
        }

        info!(
            target: "export",
            "Saved {} frames to {:?} ({} below score floor, {} missing, {} failed)",
            stats.exported, self.dist, stats.below_floor, stats.missing, stats.failed
        );
        Ok(stats)
    }

    fn export(&self, record: &MatchRecord) -> Exported {
        let score = match record.score {
            Some(score) if score >= self.min_score => score,
            _ => return Exported::BelowFloor,
        };
        if !record.found_path.exists() {
            return Exported::Missing;
        }

        let target = export_path(&self.dist, record, score, self.layout);
        let written = FrameSource::open(&record.found_path)
            .and_then(|mut source| source.frame_at(record.time))
            .and_then(|(_, frame)| {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                frame.save(&target)?;
                Ok(())
            });

        match written {
            Ok(()) => Exported::Written,
            Err(e) => {
                warn!(target: "export", "Failed to save {:?}: {}", target, e);
                Exported::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_scorer::Protocol;
    use crate::timecode::Timecode;

    fn record(score: f64) -> MatchRecord {
        let mut record = MatchRecord::detected(
            Path::new("/samples/ref.png"),
            Path::new("/anime/s1/ep1.mkv"),
            Protocol::Template,
            Timecode::from_millis(83_250),
            0,
        );
        record.score = Some(score);
        record
    }

    #[test]
    fn score_folders_are_rounded() {
        assert_eq!(score_folder(0.812_345), "0.8123");
        assert_eq!(score_folder(0.5), "0.5");
        assert_eq!(score_folder(0.999_96), "1");
    }

    #[test]
    fn layouts_nest_differently() {
        let dist = Path::new("/out/dist");
        assert_eq!(
            export_path(dist, &record(0.9), 0.9, ExportLayout::ScoreFirst),
            PathBuf::from("/out/dist/0.9/ref.png/ep1.mkv/0-01-23.250000.jpg")
        );
        assert_eq!(
            export_path(dist, &record(0.9), 0.9, ExportLayout::ReferenceFirst),
            PathBuf::from("/out/dist/ref.png/0.9/ep1.mkv/0-01-23.250000.jpg")
        );
    }

    #[test]
    fn existing_dist_is_a_precondition_violation() {
        let dist = std::env::temp_dir().join(format!("framehunt-dist-{}", std::process::id()));
        std::fs::create_dir_all(&dist).unwrap();
        let result = Exporter::new(&dist, 0.4, ExportLayout::ScoreFirst, 2);
        assert!(matches!(result, Err(Error::Precondition(_))));
        std::fs::remove_dir_all(&dist).unwrap();
    }

    #[test]
    fn low_scores_and_missing_videos_are_counted() {
        let dist = std::env::temp_dir().join(format!("framehunt-export-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dist);
        let exporter = Exporter::new(&dist, 0.4, ExportLayout::ScoreFirst, 2).unwrap();

        let stats = exporter.run(&[record(0.3), record(0.8)], &ProgressBar::hidden()).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.below_floor, 1);
        assert_eq!(stats.missing, 1);
        assert_eq!(stats.exported, 0);

        std::fs::remove_dir_all(&dist).unwrap();
    }

    #[test]
    fn decoding_is_bounded_by_the_requested_concurrency() {
        let dist = std::env::temp_dir().join(format!("framehunt-export-pool-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dist);

        let exporter = Exporter::new(&dist, 0.4, ExportLayout::ScoreFirst, 3).unwrap();
        assert_eq!(exporter.concurrency(), 3);
        let exporter = Exporter::new(&dist, 0.4, ExportLayout::ScoreFirst, 0).unwrap();
        assert_eq!(exporter.concurrency(), 1);
    }
}
