//! Deduplication Module
//!
//! Collapses a generation of match records into a clean, time-ordered set:
//! low scores are dropped and temporally adjacent records of the same
//! (reference, video, protocol) group are merged, keeping the best score.
//!
//! The same collapse rule is used when aggregating unscored search output,
//! where the earliest record of a burst always wins.

use log::{debug, info};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::results::{GroupKey, MatchRecord};

/// Counters surfaced after a deduplication pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub total_before: usize,
    pub low_scores_removed: usize,
    pub duplicates_removed: usize,
    pub total_after: usize,
}

/// Collapses one group of records that share a [`GroupKey`].
///
/// Records closer than `window` to the last kept record are folded into it;
/// the strictly higher score survives, ties keep the earlier record. Missing
/// scores compare as equal. Returns the survivors in time order and the
/// number of records folded away.
pub fn collapse_group(mut group: Vec<MatchRecord>, window: Duration) -> (Vec<MatchRecord>, usize) {
    group.sort_by_key(|record| record.time);
    let window_ms = window.as_millis() as u64;

    let mut kept: Vec<MatchRecord> = Vec::with_capacity(group.len());
    let mut duplicates = 0;
    for record in group {
        let Some(last) = kept.last_mut() else {
            kept.push(record);
            continue;
        };
        if record.time.millis_between(&last.time) < window_ms {
            if score_of(&record) > score_of(last) {
                *last = record;
            }
            duplicates += 1;
        } else {
            kept.push(record);
        }
    }
    (kept, duplicates)
}

fn score_of(record: &MatchRecord) -> f64 {
    record.score.unwrap_or(f64::NEG_INFINITY)
}

/// Splits records into their deduplication groups.
pub fn group_records(records: impl IntoIterator<Item = MatchRecord>) -> BTreeMap<GroupKey, Vec<MatchRecord>> {
    let mut groups: BTreeMap<GroupKey, Vec<MatchRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.group_key()).or_default().push(record);
    }
    groups
}

/// Score floor plus merge window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deduplicator {
    min_score: f64,
    window: Duration,
}

impl Deduplicator {
    pub fn new(min_score: f64, window: Duration) -> Self {
        Deduplicator { min_score, window }
    }

    /// Runs filter, group and merge over one generation of records.
    ///
    /// Records without a score count as below the floor. The output is
    /// ordered by group, then by time.
    pub fn run(&self, records: Vec<MatchRecord>) -> (Vec<MatchRecord>, DedupStats) {
        let mut stats = DedupStats {
            total_before: records.len(),
            ..DedupStats::default()
        };

        let survivors = records.into_iter().filter(|record| match record.score {
            Some(score) if score >= self.min_score => true,
            _ => {
                stats.low_scores_removed += 1;
                false
            }
        });
        let groups = group_records(survivors.collect::<Vec<_>>());

        let mut cleaned = Vec::new();
        for (key, group) in groups {
            let (kept, duplicates) = collapse_group(group, self.window);
            debug!(
                target: "dedup",
                "{} / {} / {}: kept {}, merged {}",
                key.reference, key.video, key.protocol, kept.len(), duplicates
            );
            stats.duplicates_removed += duplicates;
            cleaned.extend(kept);
        }
        stats.total_after = cleaned.len();

        info!(
            target: "dedup",
            "Deleted duplicates: {}, cleaned low scores: {}, unique matches left: {}",
            stats.duplicates_removed, stats.low_scores_removed, stats.total_after
        );
        (cleaned, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_scorer::Protocol;
    use crate::timecode::Timecode;
    use std::path::Path;

    fn scored(reference: &str, video: &str, time: &str, score: f64) -> MatchRecord {
        let mut record = MatchRecord::detected(
            Path::new(reference),
            Path::new(video),
            Protocol::Template,
            time.parse::<Timecode>().unwrap(),
            0,
        );
        record.score = Some(score);
        record.score_protocol = Some(Protocol::Template);
        record
    }

    fn times(records: &[MatchRecord]) -> Vec<String> {
        records.iter().map(|r| r.time.to_string()).collect()
    }

    #[test]
    fn merges_adjacent_keeping_best_score() {
        let records = vec![
            scored("/s/a.png", "/v/e1.mkv", "00:00:10.000", 0.6),
            scored("/s/a.png", "/v/e1.mkv", "00:00:10.500", 0.8),
            scored("/s/a.png", "/v/e1.mkv", "00:00:20.000", 0.7),
        ];
        let (cleaned, stats) = Deduplicator::new(0.5, Duration::from_millis(1000)).run(records);

        assert_eq!(times(&cleaned), vec!["0:00:10.500000", "0:00:20"]);
        assert_eq!(cleaned[0].score, Some(0.8));
        assert_eq!(cleaned[1].score, Some(0.7));
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.low_scores_removed, 0);
        assert_eq!(stats.total_after, 2);
    }

    #[test]
    fn equal_scores_keep_the_earlier_record() {
        let records = vec![
            scored("/s/a.png", "/v/e1.mkv", "0:00:05.400", 0.9),
            scored("/s/a.png", "/v/e1.mkv", "0:00:05.000", 0.9),
        ];
        let (cleaned, _) = Deduplicator::new(0.5, Duration::from_millis(1000)).run(records);
        assert_eq!(times(&cleaned), vec!["0:00:05"]);
    }

    #[test]
    fn low_scores_and_unscored_records_are_dropped() {
        let mut unscored = scored("/s/a.png", "/v/e1.mkv", "0:00:01", 0.0);
        unscored.score = None;
        let records = vec![
            scored("/s/a.png", "/v/e1.mkv", "0:00:03", 0.49),
            scored("/s/a.png", "/v/e1.mkv", "0:00:09", 0.5),
            unscored,
        ];
        let (cleaned, stats) = Deduplicator::new(0.5, Duration::from_millis(1000)).run(records);
        assert_eq!(times(&cleaned), vec!["0:00:09"]);
        assert_eq!(stats.low_scores_removed, 2);
        assert!(cleaned.iter().all(|r| r.score.unwrap() >= 0.5));
    }

    #[test]
    fn groups_are_merged_independently() {
        let records = vec![
            scored("/s/a.png", "/v/e1.mkv", "0:00:10", 0.7),
            scored("/s/b.png", "/v/e1.mkv", "0:00:10.2", 0.7),
            scored("/s/a.png", "/v/e2.mkv", "0:00:10.4", 0.7),
        ];
        let (cleaned, stats) = Deduplicator::new(0.5, Duration::from_millis(1000)).run(records);
        assert_eq!(cleaned.len(), 3);
        assert_eq!(stats.duplicates_removed, 0);
    }

    #[test]
    fn exactly_one_window_apart_is_not_a_duplicate() {
        let records = vec![
            scored("/s/a.png", "/v/e1.mkv", "0:00:10", 0.7),
            scored("/s/a.png", "/v/e1.mkv", "0:00:11", 0.9),
        ];
        let (cleaned, _) = Deduplicator::new(0.5, Duration::from_millis(1000)).run(records);
        assert_eq!(cleaned.len(), 2);
    }

    #[test]
    fn unscored_collapse_keeps_the_first_of_a_burst() {
        let group: Vec<MatchRecord> = (0..48)
            .map(|i| {
                let mut r = scored("/s/a.png", "/v/e1.mkv", "0:00:00", 0.0);
                r.score = None;
                r.time = Timecode::from_frame(i, 24.0);
                r
            })
            .collect();
        let (kept, duplicates) = collapse_group(group, Duration::from_millis(1000));
        assert_eq!(times(&kept), vec!["0:00:00", "0:00:01"]);
        assert_eq!(duplicates, 46);
    }

    #[test]
    fn deduplication_is_idempotent() {
        let records: Vec<MatchRecord> = (0..60)
            .map(|i| {
                let millis = (i * 337) % 9_000;
                let score = 0.4 + ((i * 7) % 11) as f64 / 20.0;
                let mut r = scored("/s/a.png", "/v/e1.mkv", "0:00:00", score);
                r.time = Timecode::from_millis(millis);
                r
            })
            .collect();
        let dedup = Deduplicator::new(0.5, Duration::from_millis(1000));
        let (once, _) = dedup.run(records);
        let (twice, stats) = dedup.run(once.clone());
        assert_eq!(once, twice);
        assert_eq!(stats.duplicates_removed, 0);

        for pair in once.windows(2) {
            assert!(pair[1].time.millis_between(&pair[0].time) >= 1000);
        }
    }
}
