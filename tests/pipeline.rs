use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use framehunt::dedup::Deduplicator;
use framehunt::match_scorer::Protocol;
use framehunt::results::{self, CLEANED_RESULTS_FILE, MatchRecord, SCORED_RESULTS_FILE};
use framehunt::search::partition_shards;
use framehunt::timecode::Timecode;
use framehunt::{Config, Settings};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("framehunt-it-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn scored(reference: &str, video: &str, time: &str, protocol: Protocol, score: f64) -> MatchRecord {
    let mut record = MatchRecord::detected(
        Path::new(reference),
        Path::new(video),
        Protocol::Template,
        time.parse::<Timecode>().unwrap(),
        0,
    );
    record.score = Some(score);
    record.score_protocol = Some(protocol);
    record
}

#[test]
fn dedup_stage_cleans_scored_results_file() {
    let base = scratch_dir("dedup");
    let scored_results = results::group_by_score_protocol(vec![
        scored("/s/a.png", "/v/e1.mkv", "00:00:10.000", Protocol::Template, 0.6),
        scored("/s/a.png", "/v/e1.mkv", "00:00:10.500", Protocol::Template, 0.8),
        scored("/s/a.png", "/v/e1.mkv", "00:00:20.000", Protocol::Template, 0.7),
        scored("/s/a.png", "/v/e1.mkv", "00:00:10.200", Protocol::Ssim, 0.3),
        scored("/s/a.png", "/v/e1.mkv", "00:00:30", Protocol::Ssim, 0.95),
    ]);
    results::save_scored(&scored_results, &base.join(SCORED_RESULTS_FILE)).unwrap();

    let config = Config {
        base_dir: base.clone(),
        settings: Settings::default(),
    };
    framehunt::run_dedup(&config).unwrap();

    let cleaned = results::load_scored(&base.join(CLEANED_RESULTS_FILE)).unwrap();
    let template: Vec<(String, f64)> = cleaned[&Protocol::Template]
        .iter()
        .map(|r| (r.time.to_string(), r.score.unwrap()))
        .collect();
    assert_eq!(
        template,
        vec![("0:00:10.500000".to_string(), 0.8), ("0:00:20".to_string(), 0.7)]
    );
    assert_eq!(cleaned[&Protocol::Ssim].len(), 1);
    assert_eq!(cleaned[&Protocol::Ssim][0].time.to_string(), "0:00:30");

    fs::remove_dir_all(&base).unwrap();
}

#[test]
fn cleaned_output_respects_window_and_floor() {
    let mut records = Vec::new();
    for i in 0..200u64 {
        let reference = if i % 3 == 0 { "/s/a.png" } else { "/s/b.png" };
        let mut record = scored(reference, "/v/e1.mkv", "0:00:00", Protocol::Phash, 0.3 + (i % 7) as f64 / 10.0);
        record.time = Timecode::from_millis((i * 173) % 20_000);
        records.push(record);
    }

    let dedup = Deduplicator::new(0.5, Duration::from_millis(1000));
    let (cleaned, stats) = dedup.run(records);
    assert!(cleaned.iter().all(|r| r.score.unwrap() >= 0.5));
    assert_eq!(stats.total_after, cleaned.len());
    assert_eq!(
        stats.total_before,
        stats.total_after + stats.duplicates_removed + stats.low_scores_removed
    );

    for (i, a) in cleaned.iter().enumerate() {
        for b in &cleaned[i + 1..] {
            if a.group_key() == b.group_key() {
                assert!(a.time.millis_between(&b.time) >= 1000);
            }
        }
    }

    let (again, _) = dedup.run(cleaned.clone());
    assert_eq!(again, cleaned);
}

#[test]
fn sharding_covers_reference_folder() {
    let references: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("/s/{i}.png"))).collect();
    let shards = partition_shards(&references, 3);
    assert_eq!(shards.iter().map(|s| s.len()).collect::<Vec<_>>(), vec![3, 3, 4]);
    assert_eq!(shards.concat(), references);
}

#[test]
fn export_refuses_to_reuse_dist() {
    let base = scratch_dir("export");
    fs::create_dir_all(base.join("dist")).unwrap();
    let config = Config {
        base_dir: base.clone(),
        settings: Settings::default(),
    };

    let err = framehunt::run_export(&config).unwrap_err();
    let err = err.downcast_ref::<framehunt::Error>().unwrap();
    assert!(err.is_fatal());

    fs::remove_dir_all(&base).unwrap();
}
