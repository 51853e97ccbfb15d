//! Results Module
//!
//! Match events and the three JSON generations they are persisted as:
//! raw search results, scored results and cleaned results.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::match_scorer::Protocol;
use crate::timecode::Timecode;

pub const RAW_RESULTS_FILE: &str = "results.json";
pub const SCORED_RESULTS_FILE: &str = "parsed_results.json";
pub const CLEANED_RESULTS_FILE: &str = "results.cleaned.json";
pub const EXPORT_DIR: &str = "dist";

/// One detection of a reference image inside a video.
///
/// `score` is absent for events straight out of the search pass and present
/// once the resolve pass has re-scored them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub original_path: PathBuf,
    pub found_path: PathBuf,
    pub time: Timecode,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_protocol: Option<Protocol>,
}

/// The unit of deduplication.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub reference: String,
    pub video: String,
    pub protocol: Protocol,
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

impl MatchRecord {
    pub fn detected(
        original_path: &Path,
        found_path: &Path,
        protocol: Protocol,
        time: Timecode,
        worker_id: usize,
    ) -> Self {
        MatchRecord {
            original_path: original_path.to_path_buf(),
            found_path: found_path.to_path_buf(),
            time,
            protocol,
            worker_id: Some(worker_id),
            score: None,
            score_protocol: None,
        }
    }

    /// The protocol this record is judged under: the scoring protocol once
    /// scored, the detecting one before.
    pub fn effective_protocol(&self) -> Protocol {
        self.score_protocol.unwrap_or(self.protocol)
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            reference: basename(&self.original_path),
            video: basename(&self.found_path),
            protocol: self.effective_protocol(),
        }
    }

    pub fn reference_name(&self) -> String {
        basename(&self.original_path)
    }

    pub fn video_name(&self) -> String {
        basename(&self.found_path)
    }
}

/// Raw search output (`results.json`).
pub type RawResults = Vec<MatchRecord>;

/// Scored or cleaned records keyed by scoring protocol.
pub type ScoredResults = BTreeMap<Protocol, Vec<MatchRecord>>;

/// Groups scored records by the protocol that scored them.
pub fn group_by_score_protocol(records: impl IntoIterator<Item = MatchRecord>) -> ScoredResults {
    let mut grouped = ScoredResults::new();
    for record in records {
        grouped.entry(record.effective_protocol()).or_default().push(record);
    }
    grouped
}

fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn save<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

pub fn load_raw(path: &Path) -> Result<RawResults> {
    load(path)
}

pub fn save_raw(results: &RawResults, path: &Path) -> Result<()> {
    save(results, path)
}

pub fn load_scored(path: &Path) -> Result<ScoredResults> {
    load(path)
}

pub fn save_scored(results: &ScoredResults, path: &Path) -> Result<()> {
    save(results, path)
}
