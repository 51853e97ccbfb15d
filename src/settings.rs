//! Settings Module
//!
//! Run configuration, loaded once from an optional JSON file and then
//! passed by reference to every stage.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::match_scorer::{Protocol, ProtocolCheck, ProtocolSet};

/// On/off switch and similarity threshold for one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    #[serde(rename = "use")]
    pub enabled: bool,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Protocols {
    pub ssim: ProtocolSettings,
    pub phash: ProtocolSettings,
    pub template: ProtocolSettings,
}

impl Default for Protocols {
    fn default() -> Self {
        Protocols {
            ssim: ProtocolSettings { enabled: false, similarity: 0.95 },
            phash: ProtocolSettings { enabled: false, similarity: 0.95 },
            template: ProtocolSettings { enabled: true, similarity: 0.395 },
        }
    }
}

impl Protocols {
    fn get(&self, protocol: Protocol) -> &ProtocolSettings {
        match protocol {
            Protocol::Template => &self.template,
            Protocol::Ssim => &self.ssim,
            Protocol::Phash => &self.phash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub min_score: f64,
    pub window_ms: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        DedupSettings { min_score: 0.5, window_ms: 1000 }
    }
}

/// How exported frames are nested under `dist/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExportLayout {
    /// `dist/<score>/<reference>/<video>/`
    #[default]
    ScoreFirst,
    /// `dist/<reference>/<score>/<video>/`
    ReferenceFirst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub min_score: f64,
    pub layout: ExportLayout,
}

impl Default for ExportSettings {
    fn default() -> Self {
        ExportSettings { min_score: 0.4, layout: ExportLayout::ScoreFirst }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateSettings {
    pub min_score: f64,
    pub concurrency: usize,
    pub timeout_secs: u64,
}

impl Default for EstimateSettings {
    fn default() -> Self {
        EstimateSettings { min_score: 0.45, concurrency: 12, timeout_secs: 5 }
    }
}

impl EstimateSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Everything a run can be tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Folder holding the reference stills, relative to the base directory.
    pub originals_folder: String,
    /// Folder holding the candidate videos, relative to the base directory.
    pub comparing_folder: String,
    /// Number of search shards.
    pub workers: usize,
    /// Maximum number of videos decoded and scored at the same time.
    pub decode_concurrency: usize,
    pub protocols: Protocols,
    pub dedup: DedupSettings,
    pub export: ExportSettings,
    pub estimate: EstimateSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            originals_folder: "samples".to_string(),
            comparing_folder: "anime".to_string(),
            workers: 10,
            decode_concurrency: 4,
            protocols: Protocols::default(),
            dedup: DedupSettings::default(),
            export: ExportSettings::default(),
            estimate: EstimateSettings::default(),
        }
    }
}

impl Settings {
    /// Reads settings from a JSON file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.decode_concurrency == 0 {
            return Err(Error::Config("decode_concurrency must be at least 1".to_string()));
        }
        if self.estimate.concurrency == 0 {
            return Err(Error::Config("estimate.concurrency must be at least 1".to_string()));
        }
        for protocol in Protocol::ALL {
            let similarity = self.protocols.get(protocol).similarity;
            // Template correlation can legitimately be negative.
            let lower = if protocol == Protocol::Template { -1.0 } else { 0.0 };
            if !(lower..=1.0).contains(&similarity) {
                return Err(Error::Config(format!(
                    "{} similarity {} is outside [{}, 1]",
                    protocol, similarity, lower
                )));
            }
        }
        Ok(())
    }

    /// The enabled protocols, each bound to its own threshold.
    pub fn protocols(&self) -> ProtocolSet {
        ProtocolSet::new(
            Protocol::ALL
                .iter()
                .filter_map(|&protocol| {
                    let settings = self.protocols.get(protocol);
                    settings.enabled.then_some(ProtocolCheck {
                        protocol,
                        threshold: settings.similarity,
                    })
                })
                .collect(),
        )
    }
}
