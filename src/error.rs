//! Error Module
//!
//! The library-level error type shared by every stage of the pipeline.

use std::path::PathBuf;

use crate::match_scorer::Protocol;

/// Everything that can go wrong while searching, resolving or cleaning results.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A video could not be opened, decoded or seeked.
    #[error("failed to decode {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },
    /// A referenced file does not exist, even after rebasing.
    #[error("file not found: {0:?}")]
    MissingFile(PathBuf),
    /// A single protocol failed to score a pair of images.
    #[error("{protocol} scoring failed: {reason}")]
    Scoring { protocol: Protocol, reason: String },
    /// The run cannot start because its environment is not as expected.
    #[error("precondition violated: {0}")]
    Precondition(String),
    /// Invalid settings.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A timecode string that is neither `H:MM:SS` nor `H:MM:SS.ffffff`.
    #[error("invalid timecode: {0:?}")]
    InvalidTimecode(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("serde_json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that must stop the whole run instead of a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Precondition(_) | Error::Config(_))
    }
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;
