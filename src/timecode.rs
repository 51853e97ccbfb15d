//! Timecode Module
//!
//! Offsets into a video, written as `H:MM:SS` or `H:MM:SS.ffffff` in every
//! persisted result file.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An offset into a video's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timecode(Duration);

impl Timecode {
    pub fn from_secs_f64(seconds: f64) -> Self {
        Timecode(Duration::from_secs_f64(seconds.max(0.0)))
    }

    pub fn from_millis(millis: u64) -> Self {
        Timecode(Duration::from_millis(millis))
    }

    /// Position of the `index`-th frame of a stream running at `fps`.
    pub fn from_frame(index: u64, fps: f64) -> Self {
        if fps <= 0.0 {
            return Timecode::default();
        }
        Timecode::from_secs_f64(index as f64 / fps)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }

    /// Absolute distance between two timecodes, in milliseconds.
    pub fn millis_between(&self, other: &Timecode) -> u64 {
        self.as_millis().abs_diff(other.as_millis())
    }

    /// The textual form with `:` swapped for `-`, usable as a file name.
    pub fn file_safe(&self) -> String {
        self.to_string().replace(':', "-")
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();
        let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);
        let micros = self.0.subsec_micros();
        if micros == 0 {
            write!(f, "{}:{:02}:{:02}", hours, minutes, seconds)
        } else {
            write!(f, "{}:{:02}:{:02}.{:06}", hours, minutes, seconds, micros)
        }
    }
}

impl FromStr for Timecode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidTimecode(s.to_string());
        let mut parts = s.trim().split(':');
        let (Some(h), Some(m), Some(rest), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let (sec, frac) = match rest.split_once('.') {
            Some((sec, frac)) => (sec, Some(frac)),
            None => (rest, None),
        };

        let number = |digits: &str| -> Result<u64> {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            digits.parse::<u64>().map_err(|_| invalid())
        };
        let hours = number(h)?;
        let minutes = number(m)?;
        let seconds = number(sec)?;
        if minutes >= 60 || seconds >= 60 || m.len() > 2 || sec.len() > 2 {
            return Err(invalid());
        }

        let micros = match frac {
            None => 0,
            Some(frac) if frac.len() > 6 => return Err(invalid()),
            Some(frac) => number(frac)? * 10u64.pow(6 - frac.len() as u32),
        };

        let secs = hours
            .checked_mul(3600)
            .and_then(|h| h.checked_add(minutes * 60 + seconds))
            .ok_or_else(invalid)?;
        Ok(Timecode(Duration::from_secs(secs) + Duration::from_micros(micros)))
    }
}

impl TryFrom<String> for Timecode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Timecode> for String {
    fn from(value: Timecode) -> Self {
        value.to_string()
    }
}
