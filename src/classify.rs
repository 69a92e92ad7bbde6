//! Crowd-tier classification.
//!
//! Maps a person count to one of three alert tiers. The mapping is a pure
//! function of the count; no history or hidden state takes part.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest count still classified as Green.
pub const GREEN_MAX: usize = 3;
/// Highest count still classified as Yellow. Anything above is Red.
pub const YELLOW_MAX: usize = 6;

/// Label shown when the frame holds no qualifying person.
pub const NO_PERSON_LABEL: &str = "No Person Detected";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertStatus {
    Green,
    Yellow,
    Red,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Green => "Green",
            AlertStatus::Yellow => "Yellow",
            AlertStatus::Red => "Red",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Green" => Some(AlertStatus::Green),
            "Yellow" => Some(AlertStatus::Yellow),
            "Red" => Some(AlertStatus::Red),
            _ => None,
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier plus the banner text rendered for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub status: AlertStatus,
    pub label: String,
}

pub fn status_for(count: usize) -> AlertStatus {
    if count <= GREEN_MAX {
        AlertStatus::Green
    } else if count <= YELLOW_MAX {
        AlertStatus::Yellow
    } else {
        AlertStatus::Red
    }
}

/// Classify a person count.
///
/// A count of zero and a count of 1-3 share the Green tier but carry
/// different labels ("No Person Detected" vs "Green Alert - Count: N").
pub fn classify(count: usize) -> Classification {
    let status = status_for(count);
    let label = if count == 0 {
        NO_PERSON_LABEL.to_string()
    } else {
        format!("{} Alert - Count: {}", status, count)
    };
    Classification { status, label }
}
