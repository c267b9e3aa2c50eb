//! Capacity status per monitored path

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Capacity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityLevel {
    Ok,
    Warning,
    Alert,
    Unknown,
}

impl CapacityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityLevel::Ok => "ok",
            CapacityLevel::Warning => "warning",
            CapacityLevel::Alert => "alert",
            CapacityLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CapacityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapacityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(CapacityLevel::Ok),
            "warning" => Ok(CapacityLevel::Warning),
            "alert" => Ok(CapacityLevel::Alert),
            "unknown" => Ok(CapacityLevel::Unknown),
            other => Err(format!("unknown capacity level '{}'", other)),
        }
    }
}

/// Probe state for one monitored path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityStatus {
    pub path: PathBuf,
    /// Last successfully sampled usage
    pub used_percent: Option<f64>,
    pub status: CapacityLevel,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CapacityStatus {
    /// Initial state of a path that has never been probed
    pub fn unknown(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            used_percent: None,
            status: CapacityLevel::Unknown,
            consecutive_failures: 0,
            last_probe_at: None,
            next_probe_at: None,
            last_error: None,
        }
    }
}
