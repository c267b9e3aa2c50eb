//! Configuration for tagshelf-ingest
//!
//! One TOML file carries the shared bootstrap keys (root folder, logging,
//! server) plus the ingest sections below. Every section and key is optional;
//! missing values fall back to compiled defaults.

use crate::jobs::retry::RetryPolicy;
use crate::services::album_grouping::YearTieBreak;
use crate::services::path_templates::{LengthUnit, TemplateSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tagshelf_common::config::{load_toml_config, resolve_config_path, TomlConfig};
use tagshelf_common::{Error, Result};

/// Complete ingest configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(flatten)]
    pub bootstrap: TomlConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub grouping: GroupingConfig,

    #[serde(default)]
    pub directory_codes: DirectoryCodeConfig,

    #[serde(default)]
    pub paths: PathConfig,

    #[serde(default)]
    pub capacity: CapacityConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub libraries: Vec<LibraryConfig>,
}

impl IngestConfig {
    /// Resolve, load and validate the configuration file
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(cli_path);
        let config: IngestConfig = load_toml_config(path.as_deref())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scanner.workers == 0 || self.scanner.batch_size == 0 {
            return Err(Error::Config(
                "scanner.workers and scanner.batch_size must be at least 1".to_string(),
            ));
        }
        if self.scanner.work_queue_capacity == 0 || self.scanner.result_queue_capacity == 0 {
            return Err(Error::Config("scanner queue capacities must be at least 1".to_string()));
        }

        let codes = &self.directory_codes;
        if codes.min_length == 0 || codes.min_length > codes.max_length {
            return Err(Error::Config(format!(
                "directory_codes: min_length {} must be between 1 and max_length {}",
                codes.min_length, codes.max_length
            )));
        }
        if !codes.suffix_pattern.contains("{n}") {
            return Err(Error::Config(
                "directory_codes.suffix_pattern must contain {n}".to_string(),
            ));
        }

        let capacity = &self.capacity;
        if !(0.0..=100.0).contains(&capacity.warning_percent)
            || !(0.0..=100.0).contains(&capacity.alert_percent)
            || capacity.warning_percent > capacity.alert_percent
        {
            return Err(Error::Config(format!(
                "capacity thresholds must satisfy 0 <= warning ({}) <= alert ({}) <= 100",
                capacity.warning_percent, capacity.alert_percent
            )));
        }
        if capacity.probe_interval_secs == 0 {
            return Err(Error::Config("capacity.probe_interval_secs must be positive".to_string()));
        }

        if self.jobs.retry.max_attempts == 0 {
            return Err(Error::Config("jobs.retry.max_attempts must be at least 1".to_string()));
        }

        let mut names: Vec<&str> = self.libraries.iter().map(|l| l.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Error::Config("library names must be unique".to_string()));
        }

        Ok(())
    }

    /// Library by name
    pub fn library(&self, name: &str) -> Option<&LibraryConfig> {
        self.libraries.iter().find(|library| library.name == name)
    }
}

/// `[scanner]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Fingerprinting workers
    pub workers: usize,
    /// Bounded capacity of the walker → workers channel
    pub work_queue_capacity: usize,
    /// Bounded capacity of the workers → inserter channel
    pub result_queue_capacity: usize,
    /// Records committed per staging transaction
    pub batch_size: usize,
    /// File or directory names skipped during the walk
    pub ignore_patterns: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            work_queue_capacity: 256,
            result_queue_capacity: 256,
            batch_size: 100,
            ignore_patterns: [".DS_Store", "Thumbs.db", ".git", ".svn", "@eaDir"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// `[grouping]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub year_tie_break: YearTieBreak,
}

/// `[directory_codes]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryCodeConfig {
    /// Leading articles stripped from multi-word names and skipped as initials
    pub articles: Vec<String>,
    pub min_length: usize,
    pub max_length: usize,
    /// Collision suffix; `{n}` is replaced by the attempt number
    pub suffix_pattern: String,
    /// Attempts before generation fails
    pub max_collisions: u32,
    /// Character class every code must match
    pub code_pattern: String,
    /// Base used for names without usable ASCII letters or digits
    pub fallback_code: String,
    pub rule_version: i64,
}

impl Default for DirectoryCodeConfig {
    fn default() -> Self {
        Self {
            articles: vec!["the".to_string(), "a".to_string(), "an".to_string()],
            min_length: 2,
            max_length: 8,
            suffix_pattern: "-{n}".to_string(),
            max_collisions: 1000,
            code_pattern: "^[A-Z0-9]+(-[0-9]+)?$".to_string(),
            fallback_code: "XX".to_string(),
            rule_version: 1,
        }
    }
}

/// `[paths]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub max_length: usize,
    pub length_unit: LengthUnit,
    pub max_depth: usize,
    pub templates: TemplateSet,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            max_length: 1024,
            length_unit: LengthUnit::Bytes,
            max_depth: 8,
            templates: TemplateSet::default(),
        }
    }
}

/// `[capacity]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub warning_percent: f64,
    pub alert_percent: f64,
    pub probe_interval_secs: u64,
    /// Consecutive failed probes tolerated before status becomes unknown
    pub max_consecutive_failures: u32,
    pub monitored_paths: Vec<PathBuf>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            warning_percent: 80.0,
            alert_percent: 90.0,
            probe_interval_secs: 600,
            max_consecutive_failures: 2,
            monitored_paths: Vec::new(),
        }
    }
}

/// `[jobs]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub retry: RetryPolicy,
    pub workers: QueueWorkers,
    pub poll_interval_ms: u64,
    /// Active jobs untouched this long are returned to the queue at startup
    pub stale_after_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            workers: QueueWorkers::default(),
            poll_interval_ms: 500,
            stale_after_secs: 900,
        }
    }
}

/// Worker tasks per queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueWorkers {
    pub critical: usize,
    pub default: usize,
    pub bulk: usize,
    pub maintenance: usize,
}

impl Default for QueueWorkers {
    fn default() -> Self {
        Self {
            critical: 2,
            default: 4,
            bulk: 2,
            maintenance: 1,
        }
    }
}

/// `[[libraries]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub name: String,
    /// Production root the library's albums are placed under
    pub root: PathBuf,
    #[serde(default)]
    pub templates: LibraryTemplates,
}

/// Per-library template overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryTemplates {
    pub production: Option<String>,
    pub staging: Option<String>,
    pub inbound: Option<String>,
}
