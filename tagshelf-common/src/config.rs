//! Bootstrap configuration loading and root folder resolution
//!
//! Configuration file resolution order:
//! 1. Command-line argument (`--config`)
//! 2. `TAGSHELF_CONFIG` environment variable
//! 3. `<config_dir>/tagshelf/tagshelf.toml` if present
//! 4. Compiled defaults
//!
//! A missing configuration file is never fatal: a warning is logged and the
//! compiled defaults are used. A file that exists but fails to parse is a
//! configuration error.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "TAGSHELF_CONFIG";

/// Environment variable naming the root data folder
pub const ROOT_ENV_VAR: &str = "TAGSHELF_ROOT";

/// Bootstrap settings shared by every tagshelf binary
///
/// Module-specific sections live next to these keys in the same file and are
/// picked up by each module's own config type (which flattens this one).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root data folder (catalog and staging stores live below it)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Explicit catalog database path (default `<root>/catalog.db`)
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,

    /// Explicit staging folder (default `<root>/staging`)
    #[serde(default)]
    pub staging_folder: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Operator HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Operator HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the operator API binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:5780".to_string()
}

impl TomlConfig {
    /// Catalog database path under the resolved root folder
    pub fn catalog_path(&self, root_folder: &Path) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| root_folder.join("catalog.db"))
    }

    /// Staging folder under the resolved root folder
    pub fn staging_folder(&self, root_folder: &Path) -> PathBuf {
        self.staging_folder
            .clone()
            .unwrap_or_else(|| root_folder.join("staging"))
    }
}

/// Locate the configuration file to load, if any
///
/// Returns `None` when no explicit path was given and the platform default
/// does not exist.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_path().filter(|path| path.exists())
}

/// Platform default configuration file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tagshelf").join("tagshelf.toml"))
}

/// Load a TOML configuration file into `T`, degrading to defaults when absent
pub fn load_toml_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        warn!("No configuration file found, using compiled defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!(
            path = %path.display(),
            "Configuration file not found, using compiled defaults"
        );
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Resolves the root data folder
///
/// Priority order:
/// 1. Command-line argument (highest priority)
/// 2. `TAGSHELF_ROOT` environment variable
/// 3. TOML `root_folder`
/// 4. OS-dependent default (fallback)
#[derive(Debug, Clone, Default)]
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml_value(mut self, path: Option<PathBuf>) -> Self {
        self.toml_value = path;
        self
    }

    /// Resolve the root folder following the priority order
    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_ENV_VAR) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_value {
            return path.clone();
        }

        default_root_folder()
    }
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("tagshelf"))
        .unwrap_or_else(|| PathBuf::from("./tagshelf_data"))
}
