//! Configuration management for the ODIN engine.
//!
//! Loaded from `.odin/config.toml` under the project root. Every set that
//! drives walking, archiving or locking lives here and is passed down
//! explicitly; nothing is read from process-wide state.

use crate::utils::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OdinConfig {
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Directory names never descended into
    #[serde(default = "default_ignore_names")]
    pub ignore_names: BTreeSet<String>,

    /// Threads used to hash files while building a snapshot
    #[serde(default = "default_hash_threads")]
    pub hash_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Extensions (without the dot, lowercase) included in backups
    #[serde(default = "default_extensions")]
    pub extensions: BTreeSet<String>,

    /// Exact file names included regardless of extension
    #[serde(default = "default_file_names")]
    pub file_names: BTreeSet<String>,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Files larger than this are left out of the archive
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Overall time budget for acquiring the lock (seconds)
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Time a conflicting instance gets to exit after SIGTERM (seconds)
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,

    /// Program name (`argv[0]` basename) a live lock holder must have to
    /// count as another instance of this tool
    #[serde(default = "default_identity_marker")]
    pub identity_marker: String,

    /// Stop a live conflicting instance instead of waiting for it
    #[serde(default = "default_true")]
    pub terminate_conflicting: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_keep_minimum")]
    pub keep_minimum: usize,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Entries per actor inside the window before it is flagged
    #[serde(default = "default_high_frequency_actor")]
    pub high_frequency_actor: usize,

    /// Share of error-severity entries that is flagged
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,

    /// UTC hours considered off-hours
    #[serde(default = "default_unusual_hours")]
    pub unusual_hours: Vec<u32>,

    /// Default anomaly window (hours)
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_ignore_names() -> BTreeSet<String> {
    [
        ".git", ".hg", ".svn", ".odin", "backups", "__pycache__", "node_modules",
        ".venv", "venv", "dist", "build", "target", ".next", ".nuxt", "coverage",
        ".pytest_cache", ".mypy_cache",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_hash_threads() -> usize {
    4
}

fn default_extensions() -> BTreeSet<String> {
    [
        "py", "js", "ts", "jsx", "tsx", "mjs", "cjs", "json", "md", "yml", "yaml",
        "toml", "cfg", "ini", "txt", "sh", "bash", "bat", "ps1", "sql", "html", "css",
        "xml", "go", "rs", "java", "cpp", "hpp", "c", "h",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_file_names() -> BTreeSet<String> {
    [
        "Dockerfile", "Makefile", "requirements.txt", "package.json", "Cargo.toml",
        "go.mod", "pom.xml", "build.gradle",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_file_size() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_terminate_timeout() -> u64 {
    10
}

fn default_identity_marker() -> String {
    "odin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keep_minimum() -> usize {
    5
}

fn default_max_age_days() -> u64 {
    7
}

fn default_high_frequency_actor() -> usize {
    100
}

fn default_failure_ratio() -> f64 {
    0.3
}

fn default_unusual_hours() -> Vec<u32> {
    vec![0, 1, 2, 3, 4, 5]
}

fn default_window_hours() -> i64 {
    24
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            ignore_names: default_ignore_names(),
            hash_threads: default_hash_threads(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            file_names: default_file_names(),
            compression_level: default_compression_level(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: default_acquire_timeout(),
            terminate_timeout_secs: default_terminate_timeout(),
            identity_marker: default_identity_marker(),
            terminate_conflicting: default_true(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_minimum: default_keep_minimum(),
            max_age_days: default_max_age_days(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            high_frequency_actor: default_high_frequency_actor(),
            failure_ratio: default_failure_ratio(),
            unusual_hours: default_unusual_hours(),
            window_hours: default_window_hours(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

impl OdinConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` when it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = OdinConfig::default();
        assert!(config.integrity.ignore_names.contains(".git"));
        assert!(config.integrity.ignore_names.contains(".odin"));
        assert!(config.archive.extensions.contains("py"));
        assert_eq!(config.retention.keep_minimum, 5);
        assert_eq!(config.lock.identity_marker, "odin");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[retention]\nkeep_minimum = 2\n").unwrap();

        let config = OdinConfig::from_file(&path).unwrap();
        assert_eq!(config.retention.keep_minimum, 2);
        assert_eq!(config.retention.max_age_days, 7);
        assert_eq!(config.audit.unusual_hours, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, OdinConfig::default().to_toml().unwrap()).unwrap();

        let loaded = OdinConfig::from_file(&path).unwrap();
        assert_eq!(loaded.archive.compression_level, 3);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "retention = 3").unwrap();

        assert!(matches!(
            OdinConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = OdinConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.lock.acquire_timeout_secs, 30);
    }
}
