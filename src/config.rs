//! Store policy and application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MIMESTORE_CONFIG` (environment variable)
//! 2. `~/.config/mimestore/config.toml` (Linux/macOS)
//!    `%APPDATA%\mimestore\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{MimeError, Result};

/// Advisory size of each content event (8 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Bytes a single part may keep in memory before spilling (1 MB).
pub const DEFAULT_MEMORY_THRESHOLD: i64 = 1024 * 1024;

/// `memory_threshold` value that disables spilling entirely.
pub const MEMORY_ONLY: i64 = -1;

/// Default spill file name prefix.
pub const DEFAULT_TEMP_PREFIX: &str = "MIME";

/// Default spill file name suffix.
pub const DEFAULT_TEMP_SUFFIX: &str = ".tmp";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Multipart store policy.
    pub store: StoreConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Multipart store policy, as written by the user.
///
/// Call [`StoreConfig::validate`] to obtain the immutable
/// [`ValidatedConfig`] a [`Message`](crate::message::Message) runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum size of one content event produced by the tokenizer.
    pub chunk_size: usize,
    /// Bytes per part before spilling to disk; `-1` keeps everything in memory.
    pub memory_threshold: i64,
    /// Directory for spill files (OS temp dir when unset).
    pub temp_dir: Option<PathBuf>,
    /// Spill file name prefix.
    pub temp_prefix: String,
    /// Spill file name suffix.
    pub temp_suffix: String,
    /// Parse the whole stream when the message is constructed.
    pub parse_eagerly: bool,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            temp_dir: None,
            temp_prefix: DEFAULT_TEMP_PREFIX.to_string(),
            temp_suffix: DEFAULT_TEMP_SUFFIX.to_string(),
            parse_eagerly: false,
        }
    }
}

// ── Builder ─────────────────────────────────────────────────────

impl StoreConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum content event size.
    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the per-part memory threshold (`-1` for memory only).
    #[must_use]
    pub fn memory_threshold(mut self, threshold: i64) -> Self {
        self.memory_threshold = threshold;
        self
    }

    /// Never spill to disk.
    #[must_use]
    pub fn memory_only(self) -> Self {
        self.memory_threshold(MEMORY_ONLY)
    }

    /// Set the directory for spill files.
    #[must_use]
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Set the spill file prefix.
    #[must_use]
    pub fn temp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.temp_prefix = prefix.into();
        self
    }

    /// Set the spill file suffix.
    #[must_use]
    pub fn temp_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.temp_suffix = suffix.into();
        self
    }

    /// Parse the whole stream up front.
    #[must_use]
    pub fn parse_eagerly(mut self, eager: bool) -> Self {
        self.parse_eagerly = eager;
        self
    }

    /// Check ranges and run the spill pre-flight.
    ///
    /// A throwaway spill file is created and removed. If that fails the
    /// returned policy is memory-only; this is logged, not reported.
    pub fn validate(self) -> Result<ValidatedConfig> {
        if self.chunk_size == 0 {
            return Err(MimeError::Config("chunk_size must be non-zero".into()));
        }
        if self.memory_threshold < MEMORY_ONLY {
            return Err(MimeError::Config(format!(
                "memory_threshold must be -1 or non-negative, got {}",
                self.memory_threshold
            )));
        }

        let mut validated = ValidatedConfig {
            chunk_size: self.chunk_size,
            memory_threshold: u64::try_from(self.memory_threshold).ok(),
            temp_dir: self.temp_dir.unwrap_or_else(std::env::temp_dir),
            temp_prefix: self.temp_prefix,
            temp_suffix: self.temp_suffix,
            parse_eagerly: self.parse_eagerly,
        };

        if validated.memory_threshold.is_some() {
            if let Err(e) = validated.create_spill_file() {
                warn!(
                    dir = %validated.temp_dir.display(),
                    error = %e,
                    "Cannot create spill files, keeping all parts in memory"
                );
                validated.memory_threshold = None;
            }
        }

        Ok(validated)
    }
}

/// Store policy after validation. Immutable.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    chunk_size: usize,
    memory_threshold: Option<u64>,
    temp_dir: PathBuf,
    temp_prefix: String,
    temp_suffix: String,
    parse_eagerly: bool,
}

impl ValidatedConfig {
    /// Maximum size of one content event.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Per-part memory threshold, `None` when spilling is disabled.
    pub fn memory_threshold(&self) -> Option<u64> {
        self.memory_threshold
    }

    /// `true` if parts never spill to disk.
    pub fn is_only_memory(&self) -> bool {
        self.memory_threshold.is_none()
    }

    /// Directory that receives spill files.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// `true` if the message parses everything at construction.
    pub fn parses_eagerly(&self) -> bool {
        self.parse_eagerly
    }

    /// Create a fresh spill file named after the configured prefix and suffix.
    pub(crate) fn create_spill_file(&self) -> std::io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(&self.temp_prefix)
            .suffix(&self.temp_suffix)
            .tempfile_in(&self.temp_dir)
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MIMESTORE_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mimestore").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mimestore")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mimestore.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "warn");
        assert_eq!(cfg.store.chunk_size, 8192);
        assert_eq!(cfg.store.memory_threshold, 1_048_576);
        assert_eq!(cfg.store.temp_prefix, "MIME");
        assert!(!cfg.store.parse_eagerly);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[store]
memory_threshold = -1
parse_eagerly = true
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.store.memory_threshold, MEMORY_ONLY);
        assert!(cfg.store.parse_eagerly);
        assert_eq!(cfg.store.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.general.log_level, "warn");
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.store, cfg.store);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(StoreConfig::new().chunk_size(0).validate().is_err());
        assert!(StoreConfig::new().memory_threshold(-2).validate().is_err());
    }

    #[test]
    fn test_validate_memory_only() {
        let cfg = StoreConfig::new().memory_only().validate().unwrap();
        assert!(cfg.is_only_memory());
        assert_eq!(cfg.memory_threshold(), None);
    }

    #[test]
    fn test_validate_keeps_threshold_when_dir_is_writable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new()
            .memory_threshold(1024)
            .temp_dir(dir.path())
            .validate()
            .unwrap();
        assert_eq!(cfg.memory_threshold(), Some(1024));
        // The pre-flight file is gone again.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_validate_downgrades_when_dir_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does").join("not").join("exist");
        let cfg = StoreConfig::new()
            .memory_threshold(1024)
            .temp_dir(missing)
            .validate()
            .unwrap();
        assert!(cfg.is_only_memory());
    }

    #[test]
    fn test_spill_file_naming() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new()
            .temp_dir(dir.path())
            .temp_prefix("part")
            .temp_suffix(".bin")
            .validate()
            .unwrap();
        let file = cfg.create_spill_file().unwrap();
        let name = file.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("part"));
        assert!(name.ends_with(".bin"));
    }

    #[test]
    fn test_log_file_in_configured_cache_dir() {
        let mut cfg = Config::default();
        cfg.general.cache_dir = Some(PathBuf::from("/var/cache/mimestore-test"));
        assert_eq!(
            log_file_path(&cfg),
            PathBuf::from("/var/cache/mimestore-test/mimestore.log")
        );
    }

    #[test]
    fn test_save_then_load_through_env_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        std::env::set_var("MIMESTORE_CONFIG", &path);

        let mut cfg = Config::default();
        cfg.general.log_level = "debug".to_string();
        cfg.store = StoreConfig::new()
            .memory_threshold(4096)
            .temp_prefix("spill")
            .parse_eagerly(true);

        save_config(&cfg).unwrap();
        assert!(path.exists());
        let loaded = load_config();
        std::env::remove_var("MIMESTORE_CONFIG");

        assert_eq!(loaded.general.log_level, "debug");
        assert_eq!(loaded.store, cfg.store);
    }
}
