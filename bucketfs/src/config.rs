//! Mount configuration, loaded from a YAML file.
//!
//! Every key is optional; missing keys take the defaults below.
//!
//! ```yaml
//! metadata-cache:
//!   stat-cache-ttl-secs: 60
//!   type-cache-ttl-secs: 60
//!   stat-cache-max-entries: 20000
//!   type-cache-max-entries-per-dir: 10000
//!   type-cache-max-dirs: 10000
//! read:
//!   sequential-read-size-mb: 200
//!   random-seek-threshold: 2
//!   enable-multi-range: false
//!   reader-priority: [file-cache, multi-range, sequential]
//! file-cache:
//!   enabled: false
//!   max-size-mb: 1024
//!   cache-file-for-range-read: false
//! write:
//!   max-file-size-mb: 65536
//! enable-hns: true
//! logging:
//!   severity: info
//! ```

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::reader::ReaderKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct MountConfig {
    pub metadata_cache: MetadataCacheConfig,
    pub read: ReadConfig,
    pub file_cache: FileCacheConfig,
    pub write: WriteConfig,
    /// Use native folder operations when the bucket is hierarchical.
    pub enable_hns: bool,
    pub logging: LogConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            metadata_cache: MetadataCacheConfig::default(),
            read: ReadConfig::default(),
            file_cache: FileCacheConfig::default(),
            write: WriteConfig::default(),
            enable_hns: true,
            logging: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct MetadataCacheConfig {
    pub stat_cache_ttl_secs: u64,
    /// Falls back to the stat cache TTL when unset.
    pub type_cache_ttl_secs: Option<u64>,
    pub stat_cache_max_entries: usize,
    pub type_cache_max_entries_per_dir: usize,
    /// Directories whose type caches are kept; the least recently used go first.
    pub type_cache_max_dirs: usize,
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            stat_cache_ttl_secs: 60,
            type_cache_ttl_secs: None,
            stat_cache_max_entries: 20_000,
            type_cache_max_entries_per_dir: 10_000,
            type_cache_max_dirs: 10_000,
        }
    }
}

impl MetadataCacheConfig {
    pub fn stat_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stat_cache_ttl_secs)
    }

    pub fn type_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.type_cache_ttl_secs.unwrap_or(self.stat_cache_ttl_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct ReadConfig {
    pub sequential_read_size_mb: u32,
    /// Number of non-contiguous reads after which a handle counts as random.
    pub random_seek_threshold: u32,
    pub enable_multi_range: bool,
    pub reader_priority: Vec<ReaderKind>,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            sequential_read_size_mb: 200,
            random_seek_threshold: 2,
            enable_multi_range: false,
            reader_priority: vec![
                ReaderKind::FileCache,
                ReaderKind::MultiRange,
                ReaderKind::Sequential,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileCacheConfig {
    pub enabled: bool,
    pub max_size_mb: u64,
    /// Populate the cache on random reads too, not only reads from offset 0.
    pub cache_file_for_range_read: bool,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size_mb: 1024,
            cache_file_for_range_read: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct WriteConfig {
    /// Largest size a file may grow to while it is buffered locally.
    pub max_file_size_mb: u64,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 64 * 1024,
        }
    }
}

impl WriteConfig {
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct LogConfig {
    pub severity: LogSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogSeverity {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Off,
}

impl LogSeverity {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub fn directive(self) -> &'static str {
        match self {
            LogSeverity::Trace => "trace",
            LogSeverity::Debug => "debug",
            LogSeverity::Info => "info",
            LogSeverity::Warning => "warn",
            LogSeverity::Error => "error",
            LogSeverity::Off => "off",
        }
    }
}

impl FromStr for LogSeverity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogSeverity::Trace),
            "DEBUG" => Ok(LogSeverity::Debug),
            "INFO" => Ok(LogSeverity::Info),
            "WARNING" | "WARN" => Ok(LogSeverity::Warning),
            "ERROR" => Ok(LogSeverity::Error),
            "OFF" => Ok(LogSeverity::Off),
            other => bail!("unknown log severity {other:?}"),
        }
    }
}

impl TryFrom<String> for LogSeverity {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<LogSeverity> for String {
    fn from(s: LogSeverity) -> Self {
        s.to_string()
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogSeverity::Trace => "TRACE",
            LogSeverity::Debug => "DEBUG",
            LogSeverity::Info => "INFO",
            LogSeverity::Warning => "WARNING",
            LogSeverity::Error => "ERROR",
            LogSeverity::Off => "OFF",
        };
        f.write_str(s)
    }
}

impl MountConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: MountConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read.sequential_read_size_mb == 0 {
            bail!("read.sequential-read-size-mb must be at least 1");
        }
        if self.metadata_cache.stat_cache_max_entries == 0 {
            bail!("metadata-cache.stat-cache-max-entries must be at least 1");
        }
        if self.metadata_cache.type_cache_max_dirs == 0 {
            bail!("metadata-cache.type-cache-max-dirs must be at least 1");
        }
        if self.write.max_file_size_mb == 0 {
            bail!("write.max-file-size-mb must be at least 1");
        }
        if self.read.reader_priority.is_empty() {
            bail!("read.reader-priority must name at least one reader");
        }
        let mut seen = HashSet::new();
        for kind in &self.read.reader_priority {
            if !seen.insert(kind) {
                bail!("read.reader-priority lists {kind:?} more than once");
            }
        }
        Ok(())
    }
}

/// Loads the config at `path`, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<MountConfig> {
    let Some(path) = path else {
        return Ok(MountConfig::default());
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    MountConfig::from_yaml(&content)
        .with_context(|| format!("Invalid config in {}", path.display()))
}
