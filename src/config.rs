//! Store configuration.
//!
//! Loaded from TOML with three sections: `[storage]` for the tier roots and
//! home capacity, `[migration]` for the scheduler, and `[logging]`.

use crate::error::{TierError, TierResult};
use crate::migrator::MigratorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Threshold value that disables the migrator.
pub const MIGRATION_DISABLED: f64 = -1.0;

/// Store configuration loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Tier roots and capacity
    pub storage: StorageConfig,

    /// Migration scheduler settings
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tier roots and capacity.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Root of the home tier
    pub home_path: PathBuf,

    /// Roots of the overflow tier: a comma separated string or an array
    #[serde(deserialize_with = "deserialize_paths")]
    pub overflow_paths: Vec<PathBuf>,

    /// Home tier capacity: a size, or "all" / -1 for the whole volume
    #[serde(default)]
    pub home_capacity: HomeCapacity,

    /// Home allocations are rounded up to a multiple of this
    #[serde(
        default = "default_allocation_granularity",
        deserialize_with = "deserialize_size"
    )]
    pub allocation_granularity: u64,

    /// Home allocation size for segments opened without a size
    #[serde(default = "default_segment_size", deserialize_with = "deserialize_size")]
    pub segment_size: u64,
}

/// How much of the home volume the store may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HomeCapacity {
    /// The total size of the volume holding `home_path`.
    #[default]
    All,
    /// A fixed number of bytes.
    Bytes(u64),
}

impl<'de> Deserialize<'de> for HomeCapacity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum CapacityValue {
            Number(i64),
            String(String),
        }

        match CapacityValue::deserialize(deserializer)? {
            CapacityValue::Number(-1) => Ok(HomeCapacity::All),
            CapacityValue::Number(n) if n >= 0 => Ok(HomeCapacity::Bytes(n as u64)),
            CapacityValue::Number(n) => Err(D::Error::custom(format!(
                "invalid home_capacity: {}",
                n
            ))),
            CapacityValue::String(s) if s.trim().eq_ignore_ascii_case("all") => {
                Ok(HomeCapacity::All)
            }
            CapacityValue::String(s) => parse_size(&s)
                .map(HomeCapacity::Bytes)
                .map_err(D::Error::custom),
        }
    }
}

/// Migration scheduler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    /// Fraction of home capacity above which segments are demoted; -1 disables
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Fraction of home capacity promotion may fill (default: threshold)
    #[serde(default)]
    pub readmit_threshold: Option<f64>,

    /// Number of migration worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Milliseconds between scheduler passes
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Milliseconds before the first scheduler pass
    #[serde(default = "default_interval_ms")]
    pub initial_delay_ms: u64,

    /// Bytes copied per migration step
    #[serde(default = "default_copy_chunk_size", deserialize_with = "deserialize_size")]
    pub copy_chunk_size: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            readmit_threshold: None,
            threads: default_threads(),
            interval_ms: default_interval_ms(),
            initial_delay_ms: default_interval_ms(),
            copy_chunk_size: default_copy_chunk_size(),
        }
    }
}

impl MigrationConfig {
    /// Returns false when the threshold is the disable sentinel.
    pub fn is_enabled(&self) -> bool {
        self.threshold != MIGRATION_DISABLED
    }

    /// Effective re-admission threshold.
    pub fn readmit(&self) -> f64 {
        self.readmit_threshold.unwrap_or(self.threshold)
    }

    /// Settings for the migrator.
    pub fn migrator_config(&self) -> MigratorConfig {
        MigratorConfig {
            threads: self.threads,
            threshold: self.threshold,
            readmit_threshold: self.readmit(),
            interval: Duration::from_millis(self.interval_ms),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "segtier=debug"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target
    #[serde(default)]
    pub target: bool,

    /// Include thread names
    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    #[default]
    Pretty,
    /// Single-line human readable output
    Compact,
    /// Newline-delimited JSON
    Json,
}

fn default_allocation_granularity() -> u64 {
    4096
}

fn default_segment_size() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

fn default_threshold() -> f64 {
    0.5
}

fn default_threads() -> usize {
    2
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_copy_chunk_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Deserialize a size string like "64MB" or "4GB" into bytes.
fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(u64),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Deserialize a comma separated path list or an array of paths.
fn deserialize_paths<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PathsValue {
        List(Vec<PathBuf>),
        String(String),
    }

    Ok(match PathsValue::deserialize(deserializer)? {
        PathsValue::List(paths) => paths,
        PathsValue::String(s) => parse_path_list(&s),
    })
}

/// Split a comma separated path list, dropping empty entries.
pub fn parse_path_list(s: &str) -> Vec<PathBuf> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Parse a size string like "64MB", "4GB", "1TB" into bytes.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: u64 = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> TierResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate TOML.
    pub fn parse(contents: &str) -> TierResult<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TierResult<()> {
        let storage = &self.storage;
        let migration = &self.migration;

        if storage.overflow_paths.is_empty() {
            return Err(TierError::Config(
                "at least one overflow path must be configured".to_string(),
            ));
        }

        if storage.home_capacity == HomeCapacity::Bytes(0) {
            return Err(TierError::Config("home_capacity must be positive".to_string()));
        }

        if storage.allocation_granularity == 0 {
            return Err(TierError::Config(
                "allocation_granularity must be positive".to_string(),
            ));
        }

        if storage.segment_size == 0 {
            return Err(TierError::Config("segment_size must be positive".to_string()));
        }

        if migration.copy_chunk_size == 0 {
            return Err(TierError::Config("copy_chunk_size must be positive".to_string()));
        }

        if migration.is_enabled() {
            if !(migration.threshold > 0.0 && migration.threshold <= 1.0) {
                return Err(TierError::Config(format!(
                    "threshold ({}) must be in (0, 1] or {} to disable migration",
                    migration.threshold, MIGRATION_DISABLED
                )));
            }
            let readmit = migration.readmit();
            if readmit < migration.threshold || readmit > 1.0 {
                return Err(TierError::Config(format!(
                    "readmit_threshold ({}) must be between threshold ({}) and 1",
                    readmit, migration.threshold
                )));
            }
        }

        Ok(())
    }
}
