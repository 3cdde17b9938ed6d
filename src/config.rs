//! Engine configuration.
//!
//! Loaded from TOML (`EngineConfig::from_file`) and then overridden by
//! environment variables:
//!
//! | Variable                   | Field                          |
//! |----------------------------|--------------------------------|
//! | `FLOWCORE_BROKER_ID`       | `node.broker_id`               |
//! | `FLOWCORE_LOG_DIR`         | `log.dir`                      |
//! | `FLOWCORE_SEGMENT_SIZE`    | `log.segment_size`             |
//! | `FLOWCORE_DISK_BUDGET`     | `log.disk_budget`              |
//! | `FLOWCORE_PUSH_TIMEOUT_MS` | `distribution.push_timeout`    |
//! | `FLOWCORE_LOG_LEVEL`       | `logging.level`                |
//! | `FLOWCORE_LOG_JSON`        | `logging.json`                 |
//!
//! Durations are written as integer milliseconds.

use crate::storage::segment::{FRAME_OVERHEAD, SEGMENT_HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub node: NodeConfig,
    pub log: LogConfig,
    pub distribution: DistributionConfig,
    pub snapshot: SnapshotConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub broker_id: u32,
    pub partition_count: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            broker_id: 0,
            partition_count: 3,
        }
    }
}

/// Segmented log storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory holding `seg-NN.data` files
    pub dir: PathBuf,
    /// Fixed capacity of every segment file, header included
    pub segment_size: u64,
    /// Total bytes the log may occupy on disk
    pub disk_budget: u64,
    /// Allocation fails when less than this would remain free afterwards
    pub min_free_space: u64,
    /// Sleep before retrying a block while the next segment is still NEW
    #[serde(with = "duration_millis")]
    pub allocation_backoff: Duration,
    /// Maximum blocks drained from the write buffer per batch
    pub max_batch: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: PathBuf::from("/tmp/flowcore/log"),
            segment_size: 128 * 1024 * 1024,
            disk_budget: 16 * 1024 * 1024 * 1024,
            min_free_space: 0,
            allocation_backoff: Duration::from_millis(1),
            max_batch: 64,
        }
    }
}

impl LogConfig {
    /// Small segments so rotation happens within a handful of appends.
    pub fn test() -> Self {
        LogConfig {
            dir: PathBuf::from("/tmp/flowcore-test/log"),
            segment_size: 4 * 1024,
            disk_budget: 4 * 1024 * 1024,
            min_free_space: 0,
            allocation_backoff: Duration::from_millis(1),
            max_batch: 8,
        }
    }

    /// Bytes available for frames in one segment.
    pub fn usable_segment_size(&self) -> u64 {
        self.segment_size.saturating_sub(SEGMENT_HEADER_SIZE as u64)
    }
}

/// Cross-partition command distribution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    #[serde(with = "duration_millis")]
    pub push_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,
    /// How often retriable distributions are re-pushed
    #[serde(with = "duration_millis")]
    pub redistribution_interval: Duration,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        DistributionConfig {
            push_timeout: Duration::from_secs(15),
            retry_backoff: Duration::from_millis(100),
            redistribution_interval: Duration::from_secs(10),
        }
    }
}

impl DistributionConfig {
    pub fn test() -> Self {
        DistributionConfig {
            push_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(10),
            redistribution_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub chunk_size: usize,
    /// Upper bound on waiting for the consumer thread during close
    #[serde(with = "duration_millis")]
    pub close_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            chunk_size: 512 * 1024,
            close_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    pub fn test() -> Self {
        EngineConfig {
            node: NodeConfig::default(),
            log: LogConfig::test(),
            distribution: DistributionConfig::test(),
            snapshot: SnapshotConfig {
                chunk_size: 1024,
                close_timeout: Duration::from_millis(500),
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `FLOWCORE_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (env in production, a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidOverride {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("FLOWCORE_BROKER_ID") {
            self.node.broker_id = parse("FLOWCORE_BROKER_ID", v)?;
        }
        if let Some(v) = lookup("FLOWCORE_LOG_DIR") {
            self.log.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLOWCORE_SEGMENT_SIZE") {
            self.log.segment_size = parse("FLOWCORE_SEGMENT_SIZE", v)?;
        }
        if let Some(v) = lookup("FLOWCORE_DISK_BUDGET") {
            self.log.disk_budget = parse("FLOWCORE_DISK_BUDGET", v)?;
        }
        if let Some(v) = lookup("FLOWCORE_PUSH_TIMEOUT_MS") {
            self.distribution.push_timeout =
                Duration::from_millis(parse("FLOWCORE_PUSH_TIMEOUT_MS", v)?);
        }
        if let Some(v) = lookup("FLOWCORE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("FLOWCORE_LOG_JSON") {
            self.logging.json = v == "1" || v.eq_ignore_ascii_case("true");
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let min_segment = (SEGMENT_HEADER_SIZE + FRAME_OVERHEAD) as u64 + 1;
        if self.log.segment_size < min_segment {
            return Err(ConfigError::Invalid(format!(
                "log.segment_size must be at least {} bytes",
                min_segment
            )));
        }
        if self.log.segment_size > u32::MAX as u64 {
            return Err(ConfigError::Invalid(
                "log.segment_size must fit in 32-bit offsets".to_string(),
            ));
        }
        if self.log.disk_budget < self.log.segment_size {
            return Err(ConfigError::Invalid(
                "log.disk_budget must hold at least one segment".to_string(),
            ));
        }
        if self.log.max_batch == 0 {
            return Err(ConfigError::Invalid("log.max_batch must be > 0".to_string()));
        }
        if self.snapshot.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "snapshot.chunk_size must be > 0".to_string(),
            ));
        }
        if self.node.partition_count == 0 {
            return Err(ConfigError::Invalid(
                "node.partition_count must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.distribution.push_timeout, Duration::from_secs(15));
        assert_eq!(config.distribution.retry_backoff, Duration::from_millis(100));
        assert_eq!(config.snapshot.close_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
        assert!(EngineConfig::test().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [log]
            segment_size = 8192
            disk_budget = 81920

            [distribution]
            retry_backoff = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.log.segment_size, 8192);
        assert_eq!(config.distribution.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.distribution.push_timeout, Duration::from_secs(15));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig::test();
        let text = toml::to_string(&config).unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.log.segment_size, config.log.segment_size);
        assert_eq!(
            parsed.distribution.redistribution_interval,
            config.distribution.redistribution_interval
        );
    }

    #[test]
    fn test_rejects_tiny_segment() {
        let err = EngineConfig::from_toml_str("[log]\nsegment_size = 16\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("FLOWCORE_BROKER_ID", "4"),
            ("FLOWCORE_PUSH_TIMEOUT_MS", "500"),
            ("FLOWCORE_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.node.broker_id, 4);
        assert_eq!(config.distribution.push_timeout, Duration::from_millis(500));
        assert!(config.logging.json);
    }

    #[test]
    fn test_bad_override() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|k| (k == "FLOWCORE_BROKER_ID").then(|| "abc".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_json_serialization() {
        let json = serde_json::to_string(&DistributionConfig::default()).unwrap();
        assert!(json.contains("\"push_timeout\":15000"));
    }
}
