use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Parameter bundle for one transport endpoint (producer or consumer).
///
/// Every field has a default so a config file only needs to name what it
/// changes. Consumers ignore the producer-only fields and vice versa.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(default = "defaults::ring_name")]
    pub ring_name: String,
    /// Directory holding segment files. `None` means `/dev/shm` (or the temp
    /// dir on hosts without it).
    #[serde(default)]
    pub shm_dir: Option<String>,
    /// Data area size in bytes. Must be a power of two.
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowMode,
    /// Fail publishes while no reader is attached instead of dropping the
    /// oldest records.
    #[serde(default)]
    pub require_readers: bool,
    #[serde(default = "defaults::spin_count")]
    pub spin_count: u32,
    /// Upper bound for one blocking wait. `None` waits indefinitely.
    #[serde(default)]
    pub timeout_us: Option<u64>,
    /// Busy-spin without yielding the CPU between polls.
    #[serde(default)]
    pub low_latency: bool,
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A producer is considered silent after `liveness_factor` heartbeat
    /// intervals without any record.
    #[serde(default = "defaults::liveness_factor")]
    pub liveness_factor: u32,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    /// Writer fails with "full" instead of overwriting unread records.
    #[default]
    Reject,
    /// Writer never waits; slow readers lose the oldest records.
    Overwrite,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

mod defaults {
    pub fn ring_name() -> String {
        "lithos_md_bus".into()
    }

    pub fn capacity() -> usize {
        1 << 20 // 1 MiB
    }

    pub fn spin_count() -> u32 {
        10_000
    }

    pub fn heartbeat_interval_ms() -> u64 {
        1_000
    }

    pub fn liveness_factor() -> u32 {
        2
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

/// Smallest ring the transport accepts (one cache line of data).
pub const MIN_CAPACITY: usize = 64;

impl TransportConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&toml_to_str)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: TransportConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_name.is_empty() || self.ring_name.contains('/') {
            return Err(ConfigError::Invalid {
                field: "ring_name",
                reason: format!("{:?} is not a valid segment name", self.ring_name),
            });
        }
        if !self.capacity.is_power_of_two() || self.capacity < MIN_CAPACITY {
            return Err(ConfigError::Invalid {
                field: "capacity",
                reason: format!(
                    "{} must be a power of two and at least {MIN_CAPACITY}",
                    self.capacity
                ),
            });
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_ms",
                reason: "must be non-zero".into(),
            });
        }
        if self.liveness_factor == 0 {
            return Err(ConfigError::Invalid {
                field: "liveness_factor",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_us.map(Duration::from_micros)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence longer than this marks the producer as dead.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.liveness_factor
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ring_name: defaults::ring_name(),
            shm_dir: None,
            capacity: defaults::capacity(),
            overflow_policy: OverflowMode::default(),
            require_readers: false,
            spin_count: defaults::spin_count(),
            timeout_us: None,
            low_latency: false,
            heartbeat_interval_ms: defaults::heartbeat_interval_ms(),
            liveness_factor: defaults::liveness_factor(),
            log_level: defaults::log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = TransportConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, TransportConfig::default());
        assert_eq!(cfg.liveness_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn parses_every_field() {
        let cfg = TransportConfig::from_toml_str(
            r#"
            ring_name = "md_feed_a"
            shm_dir = "/tmp/lithos"
            capacity = 8192
            overflow_policy = "overwrite"
            require_readers = true
            spin_count = 64
            timeout_us = 500
            low_latency = true
            heartbeat_interval_ms = 250
            liveness_factor = 3
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ring_name, "md_feed_a");
        assert_eq!(cfg.shm_dir.as_deref(), Some("/tmp/lithos"));
        assert_eq!(cfg.capacity, 8192);
        assert_eq!(cfg.overflow_policy, OverflowMode::Overwrite);
        assert!(cfg.require_readers);
        assert_eq!(cfg.timeout(), Some(Duration::from_micros(500)));
        assert!(cfg.low_latency);
        assert_eq!(cfg.liveness_timeout(), Duration::from_millis(750));
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let err = TransportConfig::from_toml_str("capacity = 1000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "capacity", .. }));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = TransportConfig::from_toml_str("capacty = 1024").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = TransportConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
