//! `config/bridge_config.json`: runtime settings of one bridge root

use chrono::{DateTime, Utc};
use filebridge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const CONFIG_VERSION: &str = "1.0.0";

/// On-disk bridge configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub settings: BridgeSettings,
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            created_at: Utc::now(),
            settings: BridgeSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a configuration document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(raw)
            .map_err(|e| Error::configuration(format!("malformed bridge configuration: {e}")))?;
        config.settings.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Every knob is defaulted so older or partial files keep loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub auto_cleanup: bool,
    pub max_task_retention_days: u32,
    pub log_level: String,
    pub worker_count: usize,
    pub execution_timeout_secs: u64,
    pub dependency_timeout_secs: u64,
    pub scan_interval_ms: u64,
    pub cache_default_ttl_secs: u64,
    pub cache_cleanup_interval_secs: u64,
    pub stale_processing_secs: u64,
    /// Extra attempts after a handler error or timeout; zero disables retries
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    /// Seconds between background recovery passes; zero disables them
    pub recovery_interval_secs: u64,
    pub max_file_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            auto_cleanup: true,
            max_task_retention_days: 30,
            log_level: "INFO".to_string(),
            worker_count: 4,
            execution_timeout_secs: 300,
            dependency_timeout_secs: 600,
            scan_interval_ms: 2_000,
            cache_default_ttl_secs: 3_600,
            cache_cleanup_interval_secs: 300,
            stale_processing_secs: 3_600,
            max_retries: 0,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 30_000,
            recovery_interval_secs: 300,
            max_file_size_bytes: 10 * 1024 * 1024,
            allowed_extensions: [
                "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "c", "h", "cpp", "hpp",
                "md", "txt", "json", "toml", "yaml", "yml", "html", "css", "sql", "sh",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl BridgeSettings {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::configuration("worker_count must be at least 1"));
        }
        if self.execution_timeout_secs == 0 {
            return Err(Error::configuration("execution_timeout_secs must be positive"));
        }
        if self.scan_interval_ms == 0 {
            return Err(Error::configuration("scan_interval_ms must be positive"));
        }
        if self.cache_cleanup_interval_secs == 0 {
            return Err(Error::configuration(
                "cache_cleanup_interval_secs must be positive",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::configuration("backoff_multiplier must be at least 1.0"));
        }
        if self.stale_processing_secs == 0 {
            return Err(Error::configuration("stale_processing_secs must be positive"));
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn cache_default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_default_ttl_secs)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_secs)
    }

    pub fn stale_processing(&self) -> Duration {
        Duration::from_secs(self.stale_processing_secs)
    }

    /// How often a task's claim is refreshed while it is in flight, well
    /// inside the stale threshold
    pub fn claim_heartbeat(&self) -> Duration {
        (self.stale_processing() / 4).max(Duration::from_secs(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_task_retention_days) * 24 * 60 * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_are_defaulted() {
        let raw = r#"{"version":"1.0.0","settings":{"auto_cleanup":false,"log_level":"DEBUG","max_cache_size_mb":100}}"#;
        let config = BridgeConfig::from_json(raw).unwrap();
        assert!(!config.settings.auto_cleanup);
        assert_eq!(config.settings.log_level, "DEBUG");
        assert_eq!(config.settings.max_task_retention_days, 30);
        assert_eq!(config.settings.worker_count, 4);
    }

    #[test]
    fn test_malformed_is_configuration_error() {
        let err = BridgeConfig::from_json("{ not json").unwrap_err();
        assert_eq!(err.kind(), filebridge_core::ErrorKind::Configuration);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let raw = r#"{"settings":{"worker_count":0}}"#;
        assert!(BridgeConfig::from_json(raw).is_err());
    }

    #[test]
    fn test_retry_settings() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.max_retries, 0);
        assert_eq!(settings.retry_delay(), Duration::from_secs(1));
        assert_eq!(settings.max_retry_delay(), Duration::from_secs(30));

        let raw = r#"{"settings":{"max_retries":2,"backoff_multiplier":0.5}}"#;
        let err = BridgeConfig::from_json(raw).unwrap_err();
        assert!(err.to_string().contains("backoff_multiplier"));

        let raw = r#"{"settings":{"max_retries":2,"retry_delay_ms":50}}"#;
        let config = BridgeConfig::from_json(raw).unwrap();
        assert_eq!(config.settings.max_retries, 2);
        assert_eq!(config.settings.retry_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_claim_heartbeat_stays_inside_stale_threshold() {
        let mut settings = BridgeSettings::default();
        assert_eq!(settings.claim_heartbeat(), Duration::from_secs(900));
        settings.stale_processing_secs = 2;
        assert_eq!(settings.claim_heartbeat(), Duration::from_secs(1));
    }

    #[test]
    fn test_durations() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.dependency_timeout(), Duration::from_secs(600));
        assert_eq!(settings.retention(), Duration::from_secs(30 * 86_400));
    }
}
