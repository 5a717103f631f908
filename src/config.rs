use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use anyhow::Result;
use tokio::fs;

use crate::engine::{pattern_payload, EngineConfig, DEFAULT_PAYLOAD_SIZE};
use crate::resolver::FamilyPreference;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PingerConfig {
    pub host: String,
    #[serde(default)]
    pub family: FamilyPreference,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default = "default_enable_latency_history")]
    pub enable_latency_history: bool,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_payload_size() -> usize {
    DEFAULT_PAYLOAD_SIZE
}

fn default_reply_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enable_latency_history() -> bool {
    false // Current RTT gauge only
}

impl PingerConfig {
    pub async fn load(file_path: &str) -> Result<Self> {
        if !Path::new(file_path).exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", file_path));
        }

        let content = fs::read_to_string(file_path).await?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: PingerConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow::anyhow!("host must not be empty"));
        }
        if self.interval_ms == 0 {
            return Err(anyhow::anyhow!("interval_ms must be greater than zero"));
        }
        self.get_tracing_level().map(|_| ())
    }

    /// Get the log level as a tracing::Level
    pub fn get_tracing_level(&self) -> Result<tracing::Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(tracing::Level::TRACE),
            "debug" => Ok(tracing::Level::DEBUG),
            "info" => Ok(tracing::Level::INFO),
            "warn" | "warning" => Ok(tracing::Level::WARN),
            "error" => Ok(tracing::Level::ERROR),
            _ => Err(anyhow::anyhow!("Invalid log level: {}. Valid levels are: trace, debug, info, warn, error", self.log_level))
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            interval: Duration::from_millis(self.interval_ms),
            payload: pattern_payload(self.payload_size),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = PingerConfig::parse(r#"{ "host": "example.com" }"#).unwrap();
        assert_eq!(config.family, FamilyPreference::Any);
        assert_eq!(config.get_tracing_level().unwrap(), tracing::Level::INFO);

        let engine = config.engine_config();
        assert_eq!(engine.interval, Duration::from_secs(1));
        assert_eq!(engine.payload.len(), 56);
        assert_eq!(engine.reply_timeout, Duration::from_secs(10));
    }

    #[test]
    fn full_config() {
        let config = PingerConfig::parse(
            r#"{
                "host": "2001:db8::1",
                "family": "ipv6",
                "interval_ms": 250,
                "payload_size": 0,
                "log_level": "WARNING",
                "metrics_port": 9100,
                "enable_latency_history": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.family, FamilyPreference::ForceIpv6);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.get_tracing_level().unwrap(), tracing::Level::WARN);
        assert_eq!(config.engine_config().interval, Duration::from_millis(250));
        assert!(config.engine_config().payload.is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(PingerConfig::parse(r#"{ "host": "" }"#).is_err());
        assert!(PingerConfig::parse(r#"{ "host": "a", "interval_ms": 0 }"#).is_err());
        assert!(PingerConfig::parse(r#"{ "host": "a", "log_level": "loud" }"#).is_err());
        assert!(PingerConfig::parse(r#"{ "host": "a", "family": "ipx" }"#).is_err());
    }

    #[tokio::test]
    async fn missing_file() {
        let err = PingerConfig::load("/nonexistent/ping.json").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
