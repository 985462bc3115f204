//! Server configuration loaded from YAML.

use anyhow::Context;
use conveyor_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// How often queue counts are checked and logged when they change.
    #[serde(default = "default_info_interval_ms")]
    pub info_interval_ms: u64,
}

fn default_info_interval_ms() -> u64 {
    500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            log: LogConfig::default(),
            info_interval_ms: default_info_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn info_interval(&self) -> Duration {
        Duration::from_millis(self.info_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.info_interval(), Duration::from_millis(500));
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.scheduler.max_requeues, 3);
    }

    #[test]
    fn test_nested_scheduler_section() {
        let yaml = r#"
scheduler:
  lease_duration_ms: 30000
  max_requeues: 1
  default_labels:
    platform: linux/arm64
log:
  level: conveyor_scheduler=debug
  format: json
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.scheduler.lease_duration(), Duration::from_secs(30));
        assert_eq!(config.scheduler.max_requeues, 1);
        assert_eq!(config.scheduler.sweep_interval_ms, 500);
        assert_eq!(config.scheduler.default_labels["platform"], "linux/arm64");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        assert!(ServerConfig::from_yaml("log:\n  format: xml\n").is_err());
    }
}
