//! Scheduler configuration.

use conveyor_core::task::Labels;
use conveyor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning parameters for one scheduler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long a claim stays valid without an extend call.
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,
    /// Interval of the lease sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Reclaims of an expired lease before the task fails with `AgentLost`.
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    /// Agent sessions not seen for this long are dropped.
    #[serde(default = "default_agent_session_timeout_secs")]
    pub agent_session_timeout_secs: u64,
    /// Labels applied to tasks that declare none.
    #[serde(default)]
    pub default_labels: Labels,
    /// Finished pipelines kept for late cancellation and requeue.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_lease_duration_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_max_requeues() -> u32 {
    3
}

fn default_agent_session_timeout_secs() -> u64 {
    300
}

fn default_history_limit() -> usize {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: default_lease_duration_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_requeues: default_max_requeues(),
            agent_session_timeout_secs: default_agent_session_timeout_secs(),
            default_labels: Labels::new(),
            history_limit: default_history_limit(),
        }
    }
}

impl SchedulerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn agent_session_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_session_timeout_secs)
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration_ms = lease.as_millis() as u64;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_requeues(mut self, max: u32) -> Self {
        self.max_requeues = max;
        self
    }

    pub fn with_agent_session_timeout(mut self, timeout: Duration) -> Self {
        self.agent_session_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_default_labels(mut self, labels: Labels) -> Self {
        self.default_labels = labels;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Reject settings that would make every lease expire immediately or
    /// spin the sweep loop.
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_ms == 0 {
            return Err(Error::Config("lease_duration_ms must be positive".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep_interval_ms must be positive".into()));
        }
        if self.history_limit == 0 {
            return Err(Error::Config("history_limit must be positive".into()));
        }
        if self.sweep_interval_ms > self.lease_duration_ms {
            return Err(Error::Config(format!(
                "sweep_interval_ms ({}) exceeds lease_duration_ms ({})",
                self.sweep_interval_ms, self.lease_duration_ms
            )));
        }
        Ok(())
    }
}

/// Parse `key=value` label filters as given on the command line.
pub fn parse_labels<S: AsRef<str>>(raw: &[S]) -> Result<Labels> {
    let mut labels = Labels::with_capacity(raw.len());
    for entry in raw {
        let entry = entry.as_ref();
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("invalid label filter: {entry}")))?;
        if name.is_empty() {
            return Err(Error::Config(format!("invalid label filter: {entry}")));
        }
        labels.insert(name.to_string(), value.to_string());
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.lease_duration(), Duration::from_secs(60));
        assert_eq!(config.sweep_interval(), Duration::from_millis(500));
        assert_eq!(config.max_requeues, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: SchedulerConfig =
            serde_yaml::from_str("max_requeues: 0\ndefault_labels:\n  platform: linux/amd64\n")
                .unwrap();
        assert_eq!(config.max_requeues, 0);
        assert_eq!(config.lease_duration_ms, 60_000);
        assert_eq!(config.default_labels["platform"], "linux/amd64");
    }

    #[test]
    fn test_sweep_slower_than_lease_is_rejected() {
        let config = SchedulerConfig::default()
            .with_lease_duration(Duration::from_millis(100))
            .with_sweep_interval(Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels(&["platform=linux/arm64", "repo=", "a=b=c"]).unwrap();
        assert_eq!(labels["platform"], "linux/arm64");
        assert_eq!(labels["repo"], "");
        assert_eq!(labels["a"], "b=c");

        let err = parse_labels(&["no-separator"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: invalid label filter: no-separator"
        );
        assert!(parse_labels(&["=value"]).is_err());
    }
}
