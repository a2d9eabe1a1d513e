//! Runtime configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConclaveError;

/// Top-level configuration for an orchestrator instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConclaveConfig {
    pub executor: ExecutorConfig,
    pub streams: StreamConfig,
    pub hierarchy: HierarchyConfig,
}

impl ConclaveConfig {
    /// Parse configuration from a JSON document. Missing fields take defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConclaveError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConclaveError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConclaveError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConclaveError> {
        if self.streams.capacity == 0 {
            return Err(ConclaveError::ConfigError(
                "streams.capacity must be at least 1".into(),
            ));
        }
        if self.streams.heartbeat_interval_secs == 0 {
            return Err(ConclaveError::ConfigError(
                "streams.heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        if self.hierarchy.max_children_per_parent == 0 {
            return Err(ConclaveError::ConfigError(
                "hierarchy.max_children_per_parent must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Plan execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Deadline for a whole parallel group. Disabled by default.
    pub group_timeout_secs: Option<u64>,
    /// Consult the policy gate before each dispatch (if one is installed)
    pub policy_gating: bool,
    /// Keyword the default success criterion looks for
    pub success_keyword: String,
}

impl ExecutorConfig {
    pub fn group_timeout(&self) -> Option<Duration> {
        self.group_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            group_timeout_secs: None,
            policy_gating: true,
            success_keyword: "success".into(),
        }
    }
}

/// What `send` does when a stream's queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for the consumer to make room
    #[default]
    Block,
    /// Evict the oldest queued event
    DropOldest,
    /// Refuse the new event
    Reject,
}

/// Event channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Maximum queued events per stream
    pub capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Bounded wait before a consumer emits a heartbeat
    pub heartbeat_interval_secs: u64,
    /// Consecutive heartbeats tolerated before the stream is terminated with
    /// an error. `None` keeps an idle stream alive forever.
    pub max_idle_heartbeats: Option<u32>,
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            backpressure: BackpressurePolicy::Block,
            heartbeat_interval_secs: 30,
            max_idle_heartbeats: None,
        }
    }
}

/// Agent hierarchy limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    pub max_depth: usize,
    pub max_children_per_parent: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_children_per_parent: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ConclaveConfig::default();
        assert_eq!(config.hierarchy.max_depth, 10);
        assert_eq!(config.hierarchy.max_children_per_parent, 5);
        assert_eq!(config.streams.capacity, 256);
        assert_eq!(config.streams.backpressure, BackpressurePolicy::Block);
        assert!(config.executor.group_timeout().is_none());
        assert_eq!(config.executor.success_keyword, "success");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = ConclaveConfig::from_json_str(
            r#"{"streams": {"backpressure": "drop_oldest", "max_idle_heartbeats": 0}}"#,
        )
        .unwrap();

        assert_eq!(config.streams.backpressure, BackpressurePolicy::DropOldest);
        assert_eq!(config.streams.max_idle_heartbeats, Some(0));
        assert_eq!(config.streams.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.hierarchy, HierarchyConfig::default());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = ConclaveConfig::from_json_str(r#"{"streams": {"capacity": 0}}"#).unwrap_err();
        assert!(matches!(err, ConclaveError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = ConclaveConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConclaveError::ConfigError(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"executor": {{"group_timeout_secs": 45}}}}"#).unwrap();

        let config = ConclaveConfig::from_file(file.path()).unwrap();
        assert_eq!(config.executor.group_timeout(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_from_missing_file() {
        let err = ConclaveConfig::from_file("/nonexistent/conclave.json").unwrap_err();
        assert!(matches!(err, ConclaveError::Io(_)));
    }
}
