//! Pipeline settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::rules::ActionTemplate;
use crate::{read_file, ConfigError};

/// Top-level mesh configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub collector: CollectorConfig,
    pub correlator: CorrelatorConfig,
    pub bus: BusConfig,
    pub audit: AuditConfig,
    pub liveness: LivenessConfig,
    pub anomaly: AnomalyConfig,
    pub executor: ExecutorConfig,
    pub planner: PlannerConfig,
    pub server: ServerConfig,
    /// Rule file; the built-in default rules are used when unset
    pub rules_path: Option<PathBuf>,
}

impl MeshConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |value: usize, name: &str| {
            if value == 0 {
                Err(ConfigError::Invalid(format!("{name} must be > 0")))
            } else {
                Ok(())
            }
        };

        positive(self.collector.queue_capacity, "collector.queue_capacity")?;
        positive(self.collector.workers, "collector.workers")?;
        positive(
            self.collector.worker_queue_capacity,
            "collector.worker_queue_capacity",
        )?;
        positive(self.bus.subscriber_queue_capacity, "bus.subscriber_queue_capacity")?;
        positive(self.audit.queue_capacity, "audit.queue_capacity")?;
        positive(self.anomaly.window_size, "anomaly.window_size")?;
        positive(self.anomaly.max_series, "anomaly.max_series")?;

        if self.correlator.window_ms == 0 {
            return Err(ConfigError::Invalid(
                "correlator.window_ms must be > 0".to_string(),
            ));
        }
        if self.correlator.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "correlator.flush_interval_ms must be > 0".to_string(),
            ));
        }
        if self.liveness.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "liveness.check_interval_ms must be > 0".to_string(),
            ));
        }
        if self.liveness.stale_threshold_secs < self.liveness.pulse_timeout_secs {
            return Err(ConfigError::Invalid(
                "liveness.stale_threshold_secs must be >= pulse_timeout_secs".to_string(),
            ));
        }
        for (entity, overrides) in &self.liveness.entities {
            let timeout = overrides
                .pulse_timeout_secs
                .unwrap_or(self.liveness.pulse_timeout_secs);
            let stale = overrides
                .stale_threshold_secs
                .unwrap_or(self.liveness.stale_threshold_secs);
            if stale < timeout {
                return Err(ConfigError::Invalid(format!(
                    "liveness.entities.{entity}: stale threshold below pulse timeout"
                )));
            }
        }
        if self.executor.backoff_multiplier.is_nan() || self.executor.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "executor.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.executor.max_backoff_ms < self.executor.initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "executor.max_backoff_ms must be >= initial_backoff_ms".to_string(),
            ));
        }
        if self.anomaly.z_threshold.is_nan() || self.anomaly.z_threshold <= 0.0 {
            return Err(ConfigError::Invalid(
                "anomaly.z_threshold must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Event collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Ingestion queue size before drop-oldest kicks in
    pub queue_capacity: usize,
    /// Detection workers, events sharded by entity hash
    pub workers: usize,
    /// Per-worker queue size
    pub worker_queue_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            workers: 4,
            worker_queue_capacity: 1024,
        }
    }
}

/// Correlator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Correlation window
    pub window_ms: u64,
    /// Also key buffers by finding category
    pub group_by_category: bool,
    /// How often expired buffers are flushed
    pub flush_interval_ms: u64,
    /// A buffer holding this many findings flushes early
    pub max_findings_per_buffer: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            window_ms: 3_000,
            group_by_category: false,
            flush_interval_ms: 250,
            max_findings_per_buffer: 1_000,
        }
    }
}

/// Alert bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub subscriber_queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 1024,
        }
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSONL file, appended to across restarts
    pub path: PathBuf,
    /// Writer queue; producers wait when it is full
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mesh-audit.jsonl"),
            queue_capacity: 4096,
        }
    }
}

/// Liveness supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Timer period for staleness checks
    pub check_interval_ms: u64,
    /// Silence after which an entity is SUSPECT
    pub pulse_timeout_secs: u64,
    /// Silence after which an entity is STALE
    pub stale_threshold_secs: u64,
    /// Automated restarts allowed before suppression
    pub restart_cap: u32,
    /// Per-entity overrides
    pub entities: HashMap<String, EntityLivenessConfig>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1_000,
            pulse_timeout_secs: 30,
            stale_threshold_secs: 90,
            restart_cap: 3,
            entities: HashMap::new(),
        }
    }
}

/// Per-entity liveness thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityLivenessConfig {
    pub pulse_timeout_secs: Option<u64>,
    pub stale_threshold_secs: Option<u64>,
}

/// Anomaly scorer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Samples kept per series
    pub window_size: usize,
    /// Samples required before a series can flag anything
    pub min_samples: usize,
    /// Series idle this long are dropped
    pub idle_ttl_secs: u64,
    /// Upper bound on tracked series
    pub max_series: usize,
    /// Default z-score threshold for watched metrics
    pub z_threshold: f64,
    /// Metrics scored on every event that carries them
    pub metrics: Vec<WatchedMetric>,
    /// Score per-entity event bursts
    pub burst_detection: bool,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 120,
            min_samples: 30,
            idle_ttl_secs: 900,
            max_series: 10_000,
            z_threshold: 3.0,
            metrics: vec![WatchedMetric {
                name: "latency_ms".to_string(),
                bound: None,
                baseline: None,
                threshold: None,
            }],
            burst_detection: false,
        }
    }
}

/// A metric the scorer watches without a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedMetric {
    pub name: String,
    /// Fixed upper bound, flagged regardless of history
    #[serde(default)]
    pub bound: Option<f64>,
    /// Static baseline used during cold start
    #[serde(default)]
    pub baseline: Option<Baseline>,
    /// Overrides `z_threshold`
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Static mean/standard deviation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std: f64,
}

/// Action executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Retries after the first attempt of an action
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// How long a restarted entity counts as restarting
    pub restart_grace_secs: u64,
    /// Directory holding `<entity>.env` configuration files
    pub config_dir: PathBuf,
    /// Operator-provided restart/reload commands per entity
    pub entities: HashMap<String, EntityCommands>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            restart_grace_secs: 30,
            config_dir: PathBuf::from("mesh-config.d"),
            entities: HashMap::new(),
        }
    }
}

/// Commands used to restart and reload one entity (argv form).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityCommands {
    pub restart: Vec<String>,
    pub reload: Vec<String>,
}

/// Patch planner settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Category → ordered action templates, replacing the severity table
    pub category_overrides: HashMap<String, Vec<ActionTemplate>>,
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Requests running longer than this get a 408
    pub request_timeout_secs: u64,
    /// Largest accepted request body
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8088".to_string(),
            request_timeout_secs: 30,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        MeshConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.yaml");
        std::fs::write(
            &path,
            r"
liveness:
  pulse_timeout_secs: 5
  stale_threshold_secs: 15
  entities:
    api:
      stale_threshold_secs: 60
executor:
  max_retries: 4
  entities:
    api:
      restart: [systemctl, restart, api]
",
        )
        .unwrap();

        let config = MeshConfig::load(&path).unwrap();
        assert_eq!(config.liveness.pulse_timeout_secs, 5);
        assert_eq!(config.liveness.restart_cap, 3);
        assert_eq!(config.executor.max_retries, 4);
        assert_eq!(
            config.executor.entities["api"].restart,
            vec!["systemctl", "restart", "api"]
        );
        assert!(config.executor.entities["api"].reload.is_empty());
        assert_eq!(config.collector.workers, 4);
    }

    #[test]
    fn test_inverted_liveness_thresholds_rejected() {
        let mut config = MeshConfig::default();
        config.liveness.pulse_timeout_secs = 100;
        config.liveness.stale_threshold_secs = 10;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.liveness.entities.insert(
            "db".to_string(),
            EntityLivenessConfig {
                pulse_timeout_secs: Some(120),
                stale_threshold_secs: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = MeshConfig::default();
        config.collector.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_backoff_bounds() {
        let mut config = MeshConfig::default();
        config.executor.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.executor.max_backoff_ms = 10;
        assert!(config.validate().is_err());
    }
}
