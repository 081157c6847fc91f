#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mesh::executor::{ActionError, RemediationBackend};
use mesh_config::{FileFormat, MeshConfig, RuleSetFile};
use uuid::Uuid;

/// Poll a condition (which may `.await`) for up to five seconds.
#[macro_export]
macro_rules! eventually {
    ($cond:expr) => {{
        let mut met = false;
        for _ in 0..500 {
            if $cond {
                met = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(met, "condition not met: {}", stringify!($cond));
    }};
}

pub const RULES: &str = r#"
version: "it-1"
rules:
  - id: flood
    description: more than 10 events in 5 seconds
    severity: high
    trigger: { type: rate_limit, window_secs: 5, max_hits: 10 }
  - id: rce
    severity: critical
    category: intrusion
    trigger: { type: pattern, pattern: "rm\\s+-rf" }
"#;

pub fn rules() -> RuleSetFile {
    RuleSetFile::from_str_as(RULES, FileFormat::Yaml).unwrap()
}

/// Fast timers so scenarios settle in milliseconds.
pub fn config(dir: &Path) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.collector.workers = 2;
    config.audit.path = dir.join("audit.jsonl");
    config.correlator.window_ms = 100;
    config.correlator.flush_interval_ms = 10;
    config.liveness.check_interval_ms = 20;
    config.liveness.pulse_timeout_secs = 1;
    config.liveness.stale_threshold_secs = 2;
    config.executor.initial_backoff_ms = 1;
    config.executor.max_backoff_ms = 5;
    config.executor.config_dir = dir.join("conf.d");
    config
}

/// Span of one backend call.
#[derive(Debug, Clone)]
pub struct Call {
    pub action: &'static str,
    pub entity: String,
    pub started: Instant,
    pub ended: Instant,
}

/// Backend that records every call and can be told to fail restarts.
#[derive(Default)]
pub struct RecordingBackend {
    pub restarts: AtomicU32,
    pub reloads: AtomicU32,
    pub notifies: AtomicU32,
    pub fail_restarts: AtomicBool,
    pub delay_ms: AtomicU32,
    pub calls: Mutex<Vec<Call>>,
}

impl RecordingBackend {
    pub fn failing() -> Self {
        let backend = Self::default();
        backend.fail_restarts.store(true, Ordering::SeqCst);
        backend
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn notifies(&self) -> u32 {
        self.notifies.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, action: &'static str, entity: &str) {
        let started = Instant::now();
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        self.calls.lock().unwrap().push(Call {
            action,
            entity: entity.to_string(),
            started,
            ended: Instant::now(),
        });
    }
}

#[async_trait]
impl RemediationBackend for RecordingBackend {
    async fn restart(&self, entity: &str) -> Result<(), ActionError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.record("restart", entity).await;
        if self.fail_restarts.load(Ordering::SeqCst) {
            return Err(ActionError::CommandFailed {
                entity: entity.to_string(),
                action: "restart",
                status: "exit status: 1".to_string(),
                stderr: "unit not found".to_string(),
            });
        }
        Ok(())
    }

    async fn reload(&self, entity: &str) -> Result<(), ActionError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        self.record("reload", entity).await;
        Ok(())
    }

    async fn edit_config(&self, entity: &str, _key: &str, _value: &str) -> Result<bool, ActionError> {
        self.record("config_edit", entity).await;
        Ok(true)
    }

    async fn notify(&self, entity: &str, _alert_id: Uuid, _message: &str) -> Result<(), ActionError> {
        self.notifies.fetch_add(1, Ordering::SeqCst);
        self.record("notify", entity).await;
        Ok(())
    }

    fn is_restarting(&self, _entity: &str) -> bool {
        false
    }
}
