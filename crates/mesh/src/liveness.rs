//! Liveness supervisor.
//!
//! Tracks one record per entity that has sent a pulse or been restarted:
//! `HEALTHY → SUSPECT` once the pulse timeout passes, `→ STALE` once the stale
//! threshold passes. Entering STALE raises one heartbeat alert per outage; the
//! next pulse returns the entity to HEALTHY and resolves that alert.
//!
//! The supervisor also owns the restart budget. Once an entity has used
//! `restart_cap` automated restarts, further restarts are suppressed until an
//! operator resets it. Restart targets that never pulsed get a record too,
//! so their budget shows up in the entity listing and can be reset; they
//! carry no `last_pulse_at` and are skipped by the staleness check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use mesh_config::LivenessConfig;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertStatus, CATEGORY_HEARTBEAT, CATEGORY_MANUAL_INTERVENTION};
use crate::bus::AlertBus;
use crate::error::MeshError;
use crate::executor::RestartGate;
use crate::metrics::HealthMetrics;
use crate::rules::LivenessPolicy;
use crate::Severity;

const DEFAULT_RULE_ID: &str = "liveness";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityState {
    Healthy,
    Suspect,
    Stale,
}

/// Liveness and restart bookkeeping for one entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityHealthRecord {
    pub entity_name: String,
    /// `None` until the first pulse, e.g. for an entity only known as a
    /// restart target; such entities are never checked
    pub last_pulse_at: Option<DateTime<Utc>>,
    pub consecutive_misses: u32,
    pub restart_count: u32,
    pub state: EntityState,
    pub suppressed: bool,
    /// Heartbeat alert raised for the current outage
    pub open_alert: Option<Uuid>,
}

impl EntityHealthRecord {
    fn new(entity: &str) -> Self {
        Self {
            entity_name: entity.to_string(),
            last_pulse_at: None,
            consecutive_misses: 0,
            restart_count: 0,
            state: EntityState::Healthy,
            suppressed: false,
            open_alert: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Thresholds {
    timeout: TimeDelta,
    stale: TimeDelta,
    severity: Severity,
    rule_id: String,
}

pub struct LivenessSupervisor {
    config: LivenessConfig,
    policies: RwLock<Vec<LivenessPolicy>>,
    records: Mutex<HashMap<String, EntityHealthRecord>>,
    bus: Arc<AlertBus>,
    metrics: Arc<HealthMetrics>,
}

impl LivenessSupervisor {
    #[must_use]
    pub fn new(config: LivenessConfig, bus: Arc<AlertBus>, metrics: Arc<HealthMetrics>) -> Self {
        Self {
            config,
            policies: RwLock::new(Vec::new()),
            records: Mutex::new(HashMap::new()),
            bus,
            metrics,
        }
    }

    /// Replace the `heartbeat_gap` policies taken from the rule set.
    pub fn set_policies(&self, policies: Vec<LivenessPolicy>) {
        debug!(count = policies.len(), "Liveness policies updated");
        *self.policies.write().unwrap_or_else(PoisonError::into_inner) = policies;
    }

    /// Effective thresholds. Entity config beats an entity-specific rule,
    /// which beats a global rule, which beats the config defaults.
    fn thresholds(&self, entity: &str) -> Thresholds {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        let policy = policies
            .iter()
            .find(|p| p.entity.as_deref() == Some(entity))
            .or_else(|| policies.iter().find(|p| p.entity.is_none()));

        let mut stale_secs = policy.map_or(self.config.stale_threshold_secs, |p| p.max_gap_secs);
        let mut timeout_secs = self.config.pulse_timeout_secs;
        if let Some(overrides) = self.config.entities.get(entity) {
            stale_secs = overrides.stale_threshold_secs.unwrap_or(stale_secs);
            timeout_secs = overrides.pulse_timeout_secs.unwrap_or(timeout_secs);
        }

        Thresholds {
            timeout: crate::secs(timeout_secs.min(stale_secs)),
            stale: crate::secs(stale_secs),
            severity: policy.map_or(Severity::High, |p| p.severity),
            rule_id: policy.map_or_else(|| DEFAULT_RULE_ID.to_string(), |p| p.rule_id.clone()),
        }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, EntityHealthRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a pulse. Any state returns to HEALTHY and an open heartbeat
    /// alert is resolved.
    pub async fn pulse(&self, entity: &str, at: DateTime<Utc>) {
        let resolved = {
            let mut records = self.records();
            let record = records
                .entry(entity.to_string())
                .or_insert_with(|| EntityHealthRecord::new(entity));
            if record.state != EntityState::Healthy {
                info!(
                    entity,
                    from = ?record.state,
                    misses = record.consecutive_misses,
                    "Entity back to healthy"
                );
            }
            record.last_pulse_at = Some(record.last_pulse_at.map_or(at, |last| last.max(at)));
            record.consecutive_misses = 0;
            record.state = EntityState::Healthy;
            record.open_alert.take()
        };

        if let Some(alert_id) = resolved {
            self.resolve(alert_id, entity).await;
        }
    }

    async fn resolve(&self, alert_id: Uuid, entity: &str) {
        match self
            .bus
            .transition(alert_id, AlertStatus::Resolved, "pulse received")
            .await
        {
            Ok(_) => info!(entity, alert_id = %alert_id, "Heartbeat alert resolved by pulse"),
            Err(MeshError::InvalidTransition { from, .. }) => debug!(
                entity,
                alert_id = %alert_id,
                %from,
                "Heartbeat alert already closed"
            ),
            Err(e) => warn!(entity, alert_id = %alert_id, error = %e, "Failed to resolve heartbeat alert"),
        }
    }

    /// Advance every entity's state to `now`. Returns the heartbeat alerts
    /// raised by this check.
    pub async fn check(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut stale = Vec::new();
        {
            let mut records = self.records();
            for record in records.values_mut() {
                let Some(last) = record.last_pulse_at else {
                    continue;
                };
                let limits = self.thresholds(&record.entity_name);
                let silence = now - last;
                if silence < limits.timeout {
                    continue;
                }
                record.consecutive_misses = record.consecutive_misses.saturating_add(1);

                if silence >= limits.stale {
                    if record.state != EntityState::Stale {
                        record.state = EntityState::Stale;
                        stale.push((record.entity_name.clone(), last, silence, limits));
                    }
                } else if record.state == EntityState::Healthy {
                    record.state = EntityState::Suspect;
                    debug!(
                        entity = %record.entity_name,
                        silent_secs = silence.num_seconds(),
                        "Entity suspect"
                    );
                }
            }
        }

        let mut raised = Vec::new();
        for (entity, last, silence, limits) in stale {
            warn!(
                entity = %entity,
                silent_secs = silence.num_seconds(),
                "Entity stale, raising heartbeat alert"
            );
            let alert = Alert::synthetic(
                &entity,
                CATEGORY_HEARTBEAT,
                limits.severity,
                &limits.rule_id,
                format!("{entity} silent for {}s", silence.num_seconds()),
                json!({
                    "summary": format!("no pulse for {}s", silence.num_seconds()),
                    "last_pulse_at": last,
                    "stale_threshold_secs": limits.stale.num_seconds(),
                }),
            );
            match self.bus.publish(alert).await {
                Ok(alert) => {
                    raised.push(alert.id);
                    self.attach_alert(&entity, alert.id).await;
                }
                Err(e) => {
                    error!(entity = %entity, error = %e, "Failed to publish heartbeat alert");
                }
            }
        }
        raised
    }

    /// Link a freshly published heartbeat alert to its outage. A pulse may
    /// have landed while publishing, in which case the alert is resolved now.
    async fn attach_alert(&self, entity: &str, alert_id: Uuid) {
        let still_stale = {
            let mut records = self.records();
            match records.get_mut(entity) {
                Some(record) if record.state == EntityState::Stale => {
                    record.open_alert = Some(alert_id);
                    true
                }
                _ => false,
            }
        };
        if !still_stale {
            self.resolve(alert_id, entity).await;
        }
    }

    /// Spend one restart from the entity's budget. Exceeding the cap
    /// suppresses restarts and raises one manual-intervention alert.
    pub async fn authorize_restart(&self, entity: &str) -> bool {
        let exhausted_at = {
            let mut records = self.records();
            let record = records
                .entry(entity.to_string())
                .or_insert_with(|| EntityHealthRecord::new(entity));
            if record.suppressed {
                debug!(entity, "Restart suppressed");
                return false;
            }
            if record.restart_count < self.config.restart_cap {
                record.restart_count += 1;
                return true;
            }
            record.suppressed = true;
            record.restart_count
        };

        HealthMetrics::incr(&self.metrics.restarts_suppressed);
        error!(
            entity,
            restarts = exhausted_at,
            cap = self.config.restart_cap,
            "Restart cap reached, suppressing automated restarts"
        );
        let alert = Alert::synthetic(
            entity,
            CATEGORY_MANUAL_INTERVENTION,
            Severity::Critical,
            "restart-cap",
            format!("{entity} exhausted its {} automated restarts", self.config.restart_cap),
            json!({
                "summary": "restart cap reached, manual reset required",
                "restart_count": exhausted_at,
                "restart_cap": self.config.restart_cap,
            }),
        );
        if let Err(e) = self.bus.publish(alert).await {
            error!(entity, error = %e, "Failed to publish manual intervention alert");
        }
        false
    }

    /// Operator reset: clears suppression and the restart budget.
    /// Returns false for an unknown entity.
    pub fn reset(&self, entity: &str) -> bool {
        let mut records = self.records();
        let Some(record) = records.get_mut(entity) else {
            return false;
        };
        record.restart_count = 0;
        record.suppressed = false;
        info!(entity, "Restart budget reset");
        true
    }

    #[must_use]
    pub fn record(&self, entity: &str) -> Option<EntityHealthRecord> {
        self.records().get(entity).cloned()
    }

    /// All records, sorted by entity name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EntityHealthRecord> {
        let mut records: Vec<EntityHealthRecord> = self.records().values().cloned().collect();
        records.sort_by(|a, b| a.entity_name.cmp(&b.entity_name));
        records
    }

    /// Run the check timer until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check(Utc::now()).await;
                }
            }
        }
        debug!("Liveness supervisor stopped");
    }
}

#[async_trait]
impl RestartGate for LivenessSupervisor {
    async fn authorize_restart(&self, entity: &str) -> bool {
        LivenessSupervisor::authorize_restart(self, entity).await
    }
}
