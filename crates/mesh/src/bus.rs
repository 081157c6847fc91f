//! Alert bus: persists alerts, tracks their status and fans them out.
//!
//! `publish` writes the audit record first, so persistence never depends on
//! delivery. Each subscriber then gets the alert through its own bounded
//! drop-oldest queue and worker task; a slow subscriber only ever loses its
//! own oldest non-critical alerts and never holds up the others.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertStatus};
use crate::audit::{AuditKind, AuditLog};
use crate::error::{MeshError, Result};
use crate::metrics::HealthMetrics;
use crate::planner::PatchPlan;
use crate::queue::{DropOldestQueue, Pushed};

/// Alerts kept in memory for status lookups; older finished ones are dropped.
const MAX_TRACKED_ALERTS: usize = 10_000;

/// Delivery attempts per alert and subscriber.
const DELIVERY_ATTEMPTS: u32 = 3;
const DELIVERY_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Consumer of published alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle one alert. Errors are retried a bounded number of times.
    async fn deliver(&self, alert: Arc<Alert>) -> Result<()>;
}

struct Subscriber {
    name: String,
    queue: DropOldestQueue<Arc<Alert>>,
}

#[derive(Default)]
struct Ledger {
    alerts: HashMap<Uuid, Alert>,
    order: VecDeque<Uuid>,
}

impl Ledger {
    fn insert(&mut self, alert: Alert) {
        self.order.push_back(alert.id);
        self.alerts.insert(alert.id, alert);
        self.prune();
    }

    /// Finished alerts go first. If that is not enough the oldest open ones
    /// follow; their history stays in the audit log.
    fn prune(&mut self) {
        let Some(mut excess) = self.alerts.len().checked_sub(MAX_TRACKED_ALERTS) else {
            return;
        };
        let alerts = &mut self.alerts;
        self.order.retain(|id| {
            if excess > 0 && alerts.get(id).is_some_and(|a| a.status.is_terminal()) {
                alerts.remove(id);
                excess -= 1;
                false
            } else {
                true
            }
        });
        while excess > 0 {
            let Some(id) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.alerts.remove(&id) {
                debug!(
                    alert_id = %id,
                    entity = %evicted.source_entity,
                    status = %evicted.status,
                    "Untracking open alert"
                );
                excess -= 1;
            }
        }
    }
}

/// Fan-out hub for alerts.
pub struct AlertBus {
    audit: AuditLog,
    ledger: RwLock<Ledger>,
    subscribers: StdRwLock<Vec<Arc<Subscriber>>>,
    capacity: usize,
    metrics: Arc<HealthMetrics>,
}

impl AlertBus {
    #[must_use]
    pub fn new(audit: AuditLog, subscriber_capacity: usize, metrics: Arc<HealthMetrics>) -> Self {
        Self {
            audit,
            ledger: RwLock::new(Ledger::default()),
            subscribers: StdRwLock::new(Vec::new()),
            capacity: subscriber_capacity,
            metrics,
        }
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Attach a subscriber and start its delivery worker.
    pub fn subscribe(&self, sink: Arc<dyn AlertSink>) -> JoinHandle<()> {
        let subscriber = Arc::new(Subscriber {
            name: sink.name().to_string(),
            queue: DropOldestQueue::with_protection(self.capacity, |a: &Arc<Alert>| {
                a.is_critical()
            }),
        });
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&subscriber));
        info!(subscriber = %subscriber.name, "Alert subscriber attached");
        tokio::spawn(run_subscriber(subscriber, sink, Arc::clone(&self.metrics)))
    }

    /// Persist an alert and hand it to every subscriber.
    pub async fn publish(&self, alert: Alert) -> Result<Arc<Alert>> {
        if alert.evidence.is_empty() {
            return Err(MeshError::Malformed(format!(
                "alert {} has no findings",
                alert.id
            )));
        }

        self.audit
            .append(
                alert.id,
                &alert.source_entity,
                AuditKind::AlertRaised {
                    alert: alert.clone(),
                },
            )
            .await?;
        self.ledger.write().await.insert(alert.clone());
        HealthMetrics::incr(&self.metrics.alerts_published);

        info!(
            alert_id = %alert.id,
            entity = %alert.source_entity,
            category = %alert.category,
            severity = %alert.severity,
            findings = alert.evidence.len(),
            "Alert published"
        );

        let alert = Arc::new(alert);
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            match subscriber.queue.push(Arc::clone(&alert)) {
                Pushed::Queued => {}
                Pushed::Evicted(dropped) | Pushed::Rejected(dropped) => {
                    HealthMetrics::incr(&self.metrics.subscriber_dropped);
                    warn!(
                        subscriber = %subscriber.name,
                        alert_id = %dropped.id,
                        entity = %dropped.source_entity,
                        "Subscriber queue full, dropped alert"
                    );
                }
            }
        }
        Ok(alert)
    }

    /// Move an alert forward in its lifecycle and audit the change.
    /// Returns the previous status.
    pub async fn transition(
        &self,
        alert_id: Uuid,
        to: AlertStatus,
        reason: &str,
    ) -> Result<AlertStatus> {
        // Held across the audit append so records for one alert stay ordered.
        let mut ledger = self.ledger.write().await;
        let alert = ledger
            .alerts
            .get_mut(&alert_id)
            .ok_or(MeshError::UnknownAlert(alert_id))?;
        let from = alert.status;
        if !from.can_transition(to) {
            return Err(MeshError::InvalidTransition { alert_id, from, to });
        }
        alert.status = to;
        let entity = alert.source_entity.clone();

        self.audit
            .append(
                alert_id,
                &entity,
                AuditKind::StatusChanged {
                    from,
                    to,
                    reason: reason.to_string(),
                },
            )
            .await?;
        drop(ledger);

        debug!(alert_id = %alert_id, entity = %entity, %from, %to, reason, "Alert status changed");
        Ok(from)
    }

    /// Current state of an alert.
    pub async fn get(&self, alert_id: Uuid) -> Option<Alert> {
        self.ledger.read().await.alerts.get(&alert_id).cloned()
    }

    /// Most recent alerts first.
    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        let ledger = self.ledger.read().await;
        ledger
            .order
            .iter()
            .rev()
            .filter_map(|id| ledger.alerts.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn record_plan_created(&self, plan: &PatchPlan) -> Result<()> {
        self.audit
            .append(
                plan.alert_id,
                &plan.entity,
                AuditKind::PlanCreated { plan: plan.clone() },
            )
            .await
    }

    pub async fn record_plan_finished(
        &self,
        plan: &PatchPlan,
        success: bool,
        started_at: chrono::DateTime<chrono::Utc>,
        finished_at: chrono::DateTime<chrono::Utc>,
        detail: Option<String>,
    ) -> Result<()> {
        self.audit
            .append(
                plan.alert_id,
                &plan.entity,
                AuditKind::PlanFinished {
                    plan_id: plan.id,
                    success,
                    started_at,
                    finished_at,
                    detail,
                },
            )
            .await
    }

    /// Stop accepting deliveries; workers drain and exit.
    pub fn close(&self) {
        for subscriber in self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            subscriber.queue.close();
        }
    }
}

async fn run_subscriber(
    subscriber: Arc<Subscriber>,
    sink: Arc<dyn AlertSink>,
    metrics: Arc<HealthMetrics>,
) {
    while let Some(alert) = subscriber.queue.pop().await {
        let mut attempt = 1;
        loop {
            match sink.deliver(Arc::clone(&alert)).await {
                Ok(()) => break,
                Err(e) if attempt < DELIVERY_ATTEMPTS => {
                    warn!(
                        subscriber = %subscriber.name,
                        alert_id = %alert.id,
                        attempt,
                        error = %e,
                        "Alert delivery failed, retrying"
                    );
                    tokio::time::sleep(DELIVERY_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    HealthMetrics::incr(&metrics.delivery_failures);
                    error!(
                        subscriber = %subscriber.name,
                        alert_id = %alert.id,
                        entity = %alert.source_entity,
                        error = %e,
                        "Alert delivery failed, giving up"
                    );
                    break;
                }
            }
        }
    }
    debug!(subscriber = %subscriber.name, "Alert subscriber stopped");
}
