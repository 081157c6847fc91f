//! Pipeline wiring.
//!
//! ```text
//! collector ─► dispatcher ─► worker[shard] ─► rules + anomaly ─► correlator ─► bus
//!                               │                                              │
//!                               └── pulses ─► liveness ──────── alerts ────────┤
//!                                                                              ├─► planner ─► executor
//!                                                                              └─► notifier
//! ```
//!
//! Events are sharded by entity across workers, so one entity's events are
//! evaluated in order while different entities proceed in parallel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mesh_config::{ConfigError, MeshConfig, RuleSetFile};
use notify::{Notifier, NotifyEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, Finding, CATEGORY_ESCALATION};
use crate::anomaly::AnomalyScorer;
use crate::audit::AuditLog;
use crate::bus::{AlertBus, AlertSink};
use crate::collector::Collector;
use crate::correlator::Correlator;
use crate::error::Result;
use crate::event::{validate_entity, Event, EventCategory};
use crate::executor::{ActionExecutor, RemediationBackend, RestartGate, RetryPolicy};
use crate::liveness::LivenessSupervisor;
use crate::metrics::{HealthMetrics, HealthSnapshot};
use crate::planner::{PatchPlanner, CATEGORY_MANUAL};
use crate::queue::{DropOldestQueue, Pushed};
use crate::rules::{RuleEngine, SnapshotInfo};
use crate::shard::shard_for;
use crate::Severity;

/// Period of the idle-state sweeps (anomaly series, rate windows).
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How long shutdown waits for running plans before cancelling them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Operator-injected alert.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualAlert {
    #[serde(alias = "entity")]
    pub source_entity: String,
    #[serde(default = "default_manual_category")]
    pub category: String,
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub evidence: Value,
}

fn default_manual_category() -> String {
    CATEGORY_MANUAL.to_string()
}

/// Health report served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub metrics: HealthSnapshot,
    pub queued_events: usize,
    pub pending_findings: usize,
    pub tracked_series: usize,
    pub rules: SnapshotInfo,
}

/// Plans and dispatches remediation for every published alert.
struct PlannerSink {
    planner: Arc<RwLock<Arc<PatchPlanner>>>,
    executor: Arc<ActionExecutor>,
    tracker: TaskTracker,
}

#[async_trait]
impl AlertSink for PlannerSink {
    fn name(&self) -> &str {
        "planner"
    }

    async fn deliver(&self, alert: Arc<Alert>) -> Result<()> {
        let planner = Arc::clone(&self.planner.read().unwrap_or_else(PoisonError::into_inner));
        let plan = planner.plan(&alert);
        if plan.is_noop() {
            debug!(alert_id = %alert.id, severity = %alert.severity, "No remediation for alert");
            return Ok(());
        }
        info!(
            alert_id = %alert.id,
            plan_id = %plan.id,
            entity = %plan.entity,
            actions = %plan.actions.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "Plan created"
        );
        let executor = Arc::clone(&self.executor);
        self.tracker.spawn(async move {
            executor.execute(plan).await;
        });
        Ok(())
    }
}

/// Forwards high and critical alerts to the external notifier.
struct NotificationSink {
    notifier: Arc<Notifier>,
}

const fn notify_severity(severity: Severity) -> notify::Severity {
    match severity {
        Severity::Info => notify::Severity::Info,
        Severity::Warn => notify::Severity::Warning,
        Severity::High => notify::Severity::High,
        Severity::Critical => notify::Severity::Critical,
    }
}

#[async_trait]
impl AlertSink for NotificationSink {
    fn name(&self) -> &str {
        "notifier"
    }

    async fn deliver(&self, alert: Arc<Alert>) -> Result<()> {
        if alert.severity < Severity::High {
            return Ok(());
        }
        let event = match alert.references {
            Some(original) if alert.category == CATEGORY_ESCALATION => NotifyEvent::Escalation {
                alert_id: alert.id.to_string(),
                original_alert_id: original.to_string(),
                entity: alert.source_entity.clone(),
                reason: alert.message.clone(),
                timestamp: alert.created_at,
            },
            _ => {
                let rules: Vec<&str> = alert.evidence.iter().map(|f| f.rule_id.as_str()).collect();
                let mut context = HashMap::new();
                context.insert("rules".to_string(), rules.join(", "));
                context.insert("findings".to_string(), alert.evidence.len().to_string());
                NotifyEvent::AlertRaised {
                    alert_id: alert.id.to_string(),
                    entity: alert.source_entity.clone(),
                    category: alert.category.clone(),
                    severity: notify_severity(alert.severity),
                    message: alert.message.clone(),
                    context,
                    timestamp: alert.created_at,
                }
            }
        };
        self.notifier.notify(event);
        Ok(())
    }
}

/// The running mesh.
pub struct Mesh {
    config: MeshConfig,
    rules_path: Option<PathBuf>,
    metrics: Arc<HealthMetrics>,
    collector: Collector,
    engine: Arc<RuleEngine>,
    scorer: Arc<AnomalyScorer>,
    correlator: Arc<Correlator>,
    bus: Arc<AlertBus>,
    liveness: Arc<LivenessSupervisor>,
    planner: Arc<RwLock<Arc<PatchPlanner>>>,
    /// Dispatcher and stage workers
    ingest: TaskTracker,
    /// Timers
    timers: TaskTracker,
    timers_cancel: CancellationToken,
    /// Running plans
    plans: TaskTracker,
    plans_cancel: CancellationToken,
    subscribers: Mutex<Vec<JoinHandle<()>>>,
}

impl Mesh {
    /// Build every stage and start the background tasks.
    pub async fn start(
        config: MeshConfig,
        rules: RuleSetFile,
        backend: Arc<dyn RemediationBackend>,
        notifier: Arc<Notifier>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let shards = config.collector.workers;
        let metrics = Arc::new(HealthMetrics::new());

        // The writer task exits once the last log handle is dropped.
        let (audit, _writer) = AuditLog::open(
            config.audit.path.clone(),
            config.audit.queue_capacity,
            Arc::clone(&metrics),
        )
        .await?;
        let bus = Arc::new(AlertBus::new(
            audit,
            config.bus.subscriber_queue_capacity,
            Arc::clone(&metrics),
        ));

        let engine = Arc::new(RuleEngine::new(&rules, shards, Arc::clone(&metrics))?);
        let snapshot = engine.snapshot();
        let scorer = Arc::new(AnomalyScorer::new(&config.anomaly, shards));
        let correlator = Arc::new(Correlator::new(&config.correlator, shards));

        let liveness = Arc::new(LivenessSupervisor::new(
            config.liveness.clone(),
            Arc::clone(&bus),
            Arc::clone(&metrics),
        ));
        liveness.set_policies(snapshot.liveness_policies().to_vec());

        let plans_cancel = CancellationToken::new();
        let gate: Arc<dyn RestartGate> = Arc::clone(&liveness) as Arc<dyn RestartGate>;
        let executor = Arc::new(ActionExecutor::new(
            backend,
            gate,
            Arc::clone(&bus),
            RetryPolicy::from_config(&config.executor),
            plans_cancel.clone(),
            Arc::clone(&metrics),
        ));
        let planner = Arc::new(RwLock::new(Arc::new(PatchPlanner::new(
            &config.planner,
            Some(&snapshot),
        ))));

        let plans = TaskTracker::new();
        let mut subscribers = vec![bus.subscribe(Arc::new(PlannerSink {
            planner: Arc::clone(&planner),
            executor,
            tracker: plans.clone(),
        }))];
        if notifier.has_channels() {
            subscribers.push(bus.subscribe(Arc::new(NotificationSink { notifier })));
        }

        let mesh = Arc::new(Self {
            collector: Collector::new(config.collector.queue_capacity, Arc::clone(&metrics)),
            rules_path: config.rules_path.clone(),
            config,
            metrics,
            engine,
            scorer,
            correlator,
            bus,
            liveness,
            planner,
            ingest: TaskTracker::new(),
            timers: TaskTracker::new(),
            timers_cancel: CancellationToken::new(),
            plans,
            plans_cancel,
            subscribers: Mutex::new(subscribers),
        });
        mesh.spawn_tasks();

        info!(
            workers = shards,
            rules = mesh.engine.snapshot().info().enabled_count,
            audit = %mesh.config.audit.path.display(),
            "Mesh started"
        );
        Ok(mesh)
    }

    fn spawn_tasks(self: &Arc<Self>) {
        let workers: Vec<Arc<DropOldestQueue<Event>>> = (0..self.config.collector.workers)
            .map(|_| Arc::new(DropOldestQueue::new(self.config.collector.worker_queue_capacity)))
            .collect();

        for (index, queue) in workers.iter().enumerate() {
            let mesh = Arc::clone(self);
            let queue = Arc::clone(queue);
            self.ingest.spawn(async move {
                while let Some(event) = queue.pop().await {
                    mesh.process(event).await;
                }
                debug!(worker = index, "Stage worker stopped");
            });
        }
        self.ingest.spawn(dispatch(
            self.collector.queue(),
            workers,
            Arc::clone(&self.metrics),
        ));

        let mesh = Arc::clone(self);
        let flush_every = Duration::from_millis(self.config.correlator.flush_interval_ms);
        self.timers.spawn(async move { mesh.flush_loop(flush_every).await });

        let mesh = Arc::clone(self);
        self.timers.spawn(async move { mesh.sweep_loop().await });

        let check_every = Duration::from_millis(self.config.liveness.check_interval_ms);
        self.timers.spawn(
            Arc::clone(&self.liveness).run(check_every, self.timers_cancel.child_token()),
        );
    }

    /// Run one event through rules, anomaly scoring and correlation.
    pub async fn process(&self, event: Event) {
        if event.category == EventCategory::Heartbeat {
            self.liveness.pulse(&event.source_entity, event.timestamp).await;
            return;
        }

        let snapshot = self.engine.snapshot();
        let mut findings = self.engine.evaluate(&event, &self.scorer);
        let watched = self.scorer.score_watched(&event, snapshot.anomaly_metrics());
        HealthMetrics::add(&self.metrics.findings, watched.len() as u64);
        findings.extend(watched);
        self.scorer.observe(&event, snapshot.anomaly_metrics());

        let now = Utc::now();
        for finding in findings {
            if let Some(alert) = self.correlator.add(finding, now) {
                self.publish(alert).await;
            }
        }
    }

    async fn publish(&self, alert: Alert) {
        let (id, entity) = (alert.id, alert.source_entity.clone());
        if let Err(e) = self.bus.publish(alert).await {
            error!(alert_id = %id, entity = %entity, error = %e, "Failed to publish alert");
        }
    }

    async fn flush_loop(&self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.timers_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for alert in self.correlator.flush_expired(Utc::now()) {
                        self.publish(alert).await;
                    }
                }
            }
        }
    }

    async fn sweep_loop(&self) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = self.timers_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let series = self.scorer.sweep(now);
                    let windows = self.engine.sweep(now);
                    if series + windows > 0 {
                        debug!(series, windows, "Swept idle state");
                    }
                }
            }
        }
    }

    /// Feed an operator alert through the correlator. Returns the alert id
    /// when it was published right away, `None` while it waits in the
    /// correlation window.
    pub async fn inject_manual(&self, manual: ManualAlert) -> Result<Option<Uuid>> {
        let entity = validate_entity(&manual.source_entity)?;
        let now = Utc::now();
        let finding = Finding {
            rule_id: CATEGORY_MANUAL.to_string(),
            severity: manual.severity,
            category: manual.category,
            source_entity: entity.clone(),
            evidence: json!({
                "summary": manual.message,
                "detail": manual.evidence,
            }),
            timestamp: now,
        };
        HealthMetrics::incr(&self.metrics.findings);
        info!(entity = %entity, severity = %manual.severity, "Manual alert injected");

        match self.correlator.add(finding, now) {
            Some(alert) => {
                let published = self.bus.publish(alert).await?;
                Ok(Some(published.id))
            }
            None => Ok(None),
        }
    }

    /// Reload the rule file and swap every derived view. On error the
    /// running rules stay in effect.
    pub fn reload_rules(&self) -> Result<SnapshotInfo> {
        let path = self
            .rules_path
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("no rule file configured".to_string()))?;
        let set = RuleSetFile::load(path)?;
        let info = self.engine.reload(&set)?;

        let snapshot = self.engine.snapshot();
        self.liveness.set_policies(snapshot.liveness_policies().to_vec());
        *self.planner.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(PatchPlanner::new(&self.config.planner, Some(&snapshot)));
        Ok(info)
    }

    #[must_use]
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<AlertBus> {
        &self.bus
    }

    #[must_use]
    pub fn liveness(&self) -> &Arc<LivenessSupervisor> {
        &self.liveness
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<HealthMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        let metrics = self.metrics.snapshot();
        HealthReport {
            status: if metrics.is_degraded() { "degraded" } else { "healthy" },
            metrics,
            queued_events: self.collector.queue().len(),
            pending_findings: self.correlator.pending(),
            tracked_series: self.scorer.series_count(),
            rules: self.engine.snapshot().info().clone(),
        }
    }

    /// Drain and stop every stage: ingestion first, then correlation, then
    /// alert delivery, then running plans. Plans still running after a grace
    /// period are cancelled between actions.
    pub async fn shutdown(&self) {
        info!("Mesh shutting down");
        self.collector.close();
        self.ingest.close();
        self.ingest.wait().await;

        self.timers_cancel.cancel();
        self.timers.close();
        self.timers.wait().await;
        for alert in self.correlator.flush_all() {
            self.publish(alert).await;
        }

        self.bus.close();
        let subscribers: Vec<JoinHandle<()>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in subscribers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Subscriber task ended abnormally");
            }
        }

        self.plans.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.plans.wait()).await.is_err() {
            warn!("Cancelling plans still running after the grace period");
            self.plans_cancel.cancel();
            self.plans.wait().await;
        }

        if let Err(e) = self.bus.audit().flush().await {
            error!(error = %e, "Final audit flush failed");
        }
        info!("Mesh stopped");
    }
}

/// Route ingested events to stage workers by entity hash.
async fn dispatch(
    source: Arc<DropOldestQueue<Event>>,
    workers: Vec<Arc<DropOldestQueue<Event>>>,
    metrics: Arc<HealthMetrics>,
) {
    while let Some(event) = source.pop().await {
        let index = shard_for(&event.source_entity, workers.len());
        match workers[index].push(event) {
            Pushed::Queued => {}
            Pushed::Evicted(dropped) | Pushed::Rejected(dropped) => {
                HealthMetrics::incr(&metrics.events_dropped);
                debug!(
                    worker = index,
                    entity = %dropped.source_entity,
                    "Worker queue full, dropped oldest event"
                );
            }
        }
    }
    for worker in &workers {
        worker.close();
    }
    debug!("Dispatcher stopped");
}
