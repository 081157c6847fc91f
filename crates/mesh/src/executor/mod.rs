//! Action executor.
//!
//! Runs a plan's actions strictly in order under per-entity locks, so two
//! plans touching the same entity never overlap. Each action gets bounded
//! retries with exponential backoff; a failed action aborts the plan, fails
//! the alert and raises a critical escalation that references it.

mod backend;

pub use backend::{apply_edit, ActionError, LocalBackend, RemediationBackend};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mesh_config::ExecutorConfig;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertStatus, CATEGORY_ESCALATION, CATEGORY_MANUAL_INTERVENTION};
use crate::bus::AlertBus;
use crate::error::MeshError;
use crate::metrics::HealthMetrics;
use crate::planner::{Action, PatchPlan, PlanStatus};
use crate::Severity;

/// Decides whether an automated restart may proceed.
#[async_trait]
pub trait RestartGate: Send + Sync {
    async fn authorize_restart(&self, entity: &str) -> bool;
}

/// Exponential backoff between attempts of one action.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = ms.min(self.max.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max
        }
    }
}

/// Outcome of one plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub plan_id: Uuid,
    pub alert_id: Uuid,
    pub entity: String,
    pub status: PlanStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Attempts across all actions
    pub attempts: u32,
    pub actions_completed: usize,
    /// The plan never ran because its alert was already closed
    pub skipped: bool,
    pub error: Option<String>,
    /// Critical alert raised because this plan failed
    pub escalation: Option<Uuid>,
}

impl ExecutionResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == PlanStatus::Succeeded
    }
}

struct Failure {
    action: Action,
    error: ActionError,
    attempts: u32,
}

pub struct ActionExecutor {
    backend: Arc<dyn RemediationBackend>,
    gate: Arc<dyn RestartGate>,
    bus: Arc<AlertBus>,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cancel: CancellationToken,
    metrics: Arc<HealthMetrics>,
}

impl ActionExecutor {
    #[must_use]
    pub fn new(
        backend: Arc<dyn RemediationBackend>,
        gate: Arc<dyn RestartGate>,
        bus: Arc<AlertBus>,
        retry: RetryPolicy,
        cancel: CancellationToken,
        metrics: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            backend,
            gate,
            bus,
            retry,
            locks: Mutex::new(HashMap::new()),
            cancel,
            metrics,
        }
    }

    fn entity_lock(&self, entity: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(entity.to_string()).or_default())
    }

    /// Take every target's lock in sorted order.
    async fn lock_targets(&self, plan: &PatchPlan) -> Option<Vec<OwnedMutexGuard<()>>> {
        let mut guards = Vec::new();
        for target in plan.targets() {
            let lock = self.entity_lock(&target);
            tokio::select! {
                guard = lock.lock_owned() => guards.push(guard),
                () = self.cancel.cancelled() => {
                    self.release_locks(guards);
                    return None;
                }
            }
        }
        Some(guards)
    }

    /// Unlock and forget entities nobody else is holding or waiting on.
    fn release_locks(&self, guards: Vec<OwnedMutexGuard<()>>) {
        drop(guards);
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Run a plan to completion. Never panics on action failure; the outcome
    /// is reported in the result, the alert status and the audit log.
    pub async fn execute(&self, mut plan: PatchPlan) -> ExecutionResult {
        let started_at = Utc::now();
        let mut result = ExecutionResult {
            plan_id: plan.id,
            alert_id: plan.alert_id,
            entity: plan.entity.clone(),
            status: PlanStatus::Pending,
            started_at,
            finished_at: started_at,
            attempts: 0,
            actions_completed: 0,
            skipped: false,
            error: None,
            escalation: None,
        };

        if plan.is_noop() {
            debug!(alert_id = %plan.alert_id, entity = %plan.entity, "No-op plan");
            result.status = PlanStatus::Succeeded;
            return result;
        }

        let Some(guards) = self.lock_targets(&plan).await else {
            return self.finish_cancelled(&mut plan, result).await;
        };

        if let Err(e) = self.bus.record_plan_created(&plan).await {
            warn!(plan_id = %plan.id, error = %e, "Failed to audit plan creation");
        }
        match self
            .bus
            .transition(plan.alert_id, AlertStatus::Remediating, "remediation started")
            .await
        {
            Ok(_) => {}
            Err(MeshError::InvalidTransition { from, .. }) if from.is_terminal() => {
                info!(
                    alert_id = %plan.alert_id,
                    entity = %plan.entity,
                    status = %from,
                    "Alert already closed, skipping plan"
                );
                result.skipped = true;
                self.release_locks(guards);
                result.error = Some(format!("alert already {from}"));
                result.status = PlanStatus::Failed;
                result.finished_at = Utc::now();
                self.audit_finished(&plan, &result).await;
                return result;
            }
            Err(e) => warn!(alert_id = %plan.alert_id, error = %e, "Could not mark alert remediating"),
        }

        plan.status = PlanStatus::Running;
        info!(
            plan_id = %plan.id,
            alert_id = %plan.alert_id,
            entity = %plan.entity,
            actions = plan.actions.len(),
            "Executing plan"
        );

        let mut failure = None;
        for action in &plan.actions {
            match self.run_action(&plan, action).await {
                Ok(attempts) => {
                    result.attempts += attempts;
                    result.actions_completed += 1;
                }
                Err(f) => {
                    result.attempts += f.attempts;
                    failure = Some(f);
                    break;
                }
            }
        }
        self.release_locks(guards);

        match failure {
            None => self.finish_succeeded(&mut plan, &mut result).await,
            Some(f) => self.finish_failed(&mut plan, &mut result, &f).await,
        }
        result
    }

    async fn run_action(&self, plan: &PatchPlan, action: &Action) -> Result<u32, Failure> {
        let fail = |error, attempts| Failure {
            action: action.clone(),
            error,
            attempts,
        };

        if let Action::Restart { target } = action {
            if self.backend.is_restarting(target) {
                info!(entity = %target, alert_id = %plan.alert_id, "Entity already restarting, skipping restart");
                return Ok(0);
            }
            if !self.gate.authorize_restart(target).await {
                return Err(fail(ActionError::Suppressed(target.clone()), 0));
            }
        }

        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(fail(ActionError::Cancelled, attempt));
            }
            attempt += 1;
            match self.apply(plan, action).await {
                Ok(()) => {
                    debug!(
                        plan_id = %plan.id,
                        entity = %action.target(),
                        action = action.kind(),
                        attempt,
                        "Action succeeded"
                    );
                    return Ok(attempt);
                }
                Err(e) if e.is_retryable() && attempt <= self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        plan_id = %plan.id,
                        alert_id = %plan.alert_id,
                        entity = %action.target(),
                        action = action.kind(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Action failed, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => {
                            return Err(fail(ActionError::Cancelled, attempt));
                        }
                    }
                }
                Err(e) => return Err(fail(e, attempt)),
            }
        }
    }

    async fn apply(&self, plan: &PatchPlan, action: &Action) -> Result<(), ActionError> {
        match action {
            Action::Restart { target } => self.backend.restart(target).await,
            Action::Reload { target } => self.backend.reload(target).await,
            Action::ConfigEdit { target, key, value } => {
                self.backend.edit_config(target, key, value).await.map(|_| ())
            }
            Action::Notify { target, message } => {
                self.backend.notify(target, plan.alert_id, message).await
            }
        }
    }

    async fn finish_succeeded(&self, plan: &mut PatchPlan, result: &mut ExecutionResult) {
        plan.status = PlanStatus::Succeeded;
        result.status = PlanStatus::Succeeded;
        result.finished_at = Utc::now();
        HealthMetrics::incr(&self.metrics.plans_executed);

        if plan.awaits_confirmation {
            info!(
                plan_id = %plan.id,
                alert_id = %plan.alert_id,
                entity = %plan.entity,
                "Plan succeeded, waiting for the entity to confirm"
            );
        } else {
            info!(plan_id = %plan.id, alert_id = %plan.alert_id, entity = %plan.entity, "Plan succeeded");
            self.set_status(plan.alert_id, AlertStatus::Resolved, "remediation succeeded")
                .await;
        }
        self.audit_finished(plan, result).await;
    }

    async fn finish_failed(&self, plan: &mut PatchPlan, result: &mut ExecutionResult, failure: &Failure) {
        plan.status = PlanStatus::Failed;
        result.status = PlanStatus::Failed;
        result.finished_at = Utc::now();
        let reason = format!("{} failed: {}", failure.action, failure.error);
        result.error = Some(reason.clone());
        HealthMetrics::incr(&self.metrics.plans_executed);
        HealthMetrics::incr(&self.metrics.plans_failed);

        error!(
            plan_id = %plan.id,
            alert_id = %plan.alert_id,
            entity = %failure.action.target(),
            action = failure.action.kind(),
            attempts = failure.attempts,
            error = %failure.error,
            "Plan failed"
        );
        self.set_status(plan.alert_id, AlertStatus::Failed, &reason).await;

        let escalate = !matches!(failure.error, ActionError::Suppressed(_) | ActionError::Cancelled)
            && plan.category != CATEGORY_ESCALATION
            && plan.category != CATEGORY_MANUAL_INTERVENTION;
        if escalate {
            result.escalation = self.escalate(plan, failure).await;
        }
        self.audit_finished(plan, result).await;
    }

    async fn finish_cancelled(&self, plan: &mut PatchPlan, mut result: ExecutionResult) -> ExecutionResult {
        plan.status = PlanStatus::Failed;
        result.status = PlanStatus::Failed;
        result.error = Some(ActionError::Cancelled.to_string());
        result.finished_at = Utc::now();
        self.set_status(plan.alert_id, AlertStatus::Failed, "cancelled by shutdown")
            .await;
        result
    }

    async fn set_status(&self, alert_id: Uuid, to: AlertStatus, reason: &str) {
        if let Err(e) = self.bus.transition(alert_id, to, reason).await {
            warn!(alert_id = %alert_id, %to, error = %e, "Could not update alert status");
        }
    }

    async fn audit_finished(&self, plan: &PatchPlan, result: &ExecutionResult) {
        if let Err(e) = self
            .bus
            .record_plan_finished(
                plan,
                result.success(),
                result.started_at,
                result.finished_at,
                result.error.clone(),
            )
            .await
        {
            warn!(plan_id = %plan.id, error = %e, "Failed to audit plan result");
        }
    }

    async fn escalate(&self, plan: &PatchPlan, failure: &Failure) -> Option<Uuid> {
        let mut alert = Alert::synthetic(
            &plan.entity,
            CATEGORY_ESCALATION,
            Severity::Critical,
            CATEGORY_ESCALATION,
            format!(
                "Remediation of alert {} on {} failed after {} attempts: {}",
                plan.alert_id, plan.entity, failure.attempts, failure.error
            ),
            json!({
                "summary": format!("{} failed", failure.action),
                "original_alert_id": plan.alert_id,
                "plan_id": plan.id,
                "action": failure.action.kind(),
                "target": failure.action.target(),
                "attempts": failure.attempts,
                "error": failure.error.to_string(),
            }),
        );
        alert.references = Some(plan.alert_id);

        match self.bus.publish(alert).await {
            Ok(alert) => {
                HealthMetrics::incr(&self.metrics.escalations);
                warn!(
                    alert_id = %alert.id,
                    original_alert_id = %plan.alert_id,
                    entity = %plan.entity,
                    "Escalated failed remediation"
                );
                Some(alert.id)
            }
            Err(e) => {
                error!(alert_id = %plan.alert_id, error = %e, "Failed to publish escalation");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditKind, AuditLog, AuditQuery};
    use crate::planner::PatchPlanner;
    use mesh_config::PlannerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Allow;

    #[async_trait]
    impl RestartGate for Allow {
        async fn authorize_restart(&self, _entity: &str) -> bool {
            true
        }
    }

    /// Backend whose reload fails a configurable number of times.
    #[derive(Default)]
    struct Flaky {
        reload_failures: AtomicU32,
        restarts: AtomicU32,
        reloads: AtomicU32,
    }

    #[async_trait]
    impl RemediationBackend for Flaky {
        async fn restart(&self, _entity: &str) -> Result<(), ActionError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reload(&self, entity: &str) -> Result<(), ActionError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            if self.reload_failures.load(Ordering::SeqCst) > 0 {
                self.reload_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ActionError::CommandFailed {
                    entity: entity.to_string(),
                    action: "reload",
                    status: "exit status: 1".to_string(),
                    stderr: "boom".to_string(),
                });
            }
            Ok(())
        }

        async fn edit_config(&self, _: &str, _: &str, _: &str) -> Result<bool, ActionError> {
            Ok(true)
        }

        async fn notify(&self, _: &str, _: Uuid, _: &str) -> Result<(), ActionError> {
            Ok(())
        }

        fn is_restarting(&self, _entity: &str) -> bool {
            false
        }
    }

    fn retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    async fn setup(
        backend: Arc<Flaky>,
    ) -> (ActionExecutor, Arc<AlertBus>, Arc<HealthMetrics>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(HealthMetrics::new());
        let (audit, _) = AuditLog::open(dir.path().join("audit.jsonl"), 16, Arc::clone(&metrics))
            .await
            .unwrap();
        let bus = Arc::new(AlertBus::new(audit, 16, Arc::clone(&metrics)));
        let executor = ActionExecutor::new(
            backend,
            Arc::new(Allow),
            Arc::clone(&bus),
            retry(2),
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        (executor, bus, metrics, dir)
    }

    fn critical_alert() -> Alert {
        Alert::synthetic("svc", "intrusion", Severity::Critical, "rce", "m".to_string(), json!({}))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_entity_locks_released_after_plan() {
        let backend = Arc::new(Flaky::default());
        let (executor, bus, _, _dir) = setup(Arc::clone(&backend)).await;

        for entity in ["a", "b", "c"] {
            let alert = bus
                .publish(Alert::synthetic(
                    entity,
                    "intrusion",
                    Severity::Critical,
                    "rce",
                    "m".to_string(),
                    json!({}),
                ))
                .await
                .unwrap();
            let plan = PatchPlanner::new(&PlannerConfig::default(), None).plan(&alert);
            assert!(executor.execute(plan).await.success());
        }
        assert!(executor.locks.lock().unwrap().is_empty());

        // A held lock survives the release of another plan's locks.
        let held = executor.entity_lock("busy").lock_owned().await;
        executor.release_locks(Vec::new());
        assert!(executor.locks.lock().unwrap().contains_key("busy"));
        drop(held);
        executor.release_locks(Vec::new());
        assert!(executor.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let backend = Arc::new(Flaky::default());
        backend.reload_failures.store(1, Ordering::SeqCst);
        let (executor, bus, _, _dir) = setup(Arc::clone(&backend)).await;

        let alert = bus.publish(critical_alert()).await.unwrap();
        let plan = PatchPlanner::new(&PlannerConfig::default(), None).plan(&alert);
        let result = executor.execute(plan).await;

        assert!(result.success());
        assert_eq!(result.actions_completed, 3);
        assert_eq!(result.attempts, 4);
        assert_eq!(backend.reloads.load(Ordering::SeqCst), 2);
        assert_eq!(bus.get(alert.id).await.unwrap().status, AlertStatus::Resolved);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_escalate() {
        let backend = Arc::new(Flaky::default());
        backend.reload_failures.store(10, Ordering::SeqCst);
        let (executor, bus, metrics, _dir) = setup(Arc::clone(&backend)).await;

        let alert = bus.publish(critical_alert()).await.unwrap();
        let plan = PatchPlanner::new(&PlannerConfig::default(), None).plan(&alert);
        let result = executor.execute(plan).await;

        assert!(!result.success());
        assert_eq!(result.actions_completed, 1);
        assert_eq!(backend.reloads.load(Ordering::SeqCst), 3);
        assert_eq!(bus.get(alert.id).await.unwrap().status, AlertStatus::Failed);

        let escalation = bus.get(result.escalation.unwrap()).await.unwrap();
        assert_eq!(escalation.severity, Severity::Critical);
        assert_eq!(escalation.category, CATEGORY_ESCALATION);
        assert_eq!(escalation.references, Some(alert.id));
        assert_eq!(metrics.snapshot().escalations, 1);
        assert_eq!(metrics.snapshot().plans_failed, 1);

        let finished: Vec<bool> = bus
            .audit()
            .query(&AuditQuery {
                alert_id: Some(alert.id),
                ..AuditQuery::default()
            })
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| match r.kind {
                AuditKind::PlanFinished { success, .. } => Some(success),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![false]);
    }

    #[tokio::test]
    async fn test_plan_for_closed_alert_is_skipped() {
        let backend = Arc::new(Flaky::default());
        let (executor, bus, _, _dir) = setup(Arc::clone(&backend)).await;

        let alert = bus.publish(critical_alert()).await.unwrap();
        bus.transition(alert.id, AlertStatus::Resolved, "operator")
            .await
            .unwrap();
        let plan = PatchPlanner::new(&PlannerConfig::default(), None).plan(&alert);
        let result = executor.execute(plan).await;

        assert!(result.skipped);
        assert_eq!(backend.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_executor_fails_without_escalation() {
        let backend = Arc::new(Flaky::default());
        let (executor, bus, metrics, _dir) = setup(Arc::clone(&backend)).await;
        executor.cancel.cancel();

        let alert = bus.publish(critical_alert()).await.unwrap();
        let plan = PatchPlanner::new(&PlannerConfig::default(), None).plan(&alert);
        let result = executor.execute(plan).await;

        assert!(!result.success());
        assert!(result.escalation.is_none());
        assert_eq!(metrics.snapshot().escalations, 0);
        assert_eq!(bus.get(alert.id).await.unwrap().status, AlertStatus::Failed);
        assert_eq!(backend.restarts.load(Ordering::SeqCst), 0);
    }
}
