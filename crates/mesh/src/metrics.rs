//! Pipeline health counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters shared by every stage.
#[derive(Debug, Default)]
pub struct HealthMetrics {
    pub events_ingested: AtomicU64,
    /// Events evicted from the collector or worker queues
    pub events_dropped: AtomicU64,
    pub malformed_records: AtomicU64,
    pub rule_errors: AtomicU64,
    pub findings: AtomicU64,
    pub alerts_published: AtomicU64,
    /// Alerts evicted from a slow subscriber's queue
    pub subscriber_dropped: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub audit_errors: AtomicU64,
    pub plans_executed: AtomicU64,
    pub plans_failed: AtomicU64,
    pub escalations: AtomicU64,
    pub restarts_suppressed: AtomicU64,
}

/// Point-in-time copy of [`HealthMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub events_ingested: u64,
    pub events_dropped: u64,
    pub malformed_records: u64,
    pub rule_errors: u64,
    pub findings: u64,
    pub alerts_published: u64,
    pub subscriber_dropped: u64,
    pub delivery_failures: u64,
    pub audit_errors: u64,
    pub plans_executed: u64,
    pub plans_failed: u64,
    pub escalations: u64,
    pub restarts_suppressed: u64,
}

impl HealthMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        HealthSnapshot {
            events_ingested: get(&self.events_ingested),
            events_dropped: get(&self.events_dropped),
            malformed_records: get(&self.malformed_records),
            rule_errors: get(&self.rule_errors),
            findings: get(&self.findings),
            alerts_published: get(&self.alerts_published),
            subscriber_dropped: get(&self.subscriber_dropped),
            delivery_failures: get(&self.delivery_failures),
            audit_errors: get(&self.audit_errors),
            plans_executed: get(&self.plans_executed),
            plans_failed: get(&self.plans_failed),
            escalations: get(&self.escalations),
            restarts_suppressed: get(&self.restarts_suppressed),
        }
    }
}

impl HealthSnapshot {
    /// Any error or loss counter is non-zero.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.events_dropped > 0
            || self.rule_errors > 0
            || self.subscriber_dropped > 0
            || self.delivery_failures > 0
            || self.audit_errors > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_degraded() {
        let metrics = HealthMetrics::new();
        HealthMetrics::incr(&metrics.events_ingested);
        HealthMetrics::add(&metrics.findings, 3);
        let snap = metrics.snapshot();
        assert_eq!(snap.events_ingested, 1);
        assert_eq!(snap.findings, 3);
        assert!(!snap.is_degraded());

        HealthMetrics::incr(&metrics.rule_errors);
        assert!(metrics.snapshot().is_degraded());
    }
}
