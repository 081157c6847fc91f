//! Correlator: merges findings from one entity within a window into an alert.
//!
//! Buffers are partitioned by entity hash, each partition behind its own lock.
//! A buffer opens with its first finding and is flushed when the window has
//! elapsed (timer driven), when a critical finding arrives, or when it reaches
//! its size cap. Every finding lands in exactly one alert.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use mesh_config::CorrelatorConfig;
use tracing::debug;

use crate::alert::{Alert, Finding};
use crate::shard::Sharded;
use crate::Severity;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BufferKey {
    entity: String,
    /// Set only when grouping by category
    category: Option<String>,
}

#[derive(Debug)]
struct Buffer {
    opened_at: DateTime<Utc>,
    findings: Vec<Finding>,
}

/// Windowed finding correlator.
pub struct Correlator {
    window: TimeDelta,
    group_by_category: bool,
    max_findings: usize,
    buffers: Sharded<HashMap<BufferKey, Buffer>>,
}

impl Correlator {
    #[must_use]
    pub fn new(config: &CorrelatorConfig, shards: usize) -> Self {
        Self {
            window: crate::millis(config.window_ms),
            group_by_category: config.group_by_category,
            max_findings: config.max_findings_per_buffer.max(1),
            buffers: Sharded::new(shards),
        }
    }

    fn key(&self, finding: &Finding) -> BufferKey {
        BufferKey {
            entity: finding.source_entity.clone(),
            category: self
                .group_by_category
                .then(|| finding.category.clone()),
        }
    }

    /// Buffer a finding received at `now`. Returns an alert when this
    /// finding forces a flush.
    pub fn add(&self, finding: Finding, now: DateTime<Utc>) -> Option<Alert> {
        let key = self.key(&finding);
        let critical = finding.severity == Severity::Critical;

        let flushed = {
            let mut shard = self.buffers.lock(&key.entity);
            let buffer = shard.entry(key.clone()).or_insert_with(|| Buffer {
                opened_at: now,
                findings: Vec::new(),
            });
            buffer.findings.push(finding);
            if critical || buffer.findings.len() >= self.max_findings {
                shard.remove(&key)
            } else {
                None
            }
        }?;

        debug!(
            entity = %key.entity,
            findings = flushed.findings.len(),
            critical,
            "Flushing correlation buffer early"
        );
        Alert::from_findings(flushed.findings)
    }

    /// Flush every buffer whose window has elapsed.
    pub fn flush_expired(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut ready = Vec::new();
        self.buffers.for_each(|shard| {
            let expired: Vec<BufferKey> = shard
                .iter()
                .filter(|(_, b)| now - b.opened_at >= self.window)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(buffer) = shard.remove(&key) {
                    ready.push(buffer);
                }
            }
        });
        ready
            .into_iter()
            .filter_map(|b| Alert::from_findings(b.findings))
            .collect()
    }

    /// Flush everything regardless of age (shutdown).
    pub fn flush_all(&self) -> Vec<Alert> {
        let mut ready = Vec::new();
        self.buffers.for_each(|shard| {
            ready.extend(shard.drain().map(|(_, b)| b));
        });
        ready
            .into_iter()
            .filter_map(|b| Alert::from_findings(b.findings))
            .collect()
    }

    /// Findings currently buffered.
    #[must_use]
    pub fn pending(&self) -> usize {
        let mut total = 0;
        self.buffers
            .for_each(|shard| total += shard.values().map(|b| b.findings.len()).sum::<usize>());
        total
    }
}
