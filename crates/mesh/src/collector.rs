//! Event collector: normalizes raw records onto the ingest queue.
//!
//! Ingestion never blocks. Under sustained overload the oldest queued events
//! are dropped and counted; malformed records are logged and skipped.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::event::{Event, RawRecord};
use crate::metrics::HealthMetrics;
use crate::queue::{DropOldestQueue, Pushed};

/// Outcome of a batch ingest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rejected: usize,
}

/// Front door of the pipeline.
#[derive(Clone)]
pub struct Collector {
    queue: Arc<DropOldestQueue<Event>>,
    metrics: Arc<HealthMetrics>,
}

impl Collector {
    /// Create a collector with a bounded ingest queue.
    #[must_use]
    pub fn new(capacity: usize, metrics: Arc<HealthMetrics>) -> Self {
        Self {
            queue: Arc::new(DropOldestQueue::new(capacity)),
            metrics,
        }
    }

    /// Queue the stage workers read from.
    #[must_use]
    pub fn queue(&self) -> Arc<DropOldestQueue<Event>> {
        Arc::clone(&self.queue)
    }

    /// Normalize and enqueue one record.
    pub fn submit(&self, record: RawRecord) -> Result<Uuid> {
        let entity = record.entity().to_string();
        let event = Event::from_record(record, Utc::now()).inspect_err(|e| {
            HealthMetrics::incr(&self.metrics.malformed_records);
            warn!(entity = %entity, error = %e, "Discarding malformed record");
        })?;
        Ok(self.enqueue(event))
    }

    /// Enqueue an already-normalized event.
    pub fn enqueue(&self, event: Event) -> Uuid {
        let id = event.id;
        HealthMetrics::incr(&self.metrics.events_ingested);
        match self.queue.push(event) {
            Pushed::Queued => {}
            Pushed::Evicted(old) => {
                HealthMetrics::incr(&self.metrics.events_dropped);
                debug!(
                    entity = %old.source_entity,
                    event_id = %old.id,
                    "Ingest queue full, dropped oldest event"
                );
            }
            Pushed::Rejected(event) => {
                HealthMetrics::incr(&self.metrics.events_dropped);
                debug!(entity = %event.source_entity, "Ingest queue closed, event dropped");
            }
        }
        id
    }

    /// Parse a JSON value and enqueue it.
    pub fn ingest_json(&self, value: Value) -> Result<Uuid> {
        let record = RawRecord::from_value(value).inspect_err(|e| {
            HealthMetrics::incr(&self.metrics.malformed_records);
            warn!(error = %e, "Discarding malformed record");
        })?;
        self.submit(record)
    }

    /// Ingest a batch, skipping bad items.
    pub fn ingest_batch(&self, values: Vec<Value>) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for value in values {
            match self.ingest_json(value) {
                Ok(_) => summary.accepted += 1,
                Err(_) => summary.rejected += 1,
            }
        }
        summary
    }

    /// Ingest newline-delimited JSON records, skipping blank and bad lines.
    pub fn ingest_lines(&self, input: &str) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for line in input.lines().filter(|l| !l.trim().is_empty()) {
            let outcome = RawRecord::from_json_line(line)
                .inspect_err(|e| {
                    HealthMetrics::incr(&self.metrics.malformed_records);
                    warn!(error = %e, "Discarding malformed line");
                })
                .and_then(|record| self.submit(record));
            match outcome {
                Ok(_) => summary.accepted += 1,
                Err(_) => summary.rejected += 1,
            }
        }
        summary
    }

    /// Stop accepting events.
    pub fn close(&self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_batch_skips_malformed() {
        let metrics = Arc::new(HealthMetrics::new());
        let collector = Collector::new(16, Arc::clone(&metrics));

        let summary = collector.ingest_batch(vec![
            json!({"source": "heartbeat", "entity": "api"}),
            json!({"source": "heartbeat"}),
            json!("garbage"),
            json!({"source": "log", "entity": "api", "line": "started"}),
        ]);

        assert_eq!(summary, IngestSummary { accepted: 2, rejected: 2 });
        let snap = metrics.snapshot();
        assert_eq!(snap.malformed_records, 2);
        assert_eq!(snap.events_ingested, 2);
        assert_eq!(collector.queue().len(), 2);
    }

    #[test]
    fn test_overload_drops_oldest() {
        let metrics = Arc::new(HealthMetrics::new());
        let collector = Collector::new(3, Arc::clone(&metrics));
        let input: String = (0..5)
            .map(|i| format!("{{\"source\":\"log\",\"entity\":\"e\",\"line\":\"{i}\"}}\n"))
            .collect();

        let summary = collector.ingest_lines(&input);
        assert_eq!(summary.accepted, 5);
        assert_eq!(metrics.snapshot().events_dropped, 2);

        let queue = collector.queue();
        let first = queue.try_pop().unwrap();
        assert_eq!(first.attribute_text("message").as_deref(), Some("2"));
    }
}
