//! Self-healing resilience mesh.
//!
//! Observes traffic, log lines and liveness pulses from running services,
//! detects policy violations and statistical anomalies, correlates them into
//! alerts and runs bounded, audited remediation plans.
//!
//! Data flows collector → rules → anomaly → correlator → bus → planner →
//! executor, with the liveness supervisor publishing straight onto the bus.
//! [`pipeline::Mesh`] wires the stages together; each stage is usable on its
//! own.

pub mod alert;
pub mod anomaly;
pub mod audit;
pub mod bus;
pub mod collector;
pub mod correlator;
pub mod error;
pub mod event;
pub mod executor;
pub mod liveness;
pub mod metrics;
pub mod pipeline;
pub mod planner;
pub mod queue;
pub mod rules;
pub mod server;
pub mod shard;

pub use alert::{Alert, AlertStatus, Finding};
pub use error::{MeshError, Result};
pub use event::{Event, EventCategory, RawRecord};
pub use mesh_config::Severity;
pub use pipeline::Mesh;

use chrono::TimeDelta;

/// Whole seconds as a [`TimeDelta`], saturating instead of overflowing.
pub(crate) fn secs(n: u64) -> TimeDelta {
    i64::try_from(n)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// Milliseconds as a [`TimeDelta`], saturating instead of overflowing.
pub(crate) fn millis(n: u64) -> TimeDelta {
    i64::try_from(n)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}
