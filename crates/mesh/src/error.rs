//! Error types for the mesh pipeline.

use thiserror::Error;
use uuid::Uuid;

use crate::alert::AlertStatus;

/// Errors raised by pipeline stages.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Input record could not be normalized
    #[error("malformed record: {0}")]
    Malformed(String),

    /// A single rule failed while evaluating an event
    #[error("rule {rule_id} failed: {reason}")]
    RuleEvaluation { rule_id: String, reason: String },

    #[error("unknown alert {0}")]
    UnknownAlert(Uuid),

    /// Alert status may only move forward
    #[error("alert {alert_id} cannot move from {from} to {to}")]
    InvalidTransition {
        alert_id: Uuid,
        from: AlertStatus,
        to: AlertStatus,
    },

    /// A bus subscriber refused or failed to take an alert
    #[error("subscriber {subscriber} failed: {reason}")]
    Delivery { subscriber: String, reason: String },

    #[error("audit log error: {0}")]
    Audit(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] mesh_config::ConfigError),

    /// The pipeline is shutting down
    #[error("pipeline closed")]
    Closed,
}

/// Result alias used throughout the crate.
pub type Result<T, E = MeshError> = std::result::Result<T, E>;
