//! Notification event types for the resilience mesh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// High - automated remediation in progress
    High,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Parse a configured floor such as `high` or `Warning`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warning),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A correlated alert was published
    AlertRaised {
        alert_id: String,
        entity: String,
        category: String,
        severity: Severity,
        message: String,
        #[serde(default)]
        context: HashMap<String, String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Automated remediation gave up; a human is needed
    Escalation {
        alert_id: String,
        original_alert_id: String,
        entity: String,
        reason: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Message produced by a plan's `notify` action
    Operator {
        entity: String,
        #[serde(default)]
        alert_id: Option<String>,
        message: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::AlertRaised {
                entity, category, ..
            } => format!("Alert: {category} on {entity}"),
            Self::Escalation { entity, .. } => format!("Escalation: {entity}"),
            Self::Operator { entity, .. } => format!("Mesh: {entity}"),
        }
    }

    /// Get the severity/color for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::AlertRaised { severity, .. } => *severity,
            Self::Escalation { .. } => Severity::Critical,
            Self::Operator { .. } => Severity::Warning,
        }
    }

    /// Entity the event is about.
    #[must_use]
    pub fn entity(&self) -> &str {
        match self {
            Self::AlertRaised { entity, .. }
            | Self::Escalation { entity, .. }
            | Self::Operator { entity, .. } => entity,
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::AlertRaised { timestamp, .. }
            | Self::Escalation { timestamp, .. }
            | Self::Operator { timestamp, .. } => *timestamp,
        }
    }
}
