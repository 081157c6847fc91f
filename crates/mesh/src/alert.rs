//! Findings, alerts and the alert status lifecycle.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Severity;

/// Category of alerts synthesized by the liveness supervisor.
pub const CATEGORY_HEARTBEAT: &str = "heartbeat";
/// Category of alerts raised when remediation gives up.
pub const CATEGORY_ESCALATION: &str = "escalation";
/// Category of alerts raised when restart suppression kicks in.
pub const CATEGORY_MANUAL_INTERVENTION: &str = "manual_intervention";

/// Raw detection produced by a rule or the anomaly scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Rule id, or `<model>:<metric>` for scorer findings
    pub rule_id: String,
    pub severity: Severity,
    pub category: String,
    pub source_entity: String,
    #[serde(default)]
    pub evidence: Value,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle of an alert. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Remediating,
    Resolved,
    Failed,
}

impl AlertStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Remediating => "remediating",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        }
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Remediating => 1,
            Self::Resolved | Self::Failed => 2,
        }
    }

    /// Resolved and failed are final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }

    /// Whether `self → to` keeps the lifecycle monotonic.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        to.rank() > self.rank()
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prioritized, correlated alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub source_entity: String,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    /// Never empty
    pub evidence: Vec<Finding>,
    pub created_at: DateTime<Utc>,
    pub status: AlertStatus,
    /// Alert this one escalates, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Uuid>,
}

impl Alert {
    /// Merge findings into one alert.
    ///
    /// Severity is the maximum of the findings; the primary category is taken
    /// from the earliest finding at that severity. Returns `None` for an
    /// empty slice.
    #[must_use]
    pub fn from_findings(mut findings: Vec<Finding>) -> Option<Self> {
        // Stable sort keeps arrival order among equal timestamps.
        findings.sort_by_key(|f| f.timestamp);
        let severity = findings.iter().map(|f| f.severity).max()?;
        let primary = findings.iter().find(|f| f.severity == severity)?;
        let source_entity = primary.source_entity.clone();
        let category = primary.category.clone();

        let rules: BTreeSet<&str> = findings.iter().map(|f| f.rule_id.as_str()).collect();
        let message = if findings.len() == 1 {
            format!("{} on {source_entity}: {}", primary.rule_id, summarize(&primary.evidence))
        } else {
            format!(
                "{} findings on {source_entity} ({})",
                findings.len(),
                rules.into_iter().collect::<Vec<_>>().join(", ")
            )
        };

        Some(Self {
            id: Uuid::new_v4(),
            source_entity,
            category,
            severity,
            message,
            evidence: findings,
            created_at: Utc::now(),
            status: AlertStatus::Open,
            references: None,
        })
    }

    /// Alert produced outside the correlator (liveness, escalation).
    #[must_use]
    pub fn synthetic(
        source_entity: &str,
        category: &str,
        severity: Severity,
        rule_id: &str,
        message: String,
        evidence: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_entity: source_entity.to_string(),
            category: category.to_string(),
            severity,
            message,
            evidence: vec![Finding {
                rule_id: rule_id.to_string(),
                severity,
                category: category.to_string(),
                source_entity: source_entity.to_string(),
                evidence,
                timestamp: now,
            }],
            created_at: now,
            status: AlertStatus::Open,
            references: None,
        }
    }

    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

fn summarize(evidence: &Value) -> String {
    match evidence {
        Value::Null => "no evidence".to_string(),
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("summary")
            .and_then(Value::as_str)
            .map_or_else(|| evidence.to_string(), ToString::to_string),
        other => other.to_string(),
    }
}
