//! Patch planner: maps an alert to an ordered, whitelisted action plan.
//!
//! | severity       | plan                          |
//! |----------------|-------------------------------|
//! | info, warn     | nothing                       |
//! | high           | restart                       |
//! | critical       | restart, reload, notify       |
//!
//! A category override (from config or from rule `actions`) replaces the
//! table for that category. Alerts in a category nobody declared get a
//! notify-only plan.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use mesh_config::{ActionTemplate, PlannerConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alert::{Alert, CATEGORY_ESCALATION, CATEGORY_HEARTBEAT, CATEGORY_MANUAL_INTERVENTION};
use crate::anomaly::CATEGORY_ANOMALY;
use crate::rules::RuleSnapshot;
use crate::Severity;

/// Category of alerts injected by operators.
pub const CATEGORY_MANUAL: &str = "manual";

const BUILTIN_CATEGORIES: &[&str] = &[
    "rate_limit",
    "pattern",
    "intrusion",
    "heartbeat_gap",
    CATEGORY_ANOMALY,
    CATEGORY_HEARTBEAT,
    CATEGORY_MANUAL,
    CATEGORY_ESCALATION,
    CATEGORY_MANUAL_INTERVENTION,
];

/// One whitelisted remediation step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Restart { target: String },
    Reload { target: String },
    ConfigEdit {
        target: String,
        key: String,
        value: String,
    },
    Notify { target: String, message: String },
}

impl Action {
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Restart { target }
            | Self::Reload { target }
            | Self::ConfigEdit { target, .. }
            | Self::Notify { target, .. } => target,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Restart { .. } => "restart",
            Self::Reload { .. } => "reload",
            Self::ConfigEdit { .. } => "config_edit",
            Self::Notify { .. } => "notify",
        }
    }

    fn from_template(template: &ActionTemplate, alert: &Alert) -> Self {
        let target = alert.source_entity.clone();
        match template {
            ActionTemplate::Restart => Self::Restart { target },
            ActionTemplate::Reload => Self::Reload { target },
            ActionTemplate::ConfigEdit { key, value } => Self::ConfigEdit {
                target,
                key: key.clone(),
                value: value.clone(),
            },
            ActionTemplate::Notify { message } => Self::Notify {
                target,
                message: message.clone().unwrap_or_else(|| default_message(alert)),
            },
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigEdit {
                target, key, value, ..
            } => write!(f, "config_edit {target} {key}={value}"),
            other => write!(f, "{} {}", other.kind(), other.target()),
        }
    }
}

fn default_message(alert: &Alert) -> String {
    format!(
        "{} {} alert {} on {}: {}",
        alert.severity, alert.category, alert.id, alert.source_entity, alert.message
    )
}

/// Plan lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Ordered remediation plan for one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchPlan {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub entity: String,
    pub category: String,
    pub severity: Severity,
    pub actions: Vec<Action>,
    /// Success leaves the alert remediating until an outside signal (a
    /// liveness pulse) resolves it
    pub awaits_confirmation: bool,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

impl PatchPlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }

    /// Distinct targets, sorted (lock order).
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.actions.iter().map(|a| a.target().to_string()).collect();
        targets.sort();
        targets.dedup();
        targets
    }
}

/// Severity table plus category overrides.
#[derive(Debug, Clone, Default)]
pub struct PatchPlanner {
    overrides: HashMap<String, Vec<ActionTemplate>>,
    known: HashSet<String>,
}

impl PatchPlanner {
    /// Build the planner. Config overrides beat rule `actions`, which beat
    /// the built-in notify-only handling of escalations.
    #[must_use]
    pub fn new(config: &PlannerConfig, rules: Option<&RuleSnapshot>) -> Self {
        let notify_only = vec![ActionTemplate::Notify { message: None }];
        let mut overrides: HashMap<String, Vec<ActionTemplate>> = HashMap::new();
        overrides.insert(CATEGORY_ESCALATION.to_string(), notify_only.clone());
        overrides.insert(CATEGORY_MANUAL_INTERVENTION.to_string(), notify_only);

        let mut known: HashSet<String> = BUILTIN_CATEGORIES.iter().map(ToString::to_string).collect();
        if let Some(rules) = rules {
            known.extend(rules.categories().iter().cloned());
            for (category, actions) in rules.action_overrides() {
                overrides.insert(category.clone(), actions.clone());
            }
        }
        for (category, actions) in &config.category_overrides {
            overrides.insert(category.clone(), actions.clone());
        }
        known.extend(overrides.keys().cloned());

        Self { overrides, known }
    }

    #[must_use]
    pub fn is_known(&self, category: &str) -> bool {
        self.known.contains(category)
    }

    /// Produce the plan for an alert. Same alert, same actions.
    #[must_use]
    pub fn plan(&self, alert: &Alert) -> PatchPlan {
        let templates: Vec<ActionTemplate> = if let Some(actions) = self.overrides.get(&alert.category) {
            actions.clone()
        } else if !self.is_known(&alert.category) {
            vec![ActionTemplate::Notify { message: None }]
        } else {
            match alert.severity {
                Severity::Info | Severity::Warn => Vec::new(),
                Severity::High => vec![ActionTemplate::Restart],
                Severity::Critical => vec![
                    ActionTemplate::Restart,
                    ActionTemplate::Reload,
                    ActionTemplate::Notify { message: None },
                ],
            }
        };

        let actions: Vec<Action> = templates
            .iter()
            .map(|t| Action::from_template(t, alert))
            .collect();
        let awaits_confirmation = alert.category == CATEGORY_HEARTBEAT
            && actions.iter().any(|a| matches!(a, Action::Restart { .. }));

        PatchPlan {
            id: Uuid::new_v4(),
            alert_id: alert.id,
            entity: alert.source_entity.clone(),
            category: alert.category.clone(),
            severity: alert.severity,
            actions,
            awaits_confirmation,
            status: PlanStatus::Pending,
            created_at: Utc::now(),
        }
    }
}
