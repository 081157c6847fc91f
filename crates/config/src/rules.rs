//! Declarative rule-set schema.
//!
//! A rule file looks like:
//!
//! ```yaml
//! version: "1.2.0"
//! rules:
//!   - id: request-flood
//!     severity: high
//!     trigger: { type: rate_limit, window_secs: 5, max_hits: 10 }
//!   - id: sql-injection
//!     severity: high
//!     trigger: { type: pattern, pattern: "(?i)select\\s+.*\\s+from", attribute: body }
//!     actions:
//!       - { type: config_edit, key: SQL_GUARD, value: strict }
//!       - { type: reload }
//! ```

use std::collections::HashSet;
use std::path::Path;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{parse_str, read_file, ConfigError, FileFormat, Severity};

/// Attribute inspected by pattern rules when none is given.
pub const DEFAULT_PATTERN_ATTRIBUTE: &str = "message";

/// A whole rule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetFile {
    /// Free-form version label carried into snapshot info
    #[serde(default = "default_version")]
    pub version: String,
    /// Rules, evaluated independently
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// One detection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Unique rule identifier
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    /// Category stamped on findings; defaults to the trigger type name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub trigger: TriggerSpec,
    /// Remediation templates registered as a category override for the planner
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionTemplate>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_true() -> bool {
    true
}

impl RuleSpec {
    /// Category findings from this rule carry.
    #[must_use]
    pub fn category(&self) -> &str {
        self.category
            .as_deref()
            .unwrap_or_else(|| self.trigger.type_name())
    }
}

/// Trigger definition, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// More than `max_hits` events per entity inside `window_secs`
    RateLimit { window_secs: u64, max_hits: u32 },
    /// Regex and/or blocked-term match on one event attribute
    #[serde(alias = "regex")]
    Pattern {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        terms: Vec<String>,
        #[serde(default = "default_attribute")]
        attribute: String,
        #[serde(default = "default_true")]
        case_insensitive: bool,
    },
    /// Liveness gap, enforced by the liveness supervisor rather than per event
    HeartbeatGap {
        max_gap_secs: u64,
        /// Entity the gap applies to; all entities when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity: Option<String>,
    },
    /// Statistical check delegated to the anomaly scorer
    Anomaly {
        metric: String,
        #[serde(default)]
        model: AnomalyModel,
        threshold: f64,
    },
}

fn default_attribute() -> String {
    DEFAULT_PATTERN_ATTRIBUTE.to_string()
}

impl TriggerSpec {
    /// Wire name of the trigger type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "rate_limit",
            Self::Pattern { .. } => "pattern",
            Self::HeartbeatGap { .. } => "heartbeat_gap",
            Self::Anomaly { .. } => "anomaly",
        }
    }
}

/// Statistical model used by anomaly triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyModel {
    /// `threshold` standard deviations from the rolling mean
    #[default]
    #[serde(alias = "z_score")]
    Zscore,
    /// `threshold` is an absolute upper bound
    Bound,
    /// Events per one-second bucket, z-scored against recent buckets
    Burst,
}

/// Targetless action template; the planner binds the target entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionTemplate {
    Restart,
    Reload,
    #[serde(alias = "configuration_edit")]
    ConfigEdit { key: String, value: String },
    Notify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl RuleSetFile {
    /// Load and validate a rule file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let set: Self = read_file(path)?;
        set.validate()?;
        tracing::info!(
            path = %path.display(),
            rules = set.rules.len(),
            version = %set.version,
            "Loaded rule set"
        );
        Ok(set)
    }

    /// Parse and validate rule-file contents.
    pub fn from_str_as(raw: &str, format: FileFormat) -> Result<Self, ConfigError> {
        let set: Self = parse_str(raw, format, Path::new("<inline>"))?;
        set.validate()?;
        Ok(set)
    }

    /// Check ids, parameters and patterns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(ConfigError::InvalidRule {
                    rule_id: rule.id.clone(),
                    reason: "empty id".to_string(),
                });
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigError::DuplicateRule(rule.id.clone()));
            }
            validate_trigger(&rule.id, &rule.trigger)?;
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form, hex encoded.
    #[must_use]
    pub fn digest(&self) -> String {
        // Struct fields serialize in declaration order, so this is stable.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Enabled rules only.
    pub fn enabled(&self) -> impl Iterator<Item = &RuleSpec> {
        self.rules.iter().filter(|r| r.enabled)
    }
}

fn validate_trigger(rule_id: &str, trigger: &TriggerSpec) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidRule {
        rule_id: rule_id.to_string(),
        reason: reason.to_string(),
    };

    match trigger {
        TriggerSpec::RateLimit {
            window_secs,
            max_hits,
        } => {
            if *window_secs == 0 {
                return Err(invalid("rate_limit window_secs must be > 0"));
            }
            if *max_hits == 0 {
                return Err(invalid("rate_limit max_hits must be > 0"));
            }
        }
        TriggerSpec::Pattern {
            pattern,
            terms,
            attribute,
            case_insensitive,
        } => {
            if pattern.is_none() && terms.is_empty() {
                return Err(invalid("pattern rule needs a pattern or terms"));
            }
            if attribute.is_empty() {
                return Err(invalid("pattern attribute must not be empty"));
            }
            if let Some(pattern) = pattern {
                RegexBuilder::new(pattern)
                    .case_insensitive(*case_insensitive)
                    .build()
                    .map_err(|e| ConfigError::InvalidPattern {
                        rule_id: rule_id.to_string(),
                        reason: e.to_string(),
                    })?;
            }
        }
        TriggerSpec::HeartbeatGap { max_gap_secs, .. } => {
            if *max_gap_secs == 0 {
                return Err(invalid("heartbeat_gap max_gap_secs must be > 0"));
            }
        }
        TriggerSpec::Anomaly {
            metric, threshold, ..
        } => {
            if metric.is_empty() {
                return Err(invalid("anomaly metric must not be empty"));
            }
            if !threshold.is_finite() || *threshold <= 0.0 {
                return Err(invalid("anomaly threshold must be a positive number"));
            }
        }
    }
    Ok(())
}
