//! Built-in rule set used when no rule file is configured.

use crate::rules::{AnomalyModel, RuleSetFile, RuleSpec, TriggerSpec};
use crate::Severity;

/// Version label of the built-in rules.
pub const DEFAULT_RULES_VERSION: &str = "builtin-1";

/// Shell commands that should never appear in mirrored traffic.
const BLOCKED_SYSTEM_TERMS: &[&str] = &[
    "rm -rf",
    "sudo rm",
    "format disk",
    "del /f",
    "shutdown",
    "reboot",
    "poweroff",
    "init 0",
    "killall",
    "kill -9",
];

fn pattern_rule(id: &str, description: &str, severity: Severity, pattern: &str) -> RuleSpec {
    RuleSpec {
        id: id.to_string(),
        description: description.to_string(),
        severity,
        category: Some("intrusion".to_string()),
        trigger: TriggerSpec::Pattern {
            pattern: Some(pattern.to_string()),
            terms: Vec::new(),
            attribute: "message".to_string(),
            case_insensitive: true,
        },
        actions: Vec::new(),
        enabled: true,
    }
}

/// The default detection rules.
#[must_use]
pub fn default_rule_set() -> RuleSetFile {
    let mut rules = vec![
        pattern_rule(
            "SQL-001",
            "Basic SQL injection attempt",
            Severity::High,
            r"select\s+.+?\s+from|insert\s+into|update\s+\w+\s+set|delete\s+from|(drop|alter|create)\s+(table|database)",
        ),
        pattern_rule(
            "CMD-001",
            "Command injection attempt",
            Severity::Critical,
            r"(;|\|\||\||&&|\$\(|`)\s*(ls|cat|rm|chmod|wget|curl)\b",
        ),
        pattern_rule(
            "PATH-001",
            "Directory traversal attempt",
            Severity::High,
            r"(\.\./|/\.\./)",
        ),
        pattern_rule(
            "XSS-001",
            "Cross-site scripting attempt",
            Severity::High,
            r"<script.*?>|javascript:|onerror=|onload=|onclick=",
        ),
        pattern_rule(
            "LFI-001",
            "Local file inclusion attempt",
            Severity::Warn,
            r"(\?|&)(file|page|include|require|path|directory)=\.\.?/",
        ),
        pattern_rule(
            "RFI-001",
            "Remote file inclusion attempt",
            Severity::High,
            r"(\?|&)(file|page|include|require|path)=(https?|ftp)://",
        ),
        pattern_rule(
            "SSTI-001",
            "Possible server-side template injection",
            Severity::Warn,
            r"\{\{.*?\}\}|\{%.*?%\}|\$\{.*?\}",
        ),
    ];

    rules.push(RuleSpec {
        id: "TERM-SYSTEM".to_string(),
        description: "Blocked system command in message".to_string(),
        severity: Severity::High,
        category: Some("intrusion".to_string()),
        trigger: TriggerSpec::Pattern {
            pattern: None,
            terms: BLOCKED_SYSTEM_TERMS.iter().map(ToString::to_string).collect(),
            attribute: "message".to_string(),
            case_insensitive: true,
        },
        actions: Vec::new(),
        enabled: true,
    });

    rules.push(RuleSpec {
        id: "request-flood".to_string(),
        description: "More than 10 requests in 5 seconds from one entity".to_string(),
        severity: Severity::High,
        category: None,
        trigger: TriggerSpec::RateLimit {
            window_secs: 5,
            max_hits: 10,
        },
        actions: Vec::new(),
        enabled: true,
    });

    rules.push(RuleSpec {
        id: "heartbeat-gap".to_string(),
        description: "Entity silent for more than 90 seconds".to_string(),
        severity: Severity::High,
        category: Some("heartbeat".to_string()),
        trigger: TriggerSpec::HeartbeatGap {
            max_gap_secs: 90,
            entity: None,
        },
        actions: Vec::new(),
        enabled: true,
    });

    rules.push(RuleSpec {
        id: "latency-zscore".to_string(),
        description: "Latency more than 3 standard deviations above baseline".to_string(),
        severity: Severity::Warn,
        category: Some("anomaly".to_string()),
        trigger: TriggerSpec::Anomaly {
            metric: "latency_ms".to_string(),
            model: AnomalyModel::Zscore,
            threshold: 3.0,
        },
        actions: Vec::new(),
        enabled: true,
    });

    RuleSetFile {
        version: DEFAULT_RULES_VERSION.to_string(),
        rules,
    }
}
