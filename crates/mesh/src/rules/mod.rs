//! Rule engine.
//!
//! Rules are compiled into an immutable [`RuleSnapshot`]; reload builds a whole
//! new snapshot and swaps the `Arc`, so an evaluation sees either the old set
//! or the new one, never a mix. A rule set that fails to compile leaves the
//! current snapshot in place.

pub mod pattern;
pub mod rate;

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use mesh_config::{ActionTemplate, AnomalyModel, ConfigError, RuleSetFile, TriggerSpec};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::alert::Finding;
use crate::anomaly::{AnomalyScorer, BURST_METRIC};
use crate::error::MeshError;
use crate::event::Event;
use crate::metrics::HealthMetrics;
use crate::Severity;

pub use pattern::{PatternHit, PatternMatcher};
pub use rate::RateLimiter;

/// Staleness policy handed to the liveness supervisor by a `heartbeat_gap` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessPolicy {
    pub rule_id: String,
    /// `None` applies to every entity
    pub entity: Option<String>,
    pub max_gap_secs: u64,
    pub severity: Severity,
}

/// Identity of a compiled snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    /// Increases by one on every successful load
    pub generation: u64,
    /// SHA-256 of the rule file's canonical form
    pub digest: String,
    pub version: String,
    pub rule_count: usize,
    pub enabled_count: usize,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum Check {
    Rate { window: TimeDelta, max_hits: u32 },
    Pattern(PatternMatcher),
    Anomaly {
        metric: String,
        model: AnomalyModel,
        threshold: f64,
    },
}

#[derive(Debug, Clone)]
struct CompiledRule {
    id: String,
    severity: Severity,
    category: String,
    check: Check,
}

/// Immutable compiled rule set.
#[derive(Debug)]
pub struct RuleSnapshot {
    info: SnapshotInfo,
    /// Per-event rules, most severe first, file order within a severity
    rules: Vec<CompiledRule>,
    liveness: Vec<LivenessPolicy>,
    anomaly_metrics: HashSet<String>,
    action_overrides: HashMap<String, Vec<ActionTemplate>>,
    categories: HashSet<String>,
}

impl RuleSnapshot {
    /// Validate and compile a rule set.
    pub fn compile(set: &RuleSetFile, generation: u64) -> Result<Self, ConfigError> {
        set.validate()?;

        let mut rules = Vec::new();
        let mut liveness = Vec::new();
        let mut anomaly_metrics = HashSet::new();
        let mut action_overrides: HashMap<String, Vec<ActionTemplate>> = HashMap::new();
        let mut categories = HashSet::new();

        for spec in set.enabled() {
            let category = spec.category().to_string();
            categories.insert(category.clone());

            if !spec.actions.is_empty() {
                match action_overrides.get(&category) {
                    Some(existing) if *existing != spec.actions => warn!(
                        rule_id = %spec.id,
                        category = %category,
                        "Category already has actions from an earlier rule, ignoring these"
                    ),
                    Some(_) => {}
                    None => {
                        action_overrides.insert(category.clone(), spec.actions.clone());
                    }
                }
            }

            let check = match &spec.trigger {
                TriggerSpec::RateLimit {
                    window_secs,
                    max_hits,
                } => Check::Rate {
                    window: crate::secs(*window_secs),
                    max_hits: *max_hits,
                },
                TriggerSpec::Pattern {
                    pattern,
                    terms,
                    attribute,
                    case_insensitive,
                } => Check::Pattern(PatternMatcher::compile(
                    &spec.id,
                    pattern.as_deref(),
                    terms,
                    attribute,
                    *case_insensitive,
                )?),
                TriggerSpec::HeartbeatGap {
                    max_gap_secs,
                    entity,
                } => {
                    liveness.push(LivenessPolicy {
                        rule_id: spec.id.clone(),
                        entity: entity.clone(),
                        max_gap_secs: *max_gap_secs,
                        severity: spec.severity,
                    });
                    continue;
                }
                TriggerSpec::Anomaly {
                    metric,
                    model,
                    threshold,
                } => {
                    let metric = if *model == AnomalyModel::Burst {
                        BURST_METRIC.to_string()
                    } else {
                        metric.clone()
                    };
                    anomaly_metrics.insert(metric.clone());
                    Check::Anomaly {
                        metric,
                        model: *model,
                        threshold: *threshold,
                    }
                }
            };

            rules.push(CompiledRule {
                id: spec.id.clone(),
                severity: spec.severity,
                category,
                check,
            });
        }

        rules.sort_by_key(|r| Reverse(r.severity));

        Ok(Self {
            info: SnapshotInfo {
                generation,
                digest: set.digest(),
                version: set.version.clone(),
                rule_count: set.rules.len(),
                enabled_count: set.enabled().count(),
                loaded_at: Utc::now(),
            },
            rules,
            liveness,
            anomaly_metrics,
            action_overrides,
            categories,
        })
    }

    #[must_use]
    pub fn info(&self) -> &SnapshotInfo {
        &self.info
    }

    /// Policies from `heartbeat_gap` rules.
    #[must_use]
    pub fn liveness_policies(&self) -> &[LivenessPolicy] {
        &self.liveness
    }

    /// Metrics named by anomaly rules.
    #[must_use]
    pub fn anomaly_metrics(&self) -> &HashSet<String> {
        &self.anomaly_metrics
    }

    /// Category → action templates declared on rules.
    #[must_use]
    pub fn action_overrides(&self) -> &HashMap<String, Vec<ActionTemplate>> {
        &self.action_overrides
    }

    /// Categories findings from this rule set can carry.
    #[must_use]
    pub fn categories(&self) -> &HashSet<String> {
        &self.categories
    }

    fn rule_ids(&self) -> HashSet<String> {
        self.rules.iter().map(|r| r.id.clone()).collect()
    }

    fn longest_rate_window(&self) -> Option<TimeDelta> {
        self.rules
            .iter()
            .filter_map(|r| match r.check {
                Check::Rate { window, .. } => Some(window),
                _ => None,
            })
            .max()
    }
}

impl CompiledRule {
    fn evaluate(
        &self,
        event: &Event,
        limiter: &RateLimiter,
        scorer: &AnomalyScorer,
    ) -> Result<Option<Finding>, MeshError> {
        let finding = |evidence: serde_json::Value| Finding {
            rule_id: self.id.clone(),
            severity: self.severity,
            category: self.category.clone(),
            source_entity: event.source_entity.clone(),
            evidence,
            timestamp: event.timestamp,
        };

        match &self.check {
            Check::Rate { window, max_hits } => Ok(limiter
                .hit(
                    &event.source_entity,
                    &self.id,
                    event.timestamp,
                    *window,
                    *max_hits,
                )
                .map(|count| {
                    finding(json!({
                        "summary": format!(
                            "{count} events within {}s (limit {max_hits})",
                            window.num_seconds()
                        ),
                        "count": count,
                        "max_hits": max_hits,
                        "window_secs": window.num_seconds(),
                    }))
                })),
            Check::Pattern(matcher) => Ok(matcher.matches(&self.id, event)?.map(|hit| {
                let summary = if hit.by_term {
                    format!("blocked term '{}' in {}", hit.matched, hit.attribute)
                } else {
                    format!("pattern matched '{}' in {}", hit.matched, hit.attribute)
                };
                finding(json!({
                    "summary": summary,
                    "attribute": hit.attribute,
                    "matched": hit.matched,
                }))
            })),
            Check::Anomaly {
                metric,
                model,
                threshold,
            } => {
                if *model != AnomalyModel::Burst
                    && event.attributes.contains_key(metric)
                    && event.metric(metric).is_none()
                {
                    return Err(MeshError::RuleEvaluation {
                        rule_id: self.id.clone(),
                        reason: format!("metric '{metric}' is not numeric"),
                    });
                }
                Ok(scorer.score_rule(
                    event,
                    &self.id,
                    self.severity,
                    &self.category,
                    metric,
                    *model,
                    *threshold,
                ))
            }
        }
    }
}

/// Evaluates events against the current snapshot.
pub struct RuleEngine {
    current: RwLock<Arc<RuleSnapshot>>,
    generation: AtomicU64,
    limiter: RateLimiter,
    metrics: Arc<HealthMetrics>,
}

impl RuleEngine {
    /// Compile the initial rule set.
    pub fn new(
        set: &RuleSetFile,
        shards: usize,
        metrics: Arc<HealthMetrics>,
    ) -> Result<Self, ConfigError> {
        let snapshot = RuleSnapshot::compile(set, 1)?;
        info!(
            generation = 1,
            rules = snapshot.info.enabled_count,
            digest = %snapshot.info.digest,
            "Rule set loaded"
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
            limiter: RateLimiter::new(shards),
            metrics,
        })
    }

    /// The snapshot in effect right now.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the rule set. On error the current snapshot stays in effect.
    pub fn reload(&self, set: &RuleSetFile) -> Result<SnapshotInfo, ConfigError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.load(Ordering::SeqCst) + 1;
        let snapshot = RuleSnapshot::compile(set, generation).inspect_err(|e| {
            warn!(error = %e, "Rule reload rejected, keeping current rules");
        })?;
        self.generation.store(generation, Ordering::SeqCst);

        self.limiter.retain_rules(&snapshot.rule_ids());
        let info = snapshot.info.clone();
        *current = Arc::new(snapshot);
        drop(current);

        info!(
            generation = info.generation,
            rules = info.enabled_count,
            digest = %info.digest,
            "Rule set reloaded"
        );
        Ok(info)
    }

    /// Evaluate one event. Each rule runs independently; a failing rule is
    /// logged and counted without affecting the others, and a critical
    /// finding stops evaluation of the remaining rules for this event.
    pub fn evaluate(&self, event: &Event, scorer: &AnomalyScorer) -> Vec<Finding> {
        let snapshot = self.snapshot();
        let mut findings = Vec::new();

        for rule in &snapshot.rules {
            match rule.evaluate(event, &self.limiter, scorer) {
                Ok(Some(finding)) => {
                    let critical = finding.severity == Severity::Critical;
                    findings.push(finding);
                    if critical {
                        debug!(
                            rule_id = %rule.id,
                            entity = %event.source_entity,
                            "Critical match, skipping remaining rules"
                        );
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    HealthMetrics::incr(&self.metrics.rule_errors);
                    warn!(
                        rule_id = %rule.id,
                        entity = %event.source_entity,
                        event_id = %event.id,
                        error = %e,
                        "Rule evaluation failed"
                    );
                }
            }
        }

        if !findings.is_empty() {
            HealthMetrics::add(&self.metrics.findings, findings.len() as u64);
        }
        findings
    }

    /// Drop rate windows idle for longer than the longest rate window.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        match self.snapshot().longest_rate_window() {
            Some(window) => self.limiter.sweep(now, window),
            None => 0,
        }
    }
}
