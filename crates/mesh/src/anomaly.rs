//! Statistical anomaly scoring.
//!
//! Keeps a rolling window of values per `(entity, metric)` series. Scoring is
//! read-only; [`AnomalyScorer::observe`] folds the event into the windows
//! after every rule has looked at it, so an outlier never dilutes the
//! statistics it is judged against.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use mesh_config::{AnomalyConfig, AnomalyModel, Baseline, WatchedMetric};
use serde_json::json;
use tracing::debug;

use crate::alert::Finding;
use crate::event::Event;
use crate::shard::Sharded;
use crate::Severity;

/// Pseudo-metric name for per-second event counts.
pub const BURST_METRIC: &str = "events_per_sec";

/// Category of scorer findings not tied to a rule.
pub const CATEGORY_ANOMALY: &str = "anomaly";

/// Mean and population standard deviation of a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
}

impl WindowStats {
    /// Compute over `values`; `None` when empty.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f64>) -> Option<Self> {
        let values: Vec<f64> = values.into_iter().copied().collect();
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        Some(Self {
            count,
            mean,
            std: variance.sqrt(),
        })
    }
}

/// Result of scoring one value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub model: AnomalyModel,
    pub value: f64,
    /// Standard deviations from the mean; `None` for the bound model
    pub z: Option<f64>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub severity: Severity,
}

/// Wire name of a model.
#[must_use]
pub const fn model_name(model: AnomalyModel) -> &'static str {
    match model {
        AnomalyModel::Zscore => "zscore",
        AnomalyModel::Bound => "bound",
        AnomalyModel::Burst => "burst",
    }
}

/// Score a value against window statistics.
///
/// Deviation models need `min_samples` of history; until then a static
/// `baseline` stands in, and without one the value is not scored. A flat
/// window (zero spread) is never scored. Severity tiers: `|z| ≥ t` warn,
/// `t + 1` high, `t + 2` critical.
#[must_use]
pub fn score_value(
    value: f64,
    stats: Option<&WindowStats>,
    model: AnomalyModel,
    threshold: f64,
    min_samples: usize,
    baseline: Option<Baseline>,
) -> Option<Score> {
    if !value.is_finite() {
        return None;
    }
    if model == AnomalyModel::Bound {
        return (value > threshold).then_some(Score {
            model,
            value,
            z: None,
            mean: None,
            std: None,
            severity: Severity::Warn,
        });
    }

    let (mean, std) = match stats {
        Some(s) if s.count >= min_samples => (s.mean, s.std),
        _ => {
            let baseline = baseline?;
            (baseline.mean, baseline.std)
        }
    };
    if !(std.is_finite() && std > f64::EPSILON) {
        return None;
    }

    let z = (value - mean) / std;
    let magnitude = z.abs();
    let severity = if magnitude >= threshold + 2.0 {
        Severity::Critical
    } else if magnitude >= threshold + 1.0 {
        Severity::High
    } else if magnitude >= threshold {
        Severity::Warn
    } else {
        return None;
    };

    Some(Score {
        model,
        value,
        z: Some(z),
        mean: Some(mean),
        std: Some(std),
        severity,
    })
}

#[derive(Debug)]
struct Series {
    values: VecDeque<f64>,
    last_seen: DateTime<Utc>,
    /// Burst series only: current second and its running count
    bucket: Option<(i64, u64)>,
}

impl Series {
    fn new(now: DateTime<Utc>, capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity.min(1024)),
            last_seen: now,
            bucket: None,
        }
    }

    fn push(&mut self, value: f64, window: usize) {
        if self.values.len() == window {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn stats(&self) -> Option<WindowStats> {
        WindowStats::from_values(&self.values)
    }

    /// Count for `second` if this event were added.
    fn burst_value(&self, second: i64) -> f64 {
        match self.bucket {
            Some((current, count)) if current == second => (count + 1) as f64,
            _ => 1.0,
        }
    }

    fn record_burst(&mut self, second: i64, window: usize) {
        match self.bucket {
            None => self.bucket = Some((second, 1)),
            Some((current, count)) if second <= current => {
                self.bucket = Some((current, count + 1));
            }
            Some((current, count)) => {
                self.push(count as f64, window);
                let silent = usize::try_from(second - current - 1).unwrap_or(usize::MAX);
                for _ in 0..silent.min(window) {
                    self.push(0.0, window);
                }
                self.bucket = Some((second, 1));
            }
        }
    }
}

type SeriesMap = HashMap<(String, String), Series>;

/// Rolling-window anomaly scorer shared by all workers.
pub struct AnomalyScorer {
    window_size: usize,
    min_samples: usize,
    idle_ttl: TimeDelta,
    max_series_per_shard: usize,
    z_threshold: f64,
    watched: Vec<WatchedMetric>,
    burst_detection: bool,
    series: Sharded<SeriesMap>,
}

impl AnomalyScorer {
    /// Create a scorer; series are partitioned over `shards` locks.
    #[must_use]
    pub fn new(config: &AnomalyConfig, shards: usize) -> Self {
        let series = Sharded::new(shards);
        let max_series_per_shard = config.max_series.div_ceil(series.count()).max(1);
        Self {
            window_size: config.window_size.max(1),
            min_samples: config.min_samples,
            idle_ttl: crate::secs(config.idle_ttl_secs),
            max_series_per_shard,
            z_threshold: config.z_threshold,
            watched: config.metrics.clone(),
            burst_detection: config.burst_detection,
            series,
        }
    }

    /// Current window statistics for a series.
    #[must_use]
    pub fn stats(&self, entity: &str, metric: &str) -> Option<WindowStats> {
        self.series
            .lock(entity)
            .get(&(entity.to_string(), metric.to_string()))
            .and_then(Series::stats)
    }

    /// Number of tracked series.
    #[must_use]
    pub fn series_count(&self) -> usize {
        let mut total = 0;
        self.series.for_each(|shard| total += shard.len());
        total
    }

    fn baseline_for(&self, metric: &str) -> Option<Baseline> {
        self.watched
            .iter()
            .find(|w| w.name == metric)
            .and_then(|w| w.baseline)
    }

    /// Score an event without touching the windows.
    #[must_use]
    pub fn score(
        &self,
        event: &Event,
        metric: &str,
        model: AnomalyModel,
        threshold: f64,
    ) -> Option<Score> {
        let entity = event.source_entity.as_str();
        let shard = self.series.lock(entity);

        if model == AnomalyModel::Burst {
            let series = shard.get(&(entity.to_string(), BURST_METRIC.to_string()));
            let value = series.map_or(1.0, |s| s.burst_value(event.timestamp.timestamp()));
            let stats = series.and_then(Series::stats);
            return score_value(
                value,
                stats.as_ref(),
                model,
                threshold,
                self.min_samples,
                self.baseline_for(BURST_METRIC),
            );
        }

        let value = event.metric(metric)?;
        let stats = shard
            .get(&(entity.to_string(), metric.to_string()))
            .and_then(Series::stats);
        score_value(
            value,
            stats.as_ref(),
            model,
            threshold,
            self.min_samples,
            self.baseline_for(metric),
        )
    }

    /// Score an event for an anomaly rule, as a finding.
    #[must_use]
    pub fn score_rule(
        &self,
        event: &Event,
        rule_id: &str,
        rule_severity: Severity,
        category: &str,
        metric: &str,
        model: AnomalyModel,
        threshold: f64,
    ) -> Option<Finding> {
        let score = self.score(event, metric, model, threshold)?;
        // Bound rules carry the rule's severity; deviation tiers never go below it.
        let severity = score.severity.max(rule_severity);
        let metric = if model == AnomalyModel::Burst {
            BURST_METRIC
        } else {
            metric
        };
        Some(finding(event, rule_id.to_string(), category, metric, &score, severity))
    }

    /// Score the configured watched metrics not already covered by a rule.
    #[must_use]
    pub fn score_watched(&self, event: &Event, covered: &HashSet<String>) -> Vec<Finding> {
        let mut findings = Vec::new();
        for watched in &self.watched {
            if covered.contains(&watched.name) || event.metric(&watched.name).is_none() {
                continue;
            }
            if let Some(bound) = watched.bound {
                if let Some(score) = self.score(event, &watched.name, AnomalyModel::Bound, bound) {
                    findings.push(finding(
                        event,
                        format!("bound:{}", watched.name),
                        CATEGORY_ANOMALY,
                        &watched.name,
                        &score,
                        score.severity,
                    ));
                }
            }
            let threshold = watched.threshold.unwrap_or(self.z_threshold);
            if let Some(score) = self.score(event, &watched.name, AnomalyModel::Zscore, threshold) {
                findings.push(finding(
                    event,
                    format!("zscore:{}", watched.name),
                    CATEGORY_ANOMALY,
                    &watched.name,
                    &score,
                    score.severity,
                ));
            }
        }

        if self.burst_detection && !covered.contains(BURST_METRIC) {
            if let Some(score) =
                self.score(event, BURST_METRIC, AnomalyModel::Burst, self.z_threshold)
            {
                findings.push(finding(
                    event,
                    format!("burst:{BURST_METRIC}"),
                    CATEGORY_ANOMALY,
                    BURST_METRIC,
                    &score,
                    score.severity,
                ));
            }
        }
        findings
    }

    /// Fold an event into its windows. `rule_metrics` are the metrics named
    /// by anomaly rules; watched metrics are always tracked.
    pub fn observe(&self, event: &Event, rule_metrics: &HashSet<String>) {
        let entity = event.source_entity.as_str();
        let tracked = self
            .watched
            .iter()
            .map(|w| w.name.as_str())
            .chain(rule_metrics.iter().map(String::as_str))
            .filter(|name| *name != BURST_METRIC);

        let mut shard = self.series.lock(entity);
        for metric in tracked {
            if let Some(value) = event.metric(metric) {
                let series = self.series_entry(&mut shard, entity, metric, event.timestamp);
                series.push(value, self.window_size);
                series.last_seen = event.timestamp;
            }
        }

        if self.burst_detection || rule_metrics.contains(BURST_METRIC) {
            let series = self.series_entry(&mut shard, entity, BURST_METRIC, event.timestamp);
            series.record_burst(event.timestamp.timestamp(), self.window_size);
            series.last_seen = event.timestamp;
        }
    }

    fn series_entry<'a>(
        &self,
        shard: &'a mut SeriesMap,
        entity: &str,
        metric: &str,
        now: DateTime<Utc>,
    ) -> &'a mut Series {
        let key = (entity.to_string(), metric.to_string());
        if !shard.contains_key(&key) && shard.len() >= self.max_series_per_shard {
            let oldest = shard
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!(entity = %oldest.0, metric = %oldest.1, "Evicting least recent series");
                shard.remove(&oldest);
            }
        }
        shard
            .entry(key)
            .or_insert_with(|| Series::new(now, self.window_size))
    }

    /// Drop series idle for longer than the TTL. Returns how many went.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.series.for_each(|shard| {
            let before = shard.len();
            shard.retain(|_, s| now - s.last_seen <= self.idle_ttl);
            removed += before - shard.len();
        });
        if removed > 0 {
            debug!(removed, "Aged out idle anomaly series");
        }
        removed
    }
}

fn finding(
    event: &Event,
    rule_id: String,
    category: &str,
    metric: &str,
    score: &Score,
    severity: Severity,
) -> Finding {
    let summary = match (score.z, score.mean) {
        (Some(z), Some(mean)) => format!(
            "{metric}={:.2} is {z:.1} standard deviations from mean {mean:.2}",
            score.value
        ),
        _ => format!("{metric}={:.2} exceeds bound", score.value),
    };
    Finding {
        rule_id,
        severity,
        category: category.to_string(),
        source_entity: event.source_entity.clone(),
        evidence: json!({
            "summary": summary,
            "model": model_name(score.model),
            "metric": metric,
            "value": score.value,
            "z": score.z,
            "mean": score.mean,
            "std": score.std,
        }),
        timestamp: event.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCategory;
    use serde_json::Map;

    fn config() -> AnomalyConfig {
        AnomalyConfig {
            window_size: 50,
            min_samples: 10,
            idle_ttl_secs: 60,
            max_series: 100,
            z_threshold: 3.0,
            metrics: vec![WatchedMetric {
                name: "latency_ms".to_string(),
                bound: Some(5_000.0),
                baseline: None,
                threshold: None,
            }],
            burst_detection: false,
        }
    }

    fn latency(entity: &str, value: f64, at: DateTime<Utc>) -> Event {
        let mut attributes = Map::new();
        attributes.insert("latency_ms".into(), json!(value));
        Event::new(entity, EventCategory::Traffic, attributes, at)
    }

    fn base() -> DateTime<Utc> {
        "2026-03-01T00:00:00Z".parse().unwrap()
    }

    fn warm_up(scorer: &AnomalyScorer, entity: &str) {
        let none = HashSet::new();
        for i in 0..20 {
            let value = if i % 2 == 0 { 90.0 } else { 110.0 };
            scorer.observe(&latency(entity, value, base()), &none);
        }
    }

    #[test]
    fn test_window_stats() {
        let stats = WindowStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(stats.count, 8);
        assert!((stats.mean - 5.0).abs() < 1e-9);
        assert!((stats.std - 2.0).abs() < 1e-9);
        assert!(WindowStats::from_values(&[]).is_none());
    }

    #[test]
    fn test_score_value_tiers() {
        let stats = WindowStats {
            count: 30,
            mean: 100.0,
            std: 10.0,
        };
        let score = |v| score_value(v, Some(&stats), AnomalyModel::Zscore, 3.0, 10, None);
        assert!(score(125.0).is_none());
        assert_eq!(score(130.0).unwrap().severity, Severity::Warn);
        assert_eq!(score(141.0).unwrap().severity, Severity::High);
        assert_eq!(score(150.0).unwrap().severity, Severity::Critical);
        assert_eq!(score(50.0).unwrap().severity, Severity::Critical);
    }

    #[test]
    fn test_cold_start_without_baseline_is_silent() {
        let thin = WindowStats {
            count: 3,
            mean: 100.0,
            std: 1.0,
        };
        assert!(score_value(1_000.0, Some(&thin), AnomalyModel::Zscore, 3.0, 10, None).is_none());
        assert!(score_value(1_000.0, None, AnomalyModel::Zscore, 3.0, 10, None).is_none());

        let baseline = Baseline {
            mean: 100.0,
            std: 10.0,
        };
        let score =
            score_value(140.0, None, AnomalyModel::Zscore, 3.0, 10, Some(baseline)).unwrap();
        assert_eq!(score.severity, Severity::High);
    }

    #[test]
    fn test_flat_window_not_scored() {
        let flat = WindowStats {
            count: 30,
            mean: 5.0,
            std: 0.0,
        };
        assert!(score_value(500.0, Some(&flat), AnomalyModel::Zscore, 3.0, 10, None).is_none());
    }

    #[test]
    fn test_bound_model() {
        assert!(score_value(10.0, None, AnomalyModel::Bound, 10.0, 10, None).is_none());
        let score = score_value(10.5, None, AnomalyModel::Bound, 10.0, 10, None).unwrap();
        assert_eq!(score.z, None);
    }

    #[test]
    fn test_scoring_is_read_only() {
        let scorer = AnomalyScorer::new(&config(), 4);
        warm_up(&scorer, "api");
        let before = scorer.stats("api", "latency_ms").unwrap();

        let spike = latency("api", 400.0, base());
        let findings = scorer.score_watched(&spike, &HashSet::new());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, "zscore:latency_ms");
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(scorer.stats("api", "latency_ms").unwrap(), before);

        // Another entity has no history yet.
        assert!(scorer
            .score_watched(&latency("db", 400.0, base()), &HashSet::new())
            .is_empty());
    }

    #[test]
    fn test_watched_bound_fires_without_history() {
        let scorer = AnomalyScorer::new(&config(), 1);
        let findings = scorer.score_watched(&latency("api", 6_000.0, base()), &HashSet::new());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, "bound:latency_ms");
    }

    #[test]
    fn test_covered_metrics_skipped() {
        let scorer = AnomalyScorer::new(&config(), 1);
        warm_up(&scorer, "api");
        let covered: HashSet<String> = ["latency_ms".to_string()].into();
        assert!(scorer
            .score_watched(&latency("api", 6_000.0, base()), &covered)
            .is_empty());
    }

    #[test]
    fn test_burst_model() {
        let mut config = config();
        config.min_samples = 5;
        let scorer = AnomalyScorer::new(&config, 1);
        let rule_metrics: HashSet<String> = [BURST_METRIC.to_string()].into();

        // One event per second for 10 seconds.
        for s in 0..10 {
            let event = latency("api", 1.0, base() + TimeDelta::seconds(s));
            scorer.observe(&event, &rule_metrics);
        }
        // Then a burst inside a single second.
        let burst_at = base() + TimeDelta::seconds(10);
        let mut fired = None;
        for i in 0..10 {
            let event = latency("api", 1.0, burst_at);
            if let Some(f) = scorer.score_rule(
                &event,
                "burst",
                Severity::Warn,
                "anomaly",
                BURST_METRIC,
                AnomalyModel::Burst,
                3.0,
            ) {
                fired.get_or_insert((i, f));
            }
            scorer.observe(&event, &rule_metrics);
        }
        // Completed buckets are all 1 with zero spread, so the flat window
        // guard keeps the scorer quiet.
        assert!(fired.is_none());

        // A noisier history makes the burst stand out.
        let scorer = AnomalyScorer::new(&config, 1);
        for s in 0..10 {
            let at = base() + TimeDelta::seconds(s);
            for _ in 0..(1 + s % 2) {
                scorer.observe(&latency("api", 1.0, at), &rule_metrics);
            }
        }
        let mut fired = false;
        for _ in 0..10 {
            let event = latency("api", 1.0, burst_at);
            fired |= scorer
                .score_rule(
                    &event,
                    "burst",
                    Severity::Warn,
                    "anomaly",
                    BURST_METRIC,
                    AnomalyModel::Burst,
                    3.0,
                )
                .is_some();
            scorer.observe(&event, &rule_metrics);
        }
        assert!(fired);
    }

    #[test]
    fn test_sweep_and_series_cap() {
        let mut config = config();
        config.max_series = 3;
        let scorer = AnomalyScorer::new(&config, 1);
        let none = HashSet::new();

        for (i, entity) in ["a", "b", "c", "d"].iter().enumerate() {
            let at = base() + TimeDelta::seconds(i as i64);
            scorer.observe(&latency(entity, 1.0, at), &none);
        }
        assert_eq!(scorer.series_count(), 3);
        assert!(scorer.stats("a", "latency_ms").is_none());

        let removed = scorer.sweep(base() + TimeDelta::seconds(63));
        assert_eq!(removed, 2);
        assert!(scorer.stats("d", "latency_ms").is_some());
    }
}
