//! Sliding-window hit counting for `rate_limit` rules.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};

use crate::shard::Sharded;

type Windows = HashMap<(String, String), VecDeque<DateTime<Utc>>>;

/// Per `(entity, rule)` hit windows, pruned by timestamp.
///
/// Only the newest `max_hits + 1` timestamps are kept: that is enough to know
/// whether the in-window count exceeds `max_hits`.
pub struct RateLimiter {
    windows: Sharded<Windows>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(shards: usize) -> Self {
        Self {
            windows: Sharded::new(shards),
        }
    }

    /// Record a hit at `at`. Returns the in-window count when it exceeds
    /// `max_hits`, so every hit past the limit reports once.
    pub fn hit(
        &self,
        entity: &str,
        rule_id: &str,
        at: DateTime<Utc>,
        window: TimeDelta,
        max_hits: u32,
    ) -> Option<usize> {
        let keep = max_hits as usize + 1;
        let mut shard = self.windows.lock(entity);
        let hits = shard
            .entry((entity.to_string(), rule_id.to_string()))
            .or_default();

        // Late arrivals go in timestamp order.
        let pos = hits.partition_point(|t| *t <= at);
        hits.insert(pos, at);

        let newest = hits.back().copied().unwrap_or(at);
        while hits.front().is_some_and(|t| newest - *t >= window) {
            hits.pop_front();
        }
        while hits.len() > keep {
            hits.pop_front();
        }

        // A late hit that fell outside the newest window never counts.
        if newest - at >= window {
            return None;
        }
        (hits.len() > max_hits as usize).then_some(hits.len())
    }

    /// Forget windows of rules that no longer exist.
    pub fn retain_rules(&self, rule_ids: &HashSet<String>) {
        self.windows
            .for_each(|shard| shard.retain(|(_, rule), _| rule_ids.contains(rule)));
    }

    /// Forget windows with no hit newer than `idle`.
    pub fn sweep(&self, now: DateTime<Utc>, idle: TimeDelta) -> usize {
        let mut removed = 0;
        self.windows.for_each(|shard| {
            let before = shard.len();
            shard.retain(|_, hits| hits.back().is_some_and(|t| now - *t < idle));
            removed += before - shard.len();
        });
        removed
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        let mut total = 0;
        self.windows.for_each(|shard| total += shard.len());
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: i64) -> DateTime<Utc> {
        let base: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        base + TimeDelta::milliseconds(ms)
    }

    #[test]
    fn test_fires_once_per_excess_hit() {
        let limiter = RateLimiter::new(2);
        let window = TimeDelta::seconds(5);
        let fired = (0..20)
            .filter(|i| limiter.hit("x", "flood", t(i * 250), window, 10).is_some())
            .count();
        assert_eq!(fired, 10);
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(1);
        let window = TimeDelta::seconds(1);
        for i in 0..3 {
            assert!(limiter.hit("x", "r", t(i * 100), window, 3).is_none());
        }
        assert_eq!(limiter.hit("x", "r", t(300), window, 3), Some(4));
        // Everything above has aged out a second later.
        assert!(limiter.hit("x", "r", t(1_400), window, 3).is_none());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(4);
        let window = TimeDelta::seconds(5);
        assert!(limiter.hit("a", "r", t(0), window, 1).is_none());
        assert!(limiter.hit("b", "r", t(0), window, 1).is_none());
        assert!(limiter.hit("a", "other", t(0), window, 1).is_none());
        assert!(limiter.hit("a", "r", t(1), window, 1).is_some());
        assert_eq!(limiter.tracked(), 3);

        limiter.retain_rules(&["other".to_string()].into());
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.sweep(t(10_000), TimeDelta::seconds(5)), 1);
    }

    #[test]
    fn test_late_hit_outside_window_ignored() {
        let limiter = RateLimiter::new(1);
        let window = TimeDelta::seconds(1);
        assert!(limiter.hit("x", "r", t(5_000), window, 1).is_none());
        assert!(limiter.hit("x", "r", t(0), window, 1).is_none());
    }
}
