//! Entity-hash partitioning.
//!
//! Stage workers and partitioned state both route by the same hash so that
//! one entity's events are always handled by the same worker and the same lock.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Stable shard index for an entity.
#[must_use]
pub fn shard_for(entity: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    entity.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// State split across independently locked partitions.
pub struct Sharded<T> {
    shards: Vec<Mutex<T>>,
}

impl<T: Default> Sharded<T> {
    /// Create `count` empty partitions (at least one).
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            shards: (0..count.max(1)).map(|_| Mutex::new(T::default())).collect(),
        }
    }
}

impl<T> Sharded<T> {
    /// Lock the partition owning `entity`.
    pub fn lock(&self, entity: &str) -> MutexGuard<'_, T> {
        let idx = shard_for(entity, self.shards.len());
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Visit every partition in turn, holding one lock at a time.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&mut T),
    {
        for shard in &self.shards {
            let mut guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard);
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_shard_for_is_stable() {
        assert_eq!(shard_for("api", 8), shard_for("api", 8));
        assert!(shard_for("api", 8) < 8);
        assert_eq!(shard_for("anything", 1), 0);
        assert_eq!(shard_for("anything", 0), 0);
    }

    #[test]
    fn test_sharded_routes_by_entity() {
        let map: Sharded<HashMap<String, u32>> = Sharded::new(4);
        for entity in ["a", "b", "c", "a"] {
            *map.lock(entity).entry(entity.to_string()).or_default() += 1;
        }
        assert_eq!(map.lock("a").get("a"), Some(&2));

        let mut total = 0;
        map.for_each(|shard| total += shard.values().sum::<u32>());
        assert_eq!(total, 4);
    }
}
