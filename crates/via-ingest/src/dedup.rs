//! Shard-striped LRU of recently ingested point ids.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use via_types::PointId;

/// Number of stripes; ids spread by their first byte.
const SHARDS: usize = 16;

/// Bounded dedup cache striped across independent locks.
///
/// Ingest workers hash into disjoint shards by id prefix, so concurrent
/// batches rarely contend on the same mutex. Ops are sub-microsecond and
/// never held across await points.
pub struct ShardedLru {
    shards: Vec<Mutex<LruCache<PointId, ()>>>,
}

impl ShardedLru {
    /// Cache remembering roughly `capacity` ids across all shards.
    pub fn new(capacity: usize) -> Self {
        let per_shard = NonZeroUsize::new((capacity / SHARDS).max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..SHARDS)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
        }
    }

    fn shard(&self, id: &PointId) -> &Mutex<LruCache<PointId, ()>> {
        let idx = (id.as_bytes()[0] as usize) % SHARDS;
        &self.shards[idx]
    }

    /// True when `id` was seen recently; a hit refreshes its recency.
    ///
    /// Deliberately does not learn the id: the cache only remembers ids
    /// whose events actually landed in Tier-1, so a failed upsert never
    /// poisons a client retry.
    pub fn contains(&self, id: &PointId) -> bool {
        let mut shard = match self.shard(id).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shard.get(id).is_some()
    }

    /// Remember an id whose event is known to be stored.
    pub fn insert(&self, id: PointId) {
        let mut shard = match self.shard(&id).lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shard.put(id, ());
    }

    /// Total ids currently remembered.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| match s.lock() {
                Ok(guard) => guard.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .sum()
    }

    /// True when nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
