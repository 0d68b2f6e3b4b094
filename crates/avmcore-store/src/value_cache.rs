//! Generational in-memory cache of materialized values.
//!
//! The cache is a short ring of buckets. Inserts go into the newest bucket;
//! lookups search every bucket. [`ValueCache::next_generation`] opens a new
//! bucket and drops the oldest once the ring is full, so a value survives as
//! long as it was touched within the last few generations. The host rotates
//! generations at checkpoint boundaries.

use std::collections::{HashMap, VecDeque};

use avmcore_types::{Value, H256};

pub struct ValueCache {
    buckets: VecDeque<HashMap<H256, Value>>,
    max_buckets: usize,
}

impl ValueCache {
    /// A cache with `generations` buckets (at least one).
    #[must_use]
    pub fn new(generations: usize) -> Self {
        let max_buckets = generations.max(1);
        let mut buckets = VecDeque::with_capacity(max_buckets);
        buckets.push_front(HashMap::new());
        Self {
            buckets,
            max_buckets,
        }
    }

    /// Look up a value in any generation. Returns a clone: cached values are
    /// owned trees, never shared references.
    #[must_use]
    pub fn get(&self, hash: &H256) -> Option<Value> {
        self.buckets
            .iter()
            .find_map(|bucket| bucket.get(hash))
            .cloned()
    }

    /// Insert into the current generation.
    pub fn insert(&mut self, hash: H256, value: Value) {
        self.buckets[0].insert(hash, value);
    }

    /// Open a fresh generation, evicting the oldest bucket once the ring is
    /// full.
    pub fn next_generation(&mut self) {
        if self.buckets.len() == self.max_buckets {
            self.buckets.pop_back();
        }
        self.buckets.push_front(HashMap::new());
    }

    /// Total cached entries across all generations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
