//! Per-connection prepared-statement cache.
//!
//! Maps canonical SQL fingerprints to provider statement handles with a
//! bounded, strictly LRU eviction policy. The cache is owned by exactly one
//! connection, which is owned by exactly one worker, so there is no internal
//! synchronisation. Every statement id the cache hands back through
//! [`StatementCache::insert`] eviction, [`StatementCache::evict`], or
//! [`StatementCache::clear`] must be deallocated by the provider exactly
//! once.

use std::collections::HashMap;

use super::{Fingerprint, StatementId};

/// Default capacity of a per-connection statement cache.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 128;

#[derive(Debug)]
struct Entry {
    id: StatementId,
    arity: usize,
    sql: String,
    last_used: u64,
    inserted: u64,
}

/// Bounded LRU cache of prepared statements keyed by SQL fingerprint.
#[derive(Debug)]
pub struct StatementCache {
    capacity: usize,
    tick: u64,
    seq: u64,
    entries: HashMap<Fingerprint, Entry>,
}

impl StatementCache {
    /// Create a cache bounded at `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            seq: 0,
            entries: HashMap::new(),
        }
    }

    /// Number of cached statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a fingerprint without touching its LRU position.
    ///
    /// The cached SQL is compared against `sql`: a fingerprint collision
    /// with different text is treated as a miss so the caller re-prepares.
    #[must_use]
    pub fn lookup(&self, fingerprint: &Fingerprint, sql: &str) -> Option<(StatementId, usize)> {
        self.entries
            .get(fingerprint)
            .filter(|e| e.sql == sql)
            .map(|e| (e.id, e.arity))
    }

    /// Mark a cached fingerprint as just used.
    pub fn touch(&mut self, fingerprint: &Fingerprint) {
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            entry.last_used = self.tick;
        }
    }

    /// Insert a freshly prepared statement.
    ///
    /// When the cache is full the least-recently-used entry is evicted
    /// first and its statement id returned so the provider can issue its
    /// single-statement deallocation before using the new handle.
    pub fn insert(
        &mut self,
        fingerprint: Fingerprint,
        id: StatementId,
        arity: usize,
        sql: &str,
    ) -> Option<StatementId> {
        let evicted = if self.entries.len() >= self.capacity
            && !self.entries.contains_key(&fingerprint)
        {
            self.evict()
        } else {
            // Re-inserting an existing fingerprint replaces the handle; the
            // old one must still be released.
            self.entries.get(&fingerprint).map(|e| e.id)
        };
        self.tick += 1;
        self.seq += 1;
        self.entries.insert(
            fingerprint,
            Entry {
                id,
                arity,
                sql: sql.to_owned(),
                last_used: self.tick,
                inserted: self.seq,
            },
        );
        evicted
    }

    /// Evict the least-recently-used entry, returning its statement id.
    ///
    /// Ties on the use tick are broken by insertion sequence: the earliest
    /// inserted entry goes first.
    pub fn evict(&mut self) -> Option<StatementId> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.last_used, e.inserted))
            .map(|(fp, _)| fp.clone())?;
        self.entries.remove(&victim).map(|e| e.id)
    }

    /// Drain the cache, returning every statement id for batched
    /// deallocation by the provider.
    pub fn clear(&mut self) -> Vec<StatementId> {
        let mut ids: Vec<StatementId> = self.entries.drain().map(|(_, e)| e.id).collect();
        ids.sort_by_key(|id| id.0);
        ids
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_STATEMENT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::engine::fingerprint;

    fn fp(n: usize) -> (Fingerprint, String) {
        let sql = format!("SELECT {n}");
        (fingerprint(&sql), sql)
    }

    #[rstest]
    fn lookup_misses_on_fingerprint_collision_with_other_sql() {
        let mut cache = StatementCache::new(4);
        let (f, sql) = fp(1);
        cache.insert(f.clone(), StatementId(1), 0, &sql);
        assert_eq!(cache.lookup(&f, &sql), Some((StatementId(1), 0)));
        assert_eq!(cache.lookup(&f, "SELECT other"), None);
    }

    #[rstest]
    fn full_cache_evicts_least_recently_used() {
        let mut cache = StatementCache::new(2);
        let (f1, s1) = fp(1);
        let (f2, s2) = fp(2);
        let (f3, s3) = fp(3);
        assert_eq!(cache.insert(f1.clone(), StatementId(1), 0, &s1), None);
        assert_eq!(cache.insert(f2, StatementId(2), 0, &s2), None);
        // Touch 1 so 2 becomes the LRU victim.
        cache.touch(&f1);
        assert_eq!(cache.insert(f3, StatementId(3), 0, &s3), Some(StatementId(2)));
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&f1, &s1).is_some());
    }

    #[rstest]
    fn untouched_entries_evict_in_insertion_order() {
        let mut cache = StatementCache::new(8);
        let (f1, s1) = fp(1);
        let (f2, s2) = fp(2);
        cache.insert(f1, StatementId(1), 0, &s1);
        cache.insert(f2, StatementId(2), 0, &s2);
        // Neither entry is ever touched after insert; insertion order must
        // decide, and entry 1 was inserted (and last used) first.
        assert_eq!(cache.evict(), Some(StatementId(1)));
        assert_eq!(cache.evict(), Some(StatementId(2)));
        assert_eq!(cache.evict(), None);
    }

    #[rstest]
    fn reinserting_a_fingerprint_releases_the_old_handle() {
        let mut cache = StatementCache::new(2);
        let (f1, s1) = fp(1);
        cache.insert(f1.clone(), StatementId(1), 0, &s1);
        assert_eq!(
            cache.insert(f1.clone(), StatementId(9), 0, &s1),
            Some(StatementId(1))
        );
        assert_eq!(cache.lookup(&f1, &s1), Some((StatementId(9), 0)));
        assert_eq!(cache.len(), 1);
    }

    #[rstest]
    fn clear_returns_every_id_once() {
        let mut cache = StatementCache::new(4);
        for n in 0..4 {
            let (f, s) = fp(n);
            cache.insert(f, StatementId(n as u64), 0, &s);
        }
        let mut ids = cache.clear();
        ids.sort_by_key(|id| id.0);
        assert_eq!(
            ids,
            vec![StatementId(0), StatementId(1), StatementId(2), StatementId(3)]
        );
        assert!(cache.is_empty());
    }

    proptest! {
        /// The cache never exceeds capacity, and every id ever inserted is
        /// returned for deallocation exactly once across evictions and the
        /// final clear.
        #[test]
        fn bounded_and_exactly_once(ops in proptest::collection::vec(0usize..32, 1..200)) {
            let mut cache = StatementCache::new(8);
            let mut released: Vec<u64> = Vec::new();
            let mut inserted: Vec<u64> = Vec::new();
            let mut next_id = 0u64;
            for key in ops {
                let (f, sql) = fp(key);
                if cache.lookup(&f, &sql).is_some() {
                    cache.touch(&f);
                } else {
                    let id = StatementId(next_id);
                    inserted.push(next_id);
                    next_id += 1;
                    if let Some(evicted) = cache.insert(f, id, 0, &sql) {
                        released.push(evicted.0);
                    }
                }
                prop_assert!(cache.len() <= cache.capacity());
            }
            released.extend(cache.clear().into_iter().map(|id| id.0));
            released.sort_unstable();
            inserted.sort_unstable();
            prop_assert_eq!(released, inserted);
        }
    }
}
