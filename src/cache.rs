use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::debug;
use ulid::Ulid;

use crate::config::CacheConfig;
use crate::model::{Availability, Ms, Stay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub unit_id: Ulid,
    pub stay: Stay,
    pub include_holds: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    verdict: Availability,
    computed_at: Ms,
    expires_at: Ms,
}

/// Short-lived memo of availability verdicts for advisory read paths.
///
/// Entries are grouped per unit so a mutation drops everything for that unit
/// in one step. The cache starts closed: until `init()` every lookup misses
/// and every store is ignored, which is also the state after `shutdown()`.
/// Callers never need to distinguish a closed cache from a cold one.
pub struct AvailabilityCache {
    units: DashMap<Ulid, HashMap<(Stay, bool), CacheEntry>>,
    /// Total entries across all units. Only changed while holding the owning
    /// unit's shard lock, so it never drifts below the true count.
    len: AtomicUsize,
    open: AtomicBool,
    ttl_ms: Ms,
    capacity: usize,
}

impl AvailabilityCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            units: DashMap::new(),
            len: AtomicUsize::new(0),
            open: AtomicBool::new(false),
            ttl_ms: config.ttl.as_millis() as Ms,
            capacity: config.capacity,
        }
    }

    /// Start serving. Any leftovers from a previous lifecycle are discarded.
    pub fn init(&self) {
        self.clear();
        self.open.store(true, Ordering::Release);
        debug!("availability cache ready (ttl {} ms, capacity {})", self.ttl_ms, self.capacity);
    }

    /// Stop serving and drop all entries.
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        self.clear();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn ttl_ms(&self) -> Ms {
        self.ttl_ms
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A cached verdict, only while `now < expires_at`.
    pub fn get(&self, key: &CacheKey, now: Ms) -> Option<Availability> {
        if !self.is_open() {
            return None;
        }
        let hit = self
            .units
            .get(&key.unit_id)
            .and_then(|entries| {
                entries
                    .get(&(key.stay, key.include_holds))
                    .filter(|e| now < e.expires_at)
                    .map(|e| e.verdict.clone())
            });
        match hit {
            Some(_) => metrics::counter!(crate::observability::CACHE_HITS_TOTAL).increment(1),
            None => metrics::counter!(crate::observability::CACHE_MISSES_TOTAL).increment(1),
        }
        hit
    }

    pub fn put(&self, key: CacheKey, verdict: Availability, ttl_ms: Ms, now: Ms) {
        if !self.is_open() || ttl_ms <= 0 || self.capacity == 0 {
            return;
        }
        {
            let mut entries = self.units.entry(key.unit_id).or_default();
            let entry = CacheEntry {
                verdict,
                computed_at: now,
                expires_at: now + ttl_ms,
            };
            if entries.insert((key.stay, key.include_holds), entry).is_none() {
                self.len.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.evict_if_over_capacity();
    }

    /// Drop every entry for the unit. Returns how many were removed.
    pub fn invalidate(&self, unit_id: &Ulid) -> usize {
        match self.units.remove(unit_id) {
            Some((_, entries)) => {
                self.len.fetch_sub(entries.len(), Ordering::AcqRel);
                entries.len()
            }
            None => 0,
        }
    }

    /// Remove the least recently verified entries until back under capacity.
    pub fn evict_if_over_capacity(&self) -> usize {
        let len = self.len();
        if len <= self.capacity {
            return 0;
        }
        let excess = len - self.capacity;

        let mut candidates: Vec<(Ms, Ulid, (Stay, bool))> = self
            .units
            .iter()
            .flat_map(|unit| {
                let unit_id = *unit.key();
                unit.value()
                    .iter()
                    .map(|(k, e)| (e.computed_at, unit_id, *k))
                    .collect::<Vec<_>>()
            })
            .collect();
        candidates.sort_unstable_by_key(|(computed_at, _, _)| *computed_at);

        let mut evicted = 0;
        for (_, unit_id, k) in candidates.into_iter().take(excess) {
            evicted += self.remove_entry(&unit_id, &k);
        }
        if evicted > 0 {
            metrics::counter!(crate::observability::CACHE_EVICTIONS_TOTAL).increment(evicted as u64);
        }
        evicted
    }

    /// Drop entries whose TTL has passed. Run periodically by the reaper.
    pub fn purge_expired(&self, now: Ms) -> usize {
        let mut purged = 0;
        for mut unit in self.units.iter_mut() {
            let before = unit.len();
            unit.retain(|_, e| now < e.expires_at);
            let removed = before - unit.len();
            if removed > 0 {
                self.len.fetch_sub(removed, Ordering::AcqRel);
                purged += removed;
            }
        }
        self.units.retain(|_, entries| !entries.is_empty());
        purged
    }

    fn remove_entry(&self, unit_id: &Ulid, key: &(Stay, bool)) -> usize {
        let Some(mut entries) = self.units.get_mut(unit_id) else { return 0 };
        if entries.remove(key).is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            1
        } else {
            0
        }
    }

    fn clear(&self) {
        let ids: Vec<Ulid> = self.units.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.invalidate(&id);
        }
    }
}
