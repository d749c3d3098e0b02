//! Bounded enrichment cache keyed by detail-page URL.
//!
//! Entries older than the TTL are invisible to lookups. When the cache is full,
//! expired entries are dropped first, then the least recently used live one.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tvg_core::EnrichmentCacheEntry;

pub const DEFAULT_CACHE_TTL_DAYS: i64 = 30;
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: TimeDelta,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            ttl: TimeDelta::days(DEFAULT_CACHE_TTL_DAYS),
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: EnrichmentCacheEntry,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(slot) = self.entries.get_mut(key) {
            self.recency.remove(&slot.last_used);
            slot.last_used = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.last_used);
        Some(slot)
    }
}

#[derive(Debug)]
pub struct EnrichmentCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl Default for EnrichmentCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl EnrichmentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config: CacheConfig {
                capacity: config.capacity.max(1),
                ttl: config.ttl,
            },
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn ttl(&self) -> TimeDelta {
        self.config.ttl
    }

    pub fn is_fresh(&self, entry: &EnrichmentCacheEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.queried_at) < self.config.ttl
    }

    /// Live entry for `source_url`, if any. A hit counts as a use for eviction order.
    pub fn get(&self, source_url: &str, now: DateTime<Utc>) -> Option<EnrichmentCacheEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.get(source_url).map(|slot| slot.entry.clone())?;
        if !self.is_fresh(&entry, now) {
            return None;
        }
        state.touch(source_url);
        Some(entry)
    }

    /// Stores `entry`, replacing any previous entry for the same URL.
    ///
    /// Returns how many other entries were evicted to make room.
    pub fn put(&self, entry: EnrichmentCacheEntry, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let key = entry.source_url.clone();
        let mut evicted = 0;

        if state.remove(&key).is_none() && state.entries.len() >= self.config.capacity {
            let expired = state
                .entries
                .iter()
                .filter(|(_, slot)| !self.is_fresh(&slot.entry, now))
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>();
            for k in expired {
                state.remove(&k);
                evicted += 1;
            }
            while state.entries.len() >= self.config.capacity {
                let Some((_, oldest)) = state.recency.pop_first() else {
                    break;
                };
                state.entries.remove(&oldest);
                evicted += 1;
            }
        }

        let tick = state.next_tick();
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key,
            Slot {
                entry,
                last_used: tick,
            },
        );
        evicted
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let expired = state
            .entries
            .iter()
            .filter(|(_, slot)| !self.is_fresh(&slot.entry, now))
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        for k in &expired {
            state.remove(k);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
