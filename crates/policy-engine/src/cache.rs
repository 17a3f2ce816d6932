//! Decision memoization.
//!
//! Entries are keyed by `(context hash, index generation)`, so publishing a
//! new rule index makes every older entry unreachable without an explicit
//! sweep. Stale generations and expired entries are purged lazily when the
//! cache reaches capacity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;

use crate::decision::Decision;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    context_hash: String,
    generation: u64,
}

#[derive(Debug)]
struct CacheEntry {
    decision: Decision,
    inserted_at: Instant,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Concurrent, bounded, TTL-expiring map from context to [`Decision`].
#[derive(Debug)]
pub struct DecisionCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl DecisionCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a live decision. The returned copy carries a fresh
    /// `evaluated_at`; every other field is as originally computed.
    pub fn get(&self, context_hash: &str, generation: u64) -> Option<Decision> {
        let key = CacheKey {
            context_hash: context_hash.to_string(),
            generation,
        };

        let hit = self.entries.get(&key).and_then(|entry| {
            (entry.inserted_at.elapsed() < self.ttl).then(|| entry.decision.clone())
        });

        match hit {
            Some(mut decision) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                decision.evaluated_at = Utc::now();
                Some(decision)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                // Expired entries are dropped eagerly on the miss path.
                if self
                    .entries
                    .remove_if(&key, |_, e| e.inserted_at.elapsed() >= self.ttl)
                    .is_some()
                {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
        }
    }

    pub fn insert(&self, context_hash: &str, generation: u64, decision: Decision) {
        if self.entries.len() >= self.capacity {
            self.purge(generation);
        }

        self.entries.insert(
            CacheKey {
                context_hash: context_hash.to_string(),
                generation,
            },
            CacheEntry {
                decision,
                inserted_at: Instant::now(),
            },
        );
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop expired entries and those from generations older than
    /// `current`. If still at capacity, drop a batch of the oldest-inserted
    /// entries (a tenth of capacity, at least one) so the next inserts do
    /// not purge again.
    fn purge(&self, current: u64) {
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| key.generation >= current && entry.inserted_at.elapsed() < self.ttl);

        let len = self.entries.len();
        if len >= self.capacity {
            let batch = (len + 1 - self.capacity).max(self.eviction_batch()).min(len);
            let mut by_age: Vec<(Instant, CacheKey)> = self
                .entries
                .iter()
                .map(|e| (e.inserted_at, e.key().clone()))
                .collect();
            if batch < by_age.len() {
                by_age.select_nth_unstable_by_key(batch, |(at, _)| *at);
            }
            for (_, key) in by_age.into_iter().take(batch) {
                self.entries.remove(&key);
            }
        }

        let removed = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(removed, remaining = self.entries.len(), "decision cache purged");
    }

    fn eviction_batch(&self) -> usize {
        (self.capacity / 10).max(1)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_CAPACITY)
    }
}
