//! Bounded response cache with per-entry TTL
//!
//! Entries live in an insertion-ordered map. When the cache is full the
//! oldest-inserted entry is evicted, regardless of how recently it was read.
//! Expiry is checked lazily on lookup; reads never extend an entry's life.

use indexmap::IndexMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_MAX_ENTRIES: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    created_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) <= self.ttl
    }
}

#[derive(Debug)]
pub struct TtlCache<T> {
    entries: IndexMap<String, CacheEntry<T>>,
    max_size: usize,
    default_ttl: Duration,
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }
}

impl<T: Clone> TtlCache<T> {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            entries: IndexMap::with_capacity(max_size),
            max_size,
            default_ttl,
        }
    }

    /// Return the value if it has not outlived its TTL; expired entries are removed.
    pub fn get(&mut self, key: &str) -> Option<T> {
        let now = Instant::now();
        let live = self.entries.get(key)?.is_live(now);
        if !live {
            // shift_remove keeps the remaining insertion order intact
            self.entries.shift_remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn set(&mut self, key: impl Into<String>, value: T) {
        let ttl = self.default_ttl;
        self.set_with_ttl(key, value, ttl);
    }

    pub fn set_with_ttl(&mut self, key: impl Into<String>, value: T, ttl: Duration) {
        let key = key.into();
        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl,
        };
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = entry;
            return;
        }
        if self.entries.len() >= self.max_size {
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(key, entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, including ones that expired but were not looked up yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}
