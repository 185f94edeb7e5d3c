// Validation result cache: TTL expiry plus priority-weighted LRU eviction.
//
// SAFETY INVARIANTS:
// 1. The cache never holds more than `max_size` live entries
// 2. Expired entries are never returned
// 3. The eviction callback runs after the internal lock is released, so it can
//    never deadlock against the cache or the engine's validation lock

use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::services::ValidationCache;

/// How many least-recently-used entries are inspected when choosing a victim.
const EVICTION_SCAN: usize = 8;

pub type EvictionCallback = Box<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: bool,
    expires_at: Instant,
    priority: u8,
}

pub struct LruValidationCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    on_evict: Option<EvictionCallback>,
}

impl LruValidationCache {
    pub fn new(max_size: usize) -> Self {
        LruValidationCache {
            entries: Mutex::new(LruCache::unbounded()),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            on_evict: None,
        }
    }

    /// Attach a callback invoked with `(key, value)` for every capacity eviction.
    pub fn with_eviction_callback(mut self, callback: EvictionCallback) -> Self {
        self.on_evict = Some(callback);
        self
    }

    /// Pick the lowest-priority entry among the least recently used ones.
    /// Ties go to the least recently used.
    fn select_victim(entries: &LruCache<String, CacheEntry>) -> Option<String> {
        entries
            .iter()
            .rev()
            .take(EVICTION_SCAN)
            .fold(None::<(&String, u8)>, |best, (key, entry)| match best {
                Some((_, p)) if p <= entry.priority => best,
                _ => Some((key, entry.priority)),
            })
            .map(|(key, _)| key.clone())
    }

    fn purge_expired(entries: &mut LruCache<String, CacheEntry>, now: Instant) {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            entries.pop(&key);
        }
    }
}

impl ValidationCache for LruValidationCache {
    fn get(&self, key: &str) -> Option<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let state = entries.get(key).map(|e| (e.value, e.expires_at > now));
        let lookup = match state {
            Some((value, true)) => Some(value),
            Some((_, false)) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        match lookup {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        lookup
    }

    fn set(&self, key: &str, value: bool, ttl: Duration, priority: u8) {
        let mut evicted = Vec::new();
        {
            let mut entries = self.entries.lock();
            let now = Instant::now();
            if !entries.contains(key) && entries.len() >= self.max_size {
                Self::purge_expired(&mut entries, now);
            }
            while !entries.contains(key) && entries.len() >= self.max_size {
                let Some(victim) = Self::select_victim(&entries) else {
                    break;
                };
                if let Some(entry) = entries.pop(&victim) {
                    evicted.push((victim, entry.value));
                }
            }
            entries.put(
                key.to_string(),
                CacheEntry {
                    value,
                    expires_at: now + ttl,
                    priority,
                },
            );
        }

        for (key, value) in evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted validation cache entry {}", key);
            if let Some(callback) = &self.on_evict {
                callback(&key, value);
            }
        }
    }

    fn has(&self, key: &str) -> bool {
        let entries = self.entries.lock();
        entries
            .peek(key)
            .map(|e| e.expires_at > Instant::now())
            .unwrap_or(false)
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    fn size(&self) -> usize {
        self.entries.lock().len()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn memory_usage(&self) -> usize {
        let entries = self.entries.lock();
        entries
            .iter()
            .map(|(k, _)| k.len() + std::mem::size_of::<String>() + std::mem::size_of::<CacheEntry>())
            .sum()
    }
}
