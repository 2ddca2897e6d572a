//! Response cache for deterministic-leaning provider calls.
//!
//! Keys are the SHA-256 of the canonical JSON form of
//! `(model, messages, temperature)`. Only calls at or below the configured
//! temperature ceiling are eligible, since sampling above it is expected to
//! vary between calls. Entries expire after their TTL; when the cache is
//! full the least recently touched entry is evicted.
//!
//! Entries sit in a `DashMap`; recency is a monotonic counter stamped on
//! every insert and hit, so eviction is a scan for the lowest stamp.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use switchyard_llm::ChatMessage;
use switchyard_types::config::CacheConfig;
use tracing::trace;

struct CacheEntry {
    response: String,
    stored_at: Instant,
    ttl: Duration,
    last_touch: u64,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

/// Hit/miss counters and fill level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before the first lookup.
    pub hit_rate: f64,
}

/// Bounded, TTL-aware cache of provider responses.
pub struct ResponseCache {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether a call at `temperature` may be cached.
    pub fn eligible(&self, temperature: f64) -> bool {
        self.config.enabled && temperature <= self.config.max_temperature
    }

    /// Cache key for a call.
    pub fn key(model: &str, messages: &[ChatMessage], temperature: f64) -> String {
        // serde_json maps are ordered by key, so the encoding is canonical.
        let canonical = serde_json::json!({
            "m": model,
            "msgs": messages,
            "t": temperature,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        format!("{digest:x}")
    }

    /// Look up a cached response. Ineligible temperatures never hit and are
    /// not counted.
    pub fn get(&self, model: &str, messages: &[ChatMessage], temperature: f64) -> Option<String> {
        if !self.eligible(temperature) {
            return None;
        }
        let key = Self::key(model, messages, temperature);
        let now = Instant::now();

        let hit = match self.entries.get_mut(&key) {
            Some(mut entry) if !entry.expired(now) => {
                entry.last_touch = self.clock.fetch_add(1, Ordering::Relaxed);
                Some(entry.response.clone())
            }
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match hit {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = %&key[..12], "cache hit");
                Some(response)
            }
            None => {
                self.entries.remove(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(key = %&key[..12], "cache entry expired");
                None
            }
        }
    }

    /// Store a response with the default TTL.
    pub fn put(&self, model: &str, messages: &[ChatMessage], temperature: f64, response: &str) {
        let ttl = Duration::from_secs(self.config.ttl_secs);
        self.put_with_ttl(model, messages, temperature, response, ttl);
    }

    /// Store a response with an explicit TTL. Empty responses and
    /// ineligible temperatures are ignored.
    pub fn put_with_ttl(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        response: &str,
        ttl: Duration,
    ) {
        if !self.eligible(temperature) || response.trim().is_empty() {
            return;
        }
        let key = Self::key(model, messages, temperature);
        self.entries.insert(
            key,
            CacheEntry {
                response: response.to_string(),
                stored_at: Instant::now(),
                ttl,
                last_touch: self.clock.fetch_add(1, Ordering::Relaxed),
            },
        );
        while self.entries.len() > self.config.max_entries {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    /// Remove the least recently touched entry. Returns false when empty.
    fn evict_oldest(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().last_touch)
            .map(|e| e.key().clone());
        match oldest {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.entries.len(),
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
