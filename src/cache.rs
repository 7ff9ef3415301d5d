//! TTL-bounded sampling cache.
//!
//! Used by collectors to decide "may I act on this key now": each key is let
//! through at most once per TTL window, and at most `max_size` distinct keys
//! are tracked at a time.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::error::ConfigError;

/// Bounded key → expiry map with a per-key cooldown.
///
/// All state lives behind one mutex, so a single instance can be shared by
/// several collection routines.
#[derive(Debug)]
pub struct RateLimitingTtlCache<K> {
    max_size: usize,
    ttl: Duration,
    entries: Mutex<HashMap<K, Instant>>,
}

impl<K: Hash + Eq> RateLimitingTtlCache<K> {
    /// Creates a cache admitting at most `max_size` live keys, each for `ttl`.
    pub fn new(max_size: usize, ttl: Duration) -> Result<Self, ConfigError> {
        if max_size == 0 {
            return Err(ConfigError::invalid("max_size", "must be > 0"));
        }
        if ttl.is_zero() {
            return Err(ConfigError::invalid("ttl", "must be > 0"));
        }
        Ok(Self {
            max_size,
            ttl,
            entries: Mutex::new(HashMap::with_capacity(max_size.min(1024))),
        })
    }

    /// Creates a cache from validated configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::new(config.max_size, config.ttl())
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns `true` if the caller may act on `key` now.
    ///
    /// A key with a live entry is refused until that entry expires. A new key
    /// is refused while the cache holds `max_size` live entries; expired
    /// entries are evicted first to make room.
    pub fn acquire(&self, key: K) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();

        if let Some(&expires_at) = entries.get(&key) {
            if expires_at > now {
                return false;
            }
            entries.remove(&key);
        }

        if entries.len() >= self.max_size {
            entries.retain(|_, expires_at| *expires_at > now);
            if entries.len() >= self.max_size {
                return false;
            }
        }

        entries.insert(key, now + self.ttl);
        true
    }

    /// Number of live entries. Prunes expired ones.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, expires_at| *expires_at > now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry, live or not.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
