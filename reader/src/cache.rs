//! In-process TTL cache for read-heavy query results.
//!
//! One map behind one narrow mutex. The lock is held for the map operation
//! only, never across a load from the database. Expired entries are dropped
//! lazily on read and proactively by [`spawn_sweeper`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::shutdown::Shutdown;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("expiry too short: cache entries must live at least {minimum:?}")]
    ExpiryTooShort { minimum: Duration },
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    min_horizon: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(min_horizon: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            min_horizon,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached value for `key`, or `None` on a miss. An expired entry counts
    /// as a miss and is removed.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_valid(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` until `expires_at`. Expiries closer than the configured
    /// minimum horizon are rejected and nothing is stored.
    pub fn put(
        &self,
        key: impl Into<String>,
        value: V,
        expires_at: Instant,
    ) -> Result<(), CacheError> {
        if expires_at < Instant::now() + self.min_horizon {
            return Err(CacheError::ExpiryTooShort {
                minimum: self.min_horizon,
            });
        }
        self.lock()
            .insert(key.into(), CacheEntry { value, expires_at });
        Ok(())
    }

    /// `put` with an expiry relative to now.
    pub fn put_for(&self, key: impl Into<String>, value: V, ttl: Duration) -> Result<(), CacheError> {
        self.put(key, value, Instant::now() + ttl)
    }

    /// Drop `key`. Returns whether an entry was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every key starting with `prefix`; returns how many went.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Remove every expired entry; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-through: return the cached value or compute it with `load`, then
    /// populate the cache. Concurrent misses on one key may each load;
    /// the last write wins.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, ttl: Duration, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            debug!(key, "cache: hit");
            return Ok(hit);
        }
        debug!(key, "cache: miss");
        let value = load().await?;
        if let Err(e) = self.put_for(key, value.clone(), ttl) {
            warn!(key, error = %e, "cache: value computed but not cached");
        }
        Ok(value)
    }
}

/// Periodically sweep expired entries until `shutdown` fires.
pub fn spawn_sweeper<V>(cache: Arc<TtlCache<V>>, every: Duration, shutdown: Shutdown) -> JoinHandle<()>
where
    V: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?every, "cache: sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = cache.sweep();
                    debug!(removed, remaining = cache.len(), "cache: swept");
                }
                _ = shutdown.wait() => break,
            }
        }
        info!("cache: sweeper stopped");
    })
}
