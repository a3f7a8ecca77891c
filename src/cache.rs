//! Time-expiring key/value store with first-write-wins semantics.
//!
//! A key, once stored, is never overwritten: a second [`ExpiringCache::set`]
//! for the same key is rejected even if the first entry has logically expired
//! and is still waiting for the sweeper. Expired entries are hidden from
//! [`ExpiringCache::get`] immediately (lazy expiration) and physically removed
//! by a background sweeper thread owned by the cache.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by cache operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache key not found: {key:?}")]
    NotFound { key: String },
}

/// Outcome of [`ExpiringCache::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The key was absent and the value is now stored.
    Stored,
    /// The key already existed; the stored entry is unchanged.
    Rejected,
}

impl SetOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored)
    }
}

/// Construction-time configuration of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL applied when `set` is called with a zero TTL. Zero means "never expires".
    pub default_ttl: Duration,
    /// How often the sweeper removes expired entries. Zero disables the sweeper.
    pub sweep_interval: Duration,
}

impl CacheConfig {
    pub fn new(default_ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            default_ttl,
            sweep_interval,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(3 * 60),
        }
    }
}

/// A stored value with its insertion time and optional absolute expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created: Instant,
    /// `None` means the entry never expires.
    pub expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now > at)
    }
}

type Entries<V> = Arc<RwLock<HashMap<String, CacheEntry<V>>>>;

/// Concurrent key/value store with per-entry TTL and a background sweeper.
///
/// All state lives behind one `RwLock`: lookups share it, mutations and the
/// sweeper's batch delete take it exclusively. No lock is held outside the
/// map access itself.
pub struct ExpiringCache<V> {
    entries: Entries<V>,
    default_ttl: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<V> std::fmt::Debug for ExpiringCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("default_ttl", &self.default_ttl)
            .field("len", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl<V> ExpiringCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache and, if `sweep_interval` is non-zero, start its sweeper thread.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let entries: Entries<V> = Arc::new(RwLock::new(HashMap::new()));

        let sweeper = if config.sweep_interval.is_zero() {
            None
        } else {
            Some(Sweeper::spawn(Arc::clone(&entries), config.sweep_interval)?)
        };

        Ok(Self {
            entries,
            default_ttl: config.default_ttl,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Store `value` under `key` unless the key is already present.
    ///
    /// A zero `ttl` falls back to the configured default TTL; if that is also
    /// zero the entry never expires. An existing key, expired or not, makes
    /// the call a no-op that returns [`SetOutcome::Rejected`].
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) -> SetOutcome {
        let key = key.into();
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let now = Instant::now();
        let expires_at = if ttl.is_zero() { None } else { now.checked_add(ttl) };

        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            debug!(key = %key, "key already cached, overwrite rejected");
            return SetOutcome::Rejected;
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                created: now,
                expires_at,
            },
        );
        SetOutcome::Stored
    }

    /// Look up `key`, treating a logically expired entry as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Remove `key`. Fails with [`CacheError::NotFound`] if it is absent.
    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self.entries.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(CacheError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    /// Remove every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        purge_expired(&self.entries)
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Whether the background sweeper is still running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Stop the sweeper and wait for its thread to exit. Idempotent.
    ///
    /// The cache stays usable afterwards; expired entries are then only
    /// hidden by `get` and removed by explicit `purge_expired` calls.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
    }
}

impl<V> Drop for ExpiringCache<V> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.stop();
        }
    }
}

/// Two-phase sweep: collect under the shared lock, delete under the exclusive one.
fn purge_expired<V>(entries: &RwLock<HashMap<String, CacheEntry<V>>>) -> usize {
    let now = Instant::now();
    let expired: Vec<String> = entries
        .read()
        .iter()
        .filter(|(_, entry)| entry.is_expired(now))
        .map(|(key, _)| key.clone())
        .collect();

    if expired.is_empty() {
        return 0;
    }

    let mut entries = entries.write();
    let mut removed = 0;
    for key in expired {
        // The key may have been deleted and set again between the two phases.
        if entries.get(&key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(&key);
            removed += 1;
        }
    }
    removed
}

// ── Sweeper ──

/// Handle to the sweeper thread. Dropping the sender wakes the loop for shutdown.
struct Sweeper {
    shutdown: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl Sweeper {
    fn spawn<V>(entries: Entries<V>, interval: Duration) -> Result<Self>
    where
        V: Send + Sync + 'static,
    {
        let (shutdown, signal) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("order-cache-sweeper".into())
            .spawn(move || sweep_loop(&entries, interval, &signal))
            .context("failed to spawn cache sweeper thread")?;

        Ok(Self { shutdown, thread })
    }

    fn stop(self) {
        drop(self.shutdown);
        if self.thread.join().is_err() {
            warn!("cache sweeper thread panicked");
        }
    }
}

fn sweep_loop<V>(
    entries: &RwLock<HashMap<String, CacheEntry<V>>>,
    interval: Duration,
    signal: &mpsc::Receiver<()>,
) {
    debug!(interval_ms = interval.as_millis(), "cache sweeper started");
    loop {
        match signal.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let removed = purge_expired(entries);
                if removed > 0 {
                    info!(removed, "swept expired cache entries");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("cache sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    const SHORT: Duration = Duration::from_millis(40);

    fn cache_without_sweeper(default_ttl: Duration) -> ExpiringCache<String> {
        ExpiringCache::new(CacheConfig::new(default_ttl, Duration::ZERO)).unwrap()
    }

    // ── set / get ──

    #[test]
    fn test_set_then_get() {
        let cache = cache_without_sweeper(Duration::ZERO);
        assert_eq!(cache.set("a", "one".to_string(), Duration::ZERO), SetOutcome::Stored);
        assert_eq!(cache.get("a").as_deref(), Some("one"));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_first_write_wins() {
        let cache = cache_without_sweeper(Duration::ZERO);
        assert!(cache.set("k", "v1".to_string(), Duration::ZERO).is_stored());
        assert_eq!(cache.set("k", "v2".to_string(), Duration::ZERO), SetOutcome::Rejected);
        assert_eq!(cache.get("k").as_deref(), Some("v1"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_set_rejected_even_when_existing_entry_expired() {
        let cache = cache_without_sweeper(Duration::ZERO);
        cache.set("k", "old".to_string(), SHORT);
        std::thread::sleep(SHORT * 3);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.set("k", "new".to_string(), Duration::ZERO), SetOutcome::Rejected);
        assert_eq!(cache.get("k"), None, "expired entry must not be replaced in place");
    }

    #[test]
    fn test_empty_key_is_an_ordinary_key() {
        let cache = cache_without_sweeper(Duration::ZERO);
        assert!(cache.set("", "blank".to_string(), Duration::ZERO).is_stored());
        assert_eq!(cache.get("").as_deref(), Some("blank"));
        assert_eq!(cache.set("", "again".to_string(), Duration::ZERO), SetOutcome::Rejected);
    }

    // ── expiry ──

    #[test]
    fn test_lazy_expiration_without_sweeper() {
        let cache = cache_without_sweeper(Duration::ZERO);
        cache.set("k", "v".to_string(), SHORT);
        assert!(cache.get("k").is_some());
        std::thread::sleep(SHORT * 3);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 1, "entry stays until swept");
    }

    #[test]
    fn test_zero_ttl_uses_default() {
        let cache = cache_without_sweeper(SHORT);
        cache.set("k", "v".to_string(), Duration::ZERO);
        assert!(cache.get("k").is_some());
        std::thread::sleep(SHORT * 3);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_zero_ttl_and_zero_default_never_expires() {
        let cache = cache_without_sweeper(Duration::ZERO);
        cache.set("A", "order1".to_string(), Duration::ZERO);
        std::thread::sleep(SHORT * 2);
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.get("A").as_deref(), Some("order1"));
    }

    #[test]
    fn test_explicit_ttl_overrides_default() {
        let cache = cache_without_sweeper(SHORT);
        cache.set("long", "v".to_string(), Duration::from_secs(60));
        std::thread::sleep(SHORT * 3);
        assert!(cache.get("long").is_some());
    }

    // ── delete ──

    #[test]
    fn test_delete_existing_key() {
        let cache = cache_without_sweeper(Duration::ZERO);
        cache.set("k", "v".to_string(), Duration::ZERO);
        cache.delete("k").unwrap();
        assert_eq!(cache.get("k"), None);
        assert!(cache.set("k", "v2".to_string(), Duration::ZERO).is_stored());
        assert_eq!(cache.get("k").as_deref(), Some("v2"));
    }

    #[test]
    fn test_delete_missing_key_is_not_found() {
        let cache = cache_without_sweeper(Duration::ZERO);
        assert_eq!(
            cache.delete("missing"),
            Err(CacheError::NotFound {
                key: "missing".to_string()
            })
        );
    }

    // ── sweeping ──

    #[test]
    fn test_purge_removes_only_expired() {
        let cache = cache_without_sweeper(Duration::ZERO);
        cache.set("short", "v".to_string(), SHORT);
        cache.set("forever", "v".to_string(), Duration::ZERO);
        cache.set("long", "v".to_string(), Duration::from_secs(60));
        std::thread::sleep(SHORT * 3);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("forever").is_some());
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn test_purge_is_idempotent_when_nothing_expired() {
        let cache = cache_without_sweeper(Duration::ZERO);
        cache.set("a", "1".to_string(), Duration::from_secs(60));
        cache.set("b", "2".to_string(), Duration::ZERO);
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }

    #[test]
    fn test_background_sweeper_removes_expired_entries() {
        let cache: ExpiringCache<String> =
            ExpiringCache::new(CacheConfig::new(Duration::ZERO, Duration::from_millis(20))).unwrap();
        assert!(cache.is_sweeping());
        cache.set("k", "v".to_string(), SHORT);
        cache.set("keep", "v".to_string(), Duration::ZERO);

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.len() > 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cache.len(), 1);
        assert!(cache.get("keep").is_some());
    }

    #[test]
    fn test_zero_sweep_interval_disables_sweeper() {
        let cache = cache_without_sweeper(Duration::ZERO);
        assert!(!cache.is_sweeping());
    }

    #[test]
    fn test_shutdown_stops_sweeper_promptly_and_is_idempotent() {
        let cache: ExpiringCache<String> =
            ExpiringCache::new(CacheConfig::new(Duration::ZERO, Duration::from_secs(3600))).unwrap();
        let started = Instant::now();
        cache.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!cache.is_sweeping());
        cache.shutdown();

        cache.set("still", "usable".to_string(), Duration::ZERO);
        assert!(cache.get("still").is_some());
    }

    #[test]
    fn test_drop_joins_sweeper() {
        let cache: ExpiringCache<String> =
            ExpiringCache::new(CacheConfig::new(Duration::ZERO, Duration::from_secs(3600))).unwrap();
        let started = Instant::now();
        drop(cache);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    // ── concurrency ──

    #[test]
    fn test_concurrent_set_same_key_exactly_one_winner() {
        let cache = Arc::new(cache_without_sweeper(Duration::ZERO));
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    (i, cache.set("shared", format!("v{i}"), Duration::ZERO))
                })
            })
            .collect();

        let outcomes: Vec<(usize, SetOutcome)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<usize> = outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_stored())
            .map(|(i, _)| *i)
            .collect();

        assert_eq!(winners.len(), 1);
        let expected = format!("v{}", winners[0]);
        for _ in 0..10 {
            assert_eq!(cache.get("shared").as_deref(), Some(expected.as_str()));
        }
    }

    #[test]
    fn test_concurrent_readers_and_writers_distinct_keys() {
        let cache = Arc::new(cache_without_sweeper(Duration::ZERO));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("{t}-{i}");
                        assert!(cache.set(key.clone(), key.clone(), Duration::ZERO).is_stored());
                        assert_eq!(cache.get(&key), Some(key));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 8 * 200);
    }
}
