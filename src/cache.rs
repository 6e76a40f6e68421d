//! # Stage: Fingerprint Cache
//!
//! ## Responsibility
//! Map a normalized request fingerprint to a previously computed result,
//! and make sure concurrent identical requests share one computation.
//!
//! ## Guarantees
//! - Single-flight: at most one computation per fingerprint is in flight.
//!   Concurrent callers join it and receive a clone of its result.
//! - Cancellation-safe: the computation runs in a spawned task behind a
//!   remote handle; it is cancelled only when every waiter has gone away.
//! - Failures are never stored; the next caller recomputes.
//! - Expired entries (age > ttl) are never returned.
//! - Bounded: at most `max_entries` results are retained; the oldest entry
//!   is evicted first.
//!
//! ## NOT Responsible For
//! - Deciding which requests may be cached (forced requests bypass it in
//!   the router)
//! - Billing (the router reports zero incremental cost for shared results)

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{RemoteHandle, Shared, WeakShared};
use futures::FutureExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{metrics, RouterError};

/// Compute a fingerprint for `text`.
///
/// The text is lower-cased and runs of whitespace are collapsed to a single
/// space before hashing, so trivially different spellings of the same
/// request share an entry.
///
/// # Example
///
/// ```rust
/// use tokio_cost_router::cache::fingerprint;
/// assert_eq!(fingerprint("What  is\nRust?"), fingerprint("what is rust?"));
/// ```
pub fn fingerprint(text: &str) -> String {
    let normalized = text
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// How a [`FingerprintCache::get_or_compute`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Served from a stored entry.
    Hit,
    /// Joined a computation started by another caller.
    Joined,
    /// This caller started the computation.
    Computed,
}

impl CacheOutcome {
    /// `true` unless this caller paid for the computation.
    pub fn is_shared(self) -> bool {
        !matches!(self, CacheOutcome::Computed)
    }

    fn label(self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Joined => "joined",
            CacheOutcome::Computed => "miss",
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Stored entries (including not-yet-purged expired ones).
    pub entries: usize,
    /// Computations currently running.
    pub in_flight: usize,
    /// Calls served from a stored entry.
    pub hits: u64,
    /// Calls that started a computation.
    pub misses: u64,
    /// Calls that joined a running computation.
    pub joins: u64,
    /// Entries removed to respect the capacity bound.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

type Flight<V> = Shared<RemoteHandle<Result<V, RouterError>>>;
type WeakFlight<V> = WeakShared<RemoteHandle<Result<V, RouterError>>>;

struct Inner<V: Clone + Send + Sync + 'static> {
    entries: DashMap<String, CacheEntry<V>>,
    in_flight: DashMap<String, (u64, WeakFlight<V>)>,
    next_flight: AtomicU64,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> Inner<V> {
    fn lookup(&self, key: &str) -> Option<V> {
        let fresh = self.entries.get(key).and_then(|e| {
            if e.is_expired() {
                None
            } else {
                Some(e.value.clone())
            }
        });
        if fresh.is_none()
            && self
                .entries
                .remove_if(key, |_, e| e.is_expired())
                .is_some()
        {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    fn store(&self, key: String, value: V, ttl: Duration) {
        if self.max_entries == 0 {
            return;
        }
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.max_entries {
                if !self.evict_oldest() {
                    break;
                }
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    fn evict_oldest(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().created_at)
            .map(|e| e.key().clone());
        match oldest {
            Some(key) => {
                self.entries.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %key, "cache entry evicted (capacity)");
                true
            }
            None => false,
        }
    }
}

/// Fingerprint-keyed result cache with single-flight computation.
///
/// Cloning is cheap and yields a handle to the same cache.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct FingerprintCache<V: Clone + Send + Sync + 'static> {
    inner: Arc<Inner<V>>,
}

impl<V: Clone + Send + Sync + 'static> Clone for FingerprintCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> FingerprintCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache retaining at most `max_entries` results.
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                next_flight: AtomicU64::new(0),
                max_entries,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                joins: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                expirations: AtomicU64::new(0),
            }),
        }
    }

    /// Return the stored value for `key`, if present and fresh.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lookup(key)
    }

    /// Store `value` under `key` directly.
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.inner.store(key.into(), value, ttl);
    }

    /// Return the cached value for `key`, or run `compute` exactly once
    /// across all concurrent callers and share its result.
    ///
    /// Successful results are stored for `ttl`. Errors are returned to every
    /// waiter of that computation but are not stored.
    ///
    /// # Errors
    ///
    /// Propagates the error produced by `compute`, or
    /// [`RouterError::Internal`] if the computation task was lost.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<(V, CacheOutcome), RouterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, RouterError>> + Send + 'static,
    {
        if let Some(value) = self.hit(key) {
            return Ok((value, CacheOutcome::Hit));
        }

        let (flight, outcome) = match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().1.upgrade();
                match live {
                    Some(flight) => (flight, CacheOutcome::Joined),
                    None => {
                        // The previous computation was abandoned by its waiters.
                        if let Some(value) = self.hit(key) {
                            return Ok((value, CacheOutcome::Hit));
                        }
                        let (id, flight) = self.launch(key, ttl, compute());
                        if let Some(weak) = flight.downgrade() {
                            occupied.insert((id, weak));
                        }
                        (flight, CacheOutcome::Computed)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                // A flight may have stored its result between the first
                // lookup and taking this slot.
                if let Some(value) = self.hit(key) {
                    return Ok((value, CacheOutcome::Hit));
                }
                let (id, flight) = self.launch(key, ttl, compute());
                if let Some(weak) = flight.downgrade() {
                    vacant.insert((id, weak));
                }
                (flight, CacheOutcome::Computed)
            }
        };

        match outcome {
            CacheOutcome::Joined => {
                self.inner.joins.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %key, "joined in-flight computation");
            }
            _ => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %key, "cache miss");
            }
        }
        metrics::inc_cache_event(outcome.label());

        flight.await.map(|value| (value, outcome))
    }

    fn hit(&self, key: &str) -> Option<V> {
        let value = self.inner.lookup(key)?;
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event(CacheOutcome::Hit.label());
        debug!(fingerprint = %key, "cache hit");
        Some(value)
    }

    fn launch<Fut>(&self, key: &str, ttl: Duration, work: Fut) -> (u64, Flight<V>)
    where
        Fut: Future<Output = Result<V, RouterError>> + Send + 'static,
    {
        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let task = async move {
            let result = work.await;
            if let Ok(value) = &result {
                inner.store(key.clone(), value.clone(), ttl);
            }
            inner.in_flight.remove_if(&key, |_, (flight, _)| *flight == id);
            result
        };
        let (remote, handle) = task.remote_handle();
        tokio::spawn(remote);
        (id, handle.shared())
    }

    /// Remove the entry for `key`. Returns `true` if one was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.entries.remove(key).is_some()
    }

    /// Drop expired entries and abandoned flights. Returns the number of
    /// expired entries removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, e| !e.is_expired());
        let removed = before.saturating_sub(self.inner.entries.len());
        self.inner
            .in_flight
            .retain(|_, (_, weak)| weak.upgrade().is_some());
        if removed > 0 {
            self.inner
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "purged expired cache entries");
        }
        removed
    }

    /// Remove every entry. Running computations are unaffected.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.entries.len(),
            in_flight: self.inner.in_flight.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            joins: self.inner.joins.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            expirations: self.inner.expirations.load(Ordering::Relaxed),
        }
    }

    /// Spawn a background task that calls [`Self::purge_expired`] every
    /// `interval`. The task exits once the cache is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        FingerprintCache { inner }.purge_expired();
                    }
                    None => break,
                }
            }
        })
    }
}
