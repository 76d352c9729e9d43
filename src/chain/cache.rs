//! Bounded LRU cache of recently-validated remote identities.
//!
//! The cache exists to shave the remote round trip off bursts of calls
//! from the same small set of recent callers, not to be a general
//! identity store, so the default capacity is deliberately small. A
//! periodic background task batches one `are_valid` call over the cached
//! identities and drops every one the bus answers negative, amortizing
//! revalidation cost across many cached calls.

use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::remote::AccessControl;

/// Default cache capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 20;

/// Default interval between batched revalidations.
pub const DEFAULT_REVALIDATION_INTERVAL: Duration = Duration::from_secs(300);

/// A validated identity: which bus issued the login, and which login.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub bus_id: String,
    pub login_id: String,
}

impl IdentityKey {
    pub fn new(bus_id: impl Into<String>, login_id: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
            login_id: login_id.into(),
        }
    }
}

/// Answer of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAnswer {
    /// Recently validated; the call may proceed without a round trip.
    Fresh,
    /// Not cached; the caller must validate remotely.
    Unknown,
}

// Strict LRU: a monotonic sequence per entry, with the ordered map giving
// O(log n) eviction of the lowest (least recently used) sequence.
struct CacheInner {
    entries: HashMap<IdentityKey, u64>,
    order: BTreeMap<u64, IdentityKey>,
    next_seq: u64,
}

/// Process-wide cache of recently-validated identities.
pub struct LoginCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl LoginCache {
    /// Create a cache bounded at `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Look up an identity, promoting it to most-recently-used on a hit.
    pub fn lookup(&self, key: &IdentityKey) -> CacheAnswer {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;
        match inner.entries.get_mut(key) {
            Some(entry_seq) => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                let old = std::mem::replace(entry_seq, seq);
                inner.order.remove(&old);
                inner.order.insert(seq, key.clone());
                CacheAnswer::Fresh
            }
            None => CacheAnswer::Unknown,
        }
    }

    /// Record a successful remote validation, evicting the least-recently
    /// used entry when at capacity.
    pub fn insert(&self, key: IdentityKey) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = inner.entries.remove(&key) {
            inner.order.remove(&old);
        } else if inner.entries.len() >= self.capacity {
            if let Some((_, evicted)) = inner.order.pop_first() {
                inner.entries.remove(&evicted);
                debug!("evicting login {} from validation cache", evicted.login_id);
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(key.clone(), seq);
        inner.order.insert(seq, key);
    }

    /// Drop an identity the bus reported invalid.
    pub fn remove(&self, key: &IdentityKey) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(seq) = inner.entries.remove(key) {
            inner.order.remove(&seq);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all cached identities, in LRU-to-MRU order.
    pub fn snapshot(&self) -> Vec<IdentityKey> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.order.values().cloned().collect()
    }
}

impl Default for LoginCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// Handle over the periodic batch-revalidation task.
///
/// Stopping never waits out the sleep interval: the loop selects on the
/// shutdown channel alongside its timer.
pub struct RevalidationTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RevalidationTask {
    /// Spawn the revalidation loop for one bus.
    ///
    /// Only identities issued by `bus_id` are sent in the batch; entries
    /// for other buses in a shared cache are left for their own tasks.
    pub fn spawn(
        cache: Arc<LoginCache>,
        bus: Arc<dyn AccessControl>,
        bus_id: String,
        period: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so a freshly
            // spawned task does not race the first insertions.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let keys: Vec<IdentityKey> = cache
                    .snapshot()
                    .into_iter()
                    .filter(|key| key.bus_id == bus_id)
                    .collect();
                if keys.is_empty() {
                    continue;
                }
                let ids: Vec<String> = keys.iter().map(|k| k.login_id.clone()).collect();
                match bus.are_valid(&ids).await {
                    Ok(answers) => {
                        let mut dropped = 0usize;
                        for (key, valid) in keys.iter().zip(answers) {
                            if !valid {
                                cache.remove(key);
                                dropped += 1;
                            }
                        }
                        debug!(
                            "revalidated {} cached logins, dropped {}",
                            ids.len(),
                            dropped
                        );
                    }
                    // Transport failure leaves the cache untouched; the
                    // next tick retries.
                    Err(e) => warn!("batch revalidation failed: {e}"),
                }
            }
        });
        Self { shutdown, handle }
    }

    /// Signal the loop to stop without waiting for it.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Merely dropping the handle also stops the loop: the task breaks
    /// out as soon as its shutdown channel closes.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
