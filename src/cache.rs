//! Compiled-artifact cache.
//!
//! Maps a [`Fingerprint`] to a compiled [`Context`]. Concurrent lookups of an
//! uncached fingerprint share one compilation: the first caller compiles,
//! the others wait on the same `OnceCell` and receive the same context.
//! Unrelated fingerprints never wait on each other.
//!
//! Eviction is configuration, not policy baked into the cache:
//! - `max_entries` bounds the size (least recently used goes first),
//! - [`ContextCache::sweep`] drops entries idle for longer than a max age
//!   (called by the maintenance task),
//! - [`ContextCache::invalidate`] drops one entry explicitly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::types::Fingerprint;
use crate::vm::Context;

/// Size bound for the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of compiled contexts kept (0 = unbounded).
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 256 }
    }
}

struct Entry {
    cell: Arc<OnceCell<Arc<dyn Context>>>,
    last_used: Instant,
}

impl Entry {
    fn pending(now: Instant) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            last_used: now,
        }
    }

    fn ready(context: Arc<dyn Context>, now: Instant) -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(context))),
            last_used: now,
        }
    }

    fn is_ready(&self) -> bool {
        self.cell.initialized()
    }
}

/// Fingerprint-keyed store of compiled contexts with single-flight compilation.
pub struct ContextCache {
    entries: Mutex<HashMap<Fingerprint, Entry>>,
    max_entries: usize,
    compilations: AtomicU64,
}

impl ContextCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: config.max_entries,
            compilations: AtomicU64::new(0),
        }
    }

    /// Return the compiled context for `fingerprint`, if one is installed.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<dyn Context>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(fingerprint)?;
        let context = entry.cell.get().cloned()?;
        entry.last_used = Instant::now();
        Some(context)
    }

    /// Install `context` for `fingerprint`, replacing any previous entry.
    pub async fn put(&self, fingerprint: Fingerprint, context: Arc<dyn Context>) {
        let mut entries = self.entries.lock().await;
        entries.insert(fingerprint, Entry::ready(context, Instant::now()));
        self.evict_over_capacity(&mut entries);
    }

    /// Return the cached context, compiling it with `compile` if absent.
    ///
    /// Only one `compile` runs per fingerprint at a time; concurrent callers
    /// wait for its result. A failed compilation is not cached: the next
    /// waiter, or the next request, compiles again.
    pub async fn get_or_compile<F, Fut, E>(
        &self,
        fingerprint: &Fingerprint,
        compile: F,
    ) -> Result<Arc<dyn Context>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Context>, E>>,
    {
        let cell = {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            let entry = entries
                .entry(fingerprint.clone())
                .or_insert_with(|| Entry::pending(now));
            entry.last_used = now;
            entry.cell.clone()
        };

        let result = cell
            .get_or_try_init(|| async move {
                self.compilations.fetch_add(1, Ordering::Relaxed);
                debug!(%fingerprint, "Compiling context");
                compile().await
            })
            .await
            .cloned();

        let mut entries = self.entries.lock().await;
        match &result {
            Ok(_) => {
                // Count from completion, not from the request.
                if let Some(entry) = entries
                    .get_mut(fingerprint)
                    .filter(|e| Arc::ptr_eq(&e.cell, &cell))
                {
                    entry.last_used = Instant::now();
                }
                self.evict_over_capacity(&mut entries);
            }
            Err(_) => {
                // Held only by the map and by us: nobody else is waiting on it.
                let stale = entries.get(fingerprint).is_some_and(|e| {
                    Arc::ptr_eq(&e.cell, &cell) && !e.is_ready() && Arc::strong_count(&cell) == 2
                });
                if stale {
                    entries.remove(fingerprint);
                }
            }
        }

        result
    }

    /// Drop the compiled entry for `fingerprint`. Returns whether one was
    /// removed.
    ///
    /// An entry still compiling is left in place; its waiters would
    /// otherwise race a second compilation of the same fingerprint.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(fingerprint) {
            Some(entry) if entry.is_ready() => {
                entries.remove(fingerprint);
                true
            }
            _ => false,
        }
    }

    /// Drop compiled entries not used within `max_age`. Returns how many.
    ///
    /// Entries whose compilation is still running are kept.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_ready() || e.last_used.elapsed() <= max_age);
        before - entries.len()
    }

    /// Number of entries, including compilations in flight.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Number of compilations started since creation.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    fn evict_over_capacity(&self, entries: &mut HashMap<Fingerprint, Entry>) {
        if self.max_entries == 0 {
            return;
        }

        while entries.len() > self.max_entries {
            let oldest = entries
                .iter()
                .filter(|(_, e)| e.is_ready())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());

            match oldest {
                Some(key) => {
                    debug!(fingerprint = %key, "Evicting compiled context");
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
