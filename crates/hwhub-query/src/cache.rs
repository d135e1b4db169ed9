//! [`QueryCache`] – one shared [`LiveQuery`] per distinct query string.
//!
//! The cache is an explicit reference-counted map from query string to
//! `{instance, strong count}`.  Every [`QueryHandle`] is one strong
//! reference: cloning a handle increments the count, dropping it decrements
//! the count, and the drop that reaches zero evicts the entry and
//! unsubscribes the instance from the registry before returning.  The next
//! lookup of the same string builds a fresh instance.
//!
//! Lookups and releases take the registry's dispatch lock before the map
//! lock, so a handle may be created or dropped from inside a listener.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hwhub_registry::{DeviceHandle, DeviceRegistry};
use hwhub_types::DeviceId;
use parking_lot::Mutex;
use tracing::debug;

use crate::live_query::{LiveQuery, QueryEvent, QuerySubscription};
use crate::predicate::Predicate;

struct CacheEntry {
    live: Arc<LiveQuery>,
    strong: usize,
}

struct CacheInner {
    registry: Arc<DeviceRegistry>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CacheInner {
    fn release(&self, live: &Arc<LiveQuery>) {
        let evicted = self.registry.with_dispatch_lock(|| {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(live.query()) else {
                return None;
            };
            if !Arc::ptr_eq(&entry.live, live) {
                return None;
            }
            entry.strong -= 1;
            if entry.strong > 0 {
                return None;
            }
            entries.remove(live.query()).map(|entry| entry.live)
        });
        if let Some(live) = evicted {
            live.detach();
            debug!(query = %live.query(), "live query evicted");
        }
    }
}

/// Shared cache of live queries over one registry.  Cheap to clone.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                registry,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    /// The live query for `query`, shared with every other holder of the
    /// same string.  Never fails: a malformed query yields an instance that
    /// matches nothing.
    pub fn for_query(&self, query: &str) -> QueryHandle {
        let registry = &self.inner.registry;
        let live = registry.with_dispatch_lock(|| {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(query) {
                entry.strong += 1;
                return Arc::clone(&entry.live);
            }
            let live = LiveQuery::attach(registry, query);
            entries.insert(
                query.to_string(),
                CacheEntry {
                    live: Arc::clone(&live),
                    strong: 1,
                },
            );
            live
        });
        QueryHandle {
            cache: Arc::clone(&self.inner),
            live,
        }
    }

    /// Number of live queries currently cached.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Strong count of the cached instance for `query`, `0` when absent.
    pub fn strong_count(&self, query: &str) -> usize {
        self.inner
            .entries
            .lock()
            .get(query)
            .map_or(0, |entry| entry.strong)
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache").field("entries", &self.len()).finish()
    }
}

/// Strong reference to a cached [`LiveQuery`].
pub struct QueryHandle {
    cache: Arc<CacheInner>,
    live: Arc<LiveQuery>,
}

impl QueryHandle {
    pub fn query(&self) -> &str {
        self.live.query()
    }

    pub fn predicate(&self) -> &Predicate {
        self.live.predicate()
    }

    /// Current result set in result order.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.live.devices()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.live.device_ids()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn at(&self, index: usize) -> Option<DeviceHandle> {
        self.live.at(index)
    }

    pub fn index_of(&self, id: &DeviceId) -> Option<usize> {
        self.live.index_of(id)
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&QueryEvent) + Send + Sync + 'static,
    ) -> QuerySubscription {
        self.live.subscribe(callback)
    }

    pub fn subscriber_count(&self) -> usize {
        self.live.subscriber_count()
    }

    /// `true` when both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &QueryHandle) -> bool {
        Arc::ptr_eq(&self.live, &other.live)
    }
}

impl Clone for QueryHandle {
    fn clone(&self) -> Self {
        if let Some(entry) = self.cache.entries.lock().get_mut(self.live.query()) {
            if Arc::ptr_eq(&entry.live, &self.live) {
                entry.strong += 1;
            }
        }
        Self {
            cache: Arc::clone(&self.cache),
            live: Arc::clone(&self.live),
        }
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.cache.release(&self.live);
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("query", &self.live.query())
            .field("devices", &self.live.len())
            .finish()
    }
}
