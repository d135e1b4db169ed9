//! [`LiveQuery`] – a predicate-filtered, incrementally maintained view of
//! the registry.
//!
//! A live query takes its initial snapshot and its registry subscription
//! under the registry's dispatch lock, so no event can fall between the two.
//! From then on its member list is mutated only from the dispatch path:
//!
//! | Registry event | Member before | Matches now | Query events |
//! |---|---|---|---|
//! | `DeviceAdded` | no | yes | `DeviceAdded` |
//! | `DeviceRemoved` | yes | – | `DeviceRemoved`, `PositionRemoved` |
//! | `PropertyChanged` | no | yes | `DeviceAdded` |
//! | `PropertyChanged` | yes | no | `DeviceRemoved`, `PositionRemoved` |
//! | `PropertyChanged` | yes | yes | `PropertyChanged` |
//!
//! Instances are shared through [`QueryCache`][crate::QueryCache]; user code
//! holds a [`QueryHandle`][crate::QueryHandle] rather than a `LiveQuery`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hwhub_registry::{DeviceHandle, DeviceListener, DeviceRegistry, SubscriptionId};
use hwhub_types::{ChangeEvent, DeviceId, PropertyMap};
use parking_lot::Mutex;
use tracing::debug;

use crate::predicate::Predicate;

/// Change notification delivered to [`LiveQuery`] subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    /// A device entered the result set; it was appended at the end.
    DeviceAdded(DeviceHandle),
    /// A device left the result set.  Always followed by exactly one
    /// `PositionRemoved`.
    DeviceRemoved(DeviceId),
    /// Index the removed device held immediately before removal.
    PositionRemoved(usize),
    /// A member's properties changed without affecting membership.
    /// `removed` names keys the device no longer reports.
    PropertyChanged {
        id: DeviceId,
        changes: PropertyMap,
        removed: Vec<String>,
    },
}

type QueryCallback = Arc<dyn Fn(&QueryEvent) + Send + Sync>;

pub struct LiveQuery {
    query: String,
    predicate: Predicate,
    registry: Weak<DeviceRegistry>,
    members: Mutex<Vec<DeviceHandle>>,
    subscribers: Mutex<Vec<(u64, QueryCallback)>>,
    next_subscriber: AtomicU64,
    registration: Mutex<Option<SubscriptionId>>,
}

/// Registry listener forwarding to a live query without keeping it alive.
struct Forward(Weak<LiveQuery>);

impl DeviceListener for Forward {
    fn on_event(&self, registry: &DeviceRegistry, event: &ChangeEvent) {
        if let Some(query) = self.0.upgrade() {
            query.handle(registry, event);
        }
    }
}

impl LiveQuery {
    /// Parse `query`, snapshot the matching devices and subscribe to
    /// `registry`, atomically with respect to dispatch.
    pub(crate) fn attach(registry: &Arc<DeviceRegistry>, query: &str) -> Arc<LiveQuery> {
        let live = Arc::new(LiveQuery {
            query: query.to_string(),
            predicate: Predicate::from_query(query),
            registry: Arc::downgrade(registry),
            members: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            registration: Mutex::new(None),
        });

        // A malformed query can never match; it needs no subscription.
        if !live.predicate.is_valid() {
            return live;
        }

        registry.with_dispatch_lock(|| {
            let members: Vec<DeviceHandle> = registry
                .enumerate(|record| live.predicate.matches(record))
                .iter()
                .filter_map(|id| registry.device(id))
                .collect();
            debug!(query = %live.query, matches = members.len(), "live query attached");
            *live.members.lock() = members;
            let id = registry.subscribe(Arc::new(Forward(Arc::downgrade(&live))));
            *live.registration.lock() = Some(id);
        });
        live
    }

    /// Unsubscribe from the registry.  Idempotent.
    pub(crate) fn detach(&self) {
        let Some(id) = self.registration.lock().take() else {
            return;
        };
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(id);
        }
        debug!(query = %self.query, "live query detached");
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Current members in result order.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.members.lock().clone()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.members.lock().iter().map(|d| d.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    pub fn at(&self, index: usize) -> Option<DeviceHandle> {
        self.members.lock().get(index).cloned()
    }

    pub fn index_of(&self, id: &DeviceId) -> Option<usize> {
        self.members.lock().iter().position(|d| d.id() == id)
    }

    /// Register `callback` for every subsequent [`QueryEvent`].
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&QueryEvent) + Send + Sync + 'static,
    ) -> QuerySubscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let callback: QueryCallback = Arc::new(callback);
        let register = || self.subscribers.lock().push((id, callback));
        match self.registry.upgrade() {
            Some(registry) => registry.with_dispatch_lock(register),
            None => register(),
        }
        QuerySubscription {
            query: Arc::downgrade(self),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        let remove = || self.subscribers.lock().retain(|(known, _)| *known != id);
        match self.registry.upgrade() {
            Some(registry) => registry.with_dispatch_lock(remove),
            None => remove(),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch path
    // -----------------------------------------------------------------------

    fn handle(&self, registry: &DeviceRegistry, event: &ChangeEvent) {
        match event {
            ChangeEvent::DeviceAdded { id } => {
                if self.index_of(id).is_none() && self.matches(registry, id) {
                    self.admit(registry, id);
                }
            }
            ChangeEvent::DeviceRemoved { id } => self.expel(id),
            ChangeEvent::PropertyChanged {
                id,
                changes,
                removed,
            } => {
                let member = self.index_of(id).is_some();
                match (member, self.matches(registry, id)) {
                    (false, true) => self.admit(registry, id),
                    (true, false) => self.expel(id),
                    (true, true) => self.notify(&QueryEvent::PropertyChanged {
                        id: id.clone(),
                        changes: changes.clone(),
                        removed: removed.clone(),
                    }),
                    (false, false) => {}
                }
            }
        }
    }

    fn matches(&self, registry: &DeviceRegistry, id: &DeviceId) -> bool {
        registry
            .inspect(id, |record| self.predicate.matches(record))
            .unwrap_or(false)
    }

    fn admit(&self, registry: &DeviceRegistry, id: &DeviceId) {
        let Some(device) = registry.device(id) else {
            return;
        };
        self.members.lock().push(device.clone());
        debug!(query = %self.query, device = %id, "device joined live query");
        self.notify(&QueryEvent::DeviceAdded(device));
    }

    fn expel(&self, id: &DeviceId) {
        let index = {
            let mut members = self.members.lock();
            let Some(index) = members.iter().position(|d| d.id() == id) else {
                return;
            };
            members.remove(index);
            index
        };
        debug!(query = %self.query, device = %id, index, "device left live query");
        self.notify(&QueryEvent::DeviceRemoved(id.clone()));
        self.notify(&QueryEvent::PositionRemoved(index));
    }

    fn notify(&self, event: &QueryEvent) {
        let snapshot: Vec<(u64, QueryCallback)> = self.subscribers.lock().clone();
        for (id, callback) in snapshot {
            // An earlier callback may have dropped this subscription.
            let live = self.subscribers.lock().iter().any(|(known, _)| *known == id);
            if live {
                callback(event);
            }
        }
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("query", &self.query)
            .field("predicate", &self.predicate)
            .field("members", &self.len())
            .finish()
    }
}

/// RAII subscription to a live query.  Dropping it unsubscribes; once the
/// drop returns the callback is never invoked again.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct QuerySubscription {
    query: Weak<LiveQuery>,
    id: u64,
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        if let Some(query) = self.query.upgrade() {
            query.unsubscribe(self.id);
        }
    }
}

impl fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySubscription").field("id", &self.id).finish()
    }
}
