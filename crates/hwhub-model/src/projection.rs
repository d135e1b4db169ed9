//! [`ListProjection`] – an ordered mirror of a live query's result set.
//!
//! Every mutation is bracketed, and observers always see the row data of the
//! side of the bracket they are on:
//!
//! | Query event | Projection events |
//! |---|---|
//! | `DeviceAdded` | `BeginInsertRows`, `EndInsertRows`, (`EmptyChanged(false)`), `CountChanged`, `DeviceAdded` |
//! | `PositionRemoved` | `BeginRemoveRows`, `EndRemoveRows`, (`EmptyChanged(true)`), `CountChanged`, `DeviceRemoved` |
//!
//! `EmptyChanged` fires only when the row count moves between zero and
//! non-zero.  Member property changes do not touch the row order and are not
//! forwarded.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hwhub_query::{QueryCache, QueryEvent, QueryHandle, QuerySubscription};
use hwhub_registry::{DeviceHandle, InterfaceHandle};
use hwhub_types::DeviceId;
use parking_lot::Mutex;
use tracing::debug;

/// The single data role, numbered after the conventional first user role.
pub const DEVICE_ROLE: u32 = 0x0100;

/// Notification emitted by a [`ListProjection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionEvent {
    /// Rows `first..=last` are about to be inserted.
    BeginInsertRows { first: usize, last: usize },
    EndInsertRows,
    /// Rows `first..=last` are about to be removed.
    BeginRemoveRows { first: usize, last: usize },
    EndRemoveRows,
    EmptyChanged(bool),
    CountChanged(usize),
    DeviceAdded(DeviceId),
    DeviceRemoved(DeviceId),
    QueryChanged(String),
}

/// Row content returned by [`ListProjection::at`].
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// The device's highest-priority capability interface.
    Device(InterfaceHandle),
    /// Out of range, or a device exposing no interface at all.
    Invalid,
}

impl Slot {
    pub fn is_valid(&self) -> bool {
        matches!(self, Slot::Device(_))
    }

    pub fn interface(&self) -> Option<&InterfaceHandle> {
        match self {
            Slot::Device(interface) => Some(interface),
            Slot::Invalid => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&ProjectionEvent) + Send + Sync>;

struct Rows {
    rows: Mutex<Vec<DeviceHandle>>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
}

impl Rows {
    fn emit(&self, event: &ProjectionEvent) {
        let snapshot: Vec<(ObserverId, Observer)> = self.observers.lock().clone();
        for (id, observer) in snapshot {
            let live = self.observers.lock().iter().any(|(known, _)| *known == id);
            if live {
                observer(event);
            }
        }
    }

    fn insert(&self, device: DeviceHandle) {
        let index = self.rows.lock().len();
        let id = device.id().clone();
        self.emit(&ProjectionEvent::BeginInsertRows {
            first: index,
            last: index,
        });
        self.rows.lock().push(device);
        self.emit(&ProjectionEvent::EndInsertRows);
        if index == 0 {
            self.emit(&ProjectionEvent::EmptyChanged(false));
        }
        self.emit(&ProjectionEvent::CountChanged(index + 1));
        self.emit(&ProjectionEvent::DeviceAdded(id));
    }

    fn remove(&self, index: usize) {
        let Some(id) = self.rows.lock().get(index).map(|d| d.id().clone()) else {
            return;
        };
        self.emit(&ProjectionEvent::BeginRemoveRows {
            first: index,
            last: index,
        });
        let count = {
            let mut rows = self.rows.lock();
            rows.remove(index);
            rows.len()
        };
        self.emit(&ProjectionEvent::EndRemoveRows);
        if count == 0 {
            self.emit(&ProjectionEvent::EmptyChanged(true));
        }
        self.emit(&ProjectionEvent::CountChanged(count));
        self.emit(&ProjectionEvent::DeviceRemoved(id));
    }

    fn reset(&self, devices: Vec<DeviceHandle>) {
        let old = self.rows.lock().len();
        if old > 0 {
            self.emit(&ProjectionEvent::BeginRemoveRows {
                first: 0,
                last: old - 1,
            });
            self.rows.lock().clear();
            self.emit(&ProjectionEvent::EndRemoveRows);
            self.emit(&ProjectionEvent::EmptyChanged(true));
            self.emit(&ProjectionEvent::CountChanged(0));
        }
        let new = devices.len();
        if new > 0 {
            self.emit(&ProjectionEvent::BeginInsertRows {
                first: 0,
                last: new - 1,
            });
            *self.rows.lock() = devices;
            self.emit(&ProjectionEvent::EndInsertRows);
            self.emit(&ProjectionEvent::EmptyChanged(false));
            self.emit(&ProjectionEvent::CountChanged(new));
        }
    }
}

// Field order matters: the subscription must go before the handle it
// points into.
struct Binding {
    _subscription: QuerySubscription,
    handle: QueryHandle,
}

/// Ordered, observable view of one query's result set.
pub struct ListProjection {
    cache: QueryCache,
    rows: Arc<Rows>,
    binding: Mutex<Option<Binding>>,
    next_observer: AtomicU64,
}

impl ListProjection {
    pub fn new(cache: &QueryCache, query: &str) -> Self {
        let projection = Self {
            cache: cache.clone(),
            rows: Arc::new(Rows {
                rows: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
            }),
            binding: Mutex::new(None),
            next_observer: AtomicU64::new(1),
        };
        projection.bind(query);
        projection
    }

    /// Attach to the live query for `query`, taking its current rows and
    /// subscribing with no event in between.
    fn bind(&self, query: &str) {
        let registry = Arc::clone(self.cache.registry());
        registry.with_dispatch_lock(|| {
            // Drop the old subscription before the fresh rows land.
            drop(self.binding.lock().take());
            let handle = self.cache.for_query(query);
            let rows = Arc::downgrade(&self.rows);
            let subscription = handle.subscribe(move |event| mirror(&rows, event));
            self.rows.reset(handle.devices());
            *self.binding.lock() = Some(Binding {
                _subscription: subscription,
                handle,
            });
        });
    }

    pub fn query(&self) -> String {
        self.binding
            .lock()
            .as_ref()
            .map(|binding| binding.handle.query().to_string())
            .unwrap_or_default()
    }

    /// Re-bind to a different query.  The old rows are removed and the new
    /// ones inserted, each as one bracketed range, then `QueryChanged` fires.
    pub fn set_query(&self, query: &str) {
        if self.query() == query {
            return;
        }
        self.bind(query);
        debug!(query, rows = self.count(), "projection query changed");
        self.rows.emit(&ProjectionEvent::QueryChanged(query.to_string()));
    }

    pub fn count(&self) -> usize {
        self.rows.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Row `index`, or [`Slot::Invalid`] when out of range.
    pub fn at(&self, index: usize) -> Slot {
        self.rows
            .rows
            .lock()
            .get(index)
            .and_then(DeviceHandle::primary_interface)
            .map_or(Slot::Invalid, Slot::Device)
    }

    pub fn get(&self, index: usize) -> Slot {
        self.at(index)
    }

    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.rows.rows.lock().clone()
    }

    /// Role-addressed row access; only [`DEVICE_ROLE`] carries data.
    pub fn data(&self, index: usize, role: u32) -> Slot {
        if role != DEVICE_ROLE {
            return Slot::Invalid;
        }
        self.at(index)
    }

    pub fn role_names(&self) -> BTreeMap<u32, &'static str> {
        BTreeMap::from([(DEVICE_ROLE, "device")])
    }

    pub fn observe(&self, observer: impl Fn(&ProjectionEvent) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.rows.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        let registry = Arc::clone(self.cache.registry());
        registry.with_dispatch_lock(|| {
            let mut observers = self.rows.observers.lock();
            let before = observers.len();
            observers.retain(|(known, _)| *known != id);
            observers.len() != before
        })
    }
}

fn mirror(rows: &Weak<Rows>, event: &QueryEvent) {
    let Some(rows) = rows.upgrade() else {
        return;
    };
    match event {
        QueryEvent::DeviceAdded(device) => rows.insert(device.clone()),
        QueryEvent::PositionRemoved(index) => rows.remove(*index),
        QueryEvent::DeviceRemoved(_) | QueryEvent::PropertyChanged { .. } => {}
    }
}

impl fmt::Debug for ListProjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListProjection")
            .field("query", &self.query())
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwhub_backends::{FakeBackend, FakeDevice};
    use hwhub_registry::DeviceRegistry;
    use hwhub_types::Capability;

    fn id(udi: &str) -> DeviceId {
        FakeDevice::new(udi).id().clone()
    }

    async fn setup() -> (Arc<DeviceRegistry>, Arc<FakeBackend>, QueryCache) {
        let backend = Arc::new(
            FakeBackend::new()
                .with_device(FakeDevice::laptop_battery("acpi_BAT0"))
                .with_device(FakeDevice::ac_adapter("acpi_AC")),
        );
        let registry = DeviceRegistry::new();
        registry.register_backend(backend.clone()).await;
        let cache = QueryCache::new(Arc::clone(&registry));
        (registry, backend, cache)
    }

    fn record(projection: &ListProjection) -> Arc<Mutex<Vec<ProjectionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        projection.observe(move |e| sink.lock().push(e.clone()));
        seen
    }

    #[tokio::test]
    async fn rows_resolve_to_primary_interfaces() {
        let (_registry, _backend, cache) = setup().await;
        let projection = ListProjection::new(&cache, "Battery");
        assert_eq!(projection.count(), 1);

        let slot = projection.at(0);
        let battery = slot.interface().and_then(InterfaceHandle::as_battery).unwrap();
        assert_eq!(battery.charge_percent(), Some(50));
        assert_eq!(projection.get(0), slot);
        assert_eq!(projection.data(0, DEVICE_ROLE), slot);
    }

    #[tokio::test]
    async fn out_of_range_and_unknown_roles_are_invalid() {
        let (_registry, _backend, cache) = setup().await;
        let projection = ListProjection::new(&cache, "");
        assert_eq!(projection.at(2), Slot::Invalid);
        assert_eq!(projection.at(usize::MAX), Slot::Invalid);
        assert_eq!(projection.data(0, 0), Slot::Invalid);
        assert_eq!(projection.role_names()[&DEVICE_ROLE], "device");
    }

    #[tokio::test]
    async fn additions_are_bracketed_and_appended() {
        let (registry, backend, cache) = setup().await;
        let projection = ListProjection::new(&cache, "Battery");
        let seen = record(&projection);

        backend.add_device(FakeDevice::laptop_battery("acpi_BAT1")).unwrap();
        registry.process_pending();

        assert_eq!(
            *seen.lock(),
            vec![
                ProjectionEvent::BeginInsertRows { first: 1, last: 1 },
                ProjectionEvent::EndInsertRows,
                ProjectionEvent::CountChanged(2),
                ProjectionEvent::DeviceAdded(id("acpi_BAT1")),
            ]
        );
        assert_eq!(projection.at(1).interface().unwrap().device().id(), &id("acpi_BAT1"));
    }

    #[tokio::test]
    async fn empty_changed_fires_only_on_zero_transitions() {
        let (registry, backend, cache) = setup().await;
        let projection = ListProjection::new(&cache, "Battery");
        let seen = record(&projection);

        backend.remove_device(&id("acpi_BAT0")).unwrap();
        registry.process_pending();
        assert_eq!(
            *seen.lock(),
            vec![
                ProjectionEvent::BeginRemoveRows { first: 0, last: 0 },
                ProjectionEvent::EndRemoveRows,
                ProjectionEvent::EmptyChanged(true),
                ProjectionEvent::CountChanged(0),
                ProjectionEvent::DeviceRemoved(id("acpi_BAT0")),
            ]
        );

        seen.lock().clear();
        backend.add_device(FakeDevice::laptop_battery("acpi_BAT1")).unwrap();
        backend.add_device(FakeDevice::laptop_battery("acpi_BAT2")).unwrap();
        registry.process_pending();
        let empties: Vec<_> = seen
            .lock()
            .iter()
            .filter(|e| matches!(e, ProjectionEvent::EmptyChanged(_)))
            .cloned()
            .collect();
        assert_eq!(empties, vec![ProjectionEvent::EmptyChanged(false)]);
        assert_eq!(projection.count(), 2);
    }

    #[tokio::test]
    async fn observers_see_old_rows_inside_the_bracket() {
        let (registry, backend, cache) = setup().await;
        let projection = Arc::new(ListProjection::new(&cache, "Battery"));
        let counts = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&projection);
        let sink = Arc::clone(&counts);
        projection.observe(move |event| {
            if let Some(projection) = weak.upgrade() {
                sink.lock().push((event.clone(), projection.count()));
            }
        });

        backend.remove_device(&id("acpi_BAT0")).unwrap();
        registry.process_pending();

        let counts = counts.lock();
        assert_eq!(counts[0], (ProjectionEvent::BeginRemoveRows { first: 0, last: 0 }, 1));
        assert_eq!(counts[1], (ProjectionEvent::EndRemoveRows, 0));
    }

    #[tokio::test]
    async fn set_query_swaps_rows_and_announces_the_query() {
        let (registry, backend, cache) = setup().await;
        let projection = ListProjection::new(&cache, "Battery");
        let seen = record(&projection);

        projection.set_query("GenericInterface");
        assert_eq!(projection.query(), "GenericInterface");
        assert_eq!(
            *seen.lock(),
            vec![
                ProjectionEvent::BeginRemoveRows { first: 0, last: 0 },
                ProjectionEvent::EndRemoveRows,
                ProjectionEvent::EmptyChanged(true),
                ProjectionEvent::CountChanged(0),
                ProjectionEvent::BeginInsertRows { first: 0, last: 0 },
                ProjectionEvent::EndInsertRows,
                ProjectionEvent::EmptyChanged(false),
                ProjectionEvent::CountChanged(1),
                ProjectionEvent::QueryChanged("GenericInterface".into()),
            ]
        );
        assert_eq!(projection.at(0).interface().unwrap().capability(), Capability::GenericInterface);

        // The old query was released and no longer feeds this projection.
        assert_eq!(cache.strong_count("Battery"), 0);
        seen.lock().clear();
        backend.add_device(FakeDevice::laptop_battery("acpi_BAT1")).unwrap();
        registry.process_pending();
        assert!(seen.lock().is_empty());

        projection.set_query("GenericInterface");
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn unobserved_callbacks_are_not_called() {
        let (registry, backend, cache) = setup().await;
        let projection = ListProjection::new(&cache, "Battery");
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        let observer = projection.observe(move |_| *sink.lock() += 1);

        assert!(projection.unobserve(observer));
        assert!(!projection.unobserve(observer));
        backend.add_device(FakeDevice::laptop_battery("acpi_BAT1")).unwrap();
        registry.process_pending();
        assert_eq!(*seen.lock(), 0);
        assert_eq!(projection.count(), 2);
    }

    #[tokio::test]
    async fn dropping_the_projection_releases_its_query() {
        let (registry, _backend, cache) = setup().await;
        let projection = ListProjection::new(&cache, "Battery");
        let other = ListProjection::new(&cache, "Battery");
        assert_eq!(cache.strong_count("Battery"), 2);
        assert_eq!(registry.subscriber_count(), 1);

        drop(projection);
        drop(other);
        assert!(cache.is_empty());
        assert_eq!(registry.subscriber_count(), 0);
    }
}
