//! [`DeviceRegistry`] – canonical device state and the single dispatch path.
//!
//! Backends push [`ChangeEvent`]s into an unbounded queue through their
//! [`EventSink`].  The queue is drained either synchronously
//! ([`DeviceRegistry::process_pending`]) or by the async
//! [`DeviceRegistry::run`] loop.  For every event the registry:
//!
//! 1. applies it to the canonical device/property state, then
//! 2. delivers it to every subscribed [`DeviceListener`] in subscription
//!    order,
//!
//! and only then dequeues the next one.  A reentrant dispatch gate is held for
//! the whole of step 1 and 2; [`DeviceRegistry::unsubscribe`] takes the same
//! gate, so once it returns no in-flight event can reach the removed listener.
//!
//! A backend that fails is marked [`BackendStatus::Degraded`], its devices
//! are removed through synthesized `DeviceRemoved` events and the remaining
//! backends keep being served.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hwhub_types::{
    CapabilitySet, ChangeEvent, DeviceId, HubError, PropertyMap, PropertyValue,
};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::adapter::{BackendAdapter, EventSink, Inbound, InboundMessage};
use crate::handle::DeviceHandle;

/// Upper bound on [`BackendAdapter::start`] before the backend is declared
/// failed.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Index of a registered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(usize);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend#{}", self.0)
    }
}

/// Handle returned by [`DeviceRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Health of a registered backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Active,
    /// Start-up, enumeration or the transport failed.  The backend
    /// contributes no devices.
    Degraded(String),
    /// Removed explicitly or by registry shutdown.
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    StartupFailed,
    Degraded,
    AdapterError,
    DuplicateDevice,
}

/// A non-fatal problem recorded by the registry.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub at: DateTime<Utc>,
    pub backend: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Receives every canonical event after it has been applied to the registry.
///
/// Called on the dispatch path: implementations must not block.  They may
/// read the registry (the state already reflects `event`) and may subscribe
/// or unsubscribe listeners.
pub trait DeviceListener: Send + Sync {
    fn on_event(&self, registry: &DeviceRegistry, event: &ChangeEvent);
}

impl<F> DeviceListener for F
where
    F: Fn(&DeviceRegistry, &ChangeEvent) + Send + Sync,
{
    fn on_event(&self, registry: &DeviceRegistry, event: &ChangeEvent) {
        self(registry, event)
    }
}

/// Read access to one device's capabilities and normalized properties, as
/// needed by predicate evaluation.
pub trait DeviceView {
    fn capabilities(&self) -> &CapabilitySet;
    fn property(&self, key: &str) -> Option<&PropertyValue>;
}

/// The registry's canonical record of one device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    id: DeviceId,
    backend: BackendId,
    capabilities: CapabilitySet,
    properties: PropertyMap,
}

impl DeviceRecord {
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }
}

impl DeviceView for DeviceRecord {
    fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct BackendSlot {
    name: String,
    adapter: Option<Arc<dyn BackendAdapter>>,
    status: BackendStatus,
}

#[derive(Default)]
struct RegistryState {
    backends: Vec<BackendSlot>,
    devices: HashMap<DeviceId, DeviceRecord>,
    /// Insertion order of `devices`; the canonical enumeration order.
    order: Vec<DeviceId>,
    diagnostics: Vec<Diagnostic>,
}

impl RegistryState {
    fn is_active(&self, backend: BackendId) -> bool {
        self.backends
            .get(backend.0)
            .is_some_and(|slot| slot.status == BackendStatus::Active)
    }

    fn backend_name(&self, backend: BackendId) -> String {
        self.backends
            .get(backend.0)
            .map(|slot| slot.name.clone())
            .unwrap_or_else(|| backend.to_string())
    }

    fn diagnose(&mut self, backend: BackendId, kind: DiagnosticKind, message: String) {
        let backend = self.backend_name(backend);
        self.diagnostics.push(Diagnostic {
            at: Utc::now(),
            backend,
            kind,
            message,
        });
    }

    fn remove_device(&mut self, id: &DeviceId) -> Option<DeviceRecord> {
        let record = self.devices.remove(id)?;
        self.order.retain(|known| known != id);
        Some(record)
    }
}

/// Resets the dispatch flag even if a listener panics.
struct DispatchScope<'a>(&'a Cell<bool>);

impl<'a> DispatchScope<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for DispatchScope<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DeviceRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Process-scoped hub aggregating every backend adapter.
///
/// Construct once with [`DeviceRegistry::new`], register backends, pass the
/// `Arc` to whoever needs it and call [`DeviceRegistry::shutdown`] on exit.
pub struct DeviceRegistry {
    self_ref: Weak<DeviceRegistry>,
    state: Mutex<RegistryState>,
    listeners: Mutex<Vec<(SubscriptionId, Arc<dyn DeviceListener>)>>,
    /// Held for the application and delivery of one event.  The flag is
    /// `true` while an event is being dispatched on the owning thread.
    gate: ReentrantMutex<Cell<bool>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    next_subscription: AtomicU64,
    closed: AtomicBool,
    shutdown: Notify,
    start_timeout: Duration,
}

impl DeviceRegistry {
    /// Create an empty registry with the default backend start timeout.
    pub fn new() -> Arc<Self> {
        Self::with_start_timeout(DEFAULT_START_TIMEOUT)
    }

    /// Create an empty registry that gives each backend at most
    /// `start_timeout` to acquire its resources.
    pub fn with_start_timeout(start_timeout: Duration) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            state: Mutex::new(RegistryState::default()),
            listeners: Mutex::new(Vec::new()),
            gate: ReentrantMutex::new(Cell::new(false)),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            next_subscription: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            start_timeout,
        })
    }

    // -----------------------------------------------------------------------
    // Backend lifecycle
    // -----------------------------------------------------------------------

    /// Register `adapter`, start it and admit its current devices.
    ///
    /// Never fails: a backend that cannot start or enumerate is recorded as
    /// [`BackendStatus::Degraded`] with a [`Diagnostic`] and contributes no
    /// devices.
    pub async fn register_backend(&self, adapter: Arc<dyn BackendAdapter>) -> BackendId {
        let name = adapter.name().to_string();
        let backend = {
            let mut state = self.state.lock();
            let backend = BackendId(state.backends.len());
            state.backends.push(BackendSlot {
                name: name.clone(),
                adapter: Some(Arc::clone(&adapter)),
                status: BackendStatus::Active,
            });
            backend
        };

        let sink = EventSink::new(backend, self.inbound_tx.clone());
        let started = match tokio::time::timeout(self.start_timeout, adapter.start(sink)).await {
            Ok(result) => result,
            Err(_) => Err(HubError::Timeout {
                operation: format!("starting backend '{name}'"),
                after_ms: self.start_timeout.as_millis() as u64,
            }),
        };

        if let Err(err) = started {
            warn!(backend = %name, error = %err, "backend failed to start; it contributes no devices");
            adapter.stop();
            let mut state = self.state.lock();
            if let Some(slot) = state.backends.get_mut(backend.0) {
                slot.status = BackendStatus::Degraded(err.to_string());
                slot.adapter = None;
            }
            state.diagnose(backend, DiagnosticKind::StartupFailed, err.to_string());
            return backend;
        }

        match adapter.list_devices() {
            Ok(ids) => {
                info!(backend = %name, devices = ids.len(), "backend registered");
                for id in ids {
                    self.enqueue(backend, InboundMessage::Change(ChangeEvent::DeviceAdded { id }));
                }
            }
            Err(err) => {
                self.enqueue(
                    backend,
                    InboundMessage::Failure(format!("enumeration failed: {err}")),
                );
            }
        }

        self.process_pending();
        backend
    }

    /// Stop and release a backend, removing its devices through the ordinary
    /// dispatch path.
    pub fn remove_backend(&self, backend: BackendId) -> Result<(), HubError> {
        let (name, adapter) = {
            let mut state = self.state.lock();
            let slot = state.backends.get_mut(backend.0).ok_or_else(|| HubError::Backend {
                backend: backend.to_string(),
                details: "not registered".to_string(),
            })?;
            slot.status = BackendStatus::Removed;
            (slot.name.clone(), slot.adapter.take())
        };
        if let Some(adapter) = adapter {
            adapter.stop();
        }
        info!(backend = %name, "backend removed");
        self.enqueue(backend, InboundMessage::Detached);
        self.process_pending();
        Ok(())
    }

    /// Tear the registry down: drop every listener, stop and release every
    /// adapter and end [`run`][Self::run].  Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _gate = self.gate.lock();
        self.listeners.lock().clear();

        let adapters: Vec<(String, Arc<dyn BackendAdapter>)> = {
            let mut state = self.state.lock();
            state.devices.clear();
            state.order.clear();
            state
                .backends
                .iter_mut()
                .filter_map(|slot| {
                    slot.status = BackendStatus::Removed;
                    slot.adapter.take().map(|a| (slot.name.clone(), a))
                })
                .collect()
        };
        for (name, adapter) in adapters {
            adapter.stop();
            debug!(backend = %name, "backend released");
        }

        self.shutdown.notify_one();
        info!("device registry shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Drain every queued event, dispatching them one at a time.
    ///
    /// Returns the number of events dispatched.  Returns `0` without
    /// dequeuing anything when called from inside a listener (nested
    /// dispatch would interleave two events) or while [`run`][Self::run]
    /// owns the queue.
    pub fn process_pending(&self) -> usize {
        let gate = self.gate.lock();
        if gate.get() {
            return 0;
        }
        let Ok(mut rx) = self.inbound_rx.try_lock() else {
            return 0;
        };
        let _scope = DispatchScope::enter(&gate);

        let mut processed = 0;
        while let Ok(inbound) = rx.try_recv() {
            self.dispatch(inbound);
            processed += 1;
        }
        processed
    }

    /// Dispatch queued events as they arrive until [`shutdown`][Self::shutdown].
    pub async fn run(&self) {
        info!("dispatch loop started");
        while !self.is_closed() {
            let mut rx = self.inbound_rx.lock().await;
            let next = tokio::select! {
                inbound = rx.recv() => inbound,
                _ = self.shutdown.notified() => None,
            };
            let Some(inbound) = next else {
                break;
            };
            {
                let gate = self.gate.lock();
                let _scope = DispatchScope::enter(&gate);
                self.dispatch(inbound);
                while let Ok(more) = rx.try_recv() {
                    self.dispatch(more);
                }
            }
        }
        info!("dispatch loop stopped");
    }

    /// Run `f` while no event is being dispatched by another thread.
    ///
    /// Used to take a snapshot and subscribe atomically.
    pub fn with_dispatch_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = self.gate.lock();
        f()
    }

    fn enqueue(&self, backend: BackendId, message: InboundMessage) {
        // The registry owns a sender, so the queue cannot be closed here.
        let _ = self.inbound_tx.send(Inbound {
            backend,
            received_at: Utc::now(),
            message,
        });
    }

    fn dispatch(&self, inbound: Inbound) {
        if self.is_closed() {
            return;
        }
        let Inbound {
            backend,
            received_at,
            message,
        } = inbound;
        match message {
            InboundMessage::Change(event) => {
                if let Some(event) = self.apply(backend, event) {
                    self.deliver(&event);
                }
            }
            InboundMessage::Failure(reason) => self.degrade(backend, reason, received_at),
            InboundMessage::Detached => self.evict(backend),
        }
    }

    /// Update canonical state.  Returns the event to deliver, or `None` when
    /// it does not change anything (unknown device, inactive backend,
    /// duplicate add).
    fn apply(&self, backend: BackendId, event: ChangeEvent) -> Option<ChangeEvent> {
        match &event {
            ChangeEvent::DeviceAdded { id } => {
                let adapter = {
                    let mut state = self.state.lock();
                    if !state.is_active(backend) {
                        debug!(%backend, device = %id, "add from inactive backend ignored");
                        return None;
                    }
                    if let Some(existing) = state.devices.get(id) {
                        if existing.backend != backend {
                            let owner = state.backend_name(existing.backend);
                            warn!(device = %id, owner = %owner, "device id already owned by another backend");
                            state.diagnose(
                                backend,
                                DiagnosticKind::DuplicateDevice,
                                format!("'{id}' is already provided by '{owner}'"),
                            );
                        }
                        return None;
                    }
                    state.backends[backend.0].adapter.clone()?
                };

                let resolved = adapter
                    .resolve_interfaces(id)
                    .and_then(|caps| adapter.properties(id).map(|props| (caps, props)));
                let (capabilities, properties) = match resolved {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        warn!(backend = %adapter.name(), device = %id, error = %err, "cannot resolve added device");
                        self.state.lock().diagnose(
                            backend,
                            DiagnosticKind::AdapterError,
                            err.to_string(),
                        );
                        return None;
                    }
                };

                let mut state = self.state.lock();
                state.order.push(id.clone());
                state.devices.insert(
                    id.clone(),
                    DeviceRecord {
                        id: id.clone(),
                        backend,
                        capabilities,
                        properties,
                    },
                );
                debug!(backend = %adapter.name(), device = %id, "device added");
            }
            ChangeEvent::DeviceRemoved { id } => {
                let mut state = self.state.lock();
                match state.devices.get(id) {
                    Some(record) if record.backend == backend => {}
                    _ => return None,
                }
                state.remove_device(id);
                debug!(%backend, device = %id, "device removed");
            }
            ChangeEvent::PropertyChanged {
                id,
                changes,
                removed,
            } => {
                let mut state = self.state.lock();
                if !state.is_active(backend) {
                    return None;
                }
                match state.devices.get_mut(id) {
                    Some(record) if record.backend == backend => {
                        for key in removed {
                            record.properties.remove(key);
                        }
                        record
                            .properties
                            .extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    _ => return None,
                }
                debug!(
                    %backend,
                    device = %id,
                    keys = changes.len(),
                    removed = removed.len(),
                    "properties changed"
                );
            }
        }
        Some(event)
    }

    fn deliver(&self, event: &ChangeEvent) {
        let snapshot: Vec<(SubscriptionId, Arc<dyn DeviceListener>)> =
            self.listeners.lock().clone();
        for (subscription, listener) in snapshot {
            // A listener earlier in this round may have unsubscribed it.
            let still_subscribed = self
                .listeners
                .lock()
                .iter()
                .any(|(id, _)| *id == subscription);
            if still_subscribed {
                listener.on_event(self, event);
            }
        }
    }

    fn degrade(&self, backend: BackendId, reason: String, at: DateTime<Utc>) {
        let adapter = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(slot) = state.backends.get_mut(backend.0) else {
                return;
            };
            if slot.status != BackendStatus::Active {
                return;
            }
            slot.status = BackendStatus::Degraded(reason.clone());
            warn!(backend = %slot.name, reason = %reason, "backend degraded");
            state.diagnostics.push(Diagnostic {
                at,
                backend: slot.name.clone(),
                kind: DiagnosticKind::Degraded,
                message: reason,
            });
            slot.adapter.take()
        };
        if let Some(adapter) = adapter {
            adapter.stop();
        }
        self.evict(backend);
    }

    /// Remove every device of `backend`, one synthesized `DeviceRemoved` at
    /// a time.
    fn evict(&self, backend: BackendId) {
        let owned: Vec<DeviceId> = {
            let state = self.state.lock();
            state
                .order
                .iter()
                .filter(|id| state.devices.get(*id).is_some_and(|r| r.backend == backend))
                .cloned()
                .collect()
        };
        for id in owned {
            self.state.lock().remove_device(&id);
            debug!(%backend, device = %id, "device evicted");
            self.deliver(&ChangeEvent::DeviceRemoved { id });
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Register `listener`.  It receives every event dispatched after this
    /// call returns, in subscription order relative to other listeners.
    pub fn subscribe(&self, listener: Arc<dyn DeviceListener>) -> SubscriptionId {
        let _gate = self.gate.lock();
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Remove a listener.  Once this returns the listener receives nothing
    /// more, including the remainder of an event currently being dispatched.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let _gate = self.gate.lock();
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(known, _)| *known != id);
        listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Point-in-time snapshot of the ids of every device accepted by
    /// `filter`, in canonical order.
    pub fn enumerate(&self, filter: impl Fn(&DeviceRecord) -> bool) -> Vec<DeviceId> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.devices.get(id))
            .filter(|record| filter(record))
            .map(|record| record.id.clone())
            .collect()
    }

    /// Run `f` against the canonical record of `id`.
    pub fn inspect<R>(&self, id: &DeviceId, f: impl FnOnce(&DeviceRecord) -> R) -> Option<R> {
        self.state.lock().devices.get(id).map(f)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.state.lock().devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A handle to `id`, or `None` if the registry does not know it.
    pub fn device(&self, id: &DeviceId) -> Option<DeviceHandle> {
        let capabilities = self.inspect(id, |record| record.capabilities.clone())?;
        Some(DeviceHandle::new(id.clone(), capabilities, self.self_ref.clone()))
    }

    /// Canonical value of one property.
    pub fn property(&self, id: &DeviceId, key: &str) -> Result<PropertyValue, HubError> {
        let state = self.state.lock();
        let record = state
            .devices
            .get(id)
            .ok_or_else(|| HubError::DeviceNotFound(id.clone()))?;
        record
            .properties
            .get(key)
            .cloned()
            .ok_or_else(|| HubError::PropertyNotFound {
                device: id.clone(),
                key: key.to_string(),
            })
    }

    /// Forward a property write to the backend owning `id`.
    ///
    /// The new value becomes visible once the backend reports the change.
    pub fn set_property(
        &self,
        id: &DeviceId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), HubError> {
        let adapter = {
            let state = self.state.lock();
            let record = state
                .devices
                .get(id)
                .ok_or_else(|| HubError::DeviceNotFound(id.clone()))?;
            state
                .backends
                .get(record.backend.0)
                .and_then(|slot| slot.adapter.clone())
                .ok_or_else(|| HubError::DeviceNotFound(id.clone()))?
        };
        adapter.set_property(id, key, value)
    }

    pub fn backend_status(&self, backend: BackendId) -> Option<BackendStatus> {
        self.state
            .lock()
            .backends
            .get(backend.0)
            .map(|slot| slot.status.clone())
    }

    /// Every registered backend with its name and status, in registration
    /// order.
    pub fn backends(&self) -> Vec<(BackendId, String, BackendStatus)> {
        self.state
            .lock()
            .backends
            .iter()
            .enumerate()
            .map(|(i, slot)| (BackendId(i), slot.name.clone(), slot.status.clone()))
            .collect()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.state.lock().diagnostics.clone()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
