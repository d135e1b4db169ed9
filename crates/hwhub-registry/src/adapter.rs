//! The backend adapter contract.
//!
//! The registry never speaks to a device daemon, a sysfs tree or a mount
//! table directly.  Each data source is wrapped in a [`BackendAdapter`] that
//! answers point-in-time questions from its own cache and pushes canonical
//! [`ChangeEvent`]s into the registry through an [`EventSink`].
//!
//! # Contract
//!
//! * Reads (`list_devices`, `resolve_interfaces`, `properties`, `property`)
//!   are called on the dispatch path and must not block on I/O.  Adapters that
//!   talk to external services refresh their cache from their own tasks and
//!   bound every wait.
//! * Every value returned or emitted is already normalized to the canonical
//!   domains of `hwhub-types`; native vocabularies stay inside the adapter.
//! * Resources (tasks, watches, connections) are acquired in `start` and
//!   released in `stop`.  `stop` must be idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hwhub_types::{CapabilitySet, ChangeEvent, DeviceId, HubError, PropertyMap, PropertyValue};
use tokio::sync::mpsc;

use crate::registry::BackendId;

/// Every device data source must implement this trait.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short, stable backend name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Acquire resources and begin reporting changes through `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError`] when the transport or watch cannot be opened.  The
    /// registry then treats the backend as contributing no devices.
    async fn start(&self, sink: EventSink) -> Result<(), HubError>;

    /// Release everything acquired in [`start`][Self::start].
    fn stop(&self) {}

    /// Identifiers of every device currently known to this backend.
    fn list_devices(&self) -> Result<Vec<DeviceId>, HubError>;

    /// Capability interfaces implemented by `id`.
    fn resolve_interfaces(&self, id: &DeviceId) -> Result<CapabilitySet, HubError>;

    /// All normalized properties of `id`.
    fn properties(&self, id: &DeviceId) -> Result<PropertyMap, HubError>;

    /// A single normalized property of `id`.
    fn property(&self, id: &DeviceId, key: &str) -> Result<PropertyValue, HubError> {
        self.properties(id)?
            .remove(key)
            .ok_or_else(|| HubError::PropertyNotFound {
                device: id.clone(),
                key: key.to_string(),
            })
    }

    /// Write a property.  Backends without write support keep the default,
    /// which answers [`HubError::Unsupported`].
    fn set_property(
        &self,
        _id: &DeviceId,
        key: &str,
        _value: PropertyValue,
    ) -> Result<(), HubError> {
        Err(HubError::Unsupported(format!(
            "backend '{}' cannot write '{key}'",
            self.name()
        )))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inbound queue
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum InboundMessage {
    Change(ChangeEvent),
    Failure(String),
    /// The backend was removed; evict its devices.
    Detached,
}

#[derive(Debug)]
pub(crate) struct Inbound {
    pub(crate) backend: BackendId,
    pub(crate) received_at: DateTime<Utc>,
    pub(crate) message: InboundMessage,
}

/// Write end of the registry's inbound queue, bound to one backend.
///
/// Cheap to clone and usable from any thread, including file-watch callbacks
/// that run outside the async runtime.
#[derive(Clone, Debug)]
pub struct EventSink {
    backend: BackendId,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl EventSink {
    pub(crate) fn new(backend: BackendId, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { backend, tx }
    }

    /// The backend this sink reports for.
    pub fn backend(&self) -> BackendId {
        self.backend
    }

    /// Queue a canonical change event for dispatch.
    ///
    /// Returns [`HubError::Backend`] once the registry has been dropped.
    pub fn emit(&self, event: ChangeEvent) -> Result<(), HubError> {
        self.send(InboundMessage::Change(event))
    }

    /// Report that the underlying source failed or disconnected.  The
    /// registry marks the backend degraded and removes its devices.
    pub fn report_failure(&self, reason: impl Into<String>) -> Result<(), HubError> {
        self.send(InboundMessage::Failure(reason.into()))
    }

    fn send(&self, message: InboundMessage) -> Result<(), HubError> {
        self.tx
            .send(Inbound {
                backend: self.backend,
                received_at: Utc::now(),
                message,
            })
            .map_err(|_| HubError::Backend {
                backend: self.backend.to_string(),
                details: "registry is gone".to_string(),
            })
    }
}
