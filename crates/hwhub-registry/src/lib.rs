//! `hwhub-registry` – the dispatch hub.
//!
//! Aggregates every registered backend into one canonical device set and
//! funnels all backend-originated changes through a single dispatch path.
//!
//! # Modules
//!
//! - [`adapter`] – [`BackendAdapter`][adapter::BackendAdapter]: the contract
//!   every device data source implements, and the [`EventSink`][adapter::EventSink]
//!   it reports changes through.
//! - [`registry`] – [`DeviceRegistry`][registry::DeviceRegistry]: canonical
//!   device/property state, listener registration and ordered dispatch.
//! - [`handle`] – [`DeviceHandle`][handle::DeviceHandle]: a cheap reference to
//!   a registry device that resolves capability interfaces on demand.
//! - [`interfaces`] – typed read views, one per
//!   [`Capability`][hwhub_types::Capability].

pub mod adapter;
pub mod handle;
pub mod interfaces;
pub mod registry;

pub use adapter::{BackendAdapter, EventSink};
pub use handle::DeviceHandle;
pub use interfaces::InterfaceHandle;
pub use registry::{
    BackendId, BackendStatus, DeviceListener, DeviceRecord, DeviceRegistry, DeviceView,
    Diagnostic, DiagnosticKind, SubscriptionId,
};
