//! `hwhub-backends` – concrete [`BackendAdapter`][hwhub_registry::BackendAdapter]
//! implementations.
//!
//! # Modules
//!
//! - [`fakehw`] – in-memory conformance fixture with synthetic event
//!   injection.  Devices are described in code or in a TOML fixture.
//! - [`power_supply`] – batteries and AC adapters from the Linux
//!   `power_supply` class directory, refreshed by a polling task.
//! - [`mtab`] – mount points from `fstab`/`mtab`, refreshed by file-system
//!   notifications.
//!
//! Each backend prefixes its device identifiers with its own UDI root so
//! identifiers stay unique across the registry.

pub mod fakehw;
pub mod mtab;
pub mod power_supply;
mod snapshot;

pub use fakehw::{FakeBackend, FakeDevice};
pub use mtab::{MountTableBackend, MountTableConfig};
pub use power_supply::{PowerSupplyBackend, PowerSupplyConfig};
