//! `hwhub-query` – predicate-filtered live views over the device registry.
//!
//! # Modules
//!
//! - [`predicate`] – the query language: [`Predicate::parse`] and
//!   [`Predicate::matches`].
//! - [`live_query`] – [`LiveQuery`]: an incrementally maintained result set
//!   with per-subscriber change notification.
//! - [`cache`] – [`QueryCache`]: one shared live query per distinct query
//!   string, released when the last [`QueryHandle`] drops.
//!
//! ```no_run
//! # async fn demo(registry: std::sync::Arc<hwhub_registry::DeviceRegistry>) {
//! use hwhub_query::{QueryCache, QueryEvent};
//!
//! let cache = QueryCache::new(registry);
//! let batteries = cache.for_query("Battery");
//! let _sub = batteries.subscribe(|event| {
//!     if let QueryEvent::DeviceAdded(device) = event {
//!         println!("new battery {}", device.id());
//!     }
//! });
//! # }
//! ```

pub mod cache;
pub mod live_query;
pub mod predicate;

pub use cache::{QueryCache, QueryHandle};
pub use live_query::{LiveQuery, QueryEvent, QuerySubscription};
pub use predicate::{Comparison, ParseError, Predicate};
