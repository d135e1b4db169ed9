//! `hwhub-model` – index-addressable consumer views.
//!
//! [`ListProjection`] mirrors the result order of a live query and announces
//! every structural change with bracketed begin/end notifications, the shape
//! list widgets and table models expect.

pub mod projection;

pub use projection::{DEVICE_ROLE, ListProjection, ObserverId, ProjectionEvent, Slot};
