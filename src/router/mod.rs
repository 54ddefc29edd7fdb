//! Delivery of notifications and faults to the caller.
//!
//! Every connection reports notification batches keyed only by the backend
//! subscription id. The [`NotificationRouter`] turns them into
//! [`NotificationBatch`]es that carry the sending identity and forwards them
//! to the one callback registered with the listener. Faults that cannot be
//! recovered internally go to a separate bounded channel.

mod dispatch;
mod types;

pub use dispatch::{FaultReporter, NotificationRouter};
pub use types::{FaultReceiver, ListenerFault, NotificationBatch, NotificationCallback};
