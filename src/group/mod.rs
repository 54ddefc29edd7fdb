//! Subscription groups: many users' subscriptions on one push connection.
//!
//! The backend refuses membership changes on an open connection, so every
//! change runs as a close, mutate, reopen sequence under the group lock:
//!
//! ```text
//!   Open ──(Add/Remove: controlled close)──► Closed ──mutate──► Open (if members)
//!     │                                                           ▲
//!     └──(unexpected disconnect)──► handler ──reopen──────────────┘
//! ```
//!
//! A disconnect raised while an Add/Remove holds the group is deferred: once
//! the transition ends, the group reopens if members remain and the channel
//! is down.

mod subscription_group;
mod state;

pub use subscription_group::{GroupContext, Subscription, SubscriptionGroup};
pub use state::{ConnectionState, ReconnectPolicy};
