//! # Push Subscription Multiplexer
//!
//! Subscribes many users to server-pushed notifications from a multi-tenant
//! backend while keeping the number of physical push connections small.
//!
//! ## Core Concepts
//!
//! - **Endpoint key**: grouping key plus endpoint URL; users with equal keys
//!   must share a connection
//! - **Subscription group**: one connection and the subscriptions multiplexed
//!   on it; membership changes run as close, mutate, reopen
//! - **Listener**: registry of groups; creates them on demand and retires
//!   them when they empty
//! - **Router**: turns raw connection callbacks into notification batches
//!   that name their sender
//!
//! Discovery, subscription creation and the push channel are provided by the
//! caller through the traits in [`backend`].
//!
//! ## Example
//!
//! ```ignore
//! use pushmux::{Backend, Credential, EventKind, Listener, WellKnownFolder};
//!
//! let listener = Listener::new(
//!     Credential::new("svc@contoso.com", "secret"),
//!     Backend::new(resolver, connections, subscriptions),
//!     |batch| println!("{} got {} events", batch.sender, batch.events.len()),
//! );
//!
//! listener.add_default_subscription("alice@contoso.com")?;
//! listener.add_subscription(
//!     "bob@contoso.com",
//!     [WellKnownFolder::Contacts.into()],
//!     [EventKind::Created],
//! )?;
//!
//! // Unexpected disconnects are repaired in the background; anything that
//! // cannot be repaired shows up here.
//! while let Ok(fault) = listener.faults().try_recv() {
//!     eprintln!("{:?}", fault);
//! }
//! ```

pub mod backend;
pub mod error;
pub mod group;
pub mod listener;
pub mod router;
pub mod sync;
pub mod types;

// Re-exports
pub use backend::{
    Backend, Connection, ConnectionEvents, ConnectionFactory, ConnectionSpec, EndpointResolver,
    SubscribeRequest, SubscriptionBackend,
};
pub use error::{BackendError, ListenerError, Result};
pub use group::{ConnectionState, ReconnectPolicy, Subscription, SubscriptionGroup};
pub use listener::{Listener, ListenerConfig};
pub use router::{FaultReceiver, ListenerFault, NotificationBatch, NotificationRouter};
pub use sync::{
    ChangeKind, FolderChanges, FolderSyncBackend, FolderSyncState, ItemChange, SyncChangesResult,
    SyncPage, SyncRequest,
};
pub use types::*;
