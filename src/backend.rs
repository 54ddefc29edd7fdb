//! Interfaces of the external collaborators the listener orchestrates.
//!
//! Endpoint discovery, subscription creation and the push channel itself are
//! provided by a client library; this crate only drives them. Implementations
//! are expected to bound their own blocking (open/close/subscribe should time
//! out with [`BackendError::Timeout`] rather than hang).

use crate::error::BackendError;
use crate::types::{
    BackendSubscription, Credential, EndpointKey, Event, EventKind, FolderRef, Identity,
    ProtocolVersion, SubscriptionId,
};
use std::sync::Arc;
use std::time::Duration;

/// Maps a user identity to the endpoint that must serve it.
pub trait EndpointResolver: Send + Sync {
    /// May involve a remote round trip.
    fn resolve(&self, identity: &Identity) -> Result<EndpointKey, BackendError>;
}

impl<F> EndpointResolver for F
where
    F: Fn(&Identity) -> Result<EndpointKey, BackendError> + Send + Sync,
{
    fn resolve(&self, identity: &Identity) -> Result<EndpointKey, BackendError> {
        self(identity)
    }
}

/// Parameters for a new push connection.
#[derive(Clone, Debug)]
pub struct ConnectionSpec<'a> {
    pub endpoint: &'a EndpointKey,
    pub credential: &'a Credential,
    pub version: ProtocolVersion,
    /// How long the backend keeps one open session alive before it disconnects.
    pub lifetime: Duration,
}

/// Creates push connections bound to a single endpoint.
pub trait ConnectionFactory: Send + Sync {
    /// `events` must receive every notification, disconnect and subscription
    /// error the connection observes, from whatever thread the transport uses.
    fn create(
        &self,
        spec: ConnectionSpec<'_>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Box<dyn Connection>, BackendError>;
}

/// A single physical push channel.
///
/// Membership may only change while the connection is closed. Dropping the
/// connection releases it.
pub trait Connection: Send {
    fn open(&mut self) -> Result<(), BackendError>;

    fn close(&mut self) -> Result<(), BackendError>;

    fn is_open(&self) -> bool;

    fn add_member(&mut self, subscription: &BackendSubscription) -> Result<(), BackendError>;

    fn remove_member(&mut self, subscription: &SubscriptionId) -> Result<(), BackendError>;
}

/// Sink for the asynchronous events a [`Connection`] raises.
pub trait ConnectionEvents: Send + Sync {
    /// A batch of events for one member subscription, in backend order.
    fn on_notification(&self, subscription: &SubscriptionId, events: Vec<Event>);

    /// The channel went down. `cause` is `None` when the session simply expired.
    fn on_disconnect(&self, cause: Option<BackendError>);

    /// The backend reported a fault on a member subscription (or on the
    /// connection as a whole when `subscription` is `None`).
    fn on_subscription_error(&self, subscription: Option<&SubscriptionId>, error: BackendError);
}

/// Everything the backend needs to create one user's subscription.
#[derive(Clone, Debug)]
pub struct SubscribeRequest<'a> {
    pub endpoint: &'a EndpointKey,
    pub credential: &'a Credential,
    pub version: ProtocolVersion,
    /// The subscription is created while impersonating this user.
    pub impersonate: &'a Identity,
    pub folders: &'a [FolderRef],
    pub event_kinds: &'a [EventKind],
}

/// Creates backend subscriptions.
pub trait SubscriptionBackend: Send + Sync {
    fn subscribe(&self, request: &SubscribeRequest<'_>)
        -> Result<BackendSubscription, BackendError>;
}

/// The collaborators a [`Listener`](crate::Listener) is wired to.
#[derive(Clone)]
pub struct Backend {
    pub resolver: Arc<dyn EndpointResolver>,
    pub connections: Arc<dyn ConnectionFactory>,
    pub subscriptions: Arc<dyn SubscriptionBackend>,
}

impl Backend {
    pub fn new(
        resolver: Arc<dyn EndpointResolver>,
        connections: Arc<dyn ConnectionFactory>,
        subscriptions: Arc<dyn SubscriptionBackend>,
    ) -> Self {
        Self {
            resolver,
            connections,
            subscriptions,
        }
    }
}
