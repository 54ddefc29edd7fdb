//! Error types for the listener and its collaborators.

use crate::types::{EndpointKey, FolderRef, Identity, ProtocolVersion};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by an external collaborator (resolver, connection, backend).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rejected by backend: {0}")]
    Rejected(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Main error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("Protocol version {0:?} does not support push subscriptions")]
    UnsupportedVersion(ProtocolVersion),

    #[error("Could not resolve endpoint for {identity}: {source}")]
    Resolution {
        identity: Identity,
        #[source]
        source: BackendError,
    },

    #[error("Backend rejected subscription for {identity}: {source}")]
    SubscriptionCreation {
        identity: Identity,
        #[source]
        source: BackendError,
    },

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Identity already subscribed: {0}")]
    DuplicateIdentity(Identity),

    #[error("Connection to {endpoint} failed: {source}")]
    Connection {
        endpoint: EndpointKey,
        #[source]
        source: BackendError,
    },

    #[error("Subscription group for {0} was retired")]
    GroupRetired(EndpointKey),

    #[error("Listener has been disposed")]
    Disposed,

    #[error("Sync of folder {folder} failed: {source}")]
    Sync {
        folder: FolderRef,
        #[source]
        source: BackendError,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for listener operations.
pub type Result<T> = std::result::Result<T, ListenerError>;
