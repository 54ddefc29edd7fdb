//! Payloads delivered to the caller: notification batches and faults.

use crate::types::{EndpointKey, Event, Identity, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Events for one user, in the order the connection reported them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub sender: Identity,
    pub events: Vec<Event>,
}

/// The single callback every group's notifications are forwarded to.
pub type NotificationCallback = Arc<dyn Fn(NotificationBatch) + Send + Sync>;

/// Asynchronous faults that could not be handled internally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerFault {
    /// The backend reported a fault on an existing subscription.
    /// The subscription is kept; the caller decides whether to remove it.
    SubscriptionError {
        identity: Option<Identity>,
        subscription: Option<SubscriptionId>,
        endpoint: EndpointKey,
        error: String,
    },

    /// Reopening after an unexpected disconnect failed.
    ReconnectFailed {
        endpoint: EndpointKey,
        attempts: u32,
        error: String,
    },

    /// A close, member removal or reopen failed while tearing down.
    ConnectionFault {
        endpoint: EndpointKey,
        identity: Option<Identity>,
        error: String,
    },
}

impl ListenerFault {
    /// Endpoint the fault happened on.
    pub fn endpoint(&self) -> &EndpointKey {
        match self {
            ListenerFault::SubscriptionError { endpoint, .. } => endpoint,
            ListenerFault::ReconnectFailed { endpoint, .. } => endpoint,
            ListenerFault::ConnectionFault { endpoint, .. } => endpoint,
        }
    }
}

/// Receiving end of the fault channel.
#[derive(Clone)]
pub struct FaultReceiver {
    pub(crate) receiver: crossbeam_channel::Receiver<ListenerFault>,
}

impl FaultReceiver {
    /// Receive the next fault (blocking).
    pub fn recv(&self) -> Result<ListenerFault, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a fault (non-blocking).
    pub fn try_recv(&self) -> Result<ListenerFault, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ListenerFault, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Faults currently buffered.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
