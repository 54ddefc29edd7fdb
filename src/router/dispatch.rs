//! Routing of raw connection callbacks to the caller.

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::types::{FaultReceiver, ListenerFault, NotificationBatch, NotificationCallback};
use crate::types::{Event, Identity, SubscriptionId};

/// Sending end of the fault channel. Drops faults when the buffer is full.
#[derive(Clone)]
pub struct FaultReporter {
    sender: Sender<ListenerFault>,
}

impl FaultReporter {
    /// Create a bounded fault channel.
    pub fn channel(capacity: usize) -> (Self, FaultReceiver) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender }, FaultReceiver { receiver })
    }

    /// Report a fault. Returns false if it could not be buffered.
    pub fn report(&self, fault: ListenerFault) -> bool {
        warn!(endpoint = %fault.endpoint(), ?fault, "listener fault");
        match self.sender.try_send(fault) {
            Ok(()) => true,
            Err(TrySendError::Full(fault)) => {
                warn!(?fault, "fault channel full, dropping fault");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Attaches sender identity to raw notifications and forwards them.
///
/// Connections report notifications by backend subscription id only; the
/// router keeps the id -> identity index the groups maintain as members come
/// and go. The index has its own lock so routing never waits on a group that
/// is busy reconnecting.
pub struct NotificationRouter {
    senders: RwLock<HashMap<SubscriptionId, Identity>>,
    callback: NotificationCallback,
    faults: FaultReporter,
}

impl NotificationRouter {
    pub fn new(callback: NotificationCallback, faults: FaultReporter) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            callback,
            faults,
        }
    }

    /// Start attributing notifications for `subscription` to `identity`.
    pub fn register(&self, subscription: SubscriptionId, identity: Identity) {
        self.senders.write().insert(subscription, identity);
    }

    /// Stop routing for `subscription`.
    pub fn unregister(&self, subscription: &SubscriptionId) -> Option<Identity> {
        self.senders.write().remove(subscription)
    }

    /// Identity a subscription belongs to, if still registered.
    pub fn sender_of(&self, subscription: &SubscriptionId) -> Option<Identity> {
        self.senders.read().get(subscription).cloned()
    }

    /// Number of subscriptions currently routed.
    pub fn route_count(&self) -> usize {
        self.senders.read().len()
    }

    /// Forward a batch to the callback. Returns false if it was dropped.
    ///
    /// Batches for unknown subscriptions (already removed) and empty batches
    /// are dropped.
    pub fn route(&self, subscription: &SubscriptionId, events: Vec<Event>) -> bool {
        if events.is_empty() {
            return false;
        }

        let sender = match self.sender_of(subscription) {
            Some(sender) => sender,
            None => {
                debug!(%subscription, count = events.len(), "dropping notification for unknown subscription");
                return false;
            }
        };

        debug!(%sender, count = events.len(), "routing notification batch");
        (self.callback)(NotificationBatch { sender, events });
        true
    }

    /// Forward a fault to the caller's fault channel.
    pub fn report(&self, fault: ListenerFault) -> bool {
        self.faults.report(fault)
    }
}
