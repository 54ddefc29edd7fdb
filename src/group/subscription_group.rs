//! A set of subscriptions multiplexed on one push connection.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::state::{ConnectionState, LinkState, ReconnectPolicy};
use crate::backend::{
    Connection, ConnectionEvents, ConnectionFactory, ConnectionSpec, SubscribeRequest,
    SubscriptionBackend,
};
use crate::error::{BackendError, ListenerError, Result};
use crate::router::{ListenerFault, NotificationRouter};
use crate::types::{
    BackendSubscription, Credential, EndpointKey, Event, EventKind, FolderRef, Identity,
    ProtocolVersion, SubscriptionId, Timestamp,
};

/// Settings and collaborators shared by every group of one listener.
pub struct GroupContext {
    pub credential: Credential,
    pub version: ProtocolVersion,
    pub connection_lifetime: Duration,
    pub reconnect: ReconnectPolicy,
    pub subscriptions: Arc<dyn SubscriptionBackend>,
    pub router: Arc<NotificationRouter>,
}

/// One user's subscription as held by its group.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub identity: Identity,
    pub folders: Vec<FolderRef>,
    pub event_kinds: Vec<EventKind>,
    pub handle: BackendSubscription,
    pub created: Timestamp,
}

struct GroupState {
    /// `None` once the group is retired.
    connection: Option<Box<dyn Connection>>,
    link: LinkState,
    members: HashMap<Identity, Subscription>,
}

impl GroupState {
    fn connection_mut(&mut self) -> std::result::Result<&mut Box<dyn Connection>, BackendError> {
        self.connection
            .as_mut()
            .ok_or_else(|| BackendError::Other("connection released".to_string()))
    }

    fn physically_open(&self) -> bool {
        self.connection.as_ref().map_or(false, |c| c.is_open())
    }
}

/// Subscriptions that share one endpoint, and the connection serving them.
///
/// Membership only changes while the connection is closed, and every Add or
/// Remove leaves the connection open iff members remain. All transitions
/// happen under the group's own lock; groups never block each other.
pub struct SubscriptionGroup {
    endpoint: EndpointKey,
    context: Arc<GroupContext>,
    /// Lock-free copy of `LinkState::close_is_controlled`, written only with
    /// `state` held. Lets the disconnect path defer without locking, which
    /// matters when a connection raises the event from inside `close()`.
    controlled: AtomicBool,
    /// Set by every disconnect the handler sees; consumed when a controlled
    /// transition ends so a drop that landed inside it still gets repaired.
    disconnect_pending: AtomicBool,
    state: Mutex<GroupState>,
}

impl SubscriptionGroup {
    /// Create a group and its (closed) connection for `endpoint`.
    pub fn new(
        endpoint: EndpointKey,
        connections: &dyn ConnectionFactory,
        context: Arc<GroupContext>,
    ) -> Result<Arc<Self>> {
        let mut failure = None;

        let group = Arc::new_cyclic(|weak: &Weak<SubscriptionGroup>| {
            let events: Arc<dyn ConnectionEvents> = Arc::new(GroupEvents {
                group: weak.clone(),
                endpoint: endpoint.clone(),
                router: Arc::clone(&context.router),
            });
            let spec = ConnectionSpec {
                endpoint: &endpoint,
                credential: &context.credential,
                version: context.version,
                lifetime: context.connection_lifetime,
            };
            let connection = match connections.create(spec, events) {
                Ok(connection) => Some(connection),
                Err(e) => {
                    failure = Some(e);
                    None
                }
            };

            SubscriptionGroup {
                endpoint: endpoint.clone(),
                context: Arc::clone(&context),
                controlled: AtomicBool::new(false),
                disconnect_pending: AtomicBool::new(false),
                state: Mutex::new(GroupState {
                    connection,
                    link: LinkState::new(),
                    members: HashMap::new(),
                }),
            }
        });

        if let Some(source) = failure {
            return Err(ListenerError::Connection { endpoint, source });
        }

        info!(endpoint = %group.endpoint, "created subscription group");
        Ok(group)
    }

    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    // --- Membership ---

    /// Subscribe `identity` and put it on this group's connection.
    ///
    /// On failure the group is back to its previous membership with its
    /// connection open iff members remain.
    pub fn add(
        &self,
        identity: Identity,
        folders: Vec<FolderRef>,
        event_kinds: Vec<EventKind>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if state.link.retired {
            return Err(ListenerError::GroupRetired(self.endpoint.clone()));
        }
        if state.members.contains_key(&identity) {
            return Err(ListenerError::DuplicateIdentity(identity));
        }

        self.begin_controlled(&mut state);
        let result = self.add_locked(&mut state, identity, folders, event_kinds);
        let dropped = self.end_controlled(&mut state);
        drop(state);

        if dropped {
            self.repair(None);
        }
        result
    }

    fn add_locked(
        &self,
        state: &mut GroupState,
        identity: Identity,
        folders: Vec<FolderRef>,
        event_kinds: Vec<EventKind>,
    ) -> Result<()> {
        self.close_locked(state).map_err(|source| self.connection_error(source))?;

        let request = SubscribeRequest {
            endpoint: &self.endpoint,
            credential: &self.context.credential,
            version: self.context.version,
            impersonate: &identity,
            folders: &folders,
            event_kinds: &event_kinds,
        };
        let handle = match self.context.subscriptions.subscribe(&request) {
            Ok(handle) => handle,
            Err(source) => {
                self.restore_locked(state);
                return Err(ListenerError::SubscriptionCreation { identity, source });
            }
        };

        if let Err(source) = state.connection_mut().and_then(|c| c.add_member(&handle)) {
            self.restore_locked(state);
            return Err(self.connection_error(source));
        }

        self.context
            .router
            .register(handle.id.clone(), identity.clone());
        state.members.insert(
            identity.clone(),
            Subscription {
                identity: identity.clone(),
                folders,
                event_kinds,
                handle: handle.clone(),
                created: Timestamp::now(),
            },
        );

        if let Err(source) = self.open_locked(state) {
            // Undo the addition so the connection only carries prior members.
            state.members.remove(&identity);
            self.context.router.unregister(&handle.id);
            if let Err(e) = state.connection_mut().and_then(|c| c.remove_member(&handle.id)) {
                warn!(endpoint = %self.endpoint, %identity, error = %e, "rollback could not detach subscription");
            }
            self.restore_locked(state);
            return Err(self.connection_error(source));
        }

        debug!(endpoint = %self.endpoint, %identity, members = state.members.len(), "subscription added, listening");
        Ok(())
    }

    /// Drop `identity` from the group. Returns false if it is not a member.
    ///
    /// Connection failures along the way are reported as faults; the member
    /// is removed regardless.
    pub fn remove(&self, identity: &Identity) -> bool {
        let mut state = self.state.lock();

        let handle = match state.members.get(identity) {
            Some(subscription) => subscription.handle.id.clone(),
            None => return false,
        };

        self.begin_controlled(&mut state);

        if let Err(e) = self.close_locked(&mut state) {
            self.report_connection_fault(Some(identity), e);
        }
        if let Err(e) = state.connection_mut().and_then(|c| c.remove_member(&handle)) {
            self.report_connection_fault(Some(identity), e);
        }
        state.members.remove(identity);
        self.context.router.unregister(&handle);

        if !state.members.is_empty() {
            if let Err(e) = self.open_locked(&mut state) {
                self.report_connection_fault(Some(identity), e);
            }
        }

        let dropped = self.end_controlled(&mut state);
        debug!(endpoint = %self.endpoint, %identity, members = state.members.len(), "subscription removed");
        drop(state);

        if dropped {
            self.repair(None);
        }
        true
    }

    /// Close and release the connection and forget every member.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        self.seal_locked(&mut state);
        self.release_locked(&mut state);
    }

    /// Dispose the group if it has no members. Returns whether it is retired.
    pub fn retire_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if !state.link.retired && !state.members.is_empty() {
            return false;
        }
        self.seal_locked(&mut state);
        self.release_locked(&mut state);
        true
    }

    /// Mark an empty group retired without touching its connection, so no
    /// Add can land on it. Returns whether it is retired.
    ///
    /// The caller releases the connection later with [`Self::dispose`].
    pub(crate) fn seal_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if !state.link.retired && !state.members.is_empty() {
            return false;
        }
        self.seal_locked(&mut state);
        true
    }

    fn seal_locked(&self, state: &mut GroupState) {
        // Stays controlled for good: late disconnects must not revive it.
        self.begin_controlled(state);
        state.link.retired = true;
    }

    fn release_locked(&self, state: &mut GroupState) {
        if state.connection.is_none() {
            return;
        }

        if let Err(e) = self.close_locked(state) {
            self.report_connection_fault(None, e);
        }
        for subscription in state.members.values() {
            self.context.router.unregister(&subscription.handle.id);
        }
        state.members.clear();
        state.connection = None;

        info!(endpoint = %self.endpoint, "subscription group retired");
    }

    // --- Queries ---

    pub fn contains(&self, identity: &Identity) -> bool {
        self.state.lock().members.contains_key(identity)
    }

    pub fn members(&self) -> Vec<Identity> {
        let mut members: Vec<Identity> = self.state.lock().members.keys().cloned().collect();
        members.sort();
        members
    }

    pub fn subscription(&self, identity: &Identity) -> Option<Subscription> {
        self.state.lock().members.get(identity).cloned()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().members.is_empty()
    }

    /// Whether the connection reports itself open right now.
    pub fn is_open(&self) -> bool {
        self.state.lock().physically_open()
    }

    /// The state the group last put its connection in.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().link.connection
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().link.retired
    }

    // --- Connection transitions (group lock held) ---

    fn begin_controlled(&self, state: &mut GroupState) {
        state.link.close_is_controlled = true;
        self.controlled.store(true, Ordering::SeqCst);
    }

    /// Leave a controlled transition. Returns whether a disconnect was seen
    /// while it ran; the caller must repair once the lock is released.
    fn end_controlled(&self, state: &mut GroupState) -> bool {
        if state.link.retired {
            return false;
        }
        state.link.close_is_controlled = false;
        self.controlled.store(false, Ordering::SeqCst);
        self.disconnect_pending.swap(false, Ordering::SeqCst)
    }

    fn close_locked(&self, state: &mut GroupState) -> std::result::Result<(), BackendError> {
        if state.physically_open() {
            state.connection_mut()?.close()?;
        }
        state.link.connection = ConnectionState::Closed;
        Ok(())
    }

    fn open_locked(&self, state: &mut GroupState) -> std::result::Result<(), BackendError> {
        if !state.physically_open() {
            state.connection_mut()?.open()?;
        }
        state.link.connection = ConnectionState::Open;
        Ok(())
    }

    /// Reopen after an aborted mutation if the (unchanged) membership needs it.
    fn restore_locked(&self, state: &mut GroupState) {
        if state.members.is_empty() {
            return;
        }
        if let Err(e) = self.open_locked(state) {
            self.report_connection_fault(None, e);
        }
    }

    fn connection_error(&self, source: BackendError) -> ListenerError {
        ListenerError::Connection {
            endpoint: self.endpoint.clone(),
            source,
        }
    }

    fn report_connection_fault(&self, identity: Option<&Identity>, error: BackendError) {
        self.context.router.report(ListenerFault::ConnectionFault {
            endpoint: self.endpoint.clone(),
            identity: identity.cloned(),
            error: error.to_string(),
        });
    }

    // --- Connection events ---

    /// Reopen after a disconnect the group did not ask for.
    fn handle_disconnect(&self, cause: Option<BackendError>) {
        // Flag first: a transition that ends after the check below still sees it.
        self.disconnect_pending.store(true, Ordering::SeqCst);
        if self.controlled.load(Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, "disconnect during controlled transition, deferred");
            return;
        }
        self.repair(cause);
    }

    /// Reopen the connection if the group wants it open and it is down.
    fn repair(&self, cause: Option<BackendError>) {
        let policy = &self.context.reconnect;
        let mut backoff = policy.initial_backoff;
        let mut attempts = 0;

        loop {
            let error = {
                let mut state = self.state.lock();
                // Whatever was pending is judged by the check below.
                self.disconnect_pending.store(false, Ordering::SeqCst);
                let has_members = !state.members.is_empty();
                if !state.link.should_reopen(has_members, state.physically_open()) {
                    return;
                }

                attempts += 1;
                info!(endpoint = %self.endpoint, attempt = attempts, cause = ?cause, "restoring connection");

                // The reopen is itself a controlled transition.
                self.begin_controlled(&mut state);
                let mut result = state.connection_mut().and_then(|c| c.open());
                let dropped = self.end_controlled(&mut state);
                if result.is_ok() && dropped && !state.physically_open() {
                    result = Err(BackendError::Transport("dropped while reopening".to_string()));
                }

                match result {
                    Ok(()) => return,
                    Err(e) if !policy.allows_retry(attempts) => {
                        state.link.connection = ConnectionState::Closed;
                        e
                    }
                    Err(e) => {
                        warn!(endpoint = %self.endpoint, attempt = attempts, error = %e, "reopen failed, retrying");
                        drop(state);
                        std::thread::sleep(backoff);
                        backoff = policy.next_backoff(backoff);
                        continue;
                    }
                }
            };

            self.context.router.report(ListenerFault::ReconnectFailed {
                endpoint: self.endpoint.clone(),
                attempts,
                error: error.to_string(),
            });
            return;
        }
    }

    fn handle_subscription_error(&self, subscription: Option<&SubscriptionId>, error: BackendError) {
        let identity = subscription.and_then(|id| self.context.router.sender_of(id));
        self.context.router.report(ListenerFault::SubscriptionError {
            identity,
            subscription: subscription.cloned(),
            endpoint: self.endpoint.clone(),
            error: error.to_string(),
        });
    }
}

/// The event sink handed to a group's connection.
struct GroupEvents {
    group: Weak<SubscriptionGroup>,
    endpoint: EndpointKey,
    router: Arc<NotificationRouter>,
}

impl ConnectionEvents for GroupEvents {
    fn on_notification(&self, subscription: &SubscriptionId, events: Vec<Event>) {
        self.router.route(subscription, events);
    }

    fn on_disconnect(&self, cause: Option<BackendError>) {
        match self.group.upgrade() {
            Some(group) => group.handle_disconnect(cause),
            None => debug!(endpoint = %self.endpoint, "disconnect for dropped group"),
        }
    }

    fn on_subscription_error(&self, subscription: Option<&SubscriptionId>, error: BackendError) {
        match self.group.upgrade() {
            Some(group) => group.handle_subscription_error(subscription, error),
            None => debug!(endpoint = %self.endpoint, %error, "subscription error for dropped group"),
        }
    }
}
