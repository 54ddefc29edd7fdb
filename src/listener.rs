//! The listener: routes users to subscription groups by endpoint.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::{ListenerError, Result};
use crate::group::{GroupContext, ReconnectPolicy, SubscriptionGroup};
use crate::router::{FaultReceiver, FaultReporter, NotificationBatch, NotificationRouter};
use crate::types::{
    Credential, EndpointKey, EventKind, FolderRef, Identity, ProtocolVersion, WellKnownFolder,
};

/// Longest session the backend grants a push connection.
const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Backend protocol version. Must support push subscriptions.
    pub version: ProtocolVersion,

    /// Reaction to unexpected disconnects.
    /// Default: one immediate reopen attempt.
    pub reconnect: ReconnectPolicy,

    /// Faults buffered before new ones are dropped.
    /// Default: 1024
    pub fault_buffer_size: usize,

    /// Session lifetime requested for each connection, 1 to 30 minutes.
    /// Default: 30 minutes
    pub connection_lifetime: Duration,

    /// Folders watched by `add_default_subscription`.
    pub default_folders: Vec<FolderRef>,

    /// Event kinds watched by `add_default_subscription`.
    pub default_event_kinds: Vec<EventKind>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default(),
            reconnect: ReconnectPolicy::default(),
            fault_buffer_size: 1024,
            connection_lifetime: MAX_CONNECTION_LIFETIME,
            default_folders: vec![FolderRef::WellKnown(WellKnownFolder::Inbox)],
            default_event_kinds: vec![EventKind::NewMail],
        }
    }
}

impl ListenerConfig {
    fn validate(&self) -> Result<()> {
        if !self.version.supports_push() {
            return Err(ListenerError::UnsupportedVersion(self.version));
        }
        if self.fault_buffer_size == 0 {
            return Err(ListenerError::InvalidConfig(
                "fault_buffer_size must be positive".to_string(),
            ));
        }
        if self.connection_lifetime < Duration::from_secs(60)
            || self.connection_lifetime > MAX_CONNECTION_LIFETIME
        {
            return Err(ListenerError::InvalidConfig(format!(
                "connection_lifetime {:?} outside 1..=30 minutes",
                self.connection_lifetime
            )));
        }
        if self.default_folders.is_empty() || self.default_event_kinds.is_empty() {
            return Err(ListenerError::InvalidConfig(
                "default subscription needs at least one folder and event kind".to_string(),
            ));
        }
        Ok(())
    }
}

/// Groups by endpoint, plus which endpoint each identity was placed on.
struct Registry {
    groups: HashMap<EndpointKey, Arc<SubscriptionGroup>>,
    /// Groups whose first Add is in flight. Concurrent first Adds for the
    /// same endpoint join the pending group.
    pending: HashMap<EndpointKey, Arc<SubscriptionGroup>>,
    /// Subscribed identities and those whose Add is in flight.
    owners: HashMap<Identity, EndpointKey>,
    disposed: bool,
}

/// Manages push subscriptions for many users over as few connections as the
/// backend allows.
///
/// Each user is resolved to an [`EndpointKey`]; users with the same key share
/// one [`SubscriptionGroup`] and thus one connection. Notifications from every
/// group reach the callback given at construction, faults go to
/// [`Listener::faults`].
///
/// The registry lock is only held for map updates, never across backend
/// calls or a group's lock. A new group sits in a pending slot until its first
/// Add succeeds, so a group is registered only once it has a working member.
pub struct Listener {
    config: ListenerConfig,
    backend: Backend,
    context: Arc<GroupContext>,
    registry: Mutex<Registry>,
    faults: FaultReceiver,
}

impl Listener {
    /// Create a listener with the default configuration.
    pub fn new<F>(credential: Credential, backend: Backend, callback: F) -> Self
    where
        F: Fn(NotificationBatch) + Send + Sync + 'static,
    {
        Self::build(credential, ListenerConfig::default(), backend, Arc::new(callback))
    }

    /// Create a listener for a specific protocol version.
    pub fn with_version<F>(
        credential: Credential,
        version: ProtocolVersion,
        backend: Backend,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(NotificationBatch) + Send + Sync + 'static,
    {
        let config = ListenerConfig {
            version,
            ..Default::default()
        };
        Self::with_config(credential, config, backend, callback)
    }

    /// Create a listener with a custom configuration.
    pub fn with_config<F>(
        credential: Credential,
        config: ListenerConfig,
        backend: Backend,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(NotificationBatch) + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self::build(credential, config, backend, Arc::new(callback)))
    }

    fn build(
        credential: Credential,
        config: ListenerConfig,
        backend: Backend,
        callback: Arc<dyn Fn(NotificationBatch) + Send + Sync>,
    ) -> Self {
        let (reporter, faults) = FaultReporter::channel(config.fault_buffer_size);
        let context = Arc::new(GroupContext {
            credential,
            version: config.version,
            connection_lifetime: config.connection_lifetime,
            reconnect: config.reconnect.clone(),
            subscriptions: Arc::clone(&backend.subscriptions),
            router: Arc::new(NotificationRouter::new(callback, reporter)),
        });

        Self {
            config,
            backend,
            context,
            registry: Mutex::new(Registry {
                groups: HashMap::new(),
                pending: HashMap::new(),
                owners: HashMap::new(),
                disposed: false,
            }),
            faults,
        }
    }

    // --- Subscriptions ---

    /// Subscribe `address` to `event_kinds` in `folders` and start listening.
    pub fn add_subscription<I, K>(&self, address: &str, folders: I, event_kinds: K) -> Result<()>
    where
        I: IntoIterator<Item = FolderRef>,
        K: IntoIterator<Item = EventKind>,
    {
        let identity = Identity::parse(address)?;
        self.subscribe(
            identity,
            dedup(folders.into_iter()),
            dedup(event_kinds.into_iter()),
        )
    }

    /// Subscribe `address` with the configured default folders and event
    /// kinds (Inbox, NewMail unless configured otherwise).
    pub fn add_default_subscription(&self, address: &str) -> Result<()> {
        let identity = Identity::parse(address)?;
        self.subscribe(
            identity,
            self.config.default_folders.clone(),
            self.config.default_event_kinds.clone(),
        )
    }

    /// Subscribe an already parsed identity.
    pub fn subscribe(
        &self,
        identity: Identity,
        folders: Vec<FolderRef>,
        event_kinds: Vec<EventKind>,
    ) -> Result<()> {
        if folders.is_empty() || event_kinds.is_empty() {
            return Err(ListenerError::InvalidSubscription(format!(
                "{} needs at least one folder and one event kind",
                identity
            )));
        }
        if self.registry.lock().disposed {
            return Err(ListenerError::Disposed);
        }

        debug!(%identity, "resolving endpoint");
        let endpoint = self
            .backend
            .resolver
            .resolve(&identity)
            .map_err(|source| ListenerError::Resolution {
                identity: identity.clone(),
                source,
            })?;

        {
            let mut registry = self.registry.lock();
            if registry.disposed {
                return Err(ListenerError::Disposed);
            }
            if registry.owners.contains_key(&identity) {
                return Err(ListenerError::DuplicateIdentity(identity));
            }
            registry.owners.insert(identity.clone(), endpoint.clone());
        }

        let result = self.add_to_group(&identity, &endpoint, folders, event_kinds);
        if result.is_err() {
            self.registry.lock().owners.remove(&identity);
        }
        result
    }

    fn add_to_group(
        &self,
        identity: &Identity,
        endpoint: &EndpointKey,
        folders: Vec<FolderRef>,
        event_kinds: Vec<EventKind>,
    ) -> Result<()> {
        loop {
            let (group, pending) = {
                let mut registry = self.registry.lock();
                if registry.disposed {
                    return Err(ListenerError::Disposed);
                }

                let registered = registry.groups.get(endpoint).cloned();
                let pending = registry.pending.get(endpoint).cloned();
                match (registered, pending) {
                    (Some(group), _) => (group, false),
                    (None, Some(group)) => (group, true),
                    (None, None) => {
                        let group = SubscriptionGroup::new(
                            endpoint.clone(),
                            self.backend.connections.as_ref(),
                            Arc::clone(&self.context),
                        )?;
                        registry.pending.insert(endpoint.clone(), Arc::clone(&group));
                        debug!(%endpoint, "created pending subscription group");
                        (group, true)
                    }
                }
            };

            match group.add(identity.clone(), folders.clone(), event_kinds.clone()) {
                // Emptied and retired since the lookup; look again.
                Err(ListenerError::GroupRetired(_)) => {
                    self.forget_group(endpoint, &group);
                    continue;
                }
                Err(e) => {
                    if pending {
                        self.discard_if_empty(endpoint, &group);
                    }
                    return Err(e);
                }
                Ok(()) if pending => return self.promote(endpoint, &group),
                Ok(()) => return Ok(()),
            }
        }
    }

    /// Move a pending group that now has a member into the registry.
    fn promote(&self, endpoint: &EndpointKey, group: &Arc<SubscriptionGroup>) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.disposed {
            // Dispose already retired it, along with the member just added.
            return Err(ListenerError::Disposed);
        }
        let is_pending = registry
            .pending
            .get(endpoint)
            .map_or(false, |g| Arc::ptr_eq(g, group));
        if is_pending {
            registry.pending.remove(endpoint);
            registry.groups.insert(endpoint.clone(), Arc::clone(group));
            info!(%endpoint, groups = registry.groups.len(), "registered subscription group");
        }
        Ok(())
    }

    /// Retire `group` if it has no members and release its connection
    /// outside the registry lock.
    fn discard_if_empty(&self, endpoint: &EndpointKey, group: &Arc<SubscriptionGroup>) -> bool {
        if !group.seal_if_empty() {
            return false;
        }
        self.forget_group(endpoint, group);
        group.dispose();
        true
    }

    /// Drop `group` from the registry if it is still the one under `endpoint`.
    fn forget_group(&self, endpoint: &EndpointKey, group: &Arc<SubscriptionGroup>) {
        let mut guard = self.registry.lock();
        let registry = &mut *guard;
        for map in [&mut registry.groups, &mut registry.pending] {
            if map.get(endpoint).map_or(false, |g| Arc::ptr_eq(g, group)) {
                map.remove(endpoint);
            }
        }
    }

    /// Cancel the subscription for `address`. Returns false if there is none.
    pub fn remove_subscription(&self, address: &str) -> bool {
        match Identity::parse(address) {
            Ok(identity) => self.unsubscribe(&identity),
            Err(_) => false,
        }
    }

    /// Cancel the subscription for `identity`. Returns false if there is none.
    ///
    /// A group left without members is retired and unregistered.
    pub fn unsubscribe(&self, identity: &Identity) -> bool {
        let (endpoint, group) = {
            let registry = self.registry.lock();
            let endpoint = match registry.owners.get(identity) {
                Some(endpoint) => endpoint.clone(),
                None => return false,
            };
            let group = registry
                .groups
                .get(&endpoint)
                .or_else(|| registry.pending.get(&endpoint));
            match group {
                Some(group) => (endpoint, Arc::clone(group)),
                None => return false,
            }
        };

        debug!(%identity, %endpoint, "closing subscription");
        if !group.remove(identity) {
            return false;
        }

        self.registry.lock().owners.remove(identity);
        if self.discard_if_empty(&endpoint, &group) {
            info!(%endpoint, "removed empty subscription group");
        }
        true
    }

    /// Close every connection and forget every subscription.
    ///
    /// Later calls are no-ops; the listener rejects new subscriptions.
    pub fn dispose(&self) {
        let groups: Vec<Arc<SubscriptionGroup>> = {
            let mut registry = self.registry.lock();
            if registry.disposed {
                return;
            }
            registry.disposed = true;
            registry.owners.clear();
            let pending: Vec<_> = registry.pending.drain().map(|(_, group)| group).collect();
            registry
                .groups
                .drain()
                .map(|(_, group)| group)
                .chain(pending)
                .collect()
        };

        for group in &groups {
            group.dispose();
        }
        info!(groups = groups.len(), "listener disposed");
    }

    // --- Queries ---

    /// Channel of faults that could not be handled internally.
    pub fn faults(&self) -> FaultReceiver {
        self.faults.clone()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn credential(&self) -> &Credential {
        &self.context.credential
    }

    /// Number of registered groups (= connections).
    pub fn group_count(&self) -> usize {
        self.registry.lock().groups.len()
    }

    /// Endpoints that currently have a group.
    pub fn endpoints(&self) -> Vec<EndpointKey> {
        self.registry.lock().groups.keys().cloned().collect()
    }

    /// The registered group for `endpoint`.
    pub fn group(&self, endpoint: &EndpointKey) -> Option<Arc<SubscriptionGroup>> {
        self.registry.lock().groups.get(endpoint).cloned()
    }

    /// Endpoint `identity` is subscribed on (or being subscribed on).
    pub fn endpoint_of(&self, identity: &Identity) -> Option<EndpointKey> {
        self.registry.lock().owners.get(identity).cloned()
    }

    /// Number of subscribed identities.
    pub fn subscription_count(&self) -> usize {
        let groups: Vec<Arc<SubscriptionGroup>> =
            self.registry.lock().groups.values().cloned().collect();
        groups.iter().map(|g| g.member_count()).sum()
    }

    pub fn is_disposed(&self) -> bool {
        self.registry.lock().disposed
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Remove repeats, keeping first occurrences in order.
fn dedup<T: PartialEq>(items: impl Iterator<Item = T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
