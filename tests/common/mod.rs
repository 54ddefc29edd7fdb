//! In-memory collaborators for listener tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use pushmux::{
    Backend, BackendError, BackendSubscription, Connection, ConnectionEvents, ConnectionFactory,
    ConnectionSpec, Credential, EndpointKey, EndpointResolver, Event, Identity, Listener,
    ListenerConfig, NotificationBatch, SubscribeRequest, SubscriptionBackend, SubscriptionId,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn endpoint_a() -> EndpointKey {
    EndpointKey::new("grp-a", "https://cas-a.contoso.com/EWS/Exchange.asmx")
}

pub fn endpoint_b() -> EndpointKey {
    EndpointKey::new("grp-b", "https://cas-b.contoso.com/EWS/Exchange.asmx")
}

pub fn id(address: &str) -> Identity {
    Identity::parse(address).unwrap()
}

// --- Connection ---

/// Observable state of one fake push connection.
#[derive(Default)]
pub struct ConnectionMonitor {
    pub endpoint: Mutex<Option<EndpointKey>>,
    open: AtomicBool,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    members: Mutex<Vec<SubscriptionId>>,
    events: Mutex<Option<Arc<dyn ConnectionEvents>>>,
    /// Fail every open from now on.
    pub fail_open: AtomicBool,
    /// Raise `on_disconnect` from inside `close()`, like real transports do.
    pub disconnect_on_close: AtomicBool,
    /// Next successful open drops the channel right away and reports the
    /// disconnect from another thread before `open()` returns.
    pub drop_after_open: AtomicBool,
    pub released: AtomicBool,
}

impl ConnectionMonitor {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn members(&self) -> Vec<SubscriptionId> {
        self.members.lock().clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn events(&self) -> Arc<dyn ConnectionEvents> {
        self.events.lock().clone().expect("connection has no event sink")
    }

    /// Drop the channel as if the network failed.
    pub fn simulate_disconnect(&self) {
        self.drop_channel();
        self.report_disconnect();
    }

    /// Drop the channel without telling anyone yet.
    pub fn drop_channel(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Deliver a disconnect event, possibly long after the drop.
    pub fn report_disconnect(&self) {
        self.events()
            .on_disconnect(Some(BackendError::Transport("connection reset".to_string())));
    }

    /// Deliver a batch for `subscription`.
    pub fn notify(&self, subscription: &SubscriptionId, events: Vec<Event>) {
        self.events().on_notification(subscription, events);
    }

    pub fn raise_subscription_error(&self, subscription: &SubscriptionId, error: BackendError) {
        self.events().on_subscription_error(Some(subscription), error);
    }
}

struct FakeConnection(Arc<ConnectionMonitor>);

impl Connection for FakeConnection {
    fn open(&mut self) -> Result<(), BackendError> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_open.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("endpoint refused connection".to_string()));
        }
        if self.0.members.lock().is_empty() {
            return Err(BackendError::Rejected("no subscriptions to listen on".to_string()));
        }
        self.0.open.store(true, Ordering::SeqCst);
        if self.0.drop_after_open.swap(false, Ordering::SeqCst) {
            self.0.drop_channel();
            let monitor = Arc::clone(&self.0);
            std::thread::spawn(move || monitor.report_disconnect())
                .join()
                .expect("disconnect thread panicked");
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        self.0.open.store(false, Ordering::SeqCst);
        if self.0.disconnect_on_close.load(Ordering::SeqCst) {
            self.0.events().on_disconnect(None);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.0.is_open()
    }

    fn add_member(&mut self, subscription: &BackendSubscription) -> Result<(), BackendError> {
        if self.0.is_open() {
            return Err(BackendError::Rejected("connection is open".to_string()));
        }
        self.0.members.lock().push(subscription.id.clone());
        Ok(())
    }

    fn remove_member(&mut self, subscription: &SubscriptionId) -> Result<(), BackendError> {
        if self.0.is_open() {
            return Err(BackendError::Rejected("connection is open".to_string()));
        }
        self.0.members.lock().retain(|m| m != subscription);
        Ok(())
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.0.released.store(true, Ordering::SeqCst);
    }
}

/// Creates fake connections and keeps their monitors.
#[derive(Default)]
pub struct FakeConnections {
    created: Mutex<Vec<Arc<ConnectionMonitor>>>,
    pub disconnect_on_close: AtomicBool,
    pub fail_create: AtomicBool,
}

impl FakeConnections {
    pub fn created(&self) -> Vec<Arc<ConnectionMonitor>> {
        self.created.lock().clone()
    }

    /// Most recently created connection for `endpoint`.
    pub fn monitor(&self, endpoint: &EndpointKey) -> Arc<ConnectionMonitor> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|p| p.endpoint.lock().as_ref() == Some(endpoint))
            .cloned()
            .expect("no connection for endpoint")
    }
}

impl ConnectionFactory for FakeConnections {
    fn create(
        &self,
        spec: ConnectionSpec<'_>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Box<dyn Connection>, BackendError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("cannot reach endpoint".to_string()));
        }
        let monitor = Arc::new(ConnectionMonitor::default());
        *monitor.endpoint.lock() = Some(spec.endpoint.clone());
        *monitor.events.lock() = Some(events);
        monitor
            .disconnect_on_close
            .store(self.disconnect_on_close.load(Ordering::SeqCst), Ordering::SeqCst);
        self.created.lock().push(Arc::clone(&monitor));
        Ok(Box::new(FakeConnection(monitor)))
    }
}

// --- Resolver ---

/// Maps identities to fixed endpoints; unknown identities fail to resolve.
#[derive(Default)]
pub struct StaticResolver {
    routes: Mutex<HashMap<Identity, EndpointKey>>,
    pub lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn route(&self, address: &str, endpoint: EndpointKey) {
        self.routes.lock().insert(id(address), endpoint);
    }
}

impl EndpointResolver for StaticResolver {
    fn resolve(&self, identity: &Identity) -> Result<EndpointKey, BackendError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.routes
            .lock()
            .get(identity)
            .cloned()
            .ok_or_else(|| BackendError::Other(format!("no mailbox for {}", identity)))
    }
}

// --- Subscription backend ---

/// Issues sequential subscription ids; rejects configured identities.
#[derive(Default)]
pub struct FakeSubscriptions {
    next: AtomicUsize,
    rejected: Mutex<HashSet<Identity>>,
    issued: Mutex<HashMap<Identity, SubscriptionId>>,
    delays: Mutex<HashMap<Identity, Duration>>,
    in_flight: AtomicUsize,
}

impl FakeSubscriptions {
    pub fn reject(&self, address: &str) {
        self.rejected.lock().insert(id(address));
    }

    /// Make subscribing `address` take `delay`.
    pub fn delay(&self, address: &str, delay: Duration) {
        self.delays.lock().insert(id(address), delay);
    }

    /// Subscribe calls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Last subscription id issued for `address`.
    pub fn issued_for(&self, address: &str) -> SubscriptionId {
        self.issued.lock().get(&id(address)).cloned().expect("no subscription issued")
    }
}

impl SubscriptionBackend for FakeSubscriptions {
    fn subscribe(&self, request: &SubscribeRequest<'_>) -> Result<BackendSubscription, BackendError> {
        let delay = self.delays.lock().get(request.impersonate).copied();
        if let Some(delay) = delay {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        if self.rejected.lock().contains(request.impersonate) {
            return Err(BackendError::Rejected(format!(
                "{} may not be impersonated",
                request.impersonate
            )));
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let subscription = BackendSubscription::new(format!("sub-{}", n));
        self.issued
            .lock()
            .insert(request.impersonate.clone(), subscription.id.clone());
        Ok(subscription)
    }
}

// --- Harness ---

pub struct Harness {
    pub listener: Listener,
    pub resolver: Arc<StaticResolver>,
    pub connections: Arc<FakeConnections>,
    pub subscriptions: Arc<FakeSubscriptions>,
    pub received: Arc<Mutex<Vec<NotificationBatch>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ListenerConfig::default())
    }

    pub fn with_config(config: ListenerConfig) -> Self {
        Self::build(config, FakeConnections::default())
    }

    pub fn build(config: ListenerConfig, connections: FakeConnections) -> Self {
        init_tracing();

        let resolver = Arc::new(StaticResolver::default());
        let connections = Arc::new(connections);
        let subscriptions = Arc::new(FakeSubscriptions::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let backend = Backend::new(resolver.clone(), connections.clone(), subscriptions.clone());
        let listener = Listener::with_config(
            Credential::new("svc@contoso.com", "secret"),
            config,
            backend,
            move |batch: NotificationBatch| sink.lock().push(batch),
        )
        .unwrap();

        Self {
            listener,
            resolver,
            connections,
            subscriptions,
            received,
        }
    }

    /// Route alice and bob to A, carol to B.
    pub fn with_default_routes(self) -> Self {
        self.resolver.route("alice@contoso.com", endpoint_a());
        self.resolver.route("bob@contoso.com", endpoint_a());
        self.resolver.route("carol@contoso.com", endpoint_b());
        self
    }

    pub fn members(&self, endpoint: &EndpointKey) -> Vec<Identity> {
        self.listener
            .group(endpoint)
            .map(|g| g.members())
            .unwrap_or_default()
    }
}
