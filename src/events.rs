use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bridge::{lock, ResultBridge};
use crate::device::{GattDevice, GattEvent, GattStatus, LinkState};
use crate::errors::{Error, ErrorKind};
use crate::model::OperationKind;

/// What a characteristic operation resolves to: `None` means the hardware reported success
/// without handing over a value.
pub(crate) type Completion = Result<Option<Vec<u8>>, Error>;

/// Connection state machine of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Waiting for the link to come up
    Connecting,
    /// Link is up but services are unknown
    ConnectedUndiscovered,
    /// Services are discovered, operations can run
    Ready,
}

/// Handle a bluetooth handler uses to report [`GattEvent`]s. Cheap to clone, usable from any thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<GattEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<GattEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self {sender}, receiver)
    }

    /// Report an event. Events sent after the session is closed are dropped.
    pub fn send(&self, event: GattEvent) {
        if self.sender.send(event).is_err() {
            debug!("Dropping event for a closed session");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListenerKey {
    characteristic: Uuid,
    kind: OperationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Discovery,
    Operation(ListenerKey),
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    discovery: Vec<(u64, Arc<ResultBridge<Result<(), Error>>>)>,
    operations: HashMap<ListenerKey, VecDeque<(u64, Arc<ResultBridge<Completion>>)>>,
}

impl Listeners {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, id: u64, slot: Slot) {
        match slot {
            Slot::Discovery => self.discovery.retain(|(other, _)| *other != id),
            Slot::Operation(key) => {
                if let Some(queue) = self.operations.get_mut(&key) {
                    queue.retain(|(other, _)| *other != id);
                    if queue.is_empty() {
                        self.operations.remove(&key);
                    }
                }
            }
        }
    }
}

/// A waiter registered with the [`EventMultiplexer`]. Unregisters itself when dropped.
pub(crate) struct Registration<T> {
    id: u64,
    slot: Slot,
    bridge: Arc<ResultBridge<T>>,
    listeners: Weak<Mutex<Listeners>>,
}

impl<T> Registration<T> {
    pub(crate) fn bridge(&self) -> &Arc<ResultBridge<T>> {
        &self.bridge
    }
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).remove(self.id, self.slot);
        }
    }
}

/// The single subscriber to a session's events.
///
/// Drives the connection state machine and routes completions to the registered waiters,
/// keyed by characteristic and operation kind. Waiters for the same key are served in
/// registration order.
pub struct EventMultiplexer<D> {
    device: Arc<D>,
    state: Mutex<ConnectionState>,
    discovering: AtomicBool,
    listeners: Arc<Mutex<Listeners>>,
}

impl<D> EventMultiplexer<D> where D: GattDevice + Send + Sync + 'static {
    /// A multiplexer for `device`, starting disconnected
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            state: Mutex::new(ConnectionState::Disconnected),
            discovering: AtomicBool::new(false),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    /// The current connection state
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("Connection state {:?} -> {state:?}", *current);
            *current = state;
        }
    }

    /// Register for the next completion of `kind` on `characteristic`.
    /// Must happen before the hardware operation is triggered.
    pub(crate) fn register(&self, characteristic: Uuid, kind: OperationKind) -> Registration<Completion> {
        let key = ListenerKey {characteristic, kind};
        let bridge = Arc::new(ResultBridge::new());
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id();
        listeners.operations.entry(key).or_default().push_back((id, bridge.clone()));
        Registration {
            id,
            slot: Slot::Operation(key),
            bridge,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Register for the end of the next service discovery
    pub(crate) fn register_discovery(&self) -> Registration<Result<(), Error>> {
        let bridge = Arc::new(ResultBridge::new());
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id();
        listeners.discovery.push((id, bridge.clone()));
        Registration {
            id,
            slot: Slot::Discovery,
            bridge,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Ask the device to discover services unless a discovery is already running
    pub(crate) async fn request_discovery(&self) -> Result<(), Error> {
        if self.discovering.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(error) = self.device.discover_services().await {
            self.discovering.store(false, Ordering::SeqCst);
            return Err(Error::new(ErrorKind::TriggerRejected, &format!("discover services failed: {error}")));
        }
        Ok(())
    }

    /// Tear the session down locally: every waiter fails with `Disconnected`
    pub(crate) fn shutdown(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.discovering.store(false, Ordering::SeqCst);
        self.fail_all(Error::new(ErrorKind::Disconnected, "session closed"));
    }

    /// Process events until every [`EventSink`] is dropped
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<GattEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("Event stream closed");
    }

    pub(crate) async fn handle(&self, event: GattEvent) {
        match event {
            GattEvent::ConnectionStateChanged {status, state} => self.on_connection_change(status, state).await,
            GattEvent::ServicesDiscovered {status} => self.on_services_discovered(status),
            GattEvent::CharacteristicRead {status, characteristic, value} =>
                self.resolve_first(ListenerKey {characteristic, kind: OperationKind::Read}, completion(status, value)),
            GattEvent::CharacteristicWrite {status, characteristic, value} =>
                self.resolve_first(ListenerKey {characteristic, kind: OperationKind::Write}, completion(status, value)),
            GattEvent::CharacteristicChanged {characteristic, value} => self.on_characteristic_changed(characteristic, value),
        }
    }

    async fn on_connection_change(&self, status: GattStatus, state: LinkState) {
        if status.is_success() && state == LinkState::Connected {
            info!("Connected, discovering services");
            self.set_state(ConnectionState::ConnectedUndiscovered);
            // Once connected the services have to be discovered before characteristics can be used
            if let Err(error) = self.request_discovery().await {
                warn!("Unable to start service discovery: {error}");
            }
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        self.discovering.store(false, Ordering::SeqCst);
        self.fail_all(Error::new(ErrorKind::Disconnected, &format!("connection lost with status {status}")));
        if status.is_success() {
            info!("Disconnected");
        } else {
            warn!("Connection failed with status {status}, disconnecting");
            if let Err(error) = self.device.disconnect().await {
                warn!("Unable to disconnect: {error}");
            }
        }
    }

    fn on_services_discovered(&self, status: GattStatus) {
        self.discovering.store(false, Ordering::SeqCst);
        let result = if status.is_success() {
            let mut state = lock(&self.state);
            if *state == ConnectionState::ConnectedUndiscovered {
                *state = ConnectionState::Ready;
                info!("Services discovered, session ready");
            }
            Ok(())
        } else {
            warn!("Service discovery failed with status {status}");
            Err(Error::new(ErrorKind::Protocol(status), "service discovery failed"))
        };
        let waiters = std::mem::take(&mut lock(&self.listeners).discovery);
        for (_, bridge) in waiters {
            bridge.complete(result.clone());
        }
    }

    fn on_characteristic_changed(&self, characteristic: Uuid, value: Vec<u8>) {
        let mut delivered = false;
        for kind in [OperationKind::Notify, OperationKind::Indicate] {
            let waiters = lock(&self.listeners).operations.remove(&ListenerKey {characteristic, kind});
            for (_, bridge) in waiters.into_iter().flatten() {
                delivered |= bridge.complete(Ok(Some(value.clone())));
            }
        }
        if !delivered {
            debug!("Ignoring notification from {characteristic}: no call is waiting for it");
        }
    }

    fn resolve_first(&self, key: ListenerKey, completion: Completion) {
        let mut listeners = lock(&self.listeners);
        if let Some(queue) = listeners.operations.get_mut(&key) {
            while let Some((_, bridge)) = queue.pop_front() {
                // canceled or timed out waiters are skipped
                if bridge.complete(completion.clone()) {
                    return;
                }
            }
        }
        debug!("Ignoring stale {} completion for {}: no call is waiting for it", key.kind, key.characteristic);
    }

    fn fail_all(&self, error: Error) {
        let (discovery, operations) = {
            let mut listeners = lock(&self.listeners);
            (std::mem::take(&mut listeners.discovery), std::mem::take(&mut listeners.operations))
        };
        for (_, bridge) in discovery {
            bridge.complete(Err(error.clone()));
        }
        for (_, bridge) in operations.into_values().flatten() {
            bridge.complete(Err(error.clone()));
        }
    }
}

fn completion(status: GattStatus, value: Option<Vec<u8>>) -> Completion {
    if status.is_success() {
        Ok(value)
    } else {
        Err(Error::new(ErrorKind::Protocol(status), "operation failed on the device"))
    }
}
