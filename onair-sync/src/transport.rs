//! WebSocket client transport: one duplex connection to the relay carrying
//! any number of rooms.
//!
//! ```text
//!   publish ──try_send──► [outgoing mpsc] ──► writer task ──► ws sink
//!
//!   ws stream ──► reader task ──┬─► subscriptions (filtered mpsc)
//!                               └─► pending snapshot/document requests
//!
//!   supervisor: waits for the reader to end, then redials with backoff
//!               and re-joins every remembered room
//! ```
//!
//! Delivery is at-most-once. Nothing is queued while disconnected and
//! nothing missed is replayed after a reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use onair_core::Rundown;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bootstrap::{BootstrapError, DocumentSource, SnapshotSource};
use crate::config::TransportConfig;
use crate::engine::Publisher;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, RoomEvent, SyncMessage, TimerSnapshot};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Which inbound events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Kind(MessageType),
}

impl EventFilter {
    pub fn matches(&self, event: &RoomEvent) -> bool {
        match self {
            Self::All => true,
            Self::Kind(kind) => event.kind() == *kind,
        }
    }
}

/// A room event received from another peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: Uuid,
    pub event: RoomEvent,
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Inbound>,
}

struct Inner {
    config: TransportConfig,
    peer: PeerInfo,
    state: watch::Sender<ConnectionState>,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rooms: Mutex<HashSet<Uuid>>,
    subscribers: Mutex<Vec<Subscriber>>,
    pending_snapshots: Waiters<TimerSnapshot>,
    pending_documents: Waiters<Option<Rundown>>,
    shutdown: AtomicBool,
}

/// Cloneable handle to the client transport.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

type Waiters<T> = Mutex<HashMap<Uuid, Vec<oneshot::Sender<T>>>>;

/// Queue a response waiter for `room`, dropping waiters whose caller has
/// already given up (a timed-out bootstrap).
fn add_waiter<T>(waiters: &Waiters<T>, room: Uuid, tx: oneshot::Sender<T>) {
    let mut waiters = lock(waiters);
    waiters.retain(|_, pending| {
        pending.retain(|tx| !tx.is_closed());
        !pending.is_empty()
    });
    waiters.entry(room).or_default().push(tx);
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let peer = PeerInfo::new(config.peer_name.clone(), config.role);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                peer,
                state,
                outgoing: Mutex::new(None),
                rooms: Mutex::new(HashSet::new()),
                subscribers: Mutex::new(Vec::new()),
                pending_snapshots: Mutex::new(HashMap::new()),
                pending_documents: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Connect to the relay and keep the connection alive.
    ///
    /// Fails if the first dial fails; later drops are handled by the
    /// reconnect supervisor.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        self.inner.shutdown.store(false, Ordering::SeqCst);
        self.inner.state.send_replace(ConnectionState::Connecting);
        match dial(&self.inner).await {
            Ok(closed) => {
                tokio::spawn(supervise(self.inner.clone(), closed));
                Ok(())
            }
            Err(e) => {
                self.inner.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        // Dropping the sender ends the writer, which closes the socket.
        lock(&self.inner.outgoing).take();
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    /// Join a room. Idempotent; the room is re-joined after reconnects.
    pub fn join(&self, room: Uuid) {
        if !lock(&self.inner.rooms).insert(room) {
            return;
        }
        log::info!("{} joining room {room}", self.inner.peer.name);
        match SyncMessage::join(&self.inner.peer, room) {
            Ok(msg) => self.send(&msg),
            Err(e) => log::error!("Failed to encode join for {room}: {e}"),
        }
    }

    /// Leave a room. Idempotent.
    pub fn leave(&self, room: Uuid) {
        if !lock(&self.inner.rooms).remove(&room) {
            return;
        }
        log::info!("{} leaving room {room}", self.inner.peer.name);
        self.send(&SyncMessage::leave(self.inner.peer.peer_id, room));
    }

    pub fn rooms(&self) -> Vec<Uuid> {
        lock(&self.inner.rooms).iter().copied().collect()
    }

    /// Receive inbound room events matching `filter`.
    pub fn subscribe(&self, filter: EventFilter) -> mpsc::Receiver<Inbound> {
        let (tx, rx) = mpsc::channel(self.inner.config.subscription_capacity);
        lock(&self.inner.subscribers).push(Subscriber { filter, tx });
        rx
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.inner.peer
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Send a ping frame to the relay.
    pub fn ping(&self) {
        self.send(&SyncMessage::ping(self.inner.peer.peer_id));
    }

    /// Fire-and-forget send. Dropped (and logged) when disconnected or
    /// when the writer is backed up.
    fn send(&self, msg: &SyncMessage) {
        let encoded = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", msg.msg_type);
                return;
            }
        };
        let outgoing = lock(&self.inner.outgoing);
        match outgoing.as_ref() {
            Some(tx) if self.is_connected() => {
                if let Err(e) = tx.try_send(encoded) {
                    log::warn!("Dropping {:?}: {e}", msg.msg_type);
                }
            }
            _ => log::debug!("Not connected, dropping {:?}", msg.msg_type),
        }
    }

    fn ensure_connected(&self) -> Result<(), BootstrapError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BootstrapError::Unavailable("transport not connected".into()))
        }
    }
}

impl Publisher for Transport {
    fn publish(&self, event: &RoomEvent) {
        match event.to_message(self.inner.peer.peer_id) {
            Ok(msg) => self.send(&msg),
            Err(e) => log::error!("Failed to encode {:?}: {e}", event.kind()),
        }
    }
}

impl SnapshotSource for Transport {
    async fn fetch_snapshot(&self, room: Uuid) -> Result<TimerSnapshot, BootstrapError> {
        self.ensure_connected()?;
        let (tx, rx) = oneshot::channel();
        add_waiter(&self.inner.pending_snapshots, room, tx);
        self.send(&SyncMessage::snapshot_request(self.inner.peer.peer_id, room));
        rx.await
            .map_err(|_| BootstrapError::Unavailable("connection closed before snapshot".into()))
    }
}

impl DocumentSource for Transport {
    async fn load_document(&self, room: Uuid) -> Result<Rundown, BootstrapError> {
        self.ensure_connected()?;
        let (tx, rx) = oneshot::channel();
        add_waiter(&self.inner.pending_documents, room, tx);
        self.send(&SyncMessage::document_request(self.inner.peer.peer_id, room));
        match rx.await {
            Ok(Some(rundown)) => Ok(rundown),
            Ok(None) => Err(BootstrapError::NotFound(room)),
            Err(_) => Err(BootstrapError::Unavailable("connection closed before document".into())),
        }
    }
}

/// Open one connection: spawn writer and reader, re-join remembered
/// rooms. The returned receiver fires when the reader ends.
async fn dial(inner: &Arc<Inner>) -> Result<oneshot::Receiver<()>, ProtocolError> {
    let url = inner.config.server_url.clone();
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
        log::warn!("Connecting to {url} failed: {e}");
        ProtocolError::ConnectionClosed
    })?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(inner.config.outgoing_capacity);
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Re-join before anyone else can publish on the new connection.
    let rooms: Vec<Uuid> = lock(&inner.rooms).iter().copied().collect();
    for room in &rooms {
        let msg = SyncMessage::join(&inner.peer, *room)?;
        let _ = out_tx.try_send(msg.encode()?);
    }
    *lock(&inner.outgoing) = Some(out_tx);
    inner.state.send_replace(ConnectionState::Connected);
    log::info!("{} connected to {url}, {} room(s) joined", inner.peer.name, rooms.len());

    let (closed_tx, closed_rx) = oneshot::channel();
    let reader_inner = inner.clone();
    tokio::spawn(async move {
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(Message::Binary(data)) => dispatch(&reader_inner, &data),
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        lock(&reader_inner.outgoing).take();
        // Dropping pending senders fails the waiting requests.
        lock(&reader_inner.pending_snapshots).clear();
        lock(&reader_inner.pending_documents).clear();
        let _ = closed_tx.send(());
    });

    Ok(closed_rx)
}

/// Redial after every drop until shutdown or attempts run out.
async fn supervise(inner: Arc<Inner>, mut closed: oneshot::Receiver<()>) {
    'connection: loop {
        let _ = (&mut closed).await;
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        log::warn!("{} lost connection to relay", inner.peer.name);
        inner.state.send_replace(ConnectionState::Reconnecting);

        for attempt in 0..inner.config.max_reconnect_attempts {
            tokio::time::sleep(inner.config.backoff(attempt)).await;
            if inner.shutdown.load(Ordering::SeqCst) {
                break 'connection;
            }
            match dial(&inner).await {
                Ok(next) => {
                    log::info!("Reconnected after {} attempt(s)", attempt + 1);
                    closed = next;
                    continue 'connection;
                }
                Err(e) => log::warn!("Reconnect attempt {} failed: {e}", attempt + 1),
            }
        }

        log::error!(
            "Giving up after {} reconnect attempts",
            inner.config.max_reconnect_attempts
        );
        break;
    }
    if inner.shutdown.load(Ordering::SeqCst) || lock(&inner.outgoing).is_none() {
        inner.state.send_replace(ConnectionState::Disconnected);
    }
}

fn dispatch(inner: &Inner, bytes: &[u8]) {
    let msg = match SyncMessage::decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Dropping undecodable frame: {e}");
            return;
        }
    };

    match msg.msg_type {
        t if t.is_room_event() => {
            if msg.peer_id == inner.peer.peer_id {
                return;
            }
            match RoomEvent::from_message(&msg) {
                Ok(event) => fan_out(inner, Inbound { from: msg.peer_id, event }),
                Err(e) => log::warn!("Dropping malformed {t:?} from {}: {e}", msg.peer_id),
            }
        }
        MessageType::SnapshotResponse => match msg.timer_snapshot() {
            Ok(snapshot) => {
                let waiting = lock(&inner.pending_snapshots).remove(&msg.room_id);
                for tx in waiting.into_iter().flatten() {
                    let _ = tx.send(snapshot);
                }
            }
            Err(e) => log::warn!("Malformed snapshot response: {e}"),
        },
        MessageType::DocumentResponse => match msg.rundown() {
            Ok(rundown) => {
                let waiting = lock(&inner.pending_documents).remove(&msg.room_id);
                for tx in waiting.into_iter().flatten() {
                    let _ = tx.send(rundown.clone());
                }
            }
            Err(e) => log::warn!("Malformed document response: {e}"),
        },
        MessageType::Join => {
            if let Ok(info) = msg.peer_info() {
                log::info!("{} ({:?}) joined room {}", info.name, info.role, msg.room_id);
            }
        }
        MessageType::Leave => log::info!("Peer {} left room {}", msg.peer_id, msg.room_id),
        MessageType::Pong => log::trace!("Pong from relay"),
        other => log::debug!("Ignoring {other:?} from relay"),
    }
}

fn fan_out(inner: &Inner, inbound: Inbound) {
    let mut subscribers = lock(&inner.subscribers);
    subscribers.retain(|sub| {
        if !sub.filter.matches(&inbound.event) {
            return !sub.tx.is_closed();
        }
        match sub.tx.try_send(inbound.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Subscriber lagging, dropping {:?}", inbound.event.kind());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PeerRole, TimerUpdate};
    use onair_core::Cursor;

    fn transport() -> Transport {
        Transport::new(TransportConfig::new("ws://127.0.0.1:1", "Operator", PeerRole::Controller))
    }

    fn timer_event(room: Uuid) -> RoomEvent {
        RoomEvent::Timer {
            room,
            update: TimerUpdate {
                is_running: true,
                time_elapsed: Some(5),
                cursor: Some(Cursor::ORIGIN),
            },
        }
    }

    #[test]
    fn test_initial_state() {
        let t = transport();
        assert_eq!(t.connection_state(), ConnectionState::Disconnected);
        assert!(!t.is_connected());
        assert_eq!(t.peer_info().name, "Operator");
        assert!(t.rooms().is_empty());
    }

    #[test]
    fn test_join_leave_idempotent() {
        let t = transport();
        let room = Uuid::new_v4();
        t.join(room);
        t.join(room);
        assert_eq!(t.rooms(), vec![room]);
        t.leave(room);
        t.leave(room);
        assert!(t.rooms().is_empty());
    }

    #[test]
    fn test_publish_while_disconnected_is_dropped() {
        let t = transport();
        // Must neither panic nor block.
        t.publish(&timer_event(Uuid::new_v4()));
        assert!(lock(&t.inner.outgoing).is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_requests_fail_fast_when_disconnected() {
        let t = transport();
        let room = Uuid::new_v4();
        assert!(matches!(
            t.fetch_snapshot(room).await,
            Err(BootstrapError::Unavailable(_))
        ));
        assert!(matches!(
            t.load_document(room).await,
            Err(BootstrapError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let t = transport();
        assert!(t.connect().await.is_err());
        assert_eq!(t.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_dispatch_filters_and_skips_own_echo() {
        let t = transport();
        let mut all = t.subscribe(EventFilter::All);
        let mut status_only = t.subscribe(EventFilter::Kind(MessageType::StatusUpdate));
        let room = Uuid::new_v4();
        let other = Uuid::new_v4();

        let own = timer_event(room).to_message(t.peer_info().peer_id).unwrap();
        dispatch(&t.inner, &own.encode().unwrap());
        assert!(all.try_recv().is_err());

        let remote = timer_event(room).to_message(other).unwrap();
        dispatch(&t.inner, &remote.encode().unwrap());
        let inbound = all.try_recv().unwrap();
        assert_eq!(inbound.from, other);
        assert_eq!(inbound.event, timer_event(room));
        assert!(status_only.try_recv().is_err());

        dispatch(&t.inner, &[0xde, 0xad]);
        assert!(all.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_resolves_pending_snapshot() {
        let t = transport();
        let room = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        lock(&t.inner.pending_snapshots).entry(room).or_default().push(tx);

        let snapshot = TimerSnapshot {
            is_running: true,
            time_elapsed: 30,
            cursor: Cursor::new(0, 1),
        };
        let msg = SyncMessage::snapshot_response(room, &snapshot).unwrap();
        dispatch(&t.inner, &msg.encode().unwrap());
        assert_eq!(rx.await.unwrap(), snapshot);
        assert!(lock(&t.inner.pending_snapshots).is_empty());
    }

    #[test]
    fn test_abandoned_waiters_are_pruned() {
        let t = transport();
        let abandoned = Uuid::new_v4();
        let (tx, rx) = oneshot::channel::<TimerSnapshot>();
        add_waiter(&t.inner.pending_snapshots, abandoned, tx);
        drop(rx);

        let room = Uuid::new_v4();
        let (tx, _rx) = oneshot::channel::<TimerSnapshot>();
        add_waiter(&t.inner.pending_snapshots, room, tx);

        let waiters = lock(&t.inner.pending_snapshots);
        assert_eq!(waiters.len(), 1);
        assert!(waiters.contains_key(&room));
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let t = transport();
        let rx = t.subscribe(EventFilter::All);
        drop(rx);
        let remote = timer_event(Uuid::new_v4()).to_message(Uuid::new_v4()).unwrap();
        dispatch(&t.inner, &remote.encode().unwrap());
        assert!(lock(&t.inner.subscribers).is_empty());
    }
}
