//! Relay server: room fan-out plus the authoritative store.
//!
//! Architecture:
//! ```text
//! Operator ──┐                 ┌── Room (rundown id) ── BroadcastGroup
//!            ├── connection ───┤
//! Presenter ─┘   (many rooms)  └── Room (rundown id) ── BroadcastGroup
//!                      │
//!                      ▼
//!               RundownStore (RocksDB)
//!                 ├── rundowns  ◄── structure / reorder / status
//!                 ├── timers    ◄── timer / cursor updates
//!                 └── metadata
//! ```
//!
//! Room events are fanned out to every other peer in the room and folded
//! into the store, last writer wins. Snapshot and document requests are
//! answered to the requester only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use onair_core::Rundown;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::config::ServerConfig;
use crate::protocol::{MessageType, PeerInfo, PeerRole, RoomEvent, SyncMessage, TimerSnapshot};
use crate::storage::{unix_millis, RundownStore, StoreConfig, StoreError};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_events: u64,
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    room_manager: RoomManager,
    stats: RwLock<ServerStats>,
    store: Option<Arc<RundownStore>>,
    shutdown: watch::Sender<bool>,
}

/// The relay server.
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Create a relay. Opens the store if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(RundownStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a relay over an already open store (or none).
    pub fn with_store(config: ServerConfig, store: Option<Arc<RundownStore>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                room_manager: RoomManager::new(config.broadcast_capacity),
                config,
                stats: RwLock::new(ServerStats::default()),
                store,
                shutdown,
            }),
        }
    }

    /// Store a rundown so late joiners can load it.
    pub fn seed(&self, rundown: &Rundown) -> Result<(), StoreError> {
        match &self.shared.store {
            Some(store) => {
                store.save_rundown(rundown)?;
                log::info!("Seeded rundown '{}' ({})", rundown.name, rundown.id);
                Ok(())
            }
            None => {
                log::warn!("No store configured, not seeding '{}'", rundown.name);
                Ok(())
            }
        }
    }

    /// Bind `bind_addr` and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shared.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = stopped(&mut shutdown_rx) => break,
            }
        }

        log::info!("Relay stopped");
        Ok(())
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn room_manager(&self) -> &RoomManager {
        &self.shared.room_manager
    }

    pub fn store(&self) -> Option<&Arc<RundownStore>> {
        self.shared.store.as_ref()
    }
}

/// Resolves once shutdown was requested, including before the call.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Per-connection room membership.
struct Membership {
    group: Arc<BroadcastGroup>,
    forwarder: JoinHandle<()>,
}

/// Copy a room's frames into this connection's outbound queue, skipping
/// the connection's own frames.
fn spawn_forwarder(
    group: Arc<BroadcastGroup>,
    mut rx: broadcast::Receiver<crate::broadcast::RoomFrame>,
    peer_id: Uuid,
    out: mpsc::Sender<Arc<Vec<u8>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if frame.from == peer_id {
                        continue;
                    }
                    if out.send(frame.bytes).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Peer {peer_id} lagged by {n} messages");
                    group.record_dropped(n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(shared.config.broadcast_capacity);
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut peer: Option<PeerInfo> = None;
    let mut rooms: HashMap<Uuid, Membership> = HashMap::new();

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            if let Some(reply) =
                                handle_message(&shared, sync_msg, Arc::new(data.to_vec()), &mut peer, &mut rooms, &out_tx).await
                            {
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                Some(bytes) = out_rx.recv() => {
                    ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                }

                _ = stopped(&mut shutdown_rx) => {
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    // Cleanup: leave every room this connection joined.
    if let Some(info) = &peer {
        let joined: Vec<Uuid> = rooms.keys().copied().collect();
        for room in joined {
            leave_room(&shared, info.peer_id, room, &mut rooms).await;
        }
    }
    {
        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = shared.room_manager.room_count().await;
    }

    result
}

/// Handle one decoded frame. Returns a reply for the sender, if any.
async fn handle_message(
    shared: &Shared,
    msg: SyncMessage,
    raw: Arc<Vec<u8>>,
    peer: &mut Option<PeerInfo>,
    rooms: &mut HashMap<Uuid, Membership>,
    out: &mpsc::Sender<Arc<Vec<u8>>>,
) -> Option<Vec<u8>> {
    match msg.msg_type {
        MessageType::Join => {
            let info = msg
                .peer_info()
                .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "Anonymous", PeerRole::Follower));
            let peer_id = info.peer_id;
            *peer = Some(info.clone());
            if rooms.contains_key(&msg.room_id) {
                return None;
            }

            let group = shared.room_manager.get_or_create(msg.room_id).await;
            if group.peer_count().await >= shared.config.max_peers_per_room {
                log::warn!("Room {} full, rejecting {}", msg.room_id, info.name);
                return None;
            }
            let rx = group.add_peer(info.clone()).await;
            let forwarder = spawn_forwarder(group.clone(), rx, peer_id, out.clone());
            group.broadcast_raw(peer_id, raw);
            rooms.insert(msg.room_id, Membership { group, forwarder });

            shared.stats.write().await.active_rooms = shared.room_manager.room_count().await;
            log::info!("{} ({:?}, {peer_id}) joined room {}", info.name, info.role, msg.room_id);
            None
        }

        MessageType::Leave => {
            leave_room(shared, msg.peer_id, msg.room_id, rooms).await;
            None
        }

        t if t.is_room_event() => {
            let Some(membership) = rooms.get(&msg.room_id) else {
                log::warn!("{t:?} for room {} from a peer that has not joined it", msg.room_id);
                return None;
            };
            let event = match RoomEvent::from_message(&msg) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Dropping malformed {t:?} from {}: {e}", msg.peer_id);
                    return None;
                }
            };
            membership.group.broadcast_raw(msg.peer_id, raw);
            persist(shared, &event).await;
            None
        }

        MessageType::SnapshotRequest => {
            let snapshot = match &shared.store {
                Some(store) => store.timer_snapshot(msg.room_id, unix_millis()).unwrap_or_else(|e| {
                    log::error!("Failed to read timer for {}: {e}", msg.room_id);
                    TimerSnapshot::stopped()
                }),
                None => TimerSnapshot::stopped(),
            };
            encode_reply(SyncMessage::snapshot_response(msg.room_id, &snapshot))
        }

        MessageType::DocumentRequest => {
            let rundown = shared.store.as_ref().and_then(|store| match store.load_rundown(msg.room_id) {
                Ok(r) => Some(r),
                Err(StoreError::NotFound(_)) => None,
                Err(e) => {
                    log::error!("Failed to load rundown {}: {e}", msg.room_id);
                    None
                }
            });
            encode_reply(SyncMessage::document_response(msg.room_id, rundown.as_ref()))
        }

        MessageType::Ping => encode_reply(Ok(SyncMessage::pong(Uuid::nil()))),

        other => {
            log::debug!("Unhandled message type: {other:?}");
            None
        }
    }
}

fn encode_reply(msg: Result<SyncMessage, crate::protocol::ProtocolError>) -> Option<Vec<u8>> {
    match msg.and_then(|m| m.encode()) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::error!("Failed to encode reply: {e}");
            None
        }
    }
}

async fn persist(shared: &Shared, event: &RoomEvent) {
    let Some(store) = &shared.store else {
        return;
    };
    match store.apply_event(event, unix_millis()) {
        Ok(()) => shared.stats.write().await.persisted_events += 1,
        Err(StoreError::NotFound(room)) => {
            log::debug!("No stored rundown for {room}, {:?} not persisted", event.kind());
        }
        Err(e) => log::error!("Failed to persist {:?} for {}: {e}", event.kind(), event.room()),
    }
}

async fn leave_room(shared: &Shared, peer_id: Uuid, room: Uuid, rooms: &mut HashMap<Uuid, Membership>) {
    let Some(membership) = rooms.remove(&room) else {
        return;
    };
    membership.forwarder.abort();
    membership.group.remove_peer(&peer_id).await;
    let _ = membership.group.broadcast(&SyncMessage::leave(peer_id, room));
    if shared.room_manager.remove_if_empty(&room).await {
        log::info!("Room {room} removed (empty)");
    }
    shared.stats.write().await.active_rooms = shared.room_manager.room_count().await;
    log::info!("Peer {peer_id} left room {room}");
}
