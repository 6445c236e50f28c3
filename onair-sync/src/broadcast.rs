//! Room fan-out with backpressure.
//!
//! Every rundown room owns one tokio broadcast channel. Frames carry the id
//! of the peer that sent them so each subscriber can skip its own echo.
//! A subscriber that falls more than `capacity` frames behind loses the
//! oldest ones; the loss is counted and logged, never replayed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// An encoded frame in flight inside a room.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub from: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for a single rundown room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per subscriber before the
    /// slowest one starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<RoomFrame> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and fan out a message. Filtering the sender is the
    /// receiver's job (see [`RoomFrame::from`]).
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(msg.peer_id, Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, from: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(RoomFrame { from, bytes }).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging subscriber lost.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room ids (rundown ids) to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for `room_id`.
    pub async fn get_or_create(&self, room_id: Uuid) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Re-check: another connection may have created it meanwhile.
        if let Some(room) = rooms.get(&room_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room_id, room.clone());
        room
    }

    pub async fn get(&self, room_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Drop a room once its last peer left.
    pub async fn remove_if_empty(&self, room_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.peer_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
