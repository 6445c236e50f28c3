//! Binary wire protocol for room-scoped rundown synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The payload is a kind-specific bincode struct. Room events are decoded
//! into [`RoomEvent`] at this boundary; cursors arrive as the tagged
//! [`WireCursor`] schema and leave as a validated [`Cursor`], so nothing
//! past this module has to repair payload shapes.

use onair_core::{Cursor, Folder, Item, Rundown};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// room.join: payload is the joining peer's [`PeerInfo`]
    Join = 1,
    /// room.leave
    Leave = 2,
    /// timer.update
    TimerUpdate = 3,
    /// cursor.update
    CursorUpdate = 4,
    /// structure.replace: whole folder tree
    StructureReplace = 5,
    /// item.reorder: children of one folder
    ItemReorder = 6,
    /// folder.reorder: the folder list
    FolderReorder = 7,
    /// status.update
    StatusUpdate = 8,
    /// Request the authoritative timer snapshot for a room
    SnapshotRequest = 9,
    /// Authoritative timer snapshot
    SnapshotResponse = 10,
    /// Request the stored rundown for a room
    DocumentRequest = 11,
    /// Stored rundown (if any)
    DocumentResponse = 12,
    /// Heartbeat ping
    Ping = 13,
    /// Heartbeat pong
    Pong = 14,
}

impl MessageType {
    /// Whether this type carries a [`RoomEvent`] that peers fan out.
    pub fn is_room_event(self) -> bool {
        matches!(
            self,
            Self::TimerUpdate
                | Self::CursorUpdate
                | Self::StructureReplace
                | Self::ItemReorder
                | Self::FolderReorder
                | Self::StatusUpdate
        )
    }
}

/// Role a client plays in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Operator console driving the clock
    Controller,
    /// Presenter or monitor view following the clock
    Follower,
}

/// Peer identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    pub role: PeerRole,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>, role: PeerRole) -> Self {
        Self::with_id(Uuid::new_v4(), name, role)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>, role: PeerRole) -> Self {
        Self {
            peer_id,
            name: name.into(),
            role,
        }
    }
}

/// Plain cursor indices as sent on the wire. Indices are signed so a
/// negative value can be decoded and rejected instead of failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatCursor {
    pub folder_index: i64,
    pub item_index: i64,
}

impl FlatCursor {
    fn valid(self) -> Option<Cursor> {
        let folder = usize::try_from(self.folder_index).ok()?;
        let item = usize::try_from(self.item_index).ok()?;
        Some(Cursor::new(folder, item))
    }
}

/// Cursor as it travels on the wire.
///
/// Older senders wrapped the cursor object one level too deep; `Nested`
/// keeps that shape explicit instead of guessing at it. Anything wrapped
/// deeper arrives as `DoublyNested` and carries no indices, so the schema
/// never recurses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireCursor {
    Missing,
    Flat(FlatCursor),
    Nested(FlatCursor),
    DoublyNested,
}

impl WireCursor {
    pub fn from_cursor(cursor: Cursor) -> Self {
        Self::Flat(FlatCursor {
            folder_index: cursor.folder_index as i64,
            item_index: cursor.item_index as i64,
        })
    }

    pub fn from_option(cursor: Option<Cursor>) -> Self {
        cursor.map_or(Self::Missing, Self::from_cursor)
    }

    /// Validate into a [`Cursor`].
    ///
    /// `Missing` yields `None`. One level of nesting is unwrapped; anything
    /// still invalid (deeper nesting, negative indices) falls back to (0,0).
    pub fn normalize(&self) -> Option<Cursor> {
        match *self {
            Self::Missing => None,
            Self::Flat(flat) => Some(flat.valid().unwrap_or_else(|| {
                log::warn!("Invalid cursor {flat:?}, falling back to origin");
                Cursor::ORIGIN
            })),
            Self::Nested(inner) => {
                let unwrapped = inner.valid();
                if unwrapped.is_some() {
                    log::warn!("Unwrapped nested cursor payload {inner:?}");
                } else {
                    log::warn!("Unrepairable nested cursor {inner:?}, falling back to origin");
                }
                Some(unwrapped.unwrap_or(Cursor::ORIGIN))
            }
            Self::DoublyNested => {
                log::warn!("Cursor nested more than once, falling back to origin");
                Some(Cursor::ORIGIN)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimerPayload {
    is_running: bool,
    time_elapsed: Option<u64>,
    cursor: WireCursor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorPayload {
    cursor: WireCursor,
    time_elapsed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StructurePayload {
    items: Vec<Folder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemReorderPayload {
    folder_index: u64,
    new_order: Vec<Item>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FolderReorderPayload {
    new_order: Vec<Folder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusPayload {
    status: String,
}

/// Timer fields of a timer.update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerUpdate {
    pub is_running: bool,
    pub time_elapsed: Option<u64>,
    pub cursor: Option<Cursor>,
}

/// Authoritative timer state served to late joiners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub is_running: bool,
    pub time_elapsed: u64,
    pub cursor: Cursor,
}

impl TimerSnapshot {
    pub fn stopped() -> Self {
        Self {
            is_running: false,
            time_elapsed: 0,
            cursor: Cursor::ORIGIN,
        }
    }
}

impl From<TimerSnapshot> for TimerUpdate {
    fn from(s: TimerSnapshot) -> Self {
        Self {
            is_running: s.is_running,
            time_elapsed: Some(s.time_elapsed),
            cursor: Some(s.cursor),
        }
    }
}

/// A validated room event, the unit the reconciliation engine applies.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Timer {
        room: Uuid,
        update: TimerUpdate,
    },
    Cursor {
        room: Uuid,
        cursor: Cursor,
        time_elapsed: Option<u64>,
    },
    StructureReplace {
        room: Uuid,
        items: Vec<Folder>,
    },
    ItemReorder {
        room: Uuid,
        folder_index: usize,
        new_order: Vec<Item>,
    },
    FolderReorder {
        room: Uuid,
        new_order: Vec<Folder>,
    },
    Status {
        room: Uuid,
        status: String,
    },
}

impl RoomEvent {
    pub fn room(&self) -> Uuid {
        match self {
            Self::Timer { room, .. }
            | Self::Cursor { room, .. }
            | Self::StructureReplace { room, .. }
            | Self::ItemReorder { room, .. }
            | Self::FolderReorder { room, .. }
            | Self::Status { room, .. } => *room,
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Self::Timer { .. } => MessageType::TimerUpdate,
            Self::Cursor { .. } => MessageType::CursorUpdate,
            Self::StructureReplace { .. } => MessageType::StructureReplace,
            Self::ItemReorder { .. } => MessageType::ItemReorder,
            Self::FolderReorder { .. } => MessageType::FolderReorder,
            Self::Status { .. } => MessageType::StatusUpdate,
        }
    }

    /// Structural events are the ones a held drag lock suppresses.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::StructureReplace { .. } | Self::ItemReorder { .. } | Self::FolderReorder { .. }
        )
    }

    /// Wrap into a wire message from `peer_id`.
    pub fn to_message(&self, peer_id: Uuid) -> Result<SyncMessage, ProtocolError> {
        let payload = match self {
            Self::Timer { update, .. } => encode_payload(&TimerPayload {
                is_running: update.is_running,
                time_elapsed: update.time_elapsed,
                cursor: WireCursor::from_option(update.cursor),
            })?,
            Self::Cursor {
                cursor,
                time_elapsed,
                ..
            } => encode_payload(&CursorPayload {
                cursor: WireCursor::from_cursor(*cursor),
                time_elapsed: *time_elapsed,
            })?,
            Self::StructureReplace { items, .. } => encode_payload(&StructurePayload {
                items: items.clone(),
            })?,
            Self::ItemReorder {
                folder_index,
                new_order,
                ..
            } => encode_payload(&ItemReorderPayload {
                folder_index: *folder_index as u64,
                new_order: new_order.clone(),
            })?,
            Self::FolderReorder { new_order, .. } => encode_payload(&FolderReorderPayload {
                new_order: new_order.clone(),
            })?,
            Self::Status { status, .. } => encode_payload(&StatusPayload {
                status: status.clone(),
            })?,
        };
        Ok(SyncMessage {
            msg_type: self.kind(),
            peer_id,
            room_id: self.room(),
            payload,
        })
    }

    /// Decode a room event from a wire message.
    pub fn from_message(msg: &SyncMessage) -> Result<Self, ProtocolError> {
        let room = msg.room_id;
        let event = match msg.msg_type {
            MessageType::TimerUpdate => {
                let p: TimerPayload = decode_payload(&msg.payload)?;
                Self::Timer {
                    room,
                    update: TimerUpdate {
                        is_running: p.is_running,
                        time_elapsed: p.time_elapsed,
                        cursor: p.cursor.normalize(),
                    },
                }
            }
            MessageType::CursorUpdate => {
                let p: CursorPayload = decode_payload(&msg.payload)?;
                Self::Cursor {
                    room,
                    cursor: p.cursor.normalize().unwrap_or(Cursor::ORIGIN),
                    time_elapsed: p.time_elapsed,
                }
            }
            MessageType::StructureReplace => {
                let p: StructurePayload = decode_payload(&msg.payload)?;
                Self::StructureReplace { room, items: p.items }
            }
            MessageType::ItemReorder => {
                let p: ItemReorderPayload = decode_payload(&msg.payload)?;
                Self::ItemReorder {
                    room,
                    folder_index: usize::try_from(p.folder_index).unwrap_or(usize::MAX),
                    new_order: p.new_order,
                }
            }
            MessageType::FolderReorder => {
                let p: FolderReorderPayload = decode_payload(&msg.payload)?;
                Self::FolderReorder {
                    room,
                    new_order: p.new_order,
                }
            }
            MessageType::StatusUpdate => {
                let p: StatusPayload = decode_payload(&msg.payload)?;
                Self::Status {
                    room,
                    status: p.status,
                }
            }
            _ => return Err(ProtocolError::InvalidMessageType),
        };
        Ok(event)
    }
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room_id: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn empty(msg_type: MessageType, peer_id: Uuid, room_id: Uuid) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id,
            payload: Vec::new(),
        }
    }

    /// Create a room join announcement.
    pub fn join(info: &PeerInfo, room_id: Uuid) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Join,
            peer_id: info.peer_id,
            room_id,
            payload: encode_payload(info)?,
        })
    }

    /// Create a room leave notification.
    pub fn leave(peer_id: Uuid, room_id: Uuid) -> Self {
        Self::empty(MessageType::Leave, peer_id, room_id)
    }

    pub fn snapshot_request(peer_id: Uuid, room_id: Uuid) -> Self {
        Self::empty(MessageType::SnapshotRequest, peer_id, room_id)
    }

    pub fn snapshot_response(room_id: Uuid, snapshot: &TimerSnapshot) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SnapshotResponse,
            peer_id: Uuid::nil(),
            room_id,
            payload: encode_payload(snapshot)?,
        })
    }

    pub fn document_request(peer_id: Uuid, room_id: Uuid) -> Self {
        Self::empty(MessageType::DocumentRequest, peer_id, room_id)
    }

    pub fn document_response(room_id: Uuid, rundown: Option<&Rundown>) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::DocumentResponse,
            peer_id: Uuid::nil(),
            room_id,
            payload: encode_payload(&rundown)?,
        })
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, peer_id, Uuid::nil())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, peer_id, Uuid::nil())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse snapshot payload.
    pub fn timer_snapshot(&self) -> Result<TimerSnapshot, ProtocolError> {
        if self.msg_type != MessageType::SnapshotResponse {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse document payload.
    pub fn rundown(&self) -> Result<Option<Rundown>, ProtocolError> {
        if self.msg_type != MessageType::DocumentResponse {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
