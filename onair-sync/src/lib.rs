//! # onair-sync: real-time sync for rundowns and the production clock
//!
//! Keeps every client's view of a rundown (structure, status, running
//! timer, cursor) convergent through a relay server.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                      ┌──────────────┐
//! │ SessionHandle│  commands / watch    │ Session task │
//! │ (UI)         │ ◄──────────────────► │ RundownEngine│
//! └──────────────┘                      └──────┬───────┘
//!                                              │ Transport
//!                                              ▼  (WebSocket, bincode)
//!                                       ┌──────────────┐
//!                                       │ RelayServer  │
//!                                       │ rooms fan-out│
//!                                       └──────┬───────┘
//!                                              │
//!                                       ┌──────┴───────┐
//!                                       │ RundownStore │
//!                                       │ (RocksDB)    │
//!                                       └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded SyncMessage, RoomEvent)
//! - [`broadcast`]: room-based fan-out with backpressure
//! - [`engine`]: reconciliation engine and timer state machine
//! - [`reorder`]: drop index, list moves, drag lock
//! - [`bootstrap`]: late-joiner snapshot and document fetch
//! - [`heartbeat`]: running-clock rebroadcast schedule
//! - [`transport`]: WebSocket client with reconnect
//! - [`session`]: per-client driver task and read model
//! - [`server`]: WebSocket relay
//! - [`storage`]: durable rundown and timer store

pub mod protocol;
pub mod config;
pub mod broadcast;
pub mod reorder;
pub mod heartbeat;
pub mod bootstrap;
pub mod engine;
pub mod storage;
pub mod transport;
pub mod session;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    MessageType, PeerInfo, PeerRole, ProtocolError, RoomEvent, SyncMessage, TimerSnapshot,
    TimerUpdate, FlatCursor, WireCursor,
};
pub use config::{EngineConfig, ServerConfig, TransportConfig};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use reorder::{drop_index, move_across, move_within, DragLock, SiblingBounds};
pub use heartbeat::Heartbeat;
pub use bootstrap::{bootstrap, BootstrapError, BootstrapOutcome, DocumentSource, SnapshotSource};
pub use engine::{Applied, IgnoreReason, Origin, Publisher, RecordingPublisher, RundownEngine};
pub use storage::{RundownMetadata, RundownStore, StoreConfig, StoreError, TimerRecord};
pub use transport::{ConnectionState, EventFilter, Inbound, Transport};
pub use session::{ReadModel, RoomLink, Session, SessionClosed, SessionHandle};
pub use server::{RelayServer, ServerStats};
