//! Durable authoritative store behind the relay.
//!
//! ```text
//! ┌─────────────┐  room events   ┌──────────────┐
//! │ RelayServer │ ─────────────► │ RundownStore │
//! │ (fan-out)   │                │ (RocksDB)    │
//! └──────┬──────┘                └──────┬───────┘
//!        │ Snapshot/Document            │ column families
//!        │ requests                     ▼
//!        ▼                ┌──────────────────────────────────┐
//!   late joiner           │ CF "rundowns": LZ4 documents     │
//!                         │ CF "timers": TimerRecord         │
//!                         │ CF "metadata": version, sizes    │
//!                         └──────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{unix_millis, RundownMetadata, RundownStore, StoreConfig, StoreError, TimerRecord};
