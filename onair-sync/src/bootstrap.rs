//! Late-joiner bootstrap: fetch the stored rundown and the authoritative
//! clock for a room, each bounded by a timeout.
//!
//! ```text
//!  attach(room) ──► join ──► ┌ load_document(room)  ┐  tokio::join!
//!                            └ fetch_snapshot(room) ┘  each under timeout
//!                                       │
//!                                       ▼
//!                       engine.complete_bootstrap(outcome)
//! ```
//!
//! Sources are traits so the same engine path runs against the relay (via
//! the client transport) or an in-process [`RundownStore`](crate::storage::RundownStore).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use onair_core::Rundown;
use uuid::Uuid;

use crate::protocol::{ProtocolError, TimerSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapError {
    /// No answer within the bootstrap timeout.
    Timeout,
    /// Source not reachable (disconnected transport, closed store).
    Unavailable(String),
    /// Nothing stored for this room.
    NotFound(Uuid),
    Protocol(String),
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "Bootstrap timed out"),
            Self::Unavailable(e) => write!(f, "Bootstrap source unavailable: {e}"),
            Self::NotFound(room) => write!(f, "Nothing stored for room {room}"),
            Self::Protocol(e) => write!(f, "Bootstrap protocol error: {e}"),
        }
    }
}

impl std::error::Error for BootstrapError {}

impl From<ProtocolError> for BootstrapError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Timeout => Self::Timeout,
            ProtocolError::ConnectionClosed => Self::Unavailable(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Authoritative timer state for a room.
pub trait SnapshotSource {
    fn fetch_snapshot(
        &self,
        room: Uuid,
    ) -> impl Future<Output = Result<TimerSnapshot, BootstrapError>> + Send;
}

/// Stored rundown for a room.
pub trait DocumentSource {
    fn load_document(&self, room: Uuid) -> impl Future<Output = Result<Rundown, BootstrapError>> + Send;
}

impl<T: SnapshotSource + Send + Sync> SnapshotSource for Arc<T> {
    fn fetch_snapshot(
        &self,
        room: Uuid,
    ) -> impl Future<Output = Result<TimerSnapshot, BootstrapError>> + Send {
        (**self).fetch_snapshot(room)
    }
}

impl<T: DocumentSource + Send + Sync> DocumentSource for Arc<T> {
    fn load_document(&self, room: Uuid) -> impl Future<Output = Result<Rundown, BootstrapError>> + Send {
        (**self).load_document(room)
    }
}

/// What a bootstrap produced. The two halves fail independently.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub room: Uuid,
    pub document: Result<Rundown, BootstrapError>,
    pub snapshot: Result<TimerSnapshot, BootstrapError>,
}

/// Fetch document and snapshot concurrently, each bounded by `limit`.
pub async fn bootstrap<S, D>(snapshots: &S, documents: &D, room: Uuid, limit: Duration) -> BootstrapOutcome
where
    S: SnapshotSource,
    D: DocumentSource,
{
    let (document, snapshot) = tokio::join!(
        with_timeout(limit, documents.load_document(room)),
        with_timeout(limit, snapshots.fetch_snapshot(room)),
    );
    log::info!(
        "Bootstrap for room {room}: document {}, snapshot {}",
        if document.is_ok() { "ok" } else { "failed" },
        if snapshot.is_ok() { "ok" } else { "failed" },
    );
    BootstrapOutcome {
        room,
        document,
        snapshot,
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, BootstrapError>>,
) -> Result<T, BootstrapError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(BootstrapError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use onair_core::Cursor;

    struct Fixed(TimerSnapshot);

    impl SnapshotSource for Fixed {
        async fn fetch_snapshot(&self, _room: Uuid) -> Result<TimerSnapshot, BootstrapError> {
            Ok(self.0)
        }
    }

    impl DocumentSource for Fixed {
        async fn load_document(&self, room: Uuid) -> Result<Rundown, BootstrapError> {
            Ok(Rundown::with_id(room, "Show", Vec::new()))
        }
    }

    struct Hanging;

    impl SnapshotSource for Hanging {
        async fn fetch_snapshot(&self, _room: Uuid) -> Result<TimerSnapshot, BootstrapError> {
            std::future::pending().await
        }
    }

    struct Missing;

    impl DocumentSource for Missing {
        async fn load_document(&self, room: Uuid) -> Result<Rundown, BootstrapError> {
            Err(BootstrapError::NotFound(room))
        }
    }

    fn snapshot() -> TimerSnapshot {
        TimerSnapshot {
            is_running: true,
            time_elapsed: 75,
            cursor: Cursor::new(0, 1),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_success() {
        let source = Fixed(snapshot());
        let room = Uuid::new_v4();
        let outcome = bootstrap(&source, &source, room, Duration::from_secs(5)).await;
        assert_eq!(outcome.room, room);
        assert_eq!(outcome.snapshot, Ok(snapshot()));
        assert_eq!(outcome.document.unwrap().id, room);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_snapshot_timeout() {
        let room = Uuid::new_v4();
        let docs = Arc::new(Fixed(snapshot()));
        let outcome = bootstrap(&Hanging, &docs, room, Duration::from_secs(5)).await;
        assert_eq!(outcome.snapshot, Err(BootstrapError::Timeout));
        assert!(outcome.document.is_ok());
    }

    #[tokio::test]
    async fn test_bootstrap_missing_document() {
        let room = Uuid::new_v4();
        let outcome = bootstrap(&Fixed(snapshot()), &Missing, room, Duration::from_secs(5)).await;
        assert_eq!(outcome.document, Err(BootstrapError::NotFound(room)));
        assert!(outcome.snapshot.is_ok());
    }

    #[test]
    fn test_protocol_error_mapping() {
        assert_eq!(
            BootstrapError::from(ProtocolError::Timeout),
            BootstrapError::Timeout
        );
        assert!(matches!(
            BootstrapError::from(ProtocolError::ConnectionClosed),
            BootstrapError::Unavailable(_)
        ));
    }
}
