//! Structured session events (§7 "User-visible behavior"), generalizing the
//! teacher's `TableSyncResult::{Success, Failure}` into the fuller event set
//! the design calls for. Delivered to the host through a broadcast channel
//! so multiple observers (a UI, a log sink) can subscribe independently.

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    SessionStarted {
        peer_id: uuid::Uuid,
        table: String,
    },
    SessionCompleted {
        peer_id: uuid::Uuid,
        table: String,
        bytes_exchanged: u64,
        rows_applied: u64,
    },
    SessionFailed {
        peer_id: uuid::Uuid,
        table: String,
        kind: String,
        detail: String,
    },
    AwaitingMaster {
        table: String,
    },
}

impl SyncEvent {
    pub fn failed(peer_id: uuid::Uuid, table: impl Into<String>, error: &SyncError) -> SyncEvent {
        SyncEvent::SessionFailed {
            peer_id,
            table: table.into(),
            kind: error_kind(error).to_string(),
            detail: error.to_string(),
        }
    }
}

/// Stable string tag for an error variant, independent of its `Display`
/// message, so hosts can match on *what kind* of failure occurred (§7)
/// without parsing free text.
fn error_kind(error: &SyncError) -> &'static str {
    match error {
        SyncError::ClockBackwardFatal { .. } => "ClockBackwardFatal",
        SyncError::ClockOverflow => "ClockOverflow",
        SyncError::ClockUnstable { .. } => "ClockUnstable",
        SyncError::WaitingForMaster => "WaitingForMaster",
        SyncError::TransportTimeout { .. } => "TransportTimeout",
        SyncError::TransportClosed => "TransportClosed",
        SyncError::ProtocolViolation(_) => "ProtocolViolation",
        SyncError::IncompatibleVersion { .. } => "IncompatibleVersion",
        SyncError::ChecksumMismatch { .. } => "ChecksumMismatch",
        SyncError::StorageUnavailable(_) => "StorageUnavailable",
        SyncError::ConflictOnWrite { .. } => "ConflictOnWrite",
        SyncError::SchemaMismatch { .. } => "SchemaMismatch",
        SyncError::StagingOverflow { .. } => "StagingOverflow",
        SyncError::Other(_) => "Other",
    }
}

/// A broadcast sender/receiver pair sized for a modest backlog of events;
/// slow subscribers miss old events rather than stalling the engine.
pub fn channel() -> (
    tokio::sync::broadcast::Sender<SyncEvent>,
    tokio::sync::broadcast::Receiver<SyncEvent>,
) {
    tokio::sync::broadcast::channel(256)
}
