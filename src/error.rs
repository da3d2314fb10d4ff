//! The error taxonomy described in the synchronization design: one variant per
//! named error kind, so callers can match on *what kind* of failure occurred
//! rather than parsing message text. Component-internal helpers return
//! `anyhow::Result` and attach context; once an error crosses into the
//! Reconciler it is classified into one of these kinds.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("clock moved backward by {jump_ms}ms, exceeding the {limit_ms}ms fatal threshold")]
    ClockBackwardFatal { jump_ms: i64, limit_ms: i64 },

    #[error("HLC counter overflowed within a single millisecond")]
    ClockOverflow,

    #[error("clock offset unstable: interquartile range {iqr_ms}ms exceeds tolerance")]
    ClockUnstable { iqr_ms: i64 },

    #[error("waiting for master node to become reachable for calibration")]
    WaitingForMaster,

    #[error("timed out waiting for {expected}")]
    TransportTimeout { expected: &'static str },

    #[error("transport connection closed unexpectedly")]
    TransportClosed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("incompatible protocol version: local={local} remote={remote}")]
    IncompatibleVersion { local: u32, remote: u32 },

    #[error("checkpoint checksum mismatch for table '{table}'")]
    ChecksumMismatch { table: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("conflicting write detected on table '{table}'")]
    ConflictOnWrite { table: String },

    #[error("schema mismatch on table '{table}': {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("receiver staging area exceeded {limit_bytes} bytes (got {staged_bytes})")]
    StagingOverflow { staged_bytes: u64, limit_bytes: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether the session should be retried after this error, per the
    /// error-handling design: everything is retryable except a fatal clock
    /// jump, an incompatible peer, a schema mismatch, and a staging overflow
    /// (each needs operator intervention — a bare retry would just re-drill
    /// the same oversized range and overflow again).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::ClockBackwardFatal { .. }
                | SyncError::IncompatibleVersion { .. }
                | SyncError::SchemaMismatch { .. }
                | SyncError::StagingOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
