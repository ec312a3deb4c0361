//! Error types for the sync server.
//!
//! `SyncError` is scoped to one client group: every variant maps to a wire
//! [`ErrorKind`] and is delivered to the group's clients before their sockets
//! close. `ReplicationError` is fatal at process scope since the replica must
//! stay consistent with the upstream.

use viewsync_core::error::{IvmError, ProtocolError, VersionError};
use viewsync_core::messages::ErrorKind;
use viewsync_core::CvrVersion;

/// Errors surfaced to clients of a single client group.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid connection request: {0}")]
    InvalidConnectionRequest(String),

    #[error("schema version {requested} is not supported (supported: {min}..={max})")]
    SchemaVersionNotSupported { requested: u32, min: u32, max: u32 },

    /// The client's cookie predates retained history. Not fatal: the caller
    /// answers with a full resync.
    #[error("cookie {base} predates retained history starting at {floor}")]
    ReplicationGap { base: CvrVersion, floor: CvrVersion },

    #[error(transparent)]
    OperatorInvariant(#[from] IvmError),

    #[error("client group {0} not found")]
    ClientNotFound(String),

    #[error("invalid push: {0}")]
    InvalidPush(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Wire category reported to the client.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Protocol(_) => ErrorKind::InvalidMessage,
            SyncError::InvalidConnectionRequest(_) => ErrorKind::InvalidConnectionRequest,
            SyncError::SchemaVersionNotSupported { .. } => ErrorKind::SchemaVersionNotSupported,
            SyncError::ClientNotFound(_) => ErrorKind::ClientNotFound,
            SyncError::InvalidPush(_) => ErrorKind::InvalidPush,
            // Queries naming unknown tables or columns are the client's fault.
            SyncError::OperatorInvariant(
                IvmError::UnknownTable(_) | IvmError::UnknownColumn { .. } | IvmError::InvalidQuery(_),
            ) => ErrorKind::InvalidMessage,
            SyncError::ReplicationGap { .. }
            | SyncError::OperatorInvariant(_)
            | SyncError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<VersionError> for SyncError {
    fn from(e: VersionError) -> Self {
        SyncError::InvalidConnectionRequest(e.to_string())
    }
}

/// Errors from the replication path. Any of these stops the replicator; the
/// process restarts and resumes from the last persisted watermark.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("begin at {lsn} while transaction {open} is still open")]
    NestedBegin { open: String, lsn: String },

    #[error("{event} outside of a transaction")]
    OutsideTransaction { event: &'static str },

    #[error("commit {commit} does not advance past {previous}")]
    NonMonotonicCommit { previous: String, commit: String },

    /// The subscriber fell behind the retained backlog.
    #[error("backlog no longer holds transactions after {from}")]
    BacklogExhausted { from: String },

    #[error("no primary key known for table {0}")]
    UnknownPrimaryKey(String),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Storage failures that callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Another writer flushed the record since it was loaded.
    #[error("client view record {client_group} was advanced to {actual:?} (expected {expected:?})")]
    Conflict {
        client_group: String,
        expected: Option<String>,
        actual: Option<String>,
    },
}
