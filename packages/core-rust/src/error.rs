//! Error types for the IVM engine, versions, and wire protocol.

/// Errors raised while compiling, hydrating, or pushing through an operator
/// graph.
///
/// An error returned from `push` leaves the operator's private index in an
/// undefined state. The owner must discard the subtree and rebuild it from a
/// fresh fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IvmError {
    #[error("row not found in {table}: {key}")]
    RowNotFound { table: String, key: String },

    #[error("operator invariant violated in {operator}: {detail}")]
    OperatorInvariant {
        operator: &'static str,
        detail: String,
    },

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("view is already hydrated")]
    AlreadyHydrated,

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl IvmError {
    pub(crate) fn invariant(operator: &'static str, detail: impl Into<String>) -> Self {
        IvmError::OperatorInvariant {
            operator,
            detail: detail.into(),
        }
    }
}

/// Errors parsing LSNs, lexicographic versions, and cookies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid LSN {0:?}: expected two hex halves separated by '/'")]
    InvalidLsn(String),

    #[error("invalid lexi version {0:?}")]
    InvalidLexi(String),

    #[error("invalid cookie {0:?}")]
    InvalidCookie(String),
}

/// Malformed upstream or downstream message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed MsgPack message: {0}")]
    MsgPack(#[from] rmp_serde::decode::Error),

    #[error("failed to encode message: {0}")]
    Encode(String),
}
