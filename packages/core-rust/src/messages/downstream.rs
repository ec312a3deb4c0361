//! Server → client messages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::messages::patch::{QueryPatchOp, RowPatchOp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Downstream {
    Connected(ConnectedBody),
    Poke(PokeBody),
    PullResponse(PullResponseBody),
    Error(ErrorBody),
    Pong,
}

impl Downstream {
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Downstream::Error(ErrorBody {
            kind,
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedBody {
    pub wsid: String,
    pub timestamp: u64,
}

/// Everything a client needs to move from `base_cookie` to `cookie`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    /// `None` for a client that has no state yet.
    pub base_cookie: Option<String>,
    pub cookie: String,
    /// Desired-query changes per client of the group.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub desired_queries_patches: BTreeMap<String, Vec<QueryPatchOp>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub got_queries_patch: Vec<QueryPatchOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows_patch: Vec<RowPatchOp>,
    #[serde(
        default,
        rename = "lastMutationIDChanges",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub last_mutation_id_changes: BTreeMap<String, u64>,
}

impl PokeBody {
    /// `true` when the poke carries no patches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.desired_queries_patches.values().all(Vec::is_empty)
            && self.got_queries_patch.is_empty()
            && self.rows_patch.is_empty()
            && self.last_mutation_id_changes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponseBody {
    pub cookie: String,
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(default, rename = "lastMutationIDChanges")]
    pub last_mutation_id_changes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Error categories sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidConnectionRequest,
    InvalidMessage,
    SchemaVersionNotSupported,
    ClientNotFound,
    InvalidPush,
    Unauthorized,
    Internal,
}

impl ErrorKind {
    /// Wire name, as serialized.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidConnectionRequest => "InvalidConnectionRequest",
            ErrorKind::InvalidMessage => "InvalidMessage",
            ErrorKind::SchemaVersionNotSupported => "SchemaVersionNotSupported",
            ErrorKind::ClientNotFound => "ClientNotFound",
            ErrorKind::InvalidPush => "InvalidPush",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Internal => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::make_row;

    #[test]
    fn poke_omits_empty_patches() {
        let poke = Downstream::Poke(PokeBody {
            poke_id: "p1".into(),
            base_cookie: None,
            cookie: "01".into(),
            ..PokeBody::default()
        });
        assert_eq!(
            serde_json::to_value(&poke).unwrap(),
            serde_json::json!({"type": "poke", "pokeID": "p1", "baseCookie": null, "cookie": "01"})
        );
    }

    #[test]
    fn poke_with_rows() {
        let mut body = PokeBody {
            poke_id: "p2".into(),
            base_cookie: Some("01".into()),
            cookie: "02".into(),
            ..PokeBody::default()
        };
        assert!(body.is_empty());
        body.rows_patch.push(RowPatchOp::Put {
            table_name: "issue".into(),
            value: make_row([("id", 1)]),
        });
        body.last_mutation_id_changes.insert("c1".into(), 4);
        assert!(!body.is_empty());
        let json = serde_json::to_value(Downstream::Poke(body)).unwrap();
        assert_eq!(json["rowsPatch"][0]["op"], "put");
        assert_eq!(json["lastMutationIDChanges"]["c1"], 4);
    }

    #[test]
    fn error_kind_is_pascal_case() {
        let msg = Downstream::error(ErrorKind::SchemaVersionNotSupported, "too old");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({"type": "error", "kind": "SchemaVersionNotSupported", "message": "too old"})
        );
    }
}
