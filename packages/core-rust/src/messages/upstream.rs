//! Client → server messages.

use serde::{Deserialize, Serialize};

use crate::data::Row;
use crate::messages::patch::QueryPatchOp;

/// Name of the built-in mutation that carries raw row writes.
pub const CRUD_MUTATION_NAME: &str = "_zero_crud";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Upstream {
    InitConnection(InitConnectionBody),
    ChangeDesiredQueries(ChangeDesiredQueriesBody),
    Push(PushBody),
    Pull(PullBody),
    Ping,
}

impl Upstream {
    /// Wire tag, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Upstream::InitConnection(_) => "initConnection",
            Upstream::ChangeDesiredQueries(_) => "changeDesiredQueries",
            Upstream::Push(_) => "push",
            Upstream::Pull(_) => "pull",
            Upstream::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConnectionBody {
    #[serde(default)]
    pub desired_queries_patch: Vec<QueryPatchOp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDesiredQueriesBody {
    pub desired_queries_patch: Vec<QueryPatchOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    pub mutations: Vec<Mutation>,
    #[serde(default)]
    pub push_version: u32,
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: u64,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    pub timestamp: u64,
}

impl Mutation {
    /// Decodes the arguments of a CRUD mutation. `None` for other mutations
    /// or malformed arguments.
    #[must_use]
    pub fn crud_args(&self) -> Option<CrudArgs> {
        if self.name != CRUD_MUTATION_NAME {
            return None;
        }
        serde_json::from_value(self.args.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrudArgs {
    pub ops: Vec<CrudOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudKind {
    /// Insert; a no-op if the key exists.
    Create,
    /// Upsert.
    Set,
    /// Merge into an existing row; a no-op if it is missing.
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrudOp {
    pub op: CrudKind,
    pub table_name: String,
    pub primary_key: Vec<String>,
    pub value: Row,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullBody {
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(rename = "requestID")]
    pub request_id: String,
}
