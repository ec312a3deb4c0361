//! Patch operations carried by pokes and desired-query updates.
//!
//! Both kinds are tagged by `op` and use camelCase field names.

use serde::{Deserialize, Serialize};

use crate::ast::Ast;
use crate::data::Row;

/// One change to a client's row cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RowPatchOp {
    /// Insert or replace the whole row.
    #[serde(rename_all = "camelCase")]
    Put { table_name: String, value: Row },

    /// Merge columns into an existing row.
    #[serde(rename_all = "camelCase")]
    Update {
        table_name: String,
        id: Row,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge: Option<Row>,
        /// Columns to keep; everything else is dropped.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        constrain: Option<Vec<String>>,
    },

    #[serde(rename_all = "camelCase")]
    Del { table_name: String, id: Row },

    /// Drop every cached row.
    Clear,
}

impl RowPatchOp {
    /// Table the op applies to, `None` for `clear`.
    #[must_use]
    pub fn table_name(&self) -> Option<&str> {
        match self {
            RowPatchOp::Put { table_name, .. }
            | RowPatchOp::Update { table_name, .. }
            | RowPatchOp::Del { table_name, .. } => Some(table_name),
            RowPatchOp::Clear => None,
        }
    }
}

/// One change to a set of queries, desired or got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum QueryPatchOp {
    Put {
        hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ast: Option<Ast>,
    },
    Del {
        hash: String,
    },
    Clear,
}

impl QueryPatchOp {
    #[must_use]
    pub fn put(hash: impl Into<String>, ast: Ast) -> Self {
        QueryPatchOp::Put {
            hash: hash.into(),
            ast: Some(ast),
        }
    }

    #[must_use]
    pub fn del(hash: impl Into<String>) -> Self {
        QueryPatchOp::Del { hash: hash.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::make_row;

    #[test]
    fn row_ops_use_camel_case_and_op_tag() {
        let put = RowPatchOp::Put {
            table_name: "issue".into(),
            value: make_row([("id", 1)]),
        };
        assert_eq!(
            serde_json::to_value(&put).unwrap(),
            serde_json::json!({"op": "put", "tableName": "issue", "value": {"id": 1}})
        );
        let del: RowPatchOp =
            serde_json::from_str(r#"{"op":"del","tableName":"issue","id":{"id":1}}"#).unwrap();
        assert_eq!(del.table_name(), Some("issue"));
        assert_eq!(
            serde_json::to_value(&RowPatchOp::Clear).unwrap(),
            serde_json::json!({"op": "clear"})
        );
    }

    #[test]
    fn query_put_carries_ast() {
        let op: QueryPatchOp =
            serde_json::from_str(r#"{"op":"put","hash":"h1","ast":{"table":"issue"}}"#).unwrap();
        assert_eq!(op, QueryPatchOp::put("h1", Ast::table("issue")));
    }
}
