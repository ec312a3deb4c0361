//! Upstream replication events.

use serde::{Deserialize, Serialize};
use viewsync_core::data::Row;

/// Table holding each client's last applied mutation id. Always replicated.
pub const CLIENTS_TABLE: &str = "_clients";

/// One event of the upstream logical replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeSourceEvent {
    Begin {
        lsn: String,
    },
    Insert {
        table: String,
        row: Row,
    },
    /// `old_key` is set when the primary key changed.
    #[serde(rename_all = "camelCase")]
    Update {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_key: Option<Row>,
        row: Row,
    },
    Delete {
        table: String,
        key: Row,
    },
    Truncate {
        tables: Vec<String>,
    },
    Commit {
        lsn: String,
    },
}

impl ChangeSourceEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeSourceEvent::Begin { .. } => "begin",
            ChangeSourceEvent::Insert { .. } => "insert",
            ChangeSourceEvent::Update { .. } => "update",
            ChangeSourceEvent::Delete { .. } => "delete",
            ChangeSourceEvent::Truncate { .. } => "truncate",
            ChangeSourceEvent::Commit { .. } => "commit",
        }
    }

    /// The data part of the event, `None` for begin and commit.
    #[must_use]
    pub fn into_data(self) -> Option<DataChange> {
        match self {
            ChangeSourceEvent::Insert { table, row } => Some(DataChange::Insert { table, row }),
            ChangeSourceEvent::Update {
                table,
                old_key,
                row,
            } => Some(DataChange::Update {
                table,
                old_key,
                row,
            }),
            ChangeSourceEvent::Delete { table, key } => Some(DataChange::Delete { table, key }),
            ChangeSourceEvent::Truncate { tables } => Some(DataChange::Truncate { tables }),
            ChangeSourceEvent::Begin { .. } | ChangeSourceEvent::Commit { .. } => None,
        }
    }
}

/// A data event buffered inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChange {
    Insert {
        table: String,
        row: Row,
    },
    Update {
        table: String,
        old_key: Option<Row>,
        row: Row,
    },
    Delete {
        table: String,
        key: Row,
    },
    Truncate {
        tables: Vec<String>,
    },
}

/// Tables replicated into a shard. An empty list replicates everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publications {
    tables: Vec<String>,
}

impl Publications {
    #[must_use]
    pub fn new(tables: Vec<String>) -> Self {
        Self { tables }
    }

    #[must_use]
    pub fn includes(&self, table: &str) -> bool {
        self.tables.is_empty() || table == CLIENTS_TABLE || self.tables.iter().any(|t| t == table)
    }

    /// Drops the parts of `change` outside the publications.
    #[must_use]
    pub fn filter(&self, change: DataChange) -> Option<DataChange> {
        match change {
            DataChange::Truncate { tables } => {
                let tables: Vec<String> = tables.into_iter().filter(|t| self.includes(t)).collect();
                (!tables.is_empty()).then_some(DataChange::Truncate { tables })
            }
            DataChange::Insert { ref table, .. }
            | DataChange::Update { ref table, .. }
            | DataChange::Delete { ref table, .. } => self.includes(table).then_some(change),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viewsync_core::data::make_row;

    #[test]
    fn events_parse_from_json_lines() {
        let update: ChangeSourceEvent = serde_json::from_str(
            r#"{"type":"update","table":"issue","oldKey":{"id":1},"row":{"id":2,"title":"x"}}"#,
        )
        .unwrap();
        assert_eq!(
            update,
            ChangeSourceEvent::Update {
                table: "issue".into(),
                old_key: Some(make_row([("id", 1)])),
                row: make_row([("id", viewsync_core::Value::from(2)), ("title", "x".into())]),
            }
        );
        let begin: ChangeSourceEvent = serde_json::from_str(r#"{"type":"begin","lsn":"0/A"}"#).unwrap();
        assert_eq!(begin.kind(), "begin");
        assert!(begin.into_data().is_none());
    }

    #[test]
    fn publications_filter_tables() {
        let all = Publications::default();
        assert!(all.includes("anything"));

        let some = Publications::new(vec!["issue".into()]);
        assert!(some.includes("issue"));
        assert!(some.includes(CLIENTS_TABLE));
        assert!(!some.includes("user"));

        let truncate = DataChange::Truncate {
            tables: vec!["issue".into(), "user".into()],
        };
        assert_eq!(
            some.filter(truncate),
            Some(DataChange::Truncate {
                tables: vec!["issue".into()]
            })
        );
        let delete = DataChange::Delete {
            table: "user".into(),
            key: make_row([("id", 1)]),
        };
        assert_eq!(some.filter(delete), None);
    }
}
