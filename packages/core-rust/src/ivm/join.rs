//! Join: attaches child nodes to parent nodes as a named relationship.
//!
//! Output is hierarchical rather than flat: every parent node carries the
//! children whose `child_key` columns equal its `parent_key` columns. A change
//! on the child side is re-emitted as a `Child` change rooted at each affected
//! parent, never as a parent remove/add.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::change::Change;
use crate::data::{correlate, row_key, rows_equal_on, Node, Row, RowKey};
use crate::error::IvmError;
use crate::ivm::operator::{BoxedOperator, FetchRequest, Operator, SourcePush};
use crate::schema::SourceSchema;
use crate::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Fetch,
    Cleanup,
}

/// Arguments for [`Join::new`].
pub struct JoinArgs {
    pub parent: BoxedOperator,
    pub child: BoxedOperator,
    /// Parent columns, matched position-wise with `child_key`.
    pub parent_key: Vec<String>,
    pub child_key: Vec<String>,
    pub relationship: String,
    /// Marks the output level as hidden (junction tables).
    pub hidden: bool,
}

pub struct Join {
    parent: BoxedOperator,
    child: BoxedOperator,
    parent_key: Vec<String>,
    child_key: Vec<String>,
    relationship: String,
    schema: SourceSchema,
    /// `(join values, parent primary key)` of every parent handed out by a
    /// fetch. Decides when the child side can release a partition.
    seen: Mutex<BTreeSet<(RowKey, RowKey)>>,
}

impl Join {
    /// # Errors
    ///
    /// Returns [`IvmError::InvalidQuery`] when the key lists differ in length
    /// or are empty.
    pub fn new(args: JoinArgs) -> Result<Self, IvmError> {
        if args.parent_key.len() != args.child_key.len() || args.parent_key.is_empty() {
            return Err(IvmError::InvalidQuery(format!(
                "relationship {} has mismatched join keys",
                args.relationship
            )));
        }
        let mut schema = args.parent.schema().clone();
        schema.is_hidden = args.hidden;
        schema
            .relationships
            .insert(args.relationship.clone(), args.child.schema().clone());
        Ok(Self {
            parent: args.parent,
            child: args.child,
            parent_key: args.parent_key,
            child_key: args.child_key,
            relationship: args.relationship,
            schema,
            seen: Mutex::new(BTreeSet::new()),
        })
    }

    fn process_parent(&self, node: Node, mode: Mode) -> Node {
        let Some(constraint) = correlate(&node.row, &self.parent_key, &self.child_key) else {
            // A null join value never matches.
            return node.with_relationship(self.relationship.clone(), Vec::new());
        };
        let join_values = row_key(&node.row, &self.parent_key);
        let pk = row_key(&node.row, &self.parent.schema().primary_key);

        let release = match mode {
            Mode::Fetch => {
                self.seen.lock().insert((join_values, pk));
                false
            }
            Mode::Cleanup => {
                let mut seen = self.seen.lock();
                let shared = seen
                    .range((join_values.clone(), RowKey::new())..)
                    .take_while(|(values, _)| *values == join_values)
                    .any(|(_, other)| *other != pk);
                seen.remove(&(join_values, pk));
                !shared
            }
        };

        let req = FetchRequest::constrained(constraint);
        let children: Vec<Node> = if release {
            self.child.cleanup(&req).collect()
        } else {
            self.child.fetch(&req).collect()
        };
        node.with_relationship(self.relationship.clone(), children)
    }

    fn push_parent(&self, change: Change, out: &mut Vec<Change>) {
        match change {
            Change::Add(node) => out.push(Change::Add(self.process_parent(node, Mode::Fetch))),
            Change::Remove(node) => {
                out.push(Change::Remove(self.process_parent(node, Mode::Cleanup)));
            }
            child @ Change::Child { .. } => out.push(child),
            Change::Edit { old, new } => {
                if rows_equal_on(&old.row, &new.row, &self.parent_key) {
                    let new = self.process_parent(new, Mode::Fetch);
                    let children = new
                        .relationships
                        .get(&self.relationship)
                        .cloned()
                        .unwrap_or_default();
                    let old = old.with_relationship(self.relationship.clone(), children);
                    out.push(Change::Edit { old, new });
                } else {
                    self.push_parent(Change::Remove(old), out);
                    self.push_parent(Change::Add(new), out);
                }
            }
        }
    }

    fn push_child(&self, change: Change, out: &mut Vec<Change>) {
        match change {
            Change::Edit { old, new } if !rows_equal_on(&old.row, &new.row, &self.child_key) => {
                // The child moved to a different parent.
                let old_row = old.row.clone();
                let new_row = new.row.clone();
                self.push_child_change(&old_row, Change::Remove(old), out);
                self.push_child_change(&new_row, Change::Add(new), out);
            }
            other => {
                let row = other.row().clone();
                self.push_child_change(&row, other, out);
            }
        }
    }

    fn push_child_change(&self, child_row: &Row, change: Change, out: &mut Vec<Change>) {
        let Some(constraint) = correlate(child_row, &self.child_key, &self.parent_key) else {
            return;
        };
        for parent in self.parent.fetch(&FetchRequest::constrained(constraint)) {
            out.push(Change::child(parent.row, &self.relationship, change.clone()));
        }
    }
}

impl Operator for Join {
    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn fetch(&self, req: &FetchRequest) -> Stream<'_> {
        Box::new(
            self.parent
                .fetch(req)
                .map(|node| self.process_parent(node, Mode::Fetch)),
        )
    }

    fn cleanup(&self, req: &FetchRequest) -> Stream<'_> {
        Box::new(
            self.parent
                .cleanup(req)
                .map(|node| self.process_parent(node, Mode::Cleanup)),
        )
    }

    fn push(&mut self, push: &SourcePush) -> Result<Vec<Change>, IvmError> {
        let mut out = Vec::new();
        for change in self.parent.push(push)? {
            self.push_parent(change, &mut out);
        }
        for change in self.child.push(push)? {
            self.push_child(change, &mut out);
        }
        Ok(out)
    }

    fn destroy(&mut self) {
        self.parent.destroy();
        self.child.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::change::SourceChange;
    use crate::data::make_row;
    use crate::ivm::source::{ChangeSink, MemorySource, Source};
    use crate::schema::{ColumnType, Direction, TableSpec};
    use crate::types::Value;

    struct Recorder {
        op: Mutex<Join>,
        out: Mutex<Vec<Change>>,
    }

    impl ChangeSink for Recorder {
        fn push(&self, push: &SourcePush) {
            let changes = self.op.lock().push(push).unwrap();
            self.out.lock().extend(changes);
        }
    }

    fn issue(id: i64) -> Row {
        make_row([("id", Value::from(id)), ("title", Value::from(format!("issue {id}")))])
    }

    fn comment(id: i64, issue_id: i64) -> Row {
        make_row([("id", Value::from(id)), ("issueID", Value::from(issue_id))])
    }

    fn setup() -> (MemorySource, MemorySource, Arc<Recorder>) {
        let issues = MemorySource::new(TableSpec::new(
            "issue",
            [("id", ColumnType::Number), ("title", ColumnType::String)],
            &["id"],
        ));
        let comments = MemorySource::new(TableSpec::new(
            "comment",
            [("id", ColumnType::Number), ("issueID", ColumnType::Number)],
            &["id"],
        ));
        issues.load([issue(1), issue(2)]);
        comments.load([comment(10, 1), comment(11, 1), comment(12, 1), comment(20, 2)]);

        let (issue_conn, parent) = issues.connect(&[]);
        let (comment_conn, child) = comments.connect(&[("id".to_string(), Direction::Asc)]);
        let join = Join::new(JoinArgs {
            parent,
            child,
            parent_key: vec!["id".into()],
            child_key: vec!["issueID".into()],
            relationship: "comments".into(),
            hidden: false,
        })
        .unwrap();
        let rec = Arc::new(Recorder {
            op: Mutex::new(join),
            out: Mutex::new(Vec::new()),
        });
        let sink: Arc<dyn ChangeSink> = rec.clone();
        issues.subscribe(issue_conn, Arc::downgrade(&sink));
        comments.subscribe(comment_conn, Arc::downgrade(&sink));
        (issues, comments, rec)
    }

    fn child_ids(node: &Node) -> Vec<i64> {
        node.relationships["comments"]
            .iter()
            .map(|c| c.row["id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn fetch_attaches_children() {
        let (_i, _c, rec) = setup();
        let nodes: Vec<Node> = rec.op.lock().fetch(&FetchRequest::default()).collect();
        assert_eq!(nodes.len(), 2);
        assert_eq!(child_ids(&nodes[0]), vec![10, 11, 12]);
        assert_eq!(child_ids(&nodes[1]), vec![20]);
        assert!(rec.op.lock().schema().relationships.contains_key("comments"));
    }

    #[test]
    fn removing_parent_emits_single_remove_with_children() {
        let (issues, _c, rec) = setup();
        let _ = rec.op.lock().fetch(&FetchRequest::default()).count();

        issues.push(SourceChange::Remove(issue(1)));
        issues.commit().unwrap();

        let out = rec.out.lock();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Change::Remove(node) => assert_eq!(child_ids(node), vec![10, 11, 12]),
            other => panic!("expected remove, got {other:?}"),
        }
    }

    #[test]
    fn child_add_becomes_child_change() {
        let (_i, comments, rec) = setup();
        let _ = rec.op.lock().fetch(&FetchRequest::default()).count();

        comments.push(SourceChange::Add(comment(21, 2)));
        comments.commit().unwrap();

        let out = rec.out.lock();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Change::Child { row, child } => {
                assert_eq!(row["id"], Value::from(2));
                assert_eq!(child.relationship, "comments");
                assert!(matches!(*child.change, Change::Add(_)));
            }
            other => panic!("expected child change, got {other:?}"),
        }
    }

    #[test]
    fn child_moving_between_parents_is_remove_then_add() {
        let (_i, comments, rec) = setup();
        comments.push(SourceChange::Edit {
            old: comment(20, 2),
            new: comment(20, 1),
        });
        comments.commit().unwrap();

        let out = rec.out.lock();
        let summary: Vec<(i64, &str)> = out
            .iter()
            .map(|c| match c {
                Change::Child { row, child } => (row["id"].as_i64().unwrap(), child.change.kind()),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(summary, vec![(2, "remove"), (1, "add")]);
    }

    #[test]
    fn parent_edit_keeping_key_is_forwarded_as_edit() {
        let (issues, _c, rec) = setup();
        let mut renamed = issue(2);
        renamed.insert("title".into(), Value::from("renamed"));
        issues.push(SourceChange::Edit {
            old: issue(2),
            new: renamed,
        });
        issues.commit().unwrap();
        let out = rec.out.lock();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Change::Edit { old, new } => {
                assert_eq!(child_ids(old), vec![20]);
                assert_eq!(child_ids(new), vec![20]);
            }
            other => panic!("expected edit, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_keys_are_rejected() {
        let issues = MemorySource::new(TableSpec::new("issue", [("id", ColumnType::Number)], &["id"]));
        let (_, parent) = issues.connect(&[]);
        let (_, child) = issues.connect(&[]);
        let err = Join::new(JoinArgs {
            parent,
            child,
            parent_key: vec!["id".into()],
            child_key: vec![],
            relationship: "self".into(),
            hidden: false,
        })
        .err()
        .unwrap();
        assert!(matches!(err, IvmError::InvalidQuery(_)));
    }
}
