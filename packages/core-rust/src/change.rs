//! The change vocabulary spoken between sources, operators, and views.

use crate::data::{Node, Row};

/// A change flowing out of an operator.
///
/// `Add` and `Remove` always carry the complete node, including its current
/// relationships at the time of the push. `Edit` keeps the primary key and
/// replaces the row contents in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Add(Node),
    Remove(Node),
    /// A change nested inside one relationship of the parent identified by `row`.
    Child { row: Row, child: ChildChange },
    Edit { old: Node, new: Node },
}

/// The nested part of a [`Change::Child`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildChange {
    pub relationship: String,
    pub change: Box<Change>,
}

impl Change {
    /// The row this change is about. For edits this is the new row.
    #[must_use]
    pub fn row(&self) -> &Row {
        match self {
            Change::Add(node) | Change::Remove(node) => &node.row,
            Change::Child { row, .. } => row,
            Change::Edit { new, .. } => &new.row,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Add(_) => "add",
            Change::Remove(_) => "remove",
            Change::Child { .. } => "child",
            Change::Edit { .. } => "edit",
        }
    }

    /// Wraps `change` as a child change of `parent` under `relationship`.
    #[must_use]
    pub fn child(parent: Row, relationship: &str, change: Change) -> Self {
        Change::Child {
            row: parent,
            child: ChildChange {
                relationship: relationship.to_string(),
                change: Box::new(change),
            },
        }
    }
}

/// A row-level change accepted by a source. Sources turn these into
/// [`Change`]s for each connected input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceChange {
    Add(Row),
    Remove(Row),
    Edit { old: Row, new: Row },
}

impl SourceChange {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SourceChange::Add(_) => "add",
            SourceChange::Remove(_) => "remove",
            SourceChange::Edit { .. } => "edit",
        }
    }

    #[must_use]
    pub fn into_change(self) -> Change {
        match self {
            SourceChange::Add(row) => Change::Add(Node::new(row)),
            SourceChange::Remove(row) => Change::Remove(Node::new(row)),
            SourceChange::Edit { old, new } => Change::Edit {
                old: Node::new(old),
                new: Node::new(new),
            },
        }
    }
}
