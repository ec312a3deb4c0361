//! Filter: a stateless where-clause.

use crate::change::Change;
use crate::error::IvmError;
use crate::ivm::operator::{BoxedOperator, FetchRequest, Operator, SourcePush};
use crate::ivm::predicate::Predicate;
use crate::schema::SourceSchema;
use crate::stream::Stream;

pub struct Filter {
    input: BoxedOperator,
    predicate: Predicate,
}

impl Filter {
    #[must_use]
    pub fn new(input: BoxedOperator, predicate: Predicate) -> Self {
        Self { input, predicate }
    }

    /// Filters one change. An edit that crosses the predicate is split into
    /// the remove or add the output actually sees.
    fn apply(&self, change: Change, out: &mut Vec<Change>) {
        match change {
            Change::Edit { old, new } => {
                let before = self.predicate.matches(&old.row);
                let after = self.predicate.matches(&new.row);
                match (before, after) {
                    (true, true) => out.push(Change::Edit { old, new }),
                    (true, false) => out.push(Change::Remove(old)),
                    (false, true) => out.push(Change::Add(new)),
                    (false, false) => {}
                }
            }
            other => {
                if self.predicate.matches(other.row()) {
                    out.push(other);
                }
            }
        }
    }
}

impl Operator for Filter {
    fn schema(&self) -> &SourceSchema {
        self.input.schema()
    }

    fn fetch(&self, req: &FetchRequest) -> Stream<'_> {
        Box::new(
            self.input
                .fetch(req)
                .filter(|node| self.predicate.matches(&node.row)),
        )
    }

    fn cleanup(&self, req: &FetchRequest) -> Stream<'_> {
        Box::new(
            self.input
                .cleanup(req)
                .filter(|node| self.predicate.matches(&node.row)),
        )
    }

    fn push(&mut self, push: &SourcePush) -> Result<Vec<Change>, IvmError> {
        let mut out = Vec::new();
        for change in self.input.push(push)? {
            self.apply(change, &mut out);
        }
        Ok(out)
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }
}
