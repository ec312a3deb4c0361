//! Compiled where-clause predicates.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};

use crate::ast::{Condition, ConjunctionOperator, SimpleOperator};
use crate::data::Row;
use crate::error::IvmError;
use crate::types::{compare_values, Value};

/// A where-clause compiled for repeated evaluation. `LIKE` patterns are
/// translated to regexes once, at compile time.
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        field: String,
        op: SimpleOperator,
        value: Value,
    },
    Like {
        field: String,
        pattern: Regex,
        negate: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Compiles a condition.
    ///
    /// # Errors
    ///
    /// Returns [`IvmError::InvalidQuery`] for a `LIKE` with a non-string
    /// pattern or an `IN` without an array operand.
    pub fn compile(condition: &Condition) -> Result<Self, IvmError> {
        match condition {
            Condition::Simple { field, op, value } => match op {
                SimpleOperator::Like
                | SimpleOperator::NotLike
                | SimpleOperator::ILike
                | SimpleOperator::NotILike => {
                    let Some(pattern) = value.as_str() else {
                        return Err(IvmError::InvalidQuery(format!(
                            "LIKE pattern for {field} must be a string"
                        )));
                    };
                    let insensitive = matches!(op, SimpleOperator::ILike | SimpleOperator::NotILike);
                    Ok(Predicate::Like {
                        field: field.clone(),
                        pattern: like_regex(pattern, insensitive)?,
                        negate: matches!(op, SimpleOperator::NotLike | SimpleOperator::NotILike),
                    })
                }
                SimpleOperator::In | SimpleOperator::NotIn if !matches!(value, Value::Array(_)) => {
                    Err(IvmError::InvalidQuery(format!(
                        "IN operand for {field} must be an array"
                    )))
                }
                _ => Ok(Predicate::Compare {
                    field: field.clone(),
                    op: *op,
                    value: value.clone(),
                }),
            },
            Condition::Conjunction { op, conditions } => {
                let parts = conditions
                    .iter()
                    .map(Predicate::compile)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(match op {
                    ConjunctionOperator::And => Predicate::And(parts),
                    ConjunctionOperator::Or => Predicate::Or(parts),
                })
            }
        }
    }

    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        static NULL: Value = Value::Null;
        match self {
            Predicate::Compare { field, op, value } => {
                compare(row.get(field).unwrap_or(&NULL), *op, value)
            }
            Predicate::Like {
                field,
                pattern,
                negate,
            } => match row.get(field).and_then(Value::as_str) {
                Some(s) => pattern.is_match(s) != *negate,
                None => false,
            },
            Predicate::And(parts) => parts.iter().all(|p| p.matches(row)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(row)),
        }
    }
}

fn compare(lhs: &Value, op: SimpleOperator, rhs: &Value) -> bool {
    match op {
        SimpleOperator::Is => compare_values(lhs, rhs) == Ordering::Equal,
        SimpleOperator::IsNot => compare_values(lhs, rhs) != Ordering::Equal,
        _ if lhs.is_null() => false,
        SimpleOperator::In | SimpleOperator::NotIn => {
            let Value::Array(items) = rhs else {
                return false;
            };
            let found = items
                .iter()
                .any(|v| !v.is_null() && compare_values(lhs, v) == Ordering::Equal);
            found == (op == SimpleOperator::In)
        }
        _ if rhs.is_null() => false,
        SimpleOperator::Eq => compare_values(lhs, rhs) == Ordering::Equal,
        SimpleOperator::Ne => compare_values(lhs, rhs) != Ordering::Equal,
        // Ordering comparisons only hold between values of the same kind.
        _ if std::mem::discriminant(lhs) != std::mem::discriminant(rhs)
            && lhs.as_f64().zip(rhs.as_f64()).is_none() =>
        {
            false
        }
        SimpleOperator::Lt => compare_values(lhs, rhs) == Ordering::Less,
        SimpleOperator::Le => compare_values(lhs, rhs) != Ordering::Greater,
        SimpleOperator::Gt => compare_values(lhs, rhs) == Ordering::Greater,
        SimpleOperator::Ge => compare_values(lhs, rhs) != Ordering::Less,
        SimpleOperator::Like
        | SimpleOperator::NotLike
        | SimpleOperator::ILike
        | SimpleOperator::NotILike => false,
    }
}

/// Translates a SQL `LIKE` pattern: `%` matches any run, `_` any single
/// character, and `\` escapes the next character.
fn like_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, IvmError> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    RegexBuilder::new(&out)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| IvmError::InvalidQuery(format!("bad LIKE pattern {pattern:?}: {e}")))
}
