//! Query AST: the JSON shape clients send in desired-query patches.
//!
//! Queries are identified by the hash of their normalized form, so two ASTs
//! that differ only in the order of `AND`/`OR` operands, or in redundant
//! nesting, share one pipeline and one CVR entry.

use serde::{Deserialize, Deserializer, Serialize};

use crate::schema::OrderBy;
use crate::types::Value;

/// A relational query over one table, with nested relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ast {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<Join>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: OrderBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate: Vec<Aggregation>,
}

/// A where-clause condition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    Simple {
        field: String,
        op: SimpleOperator,
        value: Value,
    },
    Conjunction {
        op: ConjunctionOperator,
        conditions: Vec<Condition>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SimpleOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT IN")]
    NotIn,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "NOT LIKE")]
    NotLike,
    #[serde(rename = "ILIKE")]
    ILike,
    #[serde(rename = "NOT ILIKE")]
    NotILike,
    #[serde(rename = "IS")]
    Is,
    #[serde(rename = "IS NOT")]
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConjunctionOperator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// A relationship from the parent query to a child query.
///
/// Without a junction, `source_key[i]` on the parent equals `dest_key[i]` on
/// the child. With a junction, the parent joins to the junction table on
/// `source_key` = `junction.source_key`, and the junction joins to the child on
/// `junction.dest_key` = `dest_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    pub relationship: String,
    #[serde(deserialize_with = "key_list")]
    pub source_key: Vec<String>,
    #[serde(deserialize_with = "key_list")]
    pub dest_key: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub junction: Option<Junction>,
    /// Views render a singular relationship as one entry or `null`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub singular: bool,
    pub other: Box<Ast>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Junction {
    pub table: String,
    #[serde(deserialize_with = "key_list")]
    pub source_key: Vec<String>,
    #[serde(deserialize_with = "key_list")]
    pub dest_key: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub aggregate: AggregateFn,
    pub alias: String,
}

/// Keys may be written as a single column name or a list.
fn key_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum KeyRepr {
        One(String),
        Many(Vec<String>),
    }
    Ok(match KeyRepr::deserialize(deserializer)? {
        KeyRepr::One(k) => vec![k],
        KeyRepr::Many(ks) => ks,
    })
}

impl Ast {
    /// Shorthand for a bare table scan.
    #[must_use]
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            select: None,
            where_clause: None,
            joins: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            group_by: None,
            aggregate: Vec::new(),
        }
    }

    /// Returns the canonical form of this AST.
    ///
    /// Conditions are flattened and sorted, single-operand conjunctions
    /// collapse, joins are sorted by relationship name and `select` /
    /// `groupBy` column lists are sorted. `orderBy` is kept as written since
    /// its order is significant.
    #[must_use]
    pub fn normalize(&self) -> Self {
        let mut ast = self.clone();
        ast.where_clause = ast.where_clause.map(Condition::normalize);
        if let Some(select) = &mut ast.select {
            select.sort();
            select.dedup();
        }
        if let Some(group_by) = &mut ast.group_by {
            group_by.sort();
            group_by.dedup();
        }
        ast.aggregate.sort_by(|a, b| a.alias.cmp(&b.alias));
        for join in &mut ast.joins {
            join.other = Box::new(join.other.normalize());
        }
        ast.joins.sort_by(|a, b| a.relationship.cmp(&b.relationship));
        ast
    }

    /// Stable identifier of the normalized query: the first 16 hex chars of
    /// its blake3 digest.
    #[must_use]
    pub fn hash(&self) -> String {
        let normalized = self.normalize();
        // Only non-finite floats fail to serialize.
        let bytes = serde_json::to_vec(&normalized).unwrap_or_default();
        let digest = blake3::hash(&bytes);
        digest.to_hex().as_str()[..16].to_string()
    }
}

impl Condition {
    #[must_use]
    pub fn simple(field: &str, op: SimpleOperator, value: impl Into<Value>) -> Self {
        Condition::Simple {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Conjunction {
            op: ConjunctionOperator::And,
            conditions,
        }
    }

    #[must_use]
    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Conjunction {
            op: ConjunctionOperator::Or,
            conditions,
        }
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        match self {
            simple @ Condition::Simple { .. } => simple,
            Condition::Conjunction { op, conditions } => {
                let mut flat = Vec::with_capacity(conditions.len());
                for c in conditions.into_iter().map(Condition::normalize) {
                    match c {
                        Condition::Conjunction {
                            op: inner,
                            conditions,
                        } if inner == op => flat.extend(conditions),
                        other => flat.push(other),
                    }
                }
                flat.sort();
                flat.dedup();
                if flat.len() == 1 {
                    flat.remove(0)
                } else {
                    Condition::Conjunction {
                        op,
                        conditions: flat,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Direction;

    #[test]
    fn parses_client_json() {
        let json = r#"{
            "table": "issue",
            "where": {"type": "conjunction", "op": "AND", "conditions": [
                {"type": "simple", "field": "open", "op": "=", "value": true},
                {"type": "simple", "field": "title", "op": "ILIKE", "value": "%bug%"}
            ]},
            "joins": [{
                "relationship": "comments",
                "sourceKey": "id",
                "destKey": ["issueID"],
                "other": {"table": "comment", "orderBy": [["created", "desc"]]}
            }],
            "orderBy": [["modified", "desc"]],
            "limit": 5
        }"#;
        let ast: Ast = serde_json::from_str(json).unwrap();
        assert_eq!(ast.limit, Some(5));
        assert_eq!(ast.order_by, vec![("modified".to_string(), Direction::Desc)]);
        assert_eq!(ast.joins[0].source_key, vec!["id".to_string()]);
        assert_eq!(ast.joins[0].other.order_by[0].1, Direction::Desc);
        assert!(matches!(
            ast.where_clause,
            Some(Condition::Conjunction { op: ConjunctionOperator::And, .. })
        ));
    }

    #[test]
    fn equivalent_conditions_hash_equally() {
        let a = Condition::simple("a", SimpleOperator::Eq, 1);
        let b = Condition::simple("b", SimpleOperator::Gt, 2);
        let c = Condition::simple("c", SimpleOperator::Lt, 3);

        let mut left = Ast::table("t");
        left.where_clause = Some(Condition::and(vec![
            a.clone(),
            Condition::and(vec![b.clone(), c.clone()]),
        ]));
        let mut right = Ast::table("t");
        right.where_clause = Some(Condition::and(vec![c, a, b]));

        assert_eq!(left.hash(), right.hash());
        assert_eq!(left.hash().len(), 16);
    }

    #[test]
    fn single_operand_conjunction_collapses() {
        let a = Condition::simple("a", SimpleOperator::Eq, 1);
        assert_eq!(Condition::or(vec![a.clone()]).normalize(), a);
    }

    #[test]
    fn order_by_is_significant() {
        let mut asc = Ast::table("t");
        asc.order_by = vec![("a".into(), Direction::Asc), ("b".into(), Direction::Asc)];
        let mut swapped = Ast::table("t");
        swapped.order_by = vec![("b".into(), Direction::Asc), ("a".into(), Direction::Asc)];
        assert_ne!(asc.hash(), swapped.hash());
    }
}
