//! The query AST exchanged with clients and the server.
//!
//! This is a boundary datatype: it serializes to the camelCase wire shape
//! and is otherwise inert. Compilation into a dataflow pipeline lives in
//! the `dataflow` crate.

use relation::{OrderBy, Value};
use serde::{Deserialize, Serialize};

/// A declarative relational query over one table, with nested
/// relationship subqueries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ast {
    pub table: String,
    /// Alias naming this query's relationship when nested under `related`;
    /// defaults to the table name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub order_by: OrderBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_: Option<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<CorrelatedSubquery>,
}

impl Ast {
    pub fn new(table: &str, order_by: OrderBy) -> Self {
        Self {
            table: table.to_string(),
            alias: None,
            order_by,
            limit: None,
            where_: None,
            related: Vec::new(),
        }
    }

    /// The relationship name this query contributes when nested.
    pub fn relationship_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

/// A boolean filter expression over the columns of one row, possibly
/// including correlated sub-EXISTS terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    Simple(SimpleCondition),
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    #[serde(rename = "correlatedSubquery")]
    Subquery(SubqueryCondition),
}

impl Condition {
    /// Conjoin conditions, flattening nested ANDs and collapsing the
    /// degenerate arities: zero conditions is TRUE, one is itself.
    pub fn and(conditions: Vec<Condition>) -> Condition {
        let mut flat = Vec::with_capacity(conditions.len());
        for condition in conditions {
            match condition {
                Condition::And { conditions } => flat.extend(conditions),
                other => flat.push(other),
            }
        }
        match flat.len() {
            1 => flat.pop().unwrap(),
            _ => Condition::And { conditions: flat },
        }
    }

    /// Disjoin conditions, flattening nested ORs and collapsing the
    /// degenerate arities: zero conditions is FALSE, one is itself.
    pub fn or(conditions: Vec<Condition>) -> Condition {
        let mut flat = Vec::with_capacity(conditions.len());
        for condition in conditions {
            match condition {
                Condition::Or { conditions } => flat.extend(conditions),
                other => flat.push(other),
            }
        }
        match flat.len() {
            1 => flat.pop().unwrap(),
            _ => Condition::Or { conditions: flat },
        }
    }

    pub fn cmp(field: &str, op: SimpleOp, value: impl Into<Value>) -> Condition {
        Condition::Simple(SimpleCondition {
            field: field.to_string(),
            op,
            value: Operand::Literal {
                value: value.into(),
            },
        })
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Condition {
        Self::cmp(field, SimpleOp::Eq, value)
    }
}

/// One comparison of a row column against a literal or a sibling column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleCondition {
    pub field: String,
    pub op: SimpleOp,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operand {
    Literal { value: Value },
    Column { name: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimpleOp {
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
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "ILIKE")]
    Ilike,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT IN")]
    NotIn,
}

/// A correlated EXISTS / NOT EXISTS term of a `where` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubqueryCondition {
    pub related: CorrelatedSubquery,
    pub op: ExistsOp,
    /// When set, the pipeline is driven from the child side of the join.
    #[serde(default)]
    pub flip: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistsOp {
    #[serde(rename = "EXISTS")]
    Exists,
    #[serde(rename = "NOT_EXISTS")]
    NotExists,
}

/// A subquery correlated to its parent by field equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatedSubquery {
    pub correlation: Correlation,
    pub subquery: Box<Ast>,
    #[serde(default)]
    pub system: System,
    /// Hidden relationships exist only to drive a filter; they are not
    /// part of the materialized result shape.
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    pub parent_field: Vec<String>,
    pub child_field: Vec<String>,
}

impl Correlation {
    pub fn new(parent_field: &[&str], child_field: &[&str]) -> Self {
        Self {
            parent_field: parent_field.iter().map(|f| f.to_string()).collect(),
            child_field: child_field.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum System {
    #[default]
    Client,
    Permissions,
    Test,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use relation::{OrderBy, OrderPart};
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let ast = Ast {
            table: "issue".to_string(),
            alias: None,
            order_by: OrderBy::new(vec![OrderPart::asc("id")]),
            limit: Some(10),
            where_: Some(Condition::and(vec![
                Condition::eq("open", true),
                Condition::cmp("priority", SimpleOp::Ge, 2i64),
            ])),
            related: vec![CorrelatedSubquery {
                correlation: Correlation::new(&["id"], &["issueID"]),
                subquery: Box::new(Ast::new("comment", OrderBy::new(vec![OrderPart::asc("id")]))),
                system: System::Client,
                hidden: false,
            }],
        };

        assert_eq!(
            serde_json::to_value(&ast).unwrap(),
            json!({
                "table": "issue",
                "orderBy": [{"column": "id", "direction": "asc"}],
                "limit": 10,
                "where": {
                    "type": "and",
                    "conditions": [
                        {"type": "simple", "field": "open", "op": "=",
                         "value": {"type": "literal", "value": true}},
                        {"type": "simple", "field": "priority", "op": ">=",
                         "value": {"type": "literal", "value": 2.0}},
                    ],
                },
                "related": [{
                    "correlation": {"parentField": ["id"], "childField": ["issueID"]},
                    "subquery": {
                        "table": "comment",
                        "orderBy": [{"column": "id", "direction": "asc"}],
                    },
                    "system": "client",
                    "hidden": false,
                }],
            })
        );

        let round: Ast = serde_json::from_value(serde_json::to_value(&ast).unwrap()).unwrap();
        assert_eq!(round, ast);
    }

    #[test]
    fn test_and_or_collapse() {
        let c = Condition::eq("a", 1i64);

        assert_eq!(Condition::and(vec![c.clone()]), c);
        assert_eq!(Condition::or(vec![c.clone()]), c);
        assert_eq!(
            Condition::and(vec![]),
            Condition::And { conditions: vec![] }
        );

        // Nested conjunctions flatten.
        let nested = Condition::and(vec![
            Condition::and(vec![c.clone(), c.clone()]),
            c.clone(),
        ]);
        match nested {
            Condition::And { conditions } => assert_eq!(conditions.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_relationship_name() {
        let mut ast = Ast::new("comment", OrderBy::new(vec![OrderPart::asc("id")]));
        assert_eq!(ast.relationship_name(), "comment");
        ast.alias = Some("replies".to_string());
        assert_eq!(ast.relationship_name(), "replies");
    }
}
