use crate::join::JoinHandle;
use crate::operator::Constraint;
use query::System;
use relation::Row;
use std::collections::BTreeMap;

/// A row-level change applied to a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChange {
    Add(Row),
    Remove(Row),
    Edit { old: Row, new: Row },
}

impl SourceChange {
    /// The row this change is about; for edits, the new row.
    pub fn row(&self) -> &Row {
        match self {
            SourceChange::Add(row) | SourceChange::Remove(row) => row,
            SourceChange::Edit { new, .. } => new,
        }
    }
}

/// A lazy handle onto the children of one relationship of one node.
/// The producer is the owning join, addressed by handle; the constraint
/// pins the child rows correlated with the parent. The consumer drains it
/// on demand by routing a fetch through the pipeline root.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipRef {
    pub handle: JoinHandle,
    pub constraint: Constraint,
    pub system: System,
    /// Hidden relationships drive filters only and are absent from the
    /// materialized result shape.
    pub hidden: bool,
}

/// Node bundles a result row with its named, lazily-produced child
/// relationships.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub row: Row,
    pub relationships: BTreeMap<String, RelationshipRef>,
}

impl Node {
    pub fn bare(row: Row) -> Self {
        Self {
            row,
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_relationship(mut self, name: &str, rel: RelationshipRef) -> Self {
        self.relationships.insert(name.to_string(), rel);
        self
    }
}

/// Change is the push payload flowing through operators.
///
/// A `Remove` still carries enumerable relationships so downstream
/// consumers can reverse the node's effects. `Edit` never alters
/// relationships (key-changing edits are split into remove/add upstream).
/// `Child` nests a change of one relationship beneath its parent node.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Add(Node),
    Remove(Node),
    Edit { node: Node, old_node: Node },
    Child {
        node: Node,
        relationship: String,
        change: Box<Change>,
    },
}

impl Change {
    /// The node this change applies to at this level of nesting.
    pub fn node(&self) -> &Node {
        match self {
            Change::Add(node) | Change::Remove(node) => node,
            Change::Edit { node, .. } => node,
            Change::Child { node, .. } => node,
        }
    }
}
