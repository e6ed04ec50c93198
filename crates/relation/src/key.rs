use crate::{compare, Row, Value};
use std::cmp::Ordering;

/// RowKey is the tuple of key-column values extracted from a row.
/// It is the identity of a row within its table: the primary index is
/// ordered on it, view nodes are folded by it, and operators key their
/// internal state on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey(Box<[Value]>);

impl RowKey {
    /// Extract the key tuple for `columns` from `row`.
    /// Absent columns extract as `Null`.
    pub fn extract(row: &Row, columns: &[String]) -> Self {
        Self(
            columns
                .iter()
                .map(|column| row.value_or_null(column).clone())
                .collect(),
        )
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.0.iter().map(Value::to_json).collect())
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Key tuples within one table always have equal arity; a length
        // tie-break keeps the order total regardless.
        for (l, r) in self.0.iter().zip(other.0.iter()) {
            match compare::values(l, r) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}
