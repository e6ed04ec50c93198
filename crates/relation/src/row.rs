use crate::Value;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;

static NULL: Value = Value::Null;

#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("a row must be a JSON object, not {0}")]
    NotAnObject(serde_json::Value),
}

/// Row is an immutable mapping from column name to [`Value`], shared by
/// reference. Rows are cheap to clone and are never mutated once emitted;
/// an edit is represented as a distinct old/new row pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row(Arc<BTreeMap<String, Value>>);

/// RowToken identifies one shared row allocation. Clones of a Row carry the
/// same token; structurally equal rows built independently do not.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RowToken(usize);

impl Row {
    pub fn new(columns: BTreeMap<String, Value>) -> Self {
        Self(Arc::new(columns))
    }

    /// Build a Row from a JSON object, mapping scalar members onto scalar
    /// values and nested structures onto opaque JSON.
    pub fn from_value(value: serde_json::Value) -> Result<Self, RowError> {
        match value {
            serde_json::Value::Object(fields) => Ok(Self::new(
                fields
                    .into_iter()
                    .map(|(column, value)| (column, Value::from_json(value)))
                    .collect(),
            )),
            other => Err(RowError::NotAnObject(other)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// The identity of this row's shared allocation.
    pub fn token(&self) -> RowToken {
        RowToken(Arc::as_ptr(&self.0) as usize)
    }

    /// Fetch a column value, treating an absent column as `Null`.
    pub fn value_or_null(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&NULL)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(column, value)| (column.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Enumerate the columns whose values differ between `self` and `other`.
    pub fn changed_columns<'s>(&'s self, other: &'s Row) -> impl Iterator<Item = &'s str> {
        self.0
            .iter()
            .filter(move |(column, value)| other.value_or_null(column) != *value)
            .map(|(column, _)| column.as_str())
            .chain(
                other
                    .0
                    .iter()
                    .filter(move |(column, _)| self.get(column).is_none())
                    .map(|(column, _)| column.as_str()),
            )
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(column, value)| (column.clone(), value.to_json()))
                .collect(),
        )
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(Arc::new(BTreeMap::deserialize(deserializer)?)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_from_value_and_access() {
        let row = Row::from_value(json!({"id": "i1", "score": 3, "tags": ["a"]})).unwrap();

        assert_eq!(row.get("id"), Some(&Value::from("i1")));
        assert_eq!(row.value_or_null("missing"), &Value::Null);
        assert_eq!(row.len(), 3);
        assert_eq!(
            row.to_json(),
            json!({"id": "i1", "score": 3.0, "tags": ["a"]})
        );
    }

    #[test]
    fn test_from_value_rejects_scalars() {
        assert!(matches!(
            Row::from_value(json!(42)),
            Err(RowError::NotAnObject(_))
        ));
    }

    #[test]
    fn test_changed_columns() {
        let old = Row::from_value(json!({"id": "i1", "a": 1, "b": 2})).unwrap();
        let new = Row::from_value(json!({"id": "i1", "a": 1, "b": 3, "c": 4})).unwrap();

        let mut changed: Vec<_> = old.changed_columns(&new).collect();
        changed.sort();
        assert_eq!(changed, vec!["b", "c"]);
    }

    #[test]
    fn test_serde_round_trip() {
        let row = Row::from_value(json!({"id": "i1", "n": null})).unwrap();
        let text = serde_json::to_string(&row).unwrap();
        let back: Row = serde_json::from_str(&text).unwrap();
        assert_eq!(row, back);
    }
}
