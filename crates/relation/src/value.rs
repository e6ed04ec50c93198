use crate::compare;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Value is a single column value of a row.
/// Scalar JSON values map onto their dedicated variants, while arrays and
/// objects are carried opaquely as `Json`. Values admit one total order,
/// established by [`compare::values`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Json(serde_json::Value),
}

impl Value {
    /// Build a Value from an arbitrary JSON value.
    /// Scalars become their dedicated variants; arrays and objects are
    /// retained as opaque JSON.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            v @ serde_json::Value::Array(_) | v @ serde_json::Value::Object(_) => Value::Json(v),
        }
    }

    /// Render this Value as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Json(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        compare::values(self, other) == Ordering::Equal
    }
}
impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        compare::values(self, other)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::Number(n) => {
                state.write_u8(2);
                // NB: 20u64 and 20.0f64 have already converged to one bit
                // pattern, so bit hashing is consistent with total_cmp.
                state.write_u64(n.to_bits());
            }
            Value::String(s) => {
                state.write_u8(3);
                s.hash(state);
            }
            Value::Json(v) => {
                state.write_u8(4);
                // Arrays and objects are rare as key material. Hash their
                // canonical serialization rather than walking the tree.
                v.to_string().hash(state);
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_round_trip() {
        for fixture in [
            json!(null),
            json!(true),
            json!(32.5),
            json!("hello"),
            json!([1, 2, 3]),
            json!({"a": 1}),
        ] {
            assert_eq!(Value::from_json(fixture.clone()).to_json(), fixture);
        }
    }

    #[test]
    fn test_scalar_equality() {
        assert_eq!(Value::from(20i64), Value::Number(20.0));
        assert_ne!(Value::from("20"), Value::Number(20.0));
        assert_eq!(Value::Null, Value::Null);
    }

    #[test]
    fn test_serde_untagged() {
        let values: Vec<Value> = serde_json::from_value(json!([null, false, 1.5, "s", [1]]))
            .expect("deserializes");

        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(false),
                Value::Number(1.5),
                Value::String("s".to_string()),
                Value::Json(json!([1])),
            ]
        );
    }
}
