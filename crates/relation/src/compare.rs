//! One total order over row values, used by every index, operator and view.
//!
//! The policy, which callers may rely on as a public contract:
//! `Null < Bool < Number < String < Json`, numbers by `f64::total_cmp`,
//! arrays and objects lexicographically. A descending sort therefore places
//! nulls last.

use crate::{Direction, OrderBy, Row, Value};
use itertools::{EitherOrBoth, Itertools};
use std::cmp::Ordering;

/// values evaluates the total ordering of `lhs` and `rhs`.
pub fn values(lhs: &Value, rhs: &Value) -> Ordering {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(lhs), Value::Bool(rhs)) => lhs.cmp(rhs),
        (Value::Number(lhs), Value::Number(rhs)) => lhs.total_cmp(rhs),
        (Value::String(lhs), Value::String(rhs)) => lhs.cmp(rhs),
        (Value::Json(lhs), Value::Json(rhs)) => json(lhs, rhs),

        // Types are not equal. Define an (arbitrary) total ordering.
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(_), _) => Ordering::Less,
        (_, Value::Bool(_)) => Ordering::Greater,
        (Value::Number(_), _) => Ordering::Less,
        (_, Value::Number(_)) => Ordering::Greater,
        (Value::String(_), _) => Ordering::Less,
        (_, Value::String(_)) => Ordering::Greater,
    }
}

/// json evaluates the deep ordering of raw JSON values.
/// Arrays and objects are compared lexicographically, with object fields
/// in their natural (sorted) property order.
pub fn json(lhs: &serde_json::Value, rhs: &serde_json::Value) -> Ordering {
    use serde_json::Value as J;

    match (lhs, rhs) {
        (J::Null, J::Null) => Ordering::Equal,
        (J::Bool(lhs), J::Bool(rhs)) => lhs.cmp(rhs),
        (J::Number(lhs), J::Number(rhs)) => lhs
            .as_f64()
            .unwrap_or(f64::NAN)
            .total_cmp(&rhs.as_f64().unwrap_or(f64::NAN)),
        (J::String(lhs), J::String(rhs)) => lhs.cmp(rhs),
        (J::Array(lhs), J::Array(rhs)) => lhs
            .iter()
            .zip_longest(rhs.iter())
            .map(|eob| match eob {
                EitherOrBoth::Both(lhs, rhs) => json(lhs, rhs),
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
        (J::Object(lhs), J::Object(rhs)) => lhs
            .iter()
            .zip_longest(rhs.iter())
            .map(|eob| match eob {
                EitherOrBoth::Both((lp, lv), (rp, rv)) => {
                    let prop_ord = lp.cmp(rp);
                    match prop_ord {
                        Ordering::Equal => json(lv, rv),
                        _ => prop_ord,
                    }
                }
                EitherOrBoth::Right(_) => Ordering::Less,
                EitherOrBoth::Left(_) => Ordering::Greater,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),

        (J::Null, _) => Ordering::Less,
        (_, J::Null) => Ordering::Greater,
        (J::Bool(_), _) => Ordering::Less,
        (_, J::Bool(_)) => Ordering::Greater,
        (J::Number(_), _) => Ordering::Less,
        (_, J::Number(_)) => Ordering::Greater,
        (J::String(_), _) => Ordering::Less,
        (_, J::String(_)) => Ordering::Greater,
        (J::Array(_), _) => Ordering::Less,
        (_, J::Array(_)) => Ordering::Greater,
    }
}

/// rows evaluates the ordering of two rows under `order`.
/// A column absent from a row compares as `Null`.
/// The result is total only if `order` is total (see [`OrderBy::ensure_total`]).
pub fn rows(order: &OrderBy, lhs: &Row, rhs: &Row) -> Ordering {
    for part in order.parts() {
        let l = lhs.value_or_null(&part.column);
        let r = rhs.value_or_null(&part.column);

        let ord = match part.direction {
            Direction::Asc => values(l, r),
            Direction::Desc => values(l, r).reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{OrderBy, OrderPart, Row};
    use serde_json::json;

    fn value(v: serde_json::Value) -> Value {
        Value::from_json(v)
    }

    fn is_lt(lhs: serde_json::Value, rhs: serde_json::Value) {
        assert_eq!(values(&value(lhs.clone()), &value(rhs.clone())), Ordering::Less);
        assert_eq!(values(&value(rhs), &value(lhs)), Ordering::Greater);
    }

    fn is_eq(lhs: serde_json::Value, rhs: serde_json::Value) {
        assert_eq!(values(&value(lhs), &value(rhs)), Ordering::Equal);
    }

    #[test]
    fn test_null_ordering() {
        is_eq(json!(null), json!(null));
        is_lt(json!(null), json!(false)); // Bool > Null.
        is_lt(json!(null), json!(0));
        is_lt(json!(null), json!(""));
        is_lt(json!(null), json!([]));
    }

    #[test]
    fn test_number_ordering() {
        is_eq(json!(10), json!(10));
        is_eq(json!(20), json!(20.00));
        is_lt(json!(-20), json!(-10));
        is_lt(json!(-1), json!(1));
        is_lt(json!(10), json!(20.5));
        is_lt(json!(true), json!(0)); // Number > Bool.
    }

    #[test]
    fn test_string_ordering() {
        is_eq(json!("foo"), json!("foo"));
        is_lt(json!(""), json!("foo"));
        is_lt(json!("foo"), json!("fp"));
        is_lt(json!(1), json!("1")); // String > Number.
    }

    #[test]
    fn test_json_ordering() {
        is_eq(json!([1, 2]), json!([1, 2]));
        is_lt(json!([]), json!([1]));
        is_lt(json!([1, 2]), json!([1, 3]));
        is_lt(json!({"a": 1}), json!({"a": 1, "b": 2}));
        is_lt(json!({"a": 1}), json!({"b": 1}));
        is_lt(json!([1]), json!({"a": 1})); // Object > Array.
        is_lt(json!("z"), json!([])); // Json > String.
    }

    #[test]
    fn test_row_ordering_with_direction() {
        let order = OrderBy::new(vec![OrderPart::desc("rank"), OrderPart::asc("id")]);

        let a = Row::from_value(json!({"id": "a", "rank": 2})).unwrap();
        let b = Row::from_value(json!({"id": "b", "rank": 1})).unwrap();
        let c = Row::from_value(json!({"id": "c", "rank": null})).unwrap();

        assert_eq!(rows(&order, &a, &b), Ordering::Less);
        // Nulls sort last under a descending direction.
        assert_eq!(rows(&order, &b, &c), Ordering::Less);
        assert_eq!(rows(&order, &a, &a), Ordering::Equal);
    }

    use quickcheck::{Arbitrary, Gen};

    #[derive(Clone, Debug)]
    struct ArbValue(Value);

    impl Arbitrary for ArbValue {
        fn arbitrary(g: &mut Gen) -> Self {
            ArbValue(match u8::arbitrary(g) % 4 {
                0 => Value::Null,
                1 => Value::Bool(bool::arbitrary(g)),
                2 => Value::Number(i32::arbitrary(g) as f64),
                _ => Value::String(String::arbitrary(g)),
            })
        }
    }

    #[quickcheck_macros::quickcheck]
    fn prop_value_order_antisymmetric(a: ArbValue, b: ArbValue) -> bool {
        values(&a.0, &b.0) == values(&b.0, &a.0).reverse()
    }

    #[quickcheck_macros::quickcheck]
    fn prop_value_order_transitive(a: ArbValue, b: ArbValue, c: ArbValue) -> bool {
        let mut sorted = vec![a.0, b.0, c.0];
        sorted.sort_by(values);
        sorted.windows(2).all(|w| values(&w[0], &w[1]) != Ordering::Greater)
    }
}
