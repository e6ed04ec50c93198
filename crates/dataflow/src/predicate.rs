//! Compiled row predicates.
//!
//! A [`Predicate`] evaluates the column-level portion of a query
//! [`Condition`] against single rows. Correlated subquery terms are not
//! evaluable here; they compile to `Unknown` leaves and the evaluation is
//! three-valued so that push-down filtering only excludes rows that fail
//! *regardless* of subquery outcomes.
//!
//! Comparison semantics follow SQL: any comparison involving `NULL` is
//! false, including `!=`.

use crate::Error;
use query::{Condition, Operand, SimpleOp};
use relation::{compare, Row, Value};
use std::cmp::Ordering;

/// One compiled operand: a literal, or a sibling column of the same row.
#[derive(Debug, Clone)]
enum CompiledOperand {
    Literal(Value),
    Column(String),
}

#[derive(Debug, Clone)]
enum Compiled {
    Simple {
        field: String,
        op: SimpleOp,
        operand: CompiledOperand,
        /// Pre-compiled pattern for LIKE / ILIKE against a literal.
        pattern: Option<regex::Regex>,
    },
    And(Vec<Compiled>),
    Or(Vec<Compiled>),
    Not(Box<Compiled>),
    /// A correlated subquery term, not evaluable against a single row.
    Unknown,
}

/// Predicate is a compiled, reusable row filter.
#[derive(Debug, Clone)]
pub struct Predicate {
    compiled: Compiled,
    fully_applied: bool,
}

impl Predicate {
    /// Compile `condition`. The result's [`Predicate::is_fully_applied`]
    /// reports whether every term was evaluable (no subquery leaves).
    pub fn compile(condition: &Condition) -> Result<Self, Error> {
        let mut fully_applied = true;
        let compiled = compile(condition, &mut fully_applied)?;
        Ok(Self {
            compiled,
            fully_applied,
        })
    }

    /// A predicate passing every row.
    pub fn always() -> Self {
        Self {
            compiled: Compiled::And(Vec::new()),
            fully_applied: true,
        }
    }

    /// True when the source predicate had no subquery terms, i.e. this
    /// predicate is the whole condition and nothing remains for downstream
    /// operators.
    pub fn is_fully_applied(&self) -> bool {
        self.fully_applied
    }

    /// Whether `row` definitely satisfies the predicate. Subquery terms
    /// evaluate as unknown; a row is matched unless the condition is
    /// definitely false.
    pub fn matches(&self, row: &Row) -> bool {
        eval(&self.compiled, row) != Some(false)
    }

    /// Three-valued evaluation: `None` when the outcome depends on a
    /// subquery term.
    pub fn eval(&self, row: &Row) -> Option<bool> {
        eval(&self.compiled, row)
    }
}

fn compile(condition: &Condition, fully_applied: &mut bool) -> Result<Compiled, Error> {
    Ok(match condition {
        Condition::Simple(simple) => {
            let operand = match &simple.value {
                Operand::Literal { value } => CompiledOperand::Literal(value.clone()),
                Operand::Column { name } => CompiledOperand::Column(name.clone()),
            };
            let pattern = match (&simple.op, &operand) {
                (SimpleOp::Like, CompiledOperand::Literal(Value::String(p))) => {
                    Some(like_regex(p, false)?)
                }
                (SimpleOp::Ilike, CompiledOperand::Literal(Value::String(p))) => {
                    Some(like_regex(p, true)?)
                }
                _ => None,
            };
            Compiled::Simple {
                field: simple.field.clone(),
                op: simple.op,
                operand,
                pattern,
            }
        }
        Condition::And { conditions } => Compiled::And(
            conditions
                .iter()
                .map(|c| compile(c, fully_applied))
                .collect::<Result<_, _>>()?,
        ),
        Condition::Or { conditions } => Compiled::Or(
            conditions
                .iter()
                .map(|c| compile(c, fully_applied))
                .collect::<Result<_, _>>()?,
        ),
        Condition::Not { condition } => {
            Compiled::Not(Box::new(compile(condition, fully_applied)?))
        }
        Condition::Subquery(_) => {
            *fully_applied = false;
            Compiled::Unknown
        }
    })
}

// Kleene three-valued logic over the compiled tree.
fn eval(compiled: &Compiled, row: &Row) -> Option<bool> {
    match compiled {
        Compiled::Simple {
            field,
            op,
            operand,
            pattern,
        } => Some(eval_simple(row, field, *op, operand, pattern.as_ref())),
        Compiled::And(terms) => {
            let mut out = Some(true);
            for term in terms {
                match eval(term, row) {
                    Some(false) => return Some(false),
                    Some(true) => {}
                    None => out = None,
                }
            }
            out
        }
        Compiled::Or(terms) => {
            let mut out = Some(false);
            for term in terms {
                match eval(term, row) {
                    Some(true) => return Some(true),
                    Some(false) => {}
                    None => out = None,
                }
            }
            out
        }
        Compiled::Not(term) => eval(term, row).map(|b| !b),
        Compiled::Unknown => None,
    }
}

fn eval_simple(
    row: &Row,
    field: &str,
    op: SimpleOp,
    operand: &CompiledOperand,
    pattern: Option<&regex::Regex>,
) -> bool {
    let left = row.value_or_null(field);
    let right = match operand {
        CompiledOperand::Literal(value) => value,
        CompiledOperand::Column(name) => row.value_or_null(name),
    };

    // SQL semantics: NULL compares false under every operator.
    if left.is_null() || right.is_null() {
        return false;
    }

    match op {
        SimpleOp::Eq => compare::values(left, right) == Ordering::Equal,
        SimpleOp::Ne => compare::values(left, right) != Ordering::Equal,
        SimpleOp::Lt => compare::values(left, right) == Ordering::Less,
        SimpleOp::Le => compare::values(left, right) != Ordering::Greater,
        SimpleOp::Gt => compare::values(left, right) == Ordering::Greater,
        SimpleOp::Ge => compare::values(left, right) != Ordering::Less,
        SimpleOp::Like | SimpleOp::Ilike => {
            let (Some(text), Some(pattern)) = (left.as_str(), pattern) else {
                return false;
            };
            pattern.is_match(text)
        }
        SimpleOp::In => in_list(left, right),
        SimpleOp::NotIn => match right {
            Value::Json(serde_json::Value::Array(_)) => !in_list(left, right),
            _ => false,
        },
    }
}

fn in_list(left: &Value, right: &Value) -> bool {
    match right {
        Value::Json(serde_json::Value::Array(items)) => items
            .iter()
            .any(|item| &Value::from_json(item.clone()) == left),
        _ => false,
    }
}

/// Translate a SQL LIKE pattern into an anchored regex.
/// `%` matches any run, `_` any single character; `\` escapes either.
fn like_regex(pattern: &str, case_insensitive: bool) -> Result<regex::Regex, Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    if case_insensitive {
        out.push_str("(?is)");
    } else {
        out.push_str("(?s)");
    }
    out.push('^');

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                None => out.push_str(&regex::escape("\\")),
            },
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Ok(regex::Regex::new(&out)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use query::{Condition, SimpleOp};
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        Row::from_value(v).unwrap()
    }

    #[test]
    fn test_simple_comparisons() {
        let p = Predicate::compile(&Condition::cmp("n", SimpleOp::Ge, 10i64)).unwrap();
        assert!(p.is_fully_applied());
        assert!(p.matches(&row(json!({"n": 10}))));
        assert!(p.matches(&row(json!({"n": 11}))));
        assert!(!p.matches(&row(json!({"n": 9}))));
    }

    #[test]
    fn test_null_never_matches() {
        for op in [SimpleOp::Eq, SimpleOp::Ne, SimpleOp::Lt, SimpleOp::Ge] {
            let p = Predicate::compile(&Condition::cmp("n", op, 1i64)).unwrap();
            assert_eq!(p.eval(&row(json!({"n": null}))), Some(false));
            assert_eq!(p.eval(&row(json!({}))), Some(false));
        }
    }

    #[test]
    fn test_column_operand() {
        let p = Predicate::compile(&Condition::Simple(query::SimpleCondition {
            field: "a".to_string(),
            op: SimpleOp::Eq,
            value: query::Operand::Column {
                name: "b".to_string(),
            },
        }))
        .unwrap();

        assert!(p.matches(&row(json!({"a": 3, "b": 3}))));
        assert!(!p.matches(&row(json!({"a": 3, "b": 4}))));
    }

    #[test]
    fn test_like() {
        let p = Predicate::compile(&Condition::cmp("s", SimpleOp::Like, "a%c_")).unwrap();
        assert!(p.matches(&row(json!({"s": "abcd"}))));
        assert!(p.matches(&row(json!({"s": "aXYZcZ"}))));
        assert!(!p.matches(&row(json!({"s": "abc"}))));
        assert!(!p.matches(&row(json!({"s": "Abcd"}))));

        let p = Predicate::compile(&Condition::cmp("s", SimpleOp::Ilike, "a%")).unwrap();
        assert!(p.matches(&row(json!({"s": "ABCD"}))));

        // Escaped wildcard matches only the literal.
        let p = Predicate::compile(&Condition::cmp("s", SimpleOp::Like, "100\\%")).unwrap();
        assert!(p.matches(&row(json!({"s": "100%"}))));
        assert!(!p.matches(&row(json!({"s": "1000"}))));
    }

    #[test]
    fn test_in_list() {
        let p = Predicate::compile(&Condition::cmp(
            "s",
            SimpleOp::In,
            relation::Value::Json(json!(["a", "b"])),
        ))
        .unwrap();
        assert!(p.matches(&row(json!({"s": "a"}))));
        assert!(!p.matches(&row(json!({"s": "c"}))));

        let p = Predicate::compile(&Condition::cmp(
            "s",
            SimpleOp::NotIn,
            relation::Value::Json(json!(["a", "b"])),
        ))
        .unwrap();
        assert!(p.matches(&row(json!({"s": "c"}))));
        assert!(!p.matches(&row(json!({"s": "a"}))));
    }

    #[test]
    fn test_three_valued_subquery_terms() {
        use query::{Correlation, CorrelatedSubquery, ExistsOp, SubqueryCondition, System};
        use relation::{OrderBy, OrderPart};

        let subquery = Condition::Subquery(SubqueryCondition {
            related: CorrelatedSubquery {
                correlation: Correlation::new(&["id"], &["issueID"]),
                subquery: Box::new(query::Ast::new("comment", OrderBy::new(vec![OrderPart::asc("id")]))),
                system: System::Client,
                hidden: true,
            },
            op: ExistsOp::Exists,
            flip: false,
        });

        // AND with a definitely-false term is false despite the unknown.
        let p = Predicate::compile(&Condition::and(vec![
            Condition::eq("open", false),
            subquery.clone(),
        ]))
        .unwrap();
        assert!(!p.is_fully_applied());
        assert_eq!(p.eval(&row(json!({"open": true}))), Some(false));
        assert!(!p.matches(&row(json!({"open": true}))));

        // AND with a passing term stays unknown: the row must remain
        // visible for downstream EXISTS evaluation.
        assert_eq!(p.eval(&row(json!({"open": false}))), None);
        assert!(p.matches(&row(json!({"open": false}))));

        // OR with a definitely-true branch is true.
        let p = Predicate::compile(&Condition::or(vec![
            Condition::eq("open", true),
            subquery,
        ]))
        .unwrap();
        assert_eq!(p.eval(&row(json!({"open": true}))), Some(true));
        assert_eq!(p.eval(&row(json!({"open": false}))), None);
    }
}
