use crate::LiteType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("table '{0}' must declare a non-empty primary key")]
    EmptyPrimaryKey(String),
    #[error("table '{table}' unique key references unknown column '{column}'")]
    UnknownKeyColumn { table: String, column: String },
}

/// Sort direction of one ordering column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// One column of an ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPart {
    pub column: String,
    pub direction: Direction,
}

impl OrderPart {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            direction: Direction::Desc,
        }
    }
}

/// OrderBy is an ordered list of sort columns.
/// It is total only once [`OrderBy::ensure_total`] has run against the
/// table's schema; sources refuse to index a non-total ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderBy(Vec<OrderPart>);

impl OrderBy {
    pub fn new(parts: Vec<OrderPart>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[OrderPart] {
        &self.0
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|part| part.column.as_str())
    }

    /// Reverse every direction, turning a forward scan into a backward one.
    pub fn reversed(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|part| OrderPart {
                    column: part.column.clone(),
                    direction: match part.direction {
                        Direction::Asc => Direction::Desc,
                        Direction::Desc => Direction::Asc,
                    },
                })
                .collect(),
        )
    }

    /// Make this ordering total for `schema` by appending primary-key
    /// columns, unless some declared unique key is already fully contained
    /// in the ordering's columns.
    pub fn ensure_total(&self, schema: &TableSchema) -> Self {
        let contained = |key: &[String]| {
            key.iter()
                .all(|column| self.0.iter().any(|part| &part.column == column))
        };

        if contained(&schema.primary_key)
            || schema.unique_keys.iter().any(|key| contained(key))
        {
            return self.clone();
        }

        let mut parts = self.0.clone();
        for column in &schema.primary_key {
            if !parts.iter().any(|part| &part.column == column) {
                parts.push(OrderPart::asc(column));
            }
        }
        Self(parts)
    }
}

/// TableSchema describes one replicated table: its declared primary key,
/// any additional unique keys, and (optionally) the lite types of its
/// columns as they appear in the replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub unique_keys: Vec<Vec<String>>,
    #[serde(default)]
    pub columns: BTreeMap<String, LiteType>,
}

impl TableSchema {
    pub fn new(name: &str, primary_key: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            unique_keys: Vec::new(),
            columns: BTreeMap::new(),
        }
    }

    pub fn with_unique_key(mut self, key: &[&str]) -> Self {
        self.unique_keys
            .push(key.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.primary_key.is_empty() {
            return Err(SchemaError::EmptyPrimaryKey(self.name.clone()));
        }
        if !self.columns.is_empty() {
            for key in self.unique_keys.iter().chain([&self.primary_key]) {
                for column in key {
                    if !self.columns.contains_key(column) {
                        return Err(SchemaError::UnknownKeyColumn {
                            table: self.name.clone(),
                            column: column.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// The canonical ordering of this table's rows: primary key, ascending.
    pub fn primary_order(&self) -> OrderBy {
        OrderBy(
            self.primary_key
                .iter()
                .map(|column| OrderPart::asc(column))
                .collect(),
        )
    }
}
