//! The "lite" column-type contract of the replica.
//!
//! Replicated tables store column types as the upstream Postgres type name
//! with attribute markers appended, e.g. `text|NOT_NULL|TEXT_ENUM`. A
//! sidecar metadata table may carry a per-column semantic type; when
//! present it overrides the inline string entirely.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every replicated table carries this hidden version column.
pub const VERSION_COLUMN: &str = "_0_version";

const NOT_NULL: &str = "NOT_NULL";
const TEXT_ENUM: &str = "TEXT_ENUM";
const TEXT_ARRAY: &str = "TEXT_ARRAY";

#[derive(Debug, thiserror::Error)]
pub enum LiteTypeError {
    #[error("empty column type")]
    Empty,
    #[error("unknown column type attribute '{0}'")]
    UnknownAttribute(String),
}

/// LiteType is the parsed form of a replicated column type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteType {
    pub pg_type: String,
    pub not_null: bool,
    pub text_enum: bool,
    pub text_array: bool,
}

impl LiteType {
    /// The effective type for a column: the sidecar type when present,
    /// otherwise the inline attribute-carrying string.
    pub fn effective(inline: &str, sidecar: Option<&str>) -> Result<Self, LiteTypeError> {
        sidecar.unwrap_or(inline).parse()
    }
}

impl FromStr for LiteType {
    type Err = LiteTypeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut split = text.split('|');
        let pg_type = match split.next() {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => return Err(LiteTypeError::Empty),
        };

        let mut parsed = LiteType {
            pg_type,
            not_null: false,
            text_enum: false,
            text_array: false,
        };
        for attr in split {
            match attr {
                NOT_NULL => parsed.not_null = true,
                TEXT_ENUM => parsed.text_enum = true,
                TEXT_ARRAY => parsed.text_array = true,
                other => return Err(LiteTypeError::UnknownAttribute(other.to_string())),
            }
        }
        Ok(parsed)
    }
}

impl fmt::Display for LiteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pg_type)?;
        if self.not_null {
            write!(f, "|{NOT_NULL}")?;
        }
        if self.text_enum {
            write!(f, "|{TEXT_ENUM}")?;
        }
        if self.text_array {
            write!(f, "|{TEXT_ARRAY}")?;
        }
        Ok(())
    }
}

impl Serialize for LiteType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LiteType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
