use crate::Ast;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Format describes the shape of a materialized result tree:
/// whether each level is a list or a singleton, recursively per
/// relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub singular: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, Format>,
}

impl Format {
    pub fn list() -> Self {
        Self {
            singular: false,
            relationships: BTreeMap::new(),
        }
    }

    pub fn singleton() -> Self {
        Self {
            singular: true,
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_relationship(mut self, name: &str, format: Format) -> Self {
        self.relationships.insert(name.to_string(), format);
        self
    }

    /// Derive the result shape of `ast`: one list (or singleton when
    /// `limit == 1`) per level, with a nested entry for every non-hidden
    /// relationship.
    pub fn for_ast(ast: &Ast) -> Self {
        Self::for_ast_level(ast, false)
    }

    fn for_ast_level(ast: &Ast, nested: bool) -> Self {
        Self {
            singular: nested && ast.limit == Some(1),
            relationships: ast
                .related
                .iter()
                .filter(|related| !related.hidden)
                .map(|related| {
                    (
                        related.subquery.relationship_name().to_string(),
                        Self::for_ast_level(&related.subquery, true),
                    )
                })
                .collect(),
        }
    }
}
