use crate::Ast;
use xxhash_rust::xxh3::xxh3_64;

/// query_hash derives the canonical subscription identity of a query.
///
/// The AST's serialized field order is deterministic, so the JSON encoding
/// is canonical for equal ASTs; the xxh3 digest of those bytes, rendered as
/// lower hex, keys subscription tracking on both client and server.
pub fn query_hash(ast: &Ast) -> String {
    let bytes = serde_json::to_vec(ast).expect("AST serialization is infallible");
    format!("{:016x}", xxh3_64(&bytes))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Condition;
    use relation::{OrderBy, OrderPart};

    #[test]
    fn test_hash_is_stable_and_discriminating() {
        let a = Ast::new("issue", OrderBy::new(vec![OrderPart::asc("id")]));
        let mut b = a.clone();

        assert_eq!(query_hash(&a), query_hash(&b));
        assert_eq!(query_hash(&a).len(), 16);

        b.where_ = Some(Condition::eq("open", true));
        assert_ne!(query_hash(&a), query_hash(&b));
    }
}
