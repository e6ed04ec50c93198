use crate::engine::ViewId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

// Unmount/remount churn from strict-mode hosts releases and re-acquires a
// view within one frame; destruction waits out this grace period.
const DESTROY_GRACE: Duration = Duration::from_millis(10);

struct StoreEntry {
    view: ViewId,
    refs: usize,
    released_at: Option<Instant>,
}

/// ViewStore is the process-wide map from `(query hash, client id)` to a
/// materialized view, reference-counted by the subscribers sharing it.
///
/// Dropping the last reference does not destroy the view immediately: the
/// entry lingers for a short grace period so an immediate re-acquire (the
/// strict-mode unmount/remount pattern) reuses it. Reaping is lazy: it
/// happens on access and on explicit [`ViewStore::reap`] calls. Time is
/// injected so hosts and tests control the clock.
#[derive(Default)]
pub struct ViewStore {
    entries: HashMap<(String, String), StoreEntry>,
}

impl ViewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the shared view for `(hash, client)`, materializing it with
    /// `make` on first acquisition, and increment its reference count.
    pub fn acquire<E>(
        &mut self,
        hash: &str,
        client: &str,
        now: Instant,
        make: impl FnOnce() -> Result<ViewId, E>,
    ) -> Result<ViewId, E> {
        self.reap_expired(now, &mut |_| {});

        let key = (hash.to_string(), client.to_string());
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refs += 1;
            entry.released_at = None;
            return Ok(entry.view);
        }

        let view = make()?;
        self.entries.insert(
            key,
            StoreEntry {
                view,
                refs: 1,
                released_at: None,
            },
        );
        Ok(view)
    }

    /// Drop one reference. The entry becomes reapable after the grace
    /// period once its count reaches zero.
    pub fn release(&mut self, hash: &str, client: &str, now: Instant) {
        let key = (hash.to_string(), client.to_string());
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entry.released_at = Some(now);
            }
        }
    }

    /// Destroy every entry whose grace period has lapsed, invoking
    /// `destroy` with each reaped view.
    pub fn reap(&mut self, now: Instant, destroy: &mut dyn FnMut(ViewId)) {
        self.reap_expired(now, destroy);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn reap_expired(&mut self, now: Instant, destroy: &mut dyn FnMut(ViewId)) {
        self.entries.retain(|_, entry| {
            let expired = entry.refs == 0
                && entry
                    .released_at
                    .map(|at| now.duration_since(at) >= DESTROY_GRACE)
                    .unwrap_or(false);
            if expired {
                destroy(entry.view);
            }
            !expired
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::change::SourceChange;
    use crate::engine::Engine;
    use pretty_assertions::assert_eq;
    use query::{query_hash, Ast, Ttl};
    use relation::{OrderBy, OrderPart, Row, TableSchema};
    use serde_json::json;

    fn engine() -> (Engine, Ast) {
        let mut engine = Engine::new();
        engine
            .add_table(TableSchema::new("issue", &["id"]))
            .unwrap();
        engine
            .transact(|tx| {
                tx.push(
                    "issue",
                    SourceChange::Add(Row::from_value(json!({"id": "i1"})).unwrap()),
                )
            })
            .unwrap();
        let ast = Ast::new("issue", OrderBy::new(vec![OrderPart::asc("id")]));
        (engine, ast)
    }

    #[test]
    fn test_acquire_shares_and_counts() {
        let (mut engine, ast) = engine();
        let mut store = ViewStore::new();
        let hash = query_hash(&ast);
        let t0 = Instant::now();

        let a = store
            .acquire(&hash, "client-1", t0, || {
                engine.materialize(ast.clone(), Ttl::Default)
            })
            .unwrap();
        let b = store
            .acquire(&hash, "client-1", t0, || {
                engine.materialize(ast.clone(), Ttl::Default)
            })
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);

        // A different client gets its own wrapper.
        let c = store
            .acquire(&hash, "client-2", t0, || {
                engine.materialize(ast.clone(), Ttl::Default)
            })
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_grace_period_absorbs_remount_churn() {
        let (mut engine, ast) = engine();
        let mut store = ViewStore::new();
        let hash = query_hash(&ast);
        let t0 = Instant::now();

        let a = store
            .acquire(&hash, "client-1", t0, || {
                engine.materialize(ast.clone(), Ttl::Default)
            })
            .unwrap();
        store.release(&hash, "client-1", t0);

        // Re-acquired within the grace period: same view, nothing reaped.
        let b = store
            .acquire(&hash, "client-1", t0 + Duration::from_millis(1), || {
                engine.materialize(ast.clone(), Ttl::Default)
            })
            .unwrap();
        assert_eq!(a, b);

        // Released and left past the grace period: reaped.
        store.release(&hash, "client-1", t0 + Duration::from_millis(2));
        let mut reaped = Vec::new();
        store.reap(t0 + Duration::from_millis(50), &mut |view| reaped.push(view));
        assert_eq!(reaped, vec![a]);
        assert!(store.is_empty());
    }
}
