use crate::builder::{Builder, BuilderDelegate};
use crate::change::SourceChange;
use crate::operator::{ConnectionId, PushContext};
use crate::source::MemorySource;
use crate::view::{QueryError, QueryErrorKind, View};
use crate::Error;
use query::{Ast, Ttl};
use relation::TableSchema;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// NOT EXISTS is opt-in; building one while disabled is an error.
    pub enable_not_exists: bool,
}

/// Identity of one materialized view within an engine. Stable across
/// [`Engine::retry`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ViewId(usize);

/// Engine owns the sources of every replicated table and the views
/// materialized over them, and routes source deliveries to the owning
/// pipelines.
///
/// All work is single-threaded and non-reentrant: pushes happen inside
/// [`Engine::transact`], and every dirty view commits exactly once when
/// the transaction closes, so no subscriber observes a partial commit.
pub struct Engine {
    options: EngineOptions,
    sources: HashMap<String, Rc<RefCell<MemorySource>>>,
    views: Vec<Option<View>>,
    conn_owner: HashMap<ConnectionId, usize>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        Self {
            options,
            sources: HashMap::new(),
            views: Vec::new(),
            conn_owner: HashMap::new(),
        }
    }

    /// Register a table, creating its shared source.
    pub fn add_table(&mut self, schema: TableSchema) -> Result<(), Error> {
        let name = schema.name.clone();
        let source = MemorySource::new(schema)?;
        self.sources.insert(name, Rc::new(RefCell::new(source)));
        Ok(())
    }

    pub fn source(&self, table: &str) -> Result<&Rc<RefCell<MemorySource>>, Error> {
        self.sources
            .get(table)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    /// Compile `ast` and materialize its view.
    pub fn materialize(&mut self, ast: Ast, ttl: Ttl) -> Result<ViewId, Error> {
        self.materialize_with(ast, ttl, &mut ())
    }

    /// Compile with a delegate wrapping operators for observability.
    pub fn materialize_with<D: BuilderDelegate>(
        &mut self,
        ast: Ast,
        ttl: Ttl,
        delegate: &mut D,
    ) -> Result<ViewId, Error> {
        let pipeline =
            Builder::new(&self.sources, delegate, self.options.enable_not_exists).build(&ast)?;
        let view = View::materialize(ast, pipeline, ttl)?;

        let slot = self
            .views
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.views.push(None);
                self.views.len() - 1
            });
        for conn in view.connections() {
            self.conn_owner.insert(*conn, slot);
        }
        self.views[slot] = Some(view);
        Ok(ViewId(slot))
    }

    pub fn view(&self, id: ViewId) -> Result<&View, Error> {
        self.views
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(Error::UnknownView)
    }

    pub fn view_mut(&mut self, id: ViewId) -> Result<&mut View, Error> {
        self.views
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::UnknownView)
    }

    /// Destroy a view, releasing its pipeline and connections.
    pub fn destroy_view(&mut self, id: ViewId) -> Result<(), Error> {
        let Some(mut view) = self.views.get_mut(id.0).and_then(Option::take) else {
            return Err(Error::UnknownView);
        };
        for conn in view.connections() {
            self.conn_owner.remove(conn);
        }
        view.destroy();
        Ok(())
    }

    /// Destroy and re-materialize a failed view from its own AST. The
    /// view's identity is preserved.
    pub fn retry(&mut self, id: ViewId) -> Result<ViewId, Error> {
        let Some(mut old) = self.views.get_mut(id.0).and_then(Option::take) else {
            return Err(Error::UnknownView);
        };
        let ast = old.ast().clone();
        let ttl = old.ttl();
        for conn in old.connections() {
            self.conn_owner.remove(conn);
        }
        old.destroy();

        let pipeline =
            Builder::new(&self.sources, &mut (), self.options.enable_not_exists).build(&ast)?;
        let view = View::materialize(ast, pipeline, ttl)?;
        for conn in view.connections() {
            self.conn_owner.insert(*conn, id.0);
        }
        self.views[id.0] = Some(view);
        Ok(id)
    }

    /// Run a batch of pushes as one transaction. Every dirty view commits
    /// (and notifies) exactly once when the closure returns.
    pub fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let out = {
            let mut tx = Transaction { engine: self };
            f(&mut tx)?
        };
        self.commit_all();
        Ok(out)
    }

    fn commit_all(&mut self) {
        for view in self.views.iter_mut().flatten() {
            view.commit();
        }
    }

    fn push_internal(&mut self, table: &str, change: SourceChange) -> Result<(), Error> {
        let source = self.source(table)?.clone();
        let deliveries = match source.borrow_mut().push(change) {
            Ok(deliveries) => deliveries,
            Err(error @ Error::Constraint(_)) => {
                // A constraint violation is fatal for the source: surface
                // it as an application error on every dependent view and
                // tear those pipelines down.
                self.fail_views_of(table, &error);
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        for delivery in deliveries {
            if let Some(&slot) = self.conn_owner.get(&delivery.connection) {
                let view = self.views[slot]
                    .as_mut()
                    .expect("owned connections map to live views");
                view.deliver(
                    delivery.connection,
                    &delivery.change,
                    &mut PushContext::new(),
                )?;
            }
        }
        Ok(())
    }

    fn fail_views_of(&mut self, table: &str, error: &Error) {
        let ids: Vec<ViewId> = self
            .views
            .iter()
            .enumerate()
            .filter_map(|(slot, view)| {
                view.as_ref()
                    .filter(|v| v.ast().table == table || query_references(v.ast(), table))
                    .map(|_| ViewId(slot))
            })
            .collect();

        for id in ids {
            if let Ok(view) = self.view_mut(id) {
                view.mark_error(QueryError {
                    kind: QueryErrorKind::App,
                    message: error.to_string(),
                    details: None,
                });
                view.commit();
            }
            let _ = self.destroy_view(id);
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn query_references(ast: &Ast, table: &str) -> bool {
    fn condition_references(condition: &query::Condition, table: &str) -> bool {
        match condition {
            query::Condition::Simple(_) => false,
            query::Condition::And { conditions } | query::Condition::Or { conditions } => {
                conditions.iter().any(|c| condition_references(c, table))
            }
            query::Condition::Not { condition } => condition_references(condition, table),
            query::Condition::Subquery(subquery) => {
                query_references(&subquery.related.subquery, table)
            }
        }
    }

    ast.table == table
        || ast
            .related
            .iter()
            .any(|related| query_references(&related.subquery, table))
        || ast
            .where_
            .as_ref()
            .map(|condition| condition_references(condition, table))
            .unwrap_or(false)
}

/// Transaction scopes a batch of pushes; dropping it without going through
/// [`Engine::transact`] is not possible.
pub struct Transaction<'e> {
    engine: &'e mut Engine,
}

impl Transaction<'_> {
    /// Apply one row change to a table and propagate it through every
    /// dependent pipeline.
    pub fn push(&mut self, table: &str, change: SourceChange) -> Result<(), Error> {
        self.engine.push_internal(table, change)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use relation::{OrderBy, OrderPart, Row};
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        Row::from_value(v).unwrap()
    }

    fn engine() -> Engine {
        let mut engine = Engine::new();
        engine
            .add_table(TableSchema::new("issue", &["id"]))
            .unwrap();
        engine
            .transact(|tx| {
                tx.push("issue", SourceChange::Add(row(json!({"id": "i1", "open": true}))))?;
                tx.push("issue", SourceChange::Add(row(json!({"id": "i2", "open": false}))))
            })
            .unwrap();
        engine
    }

    #[test]
    fn test_materialize_and_maintain() {
        let mut engine = engine();
        let mut ast = Ast::new("issue", OrderBy::new(vec![OrderPart::asc("id")]));
        ast.where_ = Some(query::Condition::eq("open", true));
        let id = engine.materialize(ast, Ttl::Default).unwrap();

        assert_eq!(
            engine.view(id).unwrap().snapshot(),
            json!([{"id": "i1", "open": true}])
        );

        engine
            .transact(|tx| {
                tx.push(
                    "issue",
                    SourceChange::Edit {
                        old: row(json!({"id": "i2", "open": false})),
                        new: row(json!({"id": "i2", "open": true})),
                    },
                )
            })
            .unwrap();
        assert_eq!(
            engine.view(id).unwrap().snapshot(),
            json!([{"id": "i1", "open": true}, {"id": "i2", "open": true}])
        );
    }

    #[test]
    fn test_commit_boundary_batches_notifications() {
        let mut engine = engine();
        let ast = Ast::new("issue", OrderBy::new(vec![OrderPart::asc("id")]));
        let id = engine.materialize(ast, Ttl::Default).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        engine
            .view_mut(id)
            .unwrap()
            .subscribe(Box::new(move |snapshot, _, _| {
                sink.borrow_mut().push(snapshot.clone());
            }));

        engine
            .transact(|tx| {
                tx.push("issue", SourceChange::Add(row(json!({"id": "i3"}))))?;
                tx.push("issue", SourceChange::Add(row(json!({"id": "i4"}))))
            })
            .unwrap();

        // Two pushes, one notification, already containing both rows.
        assert_eq!(seen.borrow().len(), 1);
        let snapshot = seen.borrow()[0].clone();
        let ids: Vec<_> = snapshot
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("i1"), json!("i2"), json!("i3"), json!("i4")]);
    }

    #[test]
    fn test_constraint_violation_tears_down_views() {
        let mut engine = engine();
        let ast = Ast::new("issue", OrderBy::new(vec![OrderPart::asc("id")]));
        let id = engine.materialize(ast, Ttl::Default).unwrap();

        let result = engine.transact(|tx| {
            tx.push("issue", SourceChange::Add(row(json!({"id": "i1"}))))
        });
        assert!(matches!(result, Err(Error::Constraint(_))));
        assert!(matches!(engine.view(id), Err(Error::UnknownView)));
    }

    #[test]
    fn test_retry_preserves_identity() {
        let mut engine = engine();
        let ast = Ast::new("issue", OrderBy::new(vec![OrderPart::asc("id")]));
        let id = engine.materialize(ast, Ttl::Default).unwrap();

        engine.view_mut(id).unwrap().mark_error(QueryError {
            kind: QueryErrorKind::Http(500),
            message: "sync failed".to_string(),
            details: None,
        });

        let retried = engine.retry(id).unwrap();
        assert_eq!(retried, id);
        assert_eq!(
            engine.view(id).unwrap().result_type(),
            crate::view::ResultType::Unknown
        );
        assert_eq!(
            engine.view(id).unwrap().snapshot().as_array().unwrap().len(),
            2
        );
    }
}
