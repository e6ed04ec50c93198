use crate::builder::BuiltPipeline;
use crate::change::{Change, Node, SourceChange};
use crate::operator::{ConnectionId, FetchRequest, Operator, PushContext, Step};
use crate::storage::Storage;
use crate::Error;
use futures::channel::oneshot;
use query::{Ast, Format, Ttl};
use relation::{compare, OrderBy, Row, RowKey};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// How settled this view's result is: still syncing, confirmed complete by
/// the server, or failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResultType {
    Unknown,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryErrorKind {
    App,
    Parse,
    Http(u16),
}

/// The error body attached to a view in the `Error` result state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&serde_json::Value, ResultType, Option<&QueryError>)>;

// One materialized result node: a row, its reference count, and its
// materialized children per relationship.
struct ViewNode {
    id: RowKey,
    row: Row,
    ref_count: u32,
    children: BTreeMap<String, Vec<ViewNode>>,
}

/// View translates the pipeline's change stream into a canonical,
/// reference-counted result tree and notifies subscribers at commit
/// boundaries.
///
/// Node identity is the tuple of ordering-column values (a superset of the
/// primary key, so unique). Duplicate admissions from fan-in branches fold
/// into the ref count; a node leaves the tree when its count returns to
/// zero. A remove for an absent node is dropped, not asserted: windowed
/// replays legitimately produce them.
pub struct View {
    ast: Ast,
    root: Box<dyn Operator>,
    format: Format,
    orders: BTreeMap<String, OrderBy>,
    connections: Vec<ConnectionId>,
    roots: Vec<ViewNode>,
    result_type: ResultType,
    error: Option<QueryError>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
    complete_waiters: Vec<oneshot::Sender<()>>,
    nonempty_waiters: Vec<oneshot::Sender<()>>,
    ttl: Ttl,
    dirty: bool,
    _storage: Storage,
}

impl View {
    /// Materialize the initial result of a compiled pipeline.
    pub fn materialize(ast: Ast, pipeline: BuiltPipeline, ttl: Ttl) -> Result<Self, Error> {
        let BuiltPipeline {
            mut root,
            format,
            connections,
            orders,
            storage,
        } = pipeline;

        let mut top = Vec::new();
        root.fetch(&FetchRequest::default(), &mut |node| {
            top.push(node);
            Step::Continue
        })?;

        let mut view = Self {
            ast,
            root,
            format,
            orders,
            connections,
            roots: Vec::new(),
            result_type: ResultType::Unknown,
            error: None,
            listeners: Vec::new(),
            next_subscription: 0,
            complete_waiters: Vec::new(),
            nonempty_waiters: Vec::new(),
            ttl,
            dirty: true,
            _storage: storage,
        };
        for node in top {
            view.apply(Change::Add(node))?;
        }
        Ok(view)
    }

    pub fn ast(&self) -> &Ast {
        &self.ast
    }

    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn update_ttl(&mut self, ttl: Ttl) {
        self.ttl = ttl;
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    pub fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    /// Route one source delivery through the pipeline and apply every
    /// resulting change to the tree. Notification waits for the commit
    /// boundary.
    pub fn deliver(
        &mut self,
        conn: ConnectionId,
        change: &SourceChange,
        ctx: &mut PushContext<'_>,
    ) -> Result<(), Error> {
        self.root.push(conn, change)?;
        while let Some(change) = self.root.pull(ctx)? {
            self.apply(change)?;
            ctx.yield_now();
        }
        self.dirty = true;
        Ok(())
    }

    fn apply(&mut self, change: Change) -> Result<(), Error> {
        let Self {
            root,
            format,
            orders,
            roots,
            ..
        } = self;
        apply_change(root.as_mut(), orders, format, roots, change, "")
    }

    /// The current result as canonical JSON: a list, or for a singular
    /// root, the row object or null.
    pub fn snapshot(&self) -> serde_json::Value {
        if self.format.singular {
            self.roots
                .first()
                .map(|node| node_json(node, &self.format))
                .unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Array(
                self.roots
                    .iter()
                    .map(|node| node_json(node, &self.format))
                    .collect(),
            )
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// The server confirmed this query is fully synced.
    pub fn mark_complete(&mut self) {
        self.result_type = ResultType::Complete;
        self.error = None;
        self.dirty = true;
    }

    pub fn mark_error(&mut self, error: QueryError) {
        self.result_type = ResultType::Error;
        self.error = Some(error);
        self.dirty = true;
    }

    /// Fire listeners and waiters if anything changed since the last
    /// commit. No subscriber ever observes a partially applied delivery.
    pub fn commit(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;

        let snapshot = self.snapshot();
        for (_, listener) in &mut self.listeners {
            listener(&snapshot, self.result_type, self.error.as_ref());
        }
        if self.result_type == ResultType::Complete {
            for waiter in self.complete_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        if !self.roots.is_empty() {
            for waiter in self.nonempty_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    /// Resolves at the first commit whose result is `Complete`.
    pub fn wait_for_complete(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.result_type == ResultType::Complete {
            let _ = tx.send(());
        } else {
            self.complete_waiters.push(tx);
        }
        rx
    }

    /// Resolves at the first commit with a non-empty result.
    pub fn wait_for_nonempty(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if !self.roots.is_empty() {
            let _ = tx.send(());
        } else {
            self.nonempty_waiters.push(tx);
        }
        rx
    }

    /// Tear down the pipeline, releasing source connections and storage.
    pub fn destroy(&mut self) {
        self.listeners.clear();
        self.complete_waiters.clear();
        self.nonempty_waiters.clear();
        self.root.destroy();
    }
}

fn level_order<'o>(orders: &'o BTreeMap<String, OrderBy>, path: &str) -> Option<&'o OrderBy> {
    orders.get(path)
}

fn child_path(path: &str, relationship: &str) -> String {
    if path.is_empty() {
        relationship.to_string()
    } else {
        format!("{path}/{relationship}")
    }
}

fn node_id(orders: &BTreeMap<String, OrderBy>, path: &str, row: &Row) -> RowKey {
    match level_order(orders, path) {
        Some(order) => {
            let columns: Vec<String> = order.columns().map(str::to_string).collect();
            RowKey::extract(row, &columns)
        }
        None => RowKey::extract(row, &[]),
    }
}

// Materialize one pipeline node (and, recursively, its children named by
// the format) into a ViewNode with a reference count of one.
fn materialize_node(
    root: &mut dyn Operator,
    orders: &BTreeMap<String, OrderBy>,
    format: &Format,
    node: Node,
    path: &str,
) -> Result<ViewNode, Error> {
    let mut children = BTreeMap::new();
    for (name, child_format) in &format.relationships {
        let mut list: Vec<ViewNode> = Vec::new();
        if let Some(rel) = node.relationships.get(name) {
            let mut child_nodes = Vec::new();
            root.fetch_relationship(
                rel.handle,
                &FetchRequest::constrained(rel.constraint.clone()),
                &mut |child| {
                    child_nodes.push(child);
                    Step::Continue
                },
            )?;

            let nested = child_path(path, name);
            for child in child_nodes {
                let id = node_id(orders, &nested, &child.row);
                if let Some(existing) = list.iter_mut().find(|n| n.id == id) {
                    existing.ref_count += 1;
                } else {
                    list.push(materialize_node(root, orders, child_format, child, &nested)?);
                }
            }
        }
        children.insert(name.clone(), list);
    }

    let id = node_id(orders, path, &node.row);
    Ok(ViewNode {
        id,
        row: node.row,
        ref_count: 1,
        children,
    })
}

fn apply_change(
    root: &mut dyn Operator,
    orders: &BTreeMap<String, OrderBy>,
    format: &Format,
    siblings: &mut Vec<ViewNode>,
    change: Change,
    path: &str,
) -> Result<(), Error> {
    match change {
        Change::Add(node) => {
            let id = node_id(orders, path, &node.row);
            if let Some(existing) = siblings.iter_mut().find(|n| n.id == id) {
                existing.ref_count += 1;
                return Ok(());
            }
            let view_node = materialize_node(root, orders, format, node, path)?;
            let at = insert_position(orders, path, siblings, &view_node.row);
            siblings.insert(at, view_node);
        }
        Change::Remove(node) => {
            let id = node_id(orders, path, &node.row);
            let Some(at) = siblings.iter().position(|n| n.id == id) else {
                tracing::debug!(path, "remove of absent node dropped");
                return Ok(());
            };
            siblings[at].ref_count -= 1;
            if siblings[at].ref_count == 0 {
                siblings.remove(at);
            }
        }
        Change::Edit { node, old_node } => {
            let old_id = node_id(orders, path, &old_node.row);
            let Some(at) = siblings.iter().position(|n| n.id == old_id) else {
                tracing::debug!(path, "edit of absent node dropped");
                return Ok(());
            };

            let moved = {
                let before_ok = at == 0
                    || row_cmp(orders, path, &siblings[at - 1].row, &node.row)
                        != Ordering::Greater;
                let after_ok = at + 1 >= siblings.len()
                    || row_cmp(orders, path, &node.row, &siblings[at + 1].row)
                        != Ordering::Greater;
                !(before_ok && after_ok)
            };

            let new_id = node_id(orders, path, &node.row);
            if moved {
                let mut view_node = siblings.remove(at);
                view_node.row = node.row;
                view_node.id = new_id;
                let to = insert_position(orders, path, siblings, &view_node.row);
                siblings.insert(to, view_node);
            } else {
                siblings[at].row = node.row;
                siblings[at].id = new_id;
            }
        }
        Change::Child {
            node,
            relationship,
            change,
        } => {
            let Some(child_format) = format.relationships.get(&relationship) else {
                // Hidden relationships never materialize.
                return Ok(());
            };
            let id = node_id(orders, path, &node.row);
            let Some(at) = siblings.iter().position(|n| n.id == id) else {
                tracing::debug!(path, relationship, "child change for absent parent dropped");
                return Ok(());
            };
            let nested = child_path(path, &relationship);
            let parent = &mut siblings[at];
            let list = parent.children.entry(relationship).or_default();
            apply_change(root, orders, child_format, list, *change, &nested)?;
        }
    }
    Ok(())
}

fn row_cmp(
    orders: &BTreeMap<String, OrderBy>,
    path: &str,
    a: &Row,
    b: &Row,
) -> Ordering {
    match level_order(orders, path) {
        Some(order) => compare::rows(order, a, b),
        None => Ordering::Equal,
    }
}

fn insert_position(
    orders: &BTreeMap<String, OrderBy>,
    path: &str,
    siblings: &[ViewNode],
    row: &Row,
) -> usize {
    siblings.partition_point(|n| row_cmp(orders, path, &n.row, row) == Ordering::Less)
}

fn node_json(node: &ViewNode, format: &Format) -> serde_json::Value {
    let mut object = match node.row.to_json() {
        serde_json::Value::Object(map) => map,
        _ => unreachable!("rows serialize as objects"),
    };
    for (name, child_format) in &format.relationships {
        let children = node.children.get(name);
        let value = if child_format.singular {
            children
                .and_then(|list| list.first())
                .map(|child| node_json(child, child_format))
                .unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Array(
                children
                    .map(|list| {
                        list.iter()
                            .map(|child| node_json(child, child_format))
                            .collect()
                    })
                    .unwrap_or_default(),
            )
        };
        object.insert(name.clone(), value);
    }
    serde_json::Value::Object(object)
}
