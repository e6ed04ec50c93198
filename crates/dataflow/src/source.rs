use crate::change::{Change, Node, SourceChange};
use crate::join::JoinHandle;
use crate::operator::{
    Basis, ConnectionId, FetchRequest, Operator, PushContext, Start, Step, StreamSchema,
};
use crate::predicate::Predicate;
use crate::Error;
use query::Condition;
use relation::{compare, OrderBy, Row, RowKey, TableSchema};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::rc::Rc;
use std::sync::Arc;

/// A push failure that is fatal for the source: the change contradicts the
/// primary-key constraint, so the replica and the engine have diverged.
#[derive(Debug, thiserror::Error)]
pub enum ConstraintViolation {
    #[error("add of duplicate primary key {key} to table '{table}'")]
    DuplicateAdd { table: String, key: String },
    #[error("remove of unknown primary key {key} from table '{table}'")]
    MissingRemove { table: String, key: String },
    #[error("edit of unknown primary key {key} in table '{table}'")]
    MissingEdit { table: String, key: String },
    #[error("edit moves row onto existing primary key {key} in table '{table}'")]
    EditCollision { table: String, key: String },
}

/// One source change routed to one connected pipeline input.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub connection: ConnectionId,
    pub change: SourceChange,
}

struct SecondaryIndex {
    order: OrderBy,
    rows: Vec<Row>,
    refs: usize,
}

struct Connection {
    id: ConnectionId,
    predicate: Option<Predicate>,
    split_edit_keys: BTreeSet<String>,
}

/// The outcome of [`MemorySource::connect`]: the connection identity, the
/// total ordering rows will be yielded in, and whether the push-down
/// filters are entirely satisfied at the source.
pub struct Connected {
    pub id: ConnectionId,
    pub order: OrderBy,
    pub fully_applied_filters: bool,
    pub(crate) predicate: Option<Predicate>,
}

/// MemorySource is the indexed, ordered store of one table's rows and the
/// root of every pipeline over that table.
///
/// Rows live in one canonical order (primary key ascending); secondary
/// indexes are built lazily for any other requested total ordering,
/// reference-counted by the connections using them, and kept coherent with
/// subsequent pushes for the life of the process.
// Connection identities are process-wide so the engine can route a
// delivery without knowing which source produced it.
static NEXT_CONNECTION: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

pub struct MemorySource {
    schema: Arc<TableSchema>,
    primary_order: OrderBy,
    primary: BTreeMap<RowKey, Row>,
    indexes: Vec<SecondaryIndex>,
    connections: Vec<Connection>,
}

impl MemorySource {
    pub fn new(schema: TableSchema) -> Result<Self, Error> {
        schema.validate()?;
        Ok(Self {
            primary_order: schema.primary_order(),
            schema: Arc::new(schema),
            primary: BTreeMap::new(),
            indexes: Vec::new(),
            connections: Vec::new(),
        })
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// Register a pipeline input over this source.
    ///
    /// `sort` is made total by appending the primary key as needed. The
    /// push-down `filters` are evaluated here to the extent possible;
    /// `fully_applied_filters` reports whether anything remains for
    /// downstream operators. Edits differing in any `split_edit_keys`
    /// column are delivered as a remove followed by an add.
    pub fn connect(
        &mut self,
        sort: &OrderBy,
        filters: Option<&Condition>,
        split_edit_keys: impl IntoIterator<Item = String>,
    ) -> Result<Connected, Error> {
        let order = sort.ensure_total(&self.schema);
        self.ensure_index(&order);
        if let Some(index) = self.indexes.iter_mut().find(|i| i.order == order) {
            index.refs += 1;
        }

        let predicate = filters.map(Predicate::compile).transpose()?;
        let fully_applied_filters = predicate
            .as_ref()
            .map(|p| p.is_fully_applied())
            .unwrap_or(true);

        let id = ConnectionId(
            NEXT_CONNECTION.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );

        tracing::debug!(
            table = %self.schema.name,
            connection = id.0,
            fully_applied_filters,
            "connected pipeline input"
        );

        self.connections.push(Connection {
            id,
            predicate: predicate.clone(),
            split_edit_keys: split_edit_keys.into_iter().collect(),
        });

        Ok(Connected {
            id,
            order,
            fully_applied_filters,
            predicate,
        })
    }

    /// Release a connection, dropping any secondary index no other
    /// consumer holds.
    pub fn disconnect(&mut self, id: ConnectionId, order: &OrderBy) {
        self.connections.retain(|c| c.id != id);

        if *order != self.primary_order {
            if let Some(at) = self.indexes.iter().position(|i| &i.order == order) {
                self.indexes[at].refs = self.indexes[at].refs.saturating_sub(1);
                if self.indexes[at].refs == 0 {
                    self.indexes.swap_remove(at);
                    tracing::debug!(table = %self.schema.name, "released secondary index");
                }
            }
        }
    }

    /// Apply `change` to storage and compute its routing to every
    /// connection, in connection-registration order.
    ///
    /// Fails with [`ConstraintViolation`] without touching storage when the
    /// change contradicts the primary key; the caller tears the pipeline
    /// down on that error.
    pub fn push(&mut self, change: SourceChange) -> Result<Vec<Delivery>, Error> {
        let table = &self.schema.name;

        // Validate and update the primary index.
        let applied = match change {
            SourceChange::Add(row) => {
                let key = self.row_key(&row);
                if self.primary.contains_key(&key) {
                    return Err(ConstraintViolation::DuplicateAdd {
                        table: table.clone(),
                        key: key.to_json().to_string(),
                    }
                    .into());
                }
                self.primary.insert(key, row.clone());
                SourceChange::Add(row)
            }
            SourceChange::Remove(row) => {
                let key = self.row_key(&row);
                let Some(stored) = self.primary.remove(&key) else {
                    return Err(ConstraintViolation::MissingRemove {
                        table: table.clone(),
                        key: key.to_json().to_string(),
                    }
                    .into());
                };
                SourceChange::Remove(stored)
            }
            SourceChange::Edit { old, new } => {
                let old_key = self.row_key(&old);
                let new_key = self.row_key(&new);
                if !self.primary.contains_key(&old_key) {
                    return Err(ConstraintViolation::MissingEdit {
                        table: table.clone(),
                        key: old_key.to_json().to_string(),
                    }
                    .into());
                }
                if new_key != old_key && self.primary.contains_key(&new_key) {
                    return Err(ConstraintViolation::EditCollision {
                        table: table.clone(),
                        key: new_key.to_json().to_string(),
                    }
                    .into());
                }
                let old = self
                    .primary
                    .remove(&old_key)
                    .expect("presence was checked");
                self.primary.insert(new_key, new.clone());
                SourceChange::Edit { old, new }
            }
        };

        // Keep every live secondary index coherent.
        for index in &mut self.indexes {
            match &applied {
                SourceChange::Add(row) => index_insert(index, row),
                SourceChange::Remove(row) => index_remove(index, row),
                SourceChange::Edit { old, new } => {
                    index_remove(index, old);
                    index_insert(index, new);
                }
            }
        }

        // An edit that moves the primary key must split everywhere, since
        // downstream state is keyed on row identity.
        let key_changed = match &applied {
            SourceChange::Edit { old, new } => self.row_key(old) != self.row_key(new),
            _ => false,
        };

        // Route to connections in registration order.
        let mut deliveries = Vec::new();
        for connection in &self.connections {
            route(connection, &applied, key_changed, &mut deliveries);
        }

        tracing::trace!(
            table = %self.schema.name,
            deliveries = deliveries.len(),
            "pushed source change"
        );
        Ok(deliveries)
    }

    /// Stream rows in `order`, honoring the request's constraint, cursor
    /// and direction, and filtering by `predicate`.
    pub(crate) fn scan(
        &mut self,
        order: &OrderBy,
        predicate: Option<&Predicate>,
        req: &FetchRequest,
        visit: &mut dyn FnMut(&Row) -> Step,
    ) -> Result<Step, Error> {
        let admit = |row: &Row| -> bool {
            if let Some(constraint) = &req.constraint {
                if !constraint.matches(row) {
                    return false;
                }
            }
            predicate.map(|p| p.matches(row)).unwrap_or(true)
        };

        if *order == self.primary_order {
            let range: Box<dyn Iterator<Item = &Row>> = match (&req.start, req.reverse) {
                (None, false) => Box::new(self.primary.values()),
                (None, true) => Box::new(self.primary.values().rev()),
                (Some(start), reverse) => {
                    let key = RowKey::extract(&start.row, &self.schema.primary_key);
                    match (start.basis, reverse) {
                        (Basis::At, false) => Box::new(self.primary.range(key..).map(|(_, r)| r)),
                        (Basis::After, false) => Box::new(
                            self.primary
                                .range((Bound::Excluded(key), Bound::Unbounded))
                                .map(|(_, r)| r),
                        ),
                        (Basis::At, true) => {
                            Box::new(self.primary.range(..=key).rev().map(|(_, r)| r))
                        }
                        (Basis::After, true) => {
                            Box::new(self.primary.range(..key).rev().map(|(_, r)| r))
                        }
                    }
                }
            };
            for row in range {
                if admit(row) && visit(row) == Step::Stop {
                    return Ok(Step::Stop);
                }
            }
            return Ok(Step::Continue);
        }

        self.ensure_index(order);
        let index = self
            .indexes
            .iter()
            .find(|i| &i.order == order)
            .expect("index was just ensured");

        let rows = &index.rows;
        let (from, to) = match &req.start {
            None => (0, rows.len()),
            Some(start) => {
                let below = rows
                    .partition_point(|r| compare::rows(order, r, &start.row) == Ordering::Less);
                let at_or_below = rows
                    .partition_point(|r| compare::rows(order, r, &start.row) != Ordering::Greater);
                match (start.basis, req.reverse) {
                    (Basis::At, false) => (below, rows.len()),
                    (Basis::After, false) => (at_or_below, rows.len()),
                    (Basis::At, true) => (0, at_or_below),
                    (Basis::After, true) => (0, below),
                }
            }
        };

        if req.reverse {
            for row in rows[from..to].iter().rev() {
                if admit(row) && visit(row) == Step::Stop {
                    return Ok(Step::Stop);
                }
            }
        } else {
            for row in rows[from..to].iter() {
                if admit(row) && visit(row) == Step::Stop {
                    return Ok(Step::Stop);
                }
            }
        }
        Ok(Step::Continue)
    }

    fn row_key(&self, row: &Row) -> RowKey {
        RowKey::extract(row, &self.schema.primary_key)
    }

    // Lazily build the secondary index for `order` if it doesn't exist.
    // Reference counts are owned by connect/disconnect, not by scans.
    fn ensure_index(&mut self, order: &OrderBy) {
        if *order == self.primary_order || self.indexes.iter().any(|i| &i.order == order) {
            return;
        }

        let mut rows: Vec<Row> = self.primary.values().cloned().collect();
        rows.sort_by(|a, b| compare::rows(order, a, b));
        tracing::debug!(table = %self.schema.name, rows = rows.len(), "built secondary index");

        self.indexes.push(SecondaryIndex {
            order: order.clone(),
            rows,
            refs: 0,
        });
    }
}

fn index_insert(index: &mut SecondaryIndex, row: &Row) {
    let at = index
        .rows
        .partition_point(|r| compare::rows(&index.order, r, row) == Ordering::Less);
    index.rows.insert(at, row.clone());
}

fn index_remove(index: &mut SecondaryIndex, row: &Row) {
    let at = index
        .rows
        .partition_point(|r| compare::rows(&index.order, r, row) == Ordering::Less);
    if at < index.rows.len()
        && compare::rows(&index.order, &index.rows[at], row) == Ordering::Equal
    {
        index.rows.remove(at);
    }
}

// Route one applied change to one connection, honoring push-down filter
// visibility and edit splitting.
fn route(
    connection: &Connection,
    change: &SourceChange,
    key_changed: bool,
    out: &mut Vec<Delivery>,
) {
    let visible = |row: &Row| {
        connection
            .predicate
            .as_ref()
            .map(|p| p.matches(row))
            .unwrap_or(true)
    };
    let mut deliver = |change: SourceChange| {
        out.push(Delivery {
            connection: connection.id,
            change,
        });
    };

    match change {
        SourceChange::Add(row) => {
            if visible(row) {
                deliver(SourceChange::Add(row.clone()));
            }
        }
        SourceChange::Remove(row) => {
            if visible(row) {
                deliver(SourceChange::Remove(row.clone()));
            }
        }
        SourceChange::Edit { old, new } => match (visible(old), visible(new)) {
            (false, false) => {}
            (true, false) => deliver(SourceChange::Remove(old.clone())),
            (false, true) => deliver(SourceChange::Add(new.clone())),
            (true, true) => {
                let splits = key_changed
                    || (!connection.split_edit_keys.is_empty()
                        && old
                            .changed_columns(new)
                            .any(|column| connection.split_edit_keys.contains(column)));
                if splits {
                    deliver(SourceChange::Remove(old.clone()));
                    deliver(SourceChange::Add(new.clone()));
                } else {
                    deliver(SourceChange::Edit {
                        old: old.clone(),
                        new: new.clone(),
                    });
                }
            }
        },
    }
}

/// SourceInput is the pipeline leaf bound to one source connection.
/// Fetches scan the shared source in the connection's ordering; pushes
/// convert the deliveries addressed to this connection into pipeline
/// changes. All other deliveries pass through it silently.
pub struct SourceInput {
    source: Rc<RefCell<MemorySource>>,
    connection: ConnectionId,
    schema: StreamSchema,
    predicate: Option<Predicate>,
    fully_applied_filters: bool,
    pending: Option<Change>,
    destroyed: bool,
}

impl SourceInput {
    pub fn connect(
        source: Rc<RefCell<MemorySource>>,
        sort: &OrderBy,
        filters: Option<&Condition>,
        split_edit_keys: impl IntoIterator<Item = String>,
    ) -> Result<Self, Error> {
        let connected = source
            .borrow_mut()
            .connect(sort, filters, split_edit_keys)?;
        let table = source.borrow().schema().clone();

        Ok(Self {
            source,
            connection: connected.id,
            schema: StreamSchema {
                table,
                order: connected.order,
            },
            predicate: connected.predicate,
            fully_applied_filters: connected.fully_applied_filters,
            pending: None,
            destroyed: false,
        })
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Whether the push-down filters are entirely satisfied here, making
    /// downstream re-evaluation redundant.
    pub fn fully_applied_filters(&self) -> bool {
        self.fully_applied_filters
    }
}

impl Operator for SourceInput {
    fn schema(&self) -> &StreamSchema {
        &self.schema
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        self.source.borrow_mut().scan(
            &self.schema.order,
            self.predicate.as_ref(),
            req,
            &mut |row| visit(Node::bare(row.clone())),
        )
    }

    fn fetch_relationship(
        &mut self,
        _handle: JoinHandle,
        _req: &FetchRequest,
        _visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Option<Step>, Error> {
        Ok(None)
    }

    fn push(&mut self, conn: ConnectionId, change: &SourceChange) -> Result<(), Error> {
        if conn != self.connection {
            return Ok(());
        }
        self.pending = Some(match change {
            SourceChange::Add(row) => Change::Add(Node::bare(row.clone())),
            SourceChange::Remove(row) => Change::Remove(Node::bare(row.clone())),
            SourceChange::Edit { old, new } => Change::Edit {
                node: Node::bare(new.clone()),
                old_node: Node::bare(old.clone()),
            },
        });
        Ok(())
    }

    fn pull(&mut self, _ctx: &mut PushContext<'_>) -> Result<Option<Change>, Error> {
        Ok(self.pending.take())
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            let order = self.schema.order.clone();
            self.source.borrow_mut().disconnect(self.connection, &order);
            self.destroyed = true;
        }
    }
}
