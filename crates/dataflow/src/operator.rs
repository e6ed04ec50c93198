use crate::change::{Change, Node, SourceChange};
use crate::join::JoinHandle;
use crate::Error;
use relation::{OrderBy, Row, TableSchema, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identity of one source connection. Every pipeline leaf holds exactly one;
/// the engine routes per-connection deliveries by it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

/// Flow control returned by a fetch visitor: keep streaming, or stop early.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

/// Column equalities constraining a fetch, e.g. a join key lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraint(pub BTreeMap<String, Value>);

impl Constraint {
    pub fn new(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self(entries.into_iter().collect())
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.0
            .iter()
            .all(|(column, value)| row.value_or_null(column) == value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Whether a fetch cursor starts at the given row or just after it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Basis {
    At,
    After,
}

/// A fetch cursor: resume scanning at or after `row` in the stream's order.
/// Under `reverse`, "after" means the next row toward the front.
#[derive(Debug, Clone)]
pub struct Start {
    pub basis: Basis,
    pub row: Row,
}

/// FetchRequest parameterizes one streaming scan of an operator's output.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub constraint: Option<Constraint>,
    pub start: Option<Start>,
    pub reverse: bool,
}

impl FetchRequest {
    pub fn constrained(constraint: Constraint) -> Self {
        Self {
            constraint: Some(constraint),
            start: None,
            reverse: false,
        }
    }
}

/// The schema of the row stream an operator emits: the backing table plus
/// the total ordering rows are yielded in.
#[derive(Debug, Clone)]
pub struct StreamSchema {
    pub table: Arc<TableSchema>,
    pub order: OrderBy,
}

impl StreamSchema {
    /// The primary-key identity of `row` under this schema.
    pub fn row_key(&self, row: &Row) -> relation::RowKey {
        relation::RowKey::extract(row, &self.table.primary_key)
    }
}

/// PushContext threads host cooperation through a push. Operators call
/// [`PushContext::yield_now`] between heavy steps; the hook may interleave
/// other work but must not re-enter the engine.
pub struct PushContext<'h> {
    hook: Option<&'h mut dyn FnMut()>,
}

impl<'h> PushContext<'h> {
    pub fn new() -> Self {
        Self { hook: None }
    }

    pub fn with_hook(hook: &'h mut dyn FnMut()) -> Self {
        Self { hook: Some(hook) }
    }

    pub fn yield_now(&mut self) {
        if let Some(hook) = self.hook.as_mut() {
            hook();
        }
    }
}

impl<'h> Default for PushContext<'h> {
    fn default() -> Self {
        Self::new()
    }
}

/// Operator is one node of a compiled pipeline.
///
/// Universal contracts:
/// - `fetch` yields nodes in the operator's declared output ordering, and
///   is always consistent with the accumulated effects of prior pushes.
/// - A delivery is installed with `push` and streamed with `pull`: each
///   call surfaces the next emitted change. The consumer fully processes a
///   pulled change (including fetches against this subtree) before pulling
///   again, so operator state never runs ahead of what downstream has
///   observed.
/// - Emitted `Change` payloads are single-use; operators do not retain
///   references to them after they are pulled.
/// - `destroy` releases storage and destroys inputs exactly once.
pub trait Operator {
    fn schema(&self) -> &StreamSchema;

    /// Stream the operator's current result into `visit`.
    /// Returns `Step::Stop` if the visitor ended the scan early.
    ///
    /// Visitors must be pure consumers of the yielded nodes: they must not
    /// call back into the pipeline. Operators needing per-node pipeline
    /// lookups collect first and post-process.
    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error>;

    /// Resolve a lazy relationship owned by a join within this subtree.
    /// Operators route the request toward the owning join; the join serves
    /// it from its child input. Returns `None` when no join in this
    /// subtree owns `handle`, so siblings can be consulted.
    fn fetch_relationship(
        &mut self,
        handle: JoinHandle,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Option<Step>, Error>;

    /// Install a source change arriving at connection `conn` at the leaves
    /// of this subtree. A subtree not containing `conn` installs nothing.
    /// Processing happens in the subsequent `pull` calls.
    fn push(&mut self, conn: ConnectionId, change: &SourceChange) -> Result<(), Error>;

    /// Produce this operator's next output change for the installed
    /// delivery, or `None` once drained. A drained operator resets and is
    /// ready for the next `push`.
    fn pull(&mut self, ctx: &mut PushContext<'_>) -> Result<Option<Change>, Error>;

    fn destroy(&mut self);
}

/// Install `change` and drain every resulting output change.
/// The deliberate per-change interleaving of `pull` is preserved; this is
/// a convenience for consumers (and tests) wanting the full batch.
pub fn push_collect(
    op: &mut dyn Operator,
    conn: ConnectionId,
    change: &SourceChange,
    ctx: &mut PushContext<'_>,
) -> Result<Vec<Change>, Error> {
    op.push(conn, change)?;
    let mut out = Vec::new();
    while let Some(change) = op.pull(ctx)? {
        out.push(change);
    }
    Ok(out)
}

/// Drain a full fetch into a vector. Convenience for operators and tests.
pub fn fetch_collect(
    op: &mut dyn Operator,
    req: &FetchRequest,
) -> Result<Vec<Node>, Error> {
    let mut nodes = Vec::new();
    op.fetch(req, &mut |node| {
        nodes.push(node);
        Step::Continue
    })?;
    Ok(nodes)
}

