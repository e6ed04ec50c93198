use crate::change::{Change, Node, RelationshipRef, SourceChange};
use crate::operator::{
    fetch_collect, ConnectionId, Constraint, FetchRequest, Operator, PushContext, Step,
    StreamSchema,
};
use crate::Error;
use query::System;
use relation::Row;

/// JoinHandle names one join within a pipeline. Lazy relationship
/// references carry it so a drain can be routed back to the owning join
/// from the pipeline root.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct JoinHandle(u32);

impl JoinHandle {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

// Shared mechanics of the parent-driven and child-driven joins.
struct JoinCore {
    parent: Box<dyn Operator>,
    child: Box<dyn Operator>,
    parent_key: Vec<String>,
    child_key: Vec<String>,
    relationship: String,
    handle: JoinHandle,
    system: System,
    hidden: bool,
    queue: std::collections::VecDeque<Change>,
}

impl JoinCore {
    fn child_constraint(&self, parent_row: &Row) -> Constraint {
        Constraint::new(
            self.child_key
                .iter()
                .zip(self.parent_key.iter())
                .map(|(child_col, parent_col)| {
                    (child_col.clone(), parent_row.value_or_null(parent_col).clone())
                }),
        )
    }

    fn parent_constraint(&self, child_row: &Row) -> Constraint {
        Constraint::new(
            self.parent_key
                .iter()
                .zip(self.child_key.iter())
                .map(|(parent_col, child_col)| {
                    (parent_col.clone(), child_row.value_or_null(child_col).clone())
                }),
        )
    }

    // Attach this join's lazy relationship to a parent node.
    fn attach(&self, node: Node) -> Node {
        let constraint = self.child_constraint(&node.row);
        node.with_relationship(
            &self.relationship,
            RelationshipRef {
                handle: self.handle,
                constraint,
                system: self.system,
                hidden: self.hidden,
            },
        )
    }

    fn join_key_changed(&self, old: &Row, new: &Row) -> bool {
        self.parent_key
            .iter()
            .any(|col| old.value_or_null(col) != new.value_or_null(col))
    }

    fn apply_parent(&mut self, change: Change) {
        match change {
            Change::Add(node) => {
                let node = self.attach(node);
                self.queue.push_back(Change::Add(node));
            }
            // The removed parent still carries an enumerable relationship:
            // its children are intact in the child source at apply time.
            Change::Remove(node) => {
                let node = self.attach(node);
                self.queue.push_back(Change::Remove(node));
            }
            Change::Edit { node, old_node } => {
                if self.join_key_changed(&old_node.row, &node.row) {
                    let old_node = self.attach(old_node);
                    let node = self.attach(node);
                    self.queue.push_back(Change::Remove(old_node));
                    self.queue.push_back(Change::Add(node));
                } else {
                    let change = Change::Edit {
                        node: self.attach(node),
                        old_node: self.attach(old_node),
                    };
                    self.queue.push_back(change);
                }
            }
            Change::Child {
                node,
                relationship,
                change,
            } => {
                let node = self.attach(node);
                self.queue.push_back(Change::Child {
                    node,
                    relationship,
                    change,
                });
            }
        }
    }

    // Map a child-side change onto the matching parents as nested child
    // changes, looking parents up by join key.
    fn apply_child(&mut self, change: Change, ctx: &mut PushContext<'_>) -> Result<(), Error> {
        match change {
            Change::Add(child) => {
                let constraint = self.parent_constraint(&child.row);
                self.emit_against_parents(constraint, Change::Add(child))?;
            }
            Change::Remove(child) => {
                let constraint = self.parent_constraint(&child.row);
                self.emit_against_parents(constraint, Change::Remove(child))?;
            }
            Change::Edit { node, old_node } => {
                if self
                    .child_key
                    .iter()
                    .any(|col| old_node.row.value_or_null(col) != node.row.value_or_null(col))
                {
                    // The child moved between parents: reverse it under the
                    // old ones and introduce it under the new.
                    let old_constraint = self.parent_constraint(&old_node.row);
                    let new_constraint = self.parent_constraint(&node.row);
                    self.emit_against_parents(old_constraint, Change::Remove(old_node))?;
                    self.emit_against_parents(new_constraint, Change::Add(node))?;
                } else {
                    let constraint = self.parent_constraint(&node.row);
                    self.emit_against_parents(constraint, Change::Edit { node, old_node })?;
                }
            }
            Change::Child {
                node,
                relationship,
                change,
            } => {
                let constraint = self.parent_constraint(&node.row);
                self.emit_against_parents(
                    constraint,
                    Change::Child {
                        node,
                        relationship,
                        change,
                    },
                )?;
            }
        }
        ctx.yield_now();
        Ok(())
    }

    fn emit_against_parents(
        &mut self,
        constraint: Constraint,
        change: Change,
    ) -> Result<(), Error> {
        let parents = fetch_collect(
            self.parent.as_mut(),
            &FetchRequest::constrained(constraint),
        )?;
        for parent in parents {
            let parent = self.attach(parent);
            self.queue.push_back(Change::Child {
                node: parent,
                relationship: self.relationship.clone(),
                change: Box::new(change.clone()),
            });
        }
        Ok(())
    }

    fn push(&mut self, conn: ConnectionId, change: &SourceChange) -> Result<(), Error> {
        self.parent.push(conn, change)?;
        self.child.push(conn, change)
    }

    // Pull with the parent (or, flipped, the child) side driving first.
    fn pull(
        &mut self,
        ctx: &mut PushContext<'_>,
        child_first: bool,
    ) -> Result<Option<Change>, Error> {
        loop {
            if let Some(change) = self.queue.pop_front() {
                return Ok(Some(change));
            }
            let (first_is_child, pulled) = if child_first {
                match self.child.pull(ctx)? {
                    Some(change) => (true, Some(change)),
                    None => (false, self.parent.pull(ctx)?),
                }
            } else {
                match self.parent.pull(ctx)? {
                    Some(change) => (false, Some(change)),
                    None => (true, self.child.pull(ctx)?),
                }
            };
            match pulled {
                None => return Ok(None),
                Some(change) if first_is_child => self.apply_child(change, ctx)?,
                Some(change) => self.apply_parent(change),
            }
        }
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        let Self {
            parent,
            parent_key,
            child_key,
            relationship,
            handle,
            system,
            hidden,
            ..
        } = self;

        parent.fetch(req, &mut |node| {
            let constraint = Constraint::new(
                child_key
                    .iter()
                    .zip(parent_key.iter())
                    .map(|(child_col, parent_col)| {
                        (child_col.clone(), node.row.value_or_null(parent_col).clone())
                    }),
            );
            visit(node.with_relationship(
                relationship,
                RelationshipRef {
                    handle: *handle,
                    constraint,
                    system: *system,
                    hidden: *hidden,
                },
            ))
        })
    }

    fn fetch_relationship(
        &mut self,
        handle: JoinHandle,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Option<Step>, Error> {
        if handle == self.handle {
            return self.child.fetch(req, visit).map(Some);
        }
        if let Some(step) = self.parent.fetch_relationship(handle, req, visit)? {
            return Ok(Some(step));
        }
        self.child.fetch_relationship(handle, req, visit)
    }

    fn destroy(&mut self) {
        self.parent.destroy();
        self.child.destroy();
    }
}

/// Join attaches a child relationship to its parent stream.
///
/// Parent-driven: parent adds and removes carry the relationship as a lazy
/// reference without any eager child fetch; child-side changes surface as
/// nested [`Change::Child`] payloads against the matching parents, found by
/// indexed lookup on the join key. Joins never reorder their parent stream.
pub struct Join(JoinCore);

impl Join {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent: Box<dyn Operator>,
        child: Box<dyn Operator>,
        parent_key: Vec<String>,
        child_key: Vec<String>,
        relationship: String,
        handle: JoinHandle,
        system: System,
        hidden: bool,
    ) -> Self {
        Self(JoinCore {
            parent,
            child,
            parent_key,
            child_key,
            relationship,
            handle,
            system,
            hidden,
            queue: std::collections::VecDeque::new(),
        })
    }
}

impl Operator for Join {
    fn schema(&self) -> &StreamSchema {
        self.0.parent.schema()
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        self.0.fetch(req, visit)
    }

    fn fetch_relationship(
        &mut self,
        handle: JoinHandle,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Option<Step>, Error> {
        self.0.fetch_relationship(handle, req, visit)
    }

    fn push(&mut self, conn: ConnectionId, change: &SourceChange) -> Result<(), Error> {
        self.0.push(conn, change)
    }

    fn pull(&mut self, ctx: &mut PushContext<'_>) -> Result<Option<Change>, Error> {
        // Parent side drives; the child subtree is consulted second.
        self.0.pull(ctx, false)
    }

    fn destroy(&mut self) {
        self.0.destroy();
    }
}

/// FlippedJoin is a join driven from its child side, used when the
/// push-down predicate lands on the parent side of an EXISTS. The matched
/// parent rows are materialized eagerly at push time (parent lookups route
/// through the parent input, so parent-side push-down filters apply); its
/// output stream is indistinguishable from [`Join`]'s.
pub struct FlippedJoin(JoinCore);

impl FlippedJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent: Box<dyn Operator>,
        child: Box<dyn Operator>,
        parent_key: Vec<String>,
        child_key: Vec<String>,
        relationship: String,
        handle: JoinHandle,
        system: System,
        hidden: bool,
    ) -> Self {
        Self(JoinCore {
            parent,
            child,
            parent_key,
            child_key,
            relationship,
            handle,
            system,
            hidden,
            queue: std::collections::VecDeque::new(),
        })
    }
}

impl Operator for FlippedJoin {
    fn schema(&self) -> &StreamSchema {
        self.0.parent.schema()
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        self.0.fetch(req, visit)
    }

    fn fetch_relationship(
        &mut self,
        handle: JoinHandle,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Option<Step>, Error> {
        self.0.fetch_relationship(handle, req, visit)
    }

    fn push(&mut self, conn: ConnectionId, change: &SourceChange) -> Result<(), Error> {
        self.0.push(conn, change)
    }

    fn pull(&mut self, ctx: &mut PushContext<'_>) -> Result<Option<Change>, Error> {
        // Child side drives.
        self.0.pull(ctx, true)
    }

    fn destroy(&mut self) {
        self.0.destroy();
    }
}
