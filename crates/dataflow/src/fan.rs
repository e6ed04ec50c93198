use crate::change::{Change, Node, SourceChange};
use crate::join::JoinHandle;
use crate::operator::{ConnectionId, FetchRequest, Operator, PushContext, Step, StreamSchema};
use crate::Error;
use relation::compare;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::rc::Rc;

/// FanOut is the shared upstream of an OR bracket. It is pushed exactly
/// once per delivery by the owning [`FanIn`], which replicates the output
/// to every branch feed in fixed registration order.
pub struct FanOut {
    input: Box<dyn Operator>,
}

impl FanOut {
    pub fn new(input: Box<dyn Operator>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self { input }))
    }
}

/// BranchInput is the leaf of one OR branch, reading the changes its
/// [`FanIn`] replicated into the branch feed and serving fetches from the
/// shared upstream.
pub struct BranchInput {
    fan: Rc<RefCell<FanOut>>,
    feed: Rc<RefCell<VecDeque<Change>>>,
    schema: StreamSchema,
}

impl BranchInput {
    pub fn new(fan: Rc<RefCell<FanOut>>, feed: Rc<RefCell<VecDeque<Change>>>) -> Self {
        let schema = fan.borrow().input.schema().clone();
        Self { fan, feed, schema }
    }
}

impl Operator for BranchInput {
    fn schema(&self) -> &StreamSchema {
        &self.schema
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        self.fan.borrow_mut().input.fetch(req, visit)
    }

    fn fetch_relationship(
        &mut self,
        handle: JoinHandle,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Option<Step>, Error> {
        self.fan.borrow_mut().input.fetch_relationship(handle, req, visit)
    }

    fn push(&mut self, _conn: ConnectionId, _change: &SourceChange) -> Result<(), Error> {
        // The FanIn drives the shared upstream; this branch's copy of its
        // output arrives through the feed.
        Ok(())
    }

    fn pull(&mut self, _ctx: &mut PushContext<'_>) -> Result<Option<Change>, Error> {
        Ok(self.feed.borrow_mut().pop_front())
    }

    fn destroy(&mut self) {
        // The shared upstream is destroyed once, by the owning FanIn.
        self.feed.borrow_mut().clear();
    }
}

struct Branch {
    op: Box<dyn Operator>,
    feed: Rc<RefCell<VecDeque<Change>>>,
}

/// FanIn merges the outputs of the OR branches over one shared upstream.
///
/// Branch outputs are concatenated in registration order for pushes and
/// merged by the output ordering for fetches. Duplicate admissions of the
/// same row by multiple branches are forwarded as-is: the view folds them
/// by identity, counting one reference per admitting branch.
pub struct FanIn {
    fan: Rc<RefCell<FanOut>>,
    branches: Vec<Branch>,
    schema: StreamSchema,
    primed: bool,
    cursor: usize,
}

impl FanIn {
    pub fn new(
        fan: Rc<RefCell<FanOut>>,
        branches: Vec<(Box<dyn Operator>, Rc<RefCell<VecDeque<Change>>>)>,
    ) -> Self {
        let schema = fan.borrow().input.schema().clone();
        Self {
            fan,
            branches: branches
                .into_iter()
                .map(|(op, feed)| Branch { op, feed })
                .collect(),
            schema,
            primed: false,
            cursor: 0,
        }
    }
}

impl Operator for FanIn {
    fn schema(&self) -> &StreamSchema {
        &self.schema
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        let mut per_branch = Vec::with_capacity(self.branches.len());
        for branch in &mut self.branches {
            let mut nodes = Vec::new();
            branch.op.fetch(req, &mut |node| {
                nodes.push(node);
                Step::Continue
            })?;
            per_branch.push(nodes);
        }
        merge_ordered(per_branch, &self.schema, req.reverse, visit)
    }

    fn fetch_relationship(
        &mut self,
        handle: JoinHandle,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Option<Step>, Error> {
        for branch in &mut self.branches {
            if let Some(step) = branch.op.fetch_relationship(handle, req, visit)? {
                return Ok(Some(step));
            }
        }
        Ok(None)
    }

    fn push(&mut self, conn: ConnectionId, change: &SourceChange) -> Result<(), Error> {
        self.fan.borrow_mut().input.push(conn, change)?;
        for branch in &mut self.branches {
            // Install at any leaves inside the branch body (join children).
            branch.op.push(conn, change)?;
        }
        Ok(())
    }

    fn pull(&mut self, ctx: &mut PushContext<'_>) -> Result<Option<Change>, Error> {
        if !self.primed {
            // Drain the shared upstream once and replicate its output to
            // every branch feed, in fixed registration order.
            let mut upstream = Vec::new();
            loop {
                let pulled = self.fan.borrow_mut().input.pull(ctx)?;
                match pulled {
                    Some(change) => upstream.push(change),
                    None => break,
                }
            }
            for branch in &self.branches {
                branch.feed.borrow_mut().extend(upstream.iter().cloned());
            }
            self.primed = true;
            self.cursor = 0;
        }

        while self.cursor < self.branches.len() {
            if let Some(change) = self.branches[self.cursor].op.pull(ctx)? {
                return Ok(Some(change));
            }
            self.cursor += 1;
            ctx.yield_now();
        }

        self.primed = false;
        self.cursor = 0;
        Ok(None)
    }

    fn destroy(&mut self) {
        for branch in &mut self.branches {
            branch.op.destroy();
        }
        self.fan.borrow_mut().input.destroy();
    }
}

/// UnionFanOut wraps the root of one union arm. It exists to mark the arm
/// boundary; its stream is its input's, unchanged.
pub struct UnionFanOut {
    input: Box<dyn Operator>,
}

impl UnionFanOut {
    pub fn new(input: Box<dyn Operator>) -> Self {
        Self { input }
    }
}

impl Operator for UnionFanOut {
    fn schema(&self) -> &StreamSchema {
        self.input.schema()
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        self.input.fetch(req, visit)
    }

    fn fetch_relationship(
        &mut self,
        handle: JoinHandle,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Option<Step>, Error> {
        self.input.fetch_relationship(handle, req, visit)
    }

    fn push(&mut self, conn: ConnectionId, change: &SourceChange) -> Result<(), Error> {
        self.input.push(conn, change)
    }

    fn pull(&mut self, ctx: &mut PushContext<'_>) -> Result<Option<Change>, Error> {
        self.input.pull(ctx)
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }
}

/// UnionFanIn merges independent sub-pipelines. Unlike [`FanIn`] there is
/// no shared upstream: each arm owns its own source connections, so every
/// delivery is offered to every arm and at most one responds. Downstream,
/// its semantics are identical to FanIn's.
pub struct UnionFanIn {
    branches: Vec<UnionFanOut>,
    schema: StreamSchema,
    cursor: usize,
}

impl UnionFanIn {
    pub fn new(branches: Vec<UnionFanOut>) -> Self {
        assert!(!branches.is_empty(), "a union has at least one arm");
        let schema = branches[0].input.schema().clone();
        Self {
            branches,
            schema,
            cursor: 0,
        }
    }
}

impl Operator for UnionFanIn {
    fn schema(&self) -> &StreamSchema {
        &self.schema
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        let mut per_branch = Vec::with_capacity(self.branches.len());
        for branch in &mut self.branches {
            let mut nodes = Vec::new();
            branch.fetch(req, &mut |node| {
                nodes.push(node);
                Step::Continue
            })?;
            per_branch.push(nodes);
        }
        merge_ordered(per_branch, &self.schema, req.reverse, visit)
    }

    fn fetch_relationship(
        &mut self,
        handle: JoinHandle,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Option<Step>, Error> {
        for branch in &mut self.branches {
            if let Some(step) = branch.fetch_relationship(handle, req, visit)? {
                return Ok(Some(step));
            }
        }
        Ok(None)
    }

    fn push(&mut self, conn: ConnectionId, change: &SourceChange) -> Result<(), Error> {
        for branch in &mut self.branches {
            branch.push(conn, change)?;
        }
        Ok(())
    }

    fn pull(&mut self, ctx: &mut PushContext<'_>) -> Result<Option<Change>, Error> {
        while self.cursor < self.branches.len() {
            if let Some(change) = self.branches[self.cursor].pull(ctx)? {
                return Ok(Some(change));
            }
            self.cursor += 1;
        }
        self.cursor = 0;
        Ok(None)
    }

    fn destroy(&mut self) {
        for branch in &mut self.branches {
            branch.destroy();
        }
    }
}

// K-way merge of per-branch node lists, each already in stream order.
// Equal rows surface once per admitting branch, lower branch first, so the
// view's reference counts observe every admission.
fn merge_ordered(
    per_branch: Vec<Vec<Node>>,
    schema: &StreamSchema,
    reverse: bool,
    visit: &mut dyn FnMut(Node) -> Step,
) -> Result<Step, Error> {
    let mut cursors = vec![0usize; per_branch.len()];

    loop {
        let mut best: Option<usize> = None;
        for (branch, nodes) in per_branch.iter().enumerate() {
            let Some(candidate) = nodes.get(cursors[branch]) else {
                continue;
            };
            best = match best {
                None => Some(branch),
                Some(current) => {
                    let ord = compare::rows(
                        &schema.order,
                        &candidate.row,
                        &per_branch[current][cursors[current]].row,
                    );
                    let ord = if reverse { ord.reverse() } else { ord };
                    if ord == Ordering::Less {
                        Some(branch)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        let Some(branch) = best else {
            return Ok(Step::Continue);
        };
        let node = per_branch[branch][cursors[branch]].clone();
        cursors[branch] += 1;
        if visit(node) == Step::Stop {
            return Ok(Step::Stop);
        }
    }
}
