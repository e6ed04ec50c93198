use crate::change::{Change, Node, SourceChange};
use crate::join::JoinHandle;
use crate::operator::{ConnectionId, FetchRequest, Operator, PushContext, Step, StreamSchema};
use crate::predicate::Predicate;
use crate::Error;
use fxhash::FxHashMap;
use relation::{Row, RowToken};
use std::cell::RefCell;
use std::rc::Rc;

/// FilterBank holds the predicates of one FilterStart/FilterEnd bracket and
/// the verdicts computed for the rows currently in flight between them.
///
/// FilterStart evaluates every predicate against a row exactly once and
/// records a verdict bitmask keyed by the row's shared allocation; the
/// bracketed Filters consult their slot instead of re-evaluating, and
/// FilterEnd retires the verdicts.
#[derive(Debug, Default)]
pub struct FilterBank {
    predicates: Vec<Predicate>,
    verdicts: FxHashMap<RowToken, u64>,
}

impl FilterBank {
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    /// Register a predicate, returning its slot. Brackets hold at most 64
    /// predicates; the builder chunks larger conjunctions.
    pub fn register(&mut self, predicate: Predicate) -> usize {
        assert!(self.predicates.len() < 64, "filter bracket is full");
        self.predicates.push(predicate);
        self.predicates.len() - 1
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    fn evaluate(&mut self, row: &Row) {
        let mut mask = 0u64;
        for (slot, predicate) in self.predicates.iter().enumerate() {
            if predicate.matches(row) {
                mask |= 1 << slot;
            }
        }
        self.verdicts.insert(row.token(), mask);
    }

    fn verdict(&self, row: &Row, slot: usize) -> Option<bool> {
        self.verdicts
            .get(&row.token())
            .map(|mask| mask & (1 << slot) != 0)
    }

    // Verdicts are only meaningful within one push traversal of the
    // bracket. FilterEnd retires the whole in-flight set, covering rows
    // whose changes were dropped before reaching it.
    fn retire_all(&mut self) {
        self.verdicts.clear();
    }
}

/// FilterStart opens a filter bracket: it computes the bank's verdicts for
/// every row passing through and forwards changes unchanged.
pub struct FilterStart {
    input: Box<dyn Operator>,
    bank: Rc<RefCell<FilterBank>>,
}

impl FilterStart {
    pub fn new(input: Box<dyn Operator>, bank: Rc<RefCell<FilterBank>>) -> Self {
        Self { input, bank }
    }
}

impl Operator for FilterStart {
    fn schema(&self) -> &StreamSchema {
        self.input.schema()
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        // Fetches evaluate per-Filter; the bank only serves pushes.
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
        let Some(change) = self.input.pull(ctx)? else {
            return Ok(None);
        };
        let mut bank = self.bank.borrow_mut();
        bank.evaluate(&change.node().row);
        if let Change::Edit { old_node, .. } = &change {
            bank.evaluate(&old_node.row);
        }
        Ok(Some(change))
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }
}

/// FilterEnd closes a filter bracket, retiring the bank's in-flight
/// verdicts once the delivery has drained.
pub struct FilterEnd {
    input: Box<dyn Operator>,
    bank: Rc<RefCell<FilterBank>>,
}

impl FilterEnd {
    pub fn new(input: Box<dyn Operator>, bank: Rc<RefCell<FilterBank>>) -> Self {
        Self { input, bank }
    }
}

impl Operator for FilterEnd {
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
        match self.input.pull(ctx)? {
            Some(change) => Ok(Some(change)),
            None => {
                self.bank.borrow_mut().retire_all();
                Ok(None)
            }
        }
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }
}

/// Filter drops changes whose rows fail its predicate. Edits where only
/// one of the old/new rows passes become the corresponding add or remove.
pub struct Filter {
    input: Box<dyn Operator>,
    predicate: Predicate,
    bank: Option<(Rc<RefCell<FilterBank>>, usize)>,
}

impl Filter {
    pub fn new(input: Box<dyn Operator>, predicate: Predicate) -> Self {
        Self {
            input,
            predicate,
            bank: None,
        }
    }

    /// A Filter inside a FilterStart/FilterEnd bracket, reading its verdict
    /// from the bank slot computed once per row.
    pub fn bracketed(
        input: Box<dyn Operator>,
        predicate: Predicate,
        bank: Rc<RefCell<FilterBank>>,
        slot: usize,
    ) -> Self {
        Self {
            input,
            predicate,
            bank: Some((bank, slot)),
        }
    }

    fn matches(&self, row: &Row) -> bool {
        if let Some((bank, slot)) = &self.bank {
            if let Some(verdict) = bank.borrow().verdict(row, *slot) {
                return verdict;
            }
        }
        self.predicate.matches(row)
    }

    fn apply(&self, change: Change) -> Option<Change> {
        match change {
            Change::Add(node) => self.matches(&node.row).then(|| Change::Add(node)),
            Change::Remove(node) => self.matches(&node.row).then(|| Change::Remove(node)),
            Change::Edit { node, old_node } => {
                match (self.matches(&old_node.row), self.matches(&node.row)) {
                    (true, true) => Some(Change::Edit { node, old_node }),
                    (true, false) => Some(Change::Remove(old_node)),
                    (false, true) => Some(Change::Add(node)),
                    (false, false) => None,
                }
            }
            Change::Child {
                node,
                relationship,
                change,
            } => {
                // The parent row is unchanged by a child change; it passes
                // iff it is currently in the result.
                self.matches(&node.row).then(|| Change::Child {
                    node,
                    relationship,
                    change,
                })
            }
        }
    }
}

impl Operator for Filter {
    fn schema(&self) -> &StreamSchema {
        self.input.schema()
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        let predicate = &self.predicate;
        self.input.fetch(req, &mut |node| {
            if predicate.matches(&node.row) {
                visit(node)
            } else {
                Step::Continue
            }
        })
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
        while let Some(change) = self.input.pull(ctx)? {
            if let Some(change) = self.apply(change) {
                return Ok(Some(change));
            }
        }
        Ok(None)
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }
}
