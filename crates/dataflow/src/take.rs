use crate::change::{Change, Node, SourceChange};
use crate::join::JoinHandle;
use crate::operator::{
    Basis, ConnectionId, FetchRequest, Operator, PushContext, Start, Step, StreamSchema,
};
use crate::storage::Storage;
use crate::Error;
use relation::{compare, Row};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// The window's persistent state, kept in per-query Storage.
// `bound` is the largest row currently in the window, `size <= limit`, and
// `max_bound` is the largest row ever admitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TakeState {
    bound: Option<Row>,
    size: usize,
    max_bound: Option<Row>,
}

/// Take maintains a sliding window over the first `limit` rows of its
/// input's ordering. Adds below the bound evict the current bound row;
/// removes inside the window pull the next row beyond it into scope.
pub struct Take {
    input: Box<dyn Operator>,
    limit: usize,
    storage: Storage,
    storage_key: String,
    queue: std::collections::VecDeque<Change>,
}

impl Take {
    pub fn new(
        input: Box<dyn Operator>,
        limit: usize,
        storage: Storage,
        storage_key: String,
    ) -> Self {
        Self {
            input,
            limit,
            storage,
            storage_key,
            queue: std::collections::VecDeque::new(),
        }
    }

    fn load(&self) -> TakeState {
        self.storage.get(&self.storage_key).unwrap_or_default()
    }

    fn save(&self, state: &TakeState) {
        self.storage.set(&self.storage_key, state);
    }

    fn cmp_rows(&self, a: &Row, b: &Row) -> Ordering {
        compare::rows(&self.input.schema().order, a, b)
    }

    fn in_window(&self, state: &TakeState, row: &Row) -> bool {
        match &state.bound {
            None => false,
            Some(bound) => self.cmp_rows(row, bound) != Ordering::Greater,
        }
    }

    // The first `n` nodes at or before `bound`, scanning backwards.
    fn fetch_reverse_from(&mut self, bound: &Row, n: usize) -> Result<Vec<Node>, Error> {
        let mut nodes = Vec::with_capacity(n);
        self.input.fetch(
            &FetchRequest {
                constraint: None,
                start: Some(Start {
                    basis: Basis::At,
                    row: bound.clone(),
                }),
                reverse: true,
            },
            &mut |node| {
                nodes.push(node);
                if nodes.len() < n {
                    Step::Continue
                } else {
                    Step::Stop
                }
            },
        )?;
        Ok(nodes)
    }

    // The first node strictly after `bound`, if any.
    fn fetch_successor(&mut self, bound: &Row) -> Result<Option<Node>, Error> {
        let mut found = None;
        self.input.fetch(
            &FetchRequest {
                constraint: None,
                start: Some(Start {
                    basis: Basis::After,
                    row: bound.clone(),
                }),
                reverse: false,
            },
            &mut |node| {
                found = Some(node);
                Step::Stop
            },
        )?;
        Ok(found)
    }

    fn grows_max(&self, state: &mut TakeState, row: &Row) {
        let grows = match &state.max_bound {
            None => true,
            Some(max) => self.cmp_rows(row, max) == Ordering::Greater,
        };
        if grows {
            state.max_bound = Some(row.clone());
        }
    }

    // Queue this operator's reaction to one input change.
    fn apply(&mut self, change: Change, ctx: &mut PushContext<'_>) -> Result<(), Error> {
        if self.limit == 0 {
            return Ok(());
        }
        let mut state = self.load();

        match change {
            Change::Add(node) => {
                if state.size < self.limit {
                    let grows_bound = match &state.bound {
                        None => true,
                        Some(bound) => self.cmp_rows(&node.row, bound) == Ordering::Greater,
                    };
                    if grows_bound {
                        state.bound = Some(node.row.clone());
                    }
                    self.grows_max(&mut state, &node.row);
                    state.size += 1;
                    self.save(&state);
                    self.queue.push_back(Change::Add(node));
                    return Ok(());
                }

                let bound = state.bound.clone().expect("a full window has a bound");
                if self.cmp_rows(&node.row, &bound) == Ordering::Greater {
                    // Above the bound: ignored, like any edit replayed out
                    // there.
                    return Ok(());
                }

                // The window is full: admit the row and evict the bound.
                self.queue.push_back(Change::Add(node));
                ctx.yield_now();

                let tail = self.fetch_reverse_from(&bound, 2)?;
                let mut tail = tail.into_iter();
                let evicted = tail.next().expect("the bound row is fetchable");
                let new_bound = tail.next().expect("a full window has k >= 1 rows");

                state.bound = Some(new_bound.row.clone());
                self.save(&state);
                self.queue.push_back(Change::Remove(evicted));
            }
            Change::Remove(node) => {
                if !self.in_window(&state, &node.row) {
                    return Ok(());
                }
                let bound = state.bound.clone().expect("in_window implies a bound");
                self.queue.push_back(Change::Remove(node.clone()));
                ctx.yield_now();

                match self.fetch_successor(&bound)? {
                    Some(replacement) => {
                        state.bound = Some(replacement.row.clone());
                        self.grows_max(&mut state, &replacement.row);
                        self.save(&state);
                        self.queue.push_back(Change::Add(replacement));
                    }
                    None => {
                        state.size -= 1;
                        if self.cmp_rows(&node.row, &bound) == Ordering::Equal {
                            state.bound = self
                                .fetch_reverse_from(&bound, 1)?
                                .into_iter()
                                .next()
                                .map(|n| n.row);
                        }
                        if state.size == 0 {
                            state.bound = None;
                        }
                        self.save(&state);
                    }
                }
            }
            Change::Edit { node, old_node } => {
                if self.cmp_rows(&old_node.row, &node.row) != Ordering::Equal {
                    // The edit moves the row in this ordering; the source's
                    // split keys normally prevent this, but translate it
                    // rather than corrupt the window.
                    self.apply(Change::Remove(old_node), ctx)?;
                    self.apply(Change::Add(node), ctx)?;
                    return Ok(());
                }
                if self.in_window(&state, &old_node.row) {
                    self.queue.push_back(Change::Edit { node, old_node });
                }
            }
            Change::Child {
                node,
                relationship,
                change,
            } => {
                if self.in_window(&state, &node.row) {
                    self.queue.push_back(Change::Child {
                        node,
                        relationship,
                        change,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Operator for Take {
    fn schema(&self) -> &StreamSchema {
        self.input.schema()
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        if self.limit == 0 {
            return Ok(Step::Continue);
        }

        if req.reverse {
            // The window scanned from its bound downward.
            let state = self.load();
            let Some(bound) = state.bound else {
                return Ok(Step::Continue);
            };
            let limit = self.limit;
            let mut seen = 0usize;
            return self.input.fetch(
                &FetchRequest {
                    constraint: req.constraint.clone(),
                    start: Some(Start {
                        basis: Basis::At,
                        row: bound,
                    }),
                    reverse: true,
                },
                &mut |node| {
                    seen += 1;
                    let step = visit(node);
                    if step == Step::Stop || seen == limit {
                        Step::Stop
                    } else {
                        Step::Continue
                    }
                },
            );
        }

        let state = self.load();
        let hydrate =
            req.constraint.is_none() && req.start.is_none() && state.bound.is_none();

        // With an established window, clip the scan at its bound so
        // constrained lookups never see rows beyond it.
        let bound = state.bound;
        let order = self.input.schema().order.clone();
        let limit = self.limit;
        let mut seen = 0usize;
        let mut last: Option<Row> = None;
        let stopped = self.input.fetch(req, &mut |node| {
            if let Some(bound) = &bound {
                if compare::rows(&order, &node.row, bound) == Ordering::Greater {
                    return Step::Stop;
                }
            }
            seen += 1;
            last = Some(node.row.clone());
            let step = visit(node);
            if step == Step::Stop || seen == limit {
                Step::Stop
            } else {
                Step::Continue
            }
        })?;

        // A complete plain scan establishes the window state.
        if hydrate && (stopped == Step::Continue || seen == limit) {
            let state = TakeState {
                bound: last.clone(),
                size: seen,
                max_bound: last,
            };
            self.save(&state);
        }
        Ok(stopped)
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
        loop {
            if let Some(change) = self.queue.pop_front() {
                return Ok(Some(change));
            }
            match self.input.pull(ctx)? {
                Some(change) => self.apply(change, ctx)?,
                None => return Ok(None),
            }
        }
    }

    fn destroy(&mut self) {
        self.storage.remove(&self.storage_key);
        self.input.destroy();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::operator::fetch_collect;
    use crate::source::{MemorySource, SourceInput};
    use pretty_assertions::assert_eq;
    use relation::{OrderBy, OrderPart, TableSchema, Value};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn row(v: serde_json::Value) -> Row {
        Row::from_value(v).unwrap()
    }

    fn pipeline(limit: usize, ids: &[&str]) -> (Rc<RefCell<MemorySource>>, Take) {
        let mut source = MemorySource::new(TableSchema::new("t", &["id"])).unwrap();
        for id in ids {
            source
                .push(SourceChange::Add(row(json!({ "id": *id }))))
                .unwrap();
        }
        let source = Rc::new(RefCell::new(source));
        let input = SourceInput::connect(
            source.clone(),
            &OrderBy::new(vec![OrderPart::asc("id")]),
            None,
            ["id".to_string()],
        )
        .unwrap();
        let take = Take::new(
            Box::new(input),
            limit,
            Storage::new(),
            "take/0".to_string(),
        );
        (source, take)
    }

    fn ids(changes: &[Change]) -> Vec<(&'static str, Value)> {
        changes
            .iter()
            .map(|change| match change {
                Change::Add(n) => ("add", n.row.value_or_null("id").clone()),
                Change::Remove(n) => ("remove", n.row.value_or_null("id").clone()),
                Change::Edit { node, .. } => ("edit", node.row.value_or_null("id").clone()),
                Change::Child { node, .. } => ("child", node.row.value_or_null("id").clone()),
            })
            .collect()
    }

    fn push_through(
        source: &Rc<RefCell<MemorySource>>,
        take: &mut Take,
        change: SourceChange,
    ) -> Vec<Change> {
        let deliveries = source.borrow_mut().push(change).unwrap();
        let mut out = Vec::new();
        for delivery in &deliveries {
            out.extend(
                crate::operator::push_collect(
                    take,
                    delivery.connection,
                    &delivery.change,
                    &mut PushContext::new(),
                )
                .unwrap(),
            );
        }
        out
    }

    #[test]
    fn test_fetch_returns_window_and_hydrates() {
        let (_source, mut take) = pipeline(2, &["a", "b", "c"]);
        let nodes = fetch_collect(&mut take, &FetchRequest::default()).unwrap();
        assert_eq!(
            nodes
                .iter()
                .map(|n| n.row.value_or_null("id").clone())
                .collect::<Vec<_>>(),
            vec![Value::from("a"), Value::from("b")]
        );

        let state = take.load();
        assert_eq!(state.size, 2);
        assert_eq!(state.bound, Some(row(json!({"id": "b"}))));
    }

    #[test]
    fn test_add_below_bound_evicts() {
        let (source, mut take) = pipeline(2, &["b", "c", "d"]);
        fetch_collect(&mut take, &FetchRequest::default()).unwrap();

        // "a" sorts below the window: admitted, "c" evicted.
        let out = push_through(&source, &mut take, SourceChange::Add(row(json!({"id": "a"}))));
        assert_eq!(
            ids(&out),
            vec![("add", Value::from("a")), ("remove", Value::from("c"))]
        );
        assert_eq!(take.load().bound, Some(row(json!({"id": "b"}))));

        // "z" sorts above: dropped.
        let out = push_through(&source, &mut take, SourceChange::Add(row(json!({"id": "z"}))));
        assert_eq!(out, vec![]);
    }

    #[test]
    fn test_remove_in_window_pulls_replacement() {
        let (source, mut take) = pipeline(2, &["a", "b", "c"]);
        fetch_collect(&mut take, &FetchRequest::default()).unwrap();

        let out = push_through(
            &source,
            &mut take,
            SourceChange::Remove(row(json!({"id": "a"}))),
        );
        assert_eq!(
            ids(&out),
            vec![("remove", Value::from("a")), ("add", Value::from("c"))]
        );
        assert_eq!(take.load().bound, Some(row(json!({"id": "c"}))));

        // No replacement left: the window shrinks.
        let out = push_through(
            &source,
            &mut take,
            SourceChange::Remove(row(json!({"id": "c"}))),
        );
        assert_eq!(ids(&out), vec![("remove", Value::from("c"))]);
        let state = take.load();
        assert_eq!(state.size, 1);
        assert_eq!(state.bound, Some(row(json!({"id": "b"}))));
    }

    #[test]
    fn test_edit_crossing_bound_via_split_keys() {
        // `id` is a split key, so the source splits the bound-crossing edit
        // into remove + add before it reaches the window.
        let (source, mut take) = pipeline(1, &["a", "b"]);
        fetch_collect(&mut take, &FetchRequest::default()).unwrap();

        let out = push_through(
            &source,
            &mut take,
            SourceChange::Edit {
                old: row(json!({"id": "a"})),
                new: row(json!({"id": "z"})),
            },
        );
        assert_eq!(
            ids(&out),
            vec![("remove", Value::from("a")), ("add", Value::from("b"))]
        );

        let nodes = fetch_collect(&mut take, &FetchRequest::default()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].row, row(json!({"id": "b"})));
    }

    #[test]
    fn test_edit_above_bound_dropped() {
        let (source, mut take) = pipeline(1, &["a", "b", "c"]);
        fetch_collect(&mut take, &FetchRequest::default()).unwrap();

        // An edit out in the ignored region, not touching ordering columns.
        let out = push_through(
            &source,
            &mut take,
            SourceChange::Edit {
                old: row(json!({"id": "c"})),
                new: row(json!({"id": "c", "note": "x"})),
            },
        );
        assert_eq!(out, vec![]);

        // In-window edits that keep their position stay edits.
        let out = push_through(
            &source,
            &mut take,
            SourceChange::Edit {
                old: row(json!({"id": "a"})),
                new: row(json!({"id": "a", "note": "y"})),
            },
        );
        assert_eq!(ids(&out), vec![("edit", Value::from("a"))]);
    }
}
