use crate::change::{Change, Node, SourceChange};
use crate::join::JoinHandle;
use crate::operator::{ConnectionId, FetchRequest, Operator, PushContext, Step, StreamSchema};
use crate::Error;
use fxhash::FxHashMap;
use query::ExistsOp;
use relation::RowKey;

/// Exists gates its parent stream on the presence (or, for NOT EXISTS,
/// absence) of children under one relationship of the join beneath it.
///
/// It maintains a non-negative per-parent child count. A parent surfaces
/// when the count crosses into the visible range and disappears when it
/// crosses out; child changes of visible parents pass through nested.
pub struct Exists {
    input: Box<dyn Operator>,
    relationship: String,
    op: ExistsOp,
    counts: FxHashMap<RowKey, i64>,
}

impl Exists {
    pub fn new(input: Box<dyn Operator>, relationship: String, op: ExistsOp) -> Self {
        Self {
            input,
            relationship,
            op,
            counts: FxHashMap::default(),
        }
    }

    fn visible(&self, count: i64) -> bool {
        match self.op {
            ExistsOp::Exists => count > 0,
            ExistsOp::NotExists => count == 0,
        }
    }

    fn key(&self, node: &Node) -> RowKey {
        self.input.schema().row_key(&node.row)
    }

    // Count the node's current children by draining its relationship
    // reference through the join.
    fn compute_count(&mut self, node: &Node) -> Result<i64, Error> {
        let Some(rel) = node.relationships.get(&self.relationship).cloned() else {
            tracing::debug!(
                relationship = %self.relationship,
                "node lacks the gating relationship; counting zero children"
            );
            return Ok(0);
        };

        let mut count = 0i64;
        self.input.fetch_relationship(
            rel.handle,
            &FetchRequest::constrained(rel.constraint),
            &mut |_node| {
                count += 1;
                Step::Continue
            },
        )?;
        Ok(count)
    }

    fn cached_or_computed(&mut self, node: &Node) -> Result<i64, Error> {
        let key = self.key(node);
        if let Some(count) = self.counts.get(&key) {
            return Ok(*count);
        }
        let count = self.compute_count(node)?;
        self.counts.insert(key, count);
        Ok(count)
    }

    // Map one input change to at most one output change.
    fn apply(&mut self, change: Change) -> Result<Option<Change>, Error> {
        Ok(match change {
            Change::Add(node) => {
                let count = self.compute_count(&node)?;
                self.counts.insert(self.key(&node), count);
                self.visible(count).then(|| Change::Add(node))
            }
            Change::Remove(node) => {
                let key = self.key(&node);
                let count = match self.counts.remove(&key) {
                    Some(count) => count,
                    None => self.compute_count(&node)?,
                };
                self.visible(count).then(|| Change::Remove(node))
            }
            Change::Edit { node, old_node } => {
                let count = self.cached_or_computed(&node)?;
                self.visible(count).then(|| Change::Edit { node, old_node })
            }
            Change::Child {
                node,
                relationship,
                change,
            } if relationship == self.relationship => {
                let delta = match &*change {
                    Change::Add(_) => 1,
                    Change::Remove(_) => -1,
                    Change::Edit { .. } | Change::Child { .. } => 0,
                };

                let key = self.key(&node);
                let old_count = match self.counts.get(&key) {
                    Some(count) => *count,
                    None => {
                        // The relationship drain reflects the post-change
                        // state; back the delta out to recover the prior
                        // count.
                        let current = self.compute_count(&node)?;
                        (current - delta).max(0)
                    }
                };

                if delta < 0 && old_count == 0 {
                    // A windowed operator downstream can pull rows into
                    // scope whose removal is then replayed through the
                    // join. The replayed remove is not an error.
                    tracing::debug!(
                        relationship = %self.relationship,
                        "dropping child remove at count zero"
                    );
                    self.counts.insert(key, 0);
                    return Ok(None);
                }

                let new_count = (old_count + delta).max(0);
                self.counts.insert(key, new_count);

                match (self.visible(old_count), self.visible(new_count)) {
                    (false, true) => Some(Change::Add(node)),
                    (true, false) => Some(Change::Remove(node)),
                    (true, true) => Some(Change::Child {
                        node,
                        relationship,
                        change,
                    }),
                    (false, false) => None,
                }
            }
            Change::Child {
                node,
                relationship,
                change,
            } => {
                // A change under some other relationship: pass it through
                // for parents currently in the result.
                let count = self.cached_or_computed(&node)?;
                self.visible(count).then(|| Change::Child {
                    node,
                    relationship,
                    change,
                })
            }
        })
    }
}

impl Operator for Exists {
    fn schema(&self) -> &StreamSchema {
        self.input.schema()
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        // Two phases: visitors must not call back into the pipeline, and
        // counting requires a relationship drain per node. Counts are
        // cached for every scanned node, seen or not, so later windowed
        // pulls observe sizes consistent with the changes already applied.
        let mut nodes = Vec::new();
        self.input.fetch(req, &mut |node| {
            nodes.push(node);
            Step::Continue
        })?;

        let mut stopped = Step::Continue;
        let mut visible = Vec::with_capacity(nodes.len());
        for node in nodes {
            let count = self.cached_or_computed(&node)?;
            visible.push(self.visible(count).then_some(node));
        }
        for node in visible.into_iter().flatten() {
            if stopped == Step::Continue && visit(node) == Step::Stop {
                stopped = Step::Stop;
            }
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
        while let Some(change) = self.input.pull(ctx)? {
            if let Some(change) = self.apply(change)? {
                return Ok(Some(change));
            }
        }
        Ok(None)
    }

    fn destroy(&mut self) {
        self.counts.clear();
        self.input.destroy();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::join::Join;
    use crate::operator::fetch_collect;
    use crate::source::{MemorySource, SourceInput};
    use pretty_assertions::assert_eq;
    use query::System;
    use relation::{OrderBy, OrderPart, Row, TableSchema};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn row(v: serde_json::Value) -> Row {
        Row::from_value(v).unwrap()
    }

    struct Fixture {
        issues: Rc<RefCell<MemorySource>>,
        comments: Rc<RefCell<MemorySource>>,
        exists: Exists,
    }

    fn fixture(op: ExistsOp) -> Fixture {
        let mut issues = MemorySource::new(TableSchema::new("issue", &["id"])).unwrap();
        issues
            .push(SourceChange::Add(row(json!({"id": "i1", "text": "first"}))))
            .unwrap();
        issues
            .push(SourceChange::Add(row(json!({"id": "i2", "text": "second"}))))
            .unwrap();
        let issues = Rc::new(RefCell::new(issues));

        let mut comments = MemorySource::new(TableSchema::new("comment", &["id"])).unwrap();
        comments
            .push(SourceChange::Add(row(json!({"id": "c1", "issueID": "i1"}))))
            .unwrap();
        let comments = Rc::new(RefCell::new(comments));

        let order = OrderBy::new(vec![OrderPart::asc("id")]);
        let parent = SourceInput::connect(issues.clone(), &order, None, []).unwrap();
        let child = SourceInput::connect(comments.clone(), &order, None, []).unwrap();

        let join = Join::new(
            Box::new(parent),
            Box::new(child),
            vec!["id".to_string()],
            vec!["issueID".to_string()],
            "comments".to_string(),
            JoinHandle::new(0),
            System::Client,
            true,
        );
        let exists = Exists::new(Box::new(join), "comments".to_string(), op);
        Fixture {
            issues,
            comments,
            exists,
        }
    }

    fn push_through(fx: &mut Fixture, comments: bool, change: SourceChange) -> Vec<Change> {
        let source = if comments {
            fx.comments.clone()
        } else {
            fx.issues.clone()
        };
        let deliveries = source.borrow_mut().push(change).unwrap();
        let mut out = Vec::new();
        for delivery in &deliveries {
            out.extend(
                crate::operator::push_collect(
                    &mut fx.exists,
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
    fn test_fetch_filters_parents_without_children() {
        let mut fx = fixture(ExistsOp::Exists);
        let nodes = fetch_collect(&mut fx.exists, &FetchRequest::default()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].row.value_or_null("id"), &"i1".into());

        let mut fx = fixture(ExistsOp::NotExists);
        let nodes = fetch_collect(&mut fx.exists, &FetchRequest::default()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].row.value_or_null("id"), &"i2".into());
    }

    #[test]
    fn test_last_child_removal_empties_parent() {
        let mut fx = fixture(ExistsOp::Exists);
        // Materialize to seed the counts.
        fetch_collect(&mut fx.exists, &FetchRequest::default()).unwrap();

        let out = push_through(
            &mut fx,
            true,
            SourceChange::Remove(row(json!({"id": "c1", "issueID": "i1"}))),
        );
        assert_eq!(out.len(), 1);
        assert!(
            matches!(&out[0], Change::Remove(node) if node.row.value_or_null("id") == &"i1".into())
        );

        // And the reverse: a first child surfaces the parent.
        let out = push_through(
            &mut fx,
            true,
            SourceChange::Add(row(json!({"id": "c9", "issueID": "i2"}))),
        );
        assert_eq!(out.len(), 1);
        assert!(
            matches!(&out[0], Change::Add(node) if node.row.value_or_null("id") == &"i2".into())
        );
    }

    #[test]
    fn test_child_remove_at_count_zero_is_dropped() {
        let mut fx = fixture(ExistsOp::Exists);
        fetch_collect(&mut fx.exists, &FetchRequest::default()).unwrap();

        // Remove c1 twice's worth: the first empties i1, then a replayed
        // remove of a sibling key arrives while the count sits at zero.
        push_through(
            &mut fx,
            true,
            SourceChange::Remove(row(json!({"id": "c1", "issueID": "i1"}))),
        );

        // Seed another comment and remove it while forcing the cached
        // count to zero, as a windowed replay would.
        fx.comments
            .borrow_mut()
            .push(SourceChange::Add(row(json!({"id": "c2", "issueID": "i1"}))))
            .unwrap();
        fx.exists
            .counts
            .insert(RowKey::extract(&row(json!({"id": "i1"})), &["id".to_string()]), 0);

        let out = push_through(
            &mut fx,
            true,
            SourceChange::Remove(row(json!({"id": "c2", "issueID": "i1"}))),
        );
        assert_eq!(out, vec![]);
    }

    #[test]
    fn test_second_child_change_stays_nested() {
        let mut fx = fixture(ExistsOp::Exists);
        fetch_collect(&mut fx.exists, &FetchRequest::default()).unwrap();

        // i1 already has c1; a second child keeps it visible and the change
        // flows through nested.
        let out = push_through(
            &mut fx,
            true,
            SourceChange::Add(row(json!({"id": "c2", "issueID": "i1"}))),
        );
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Change::Child { .. }));
    }
}
