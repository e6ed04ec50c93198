use crate::change::{Change, Node, SourceChange};
use crate::join::JoinHandle;
use crate::operator::{
    Basis, ConnectionId, FetchRequest, Operator, PushContext, Start, Step, StreamSchema,
};
use crate::Error;
use relation::{compare, Row};
use std::cmp::Ordering;

/// Skip drops rows ordered before its bound, exposing the suffix of its
/// input's stream. Edits crossing the bound surface as the half visible on
/// this side.
pub struct Skip {
    input: Box<dyn Operator>,
    bound: Row,
    /// When set, the bound row itself is excluded.
    exclusive: bool,
}

impl Skip {
    pub fn new(input: Box<dyn Operator>, bound: Row, exclusive: bool) -> Self {
        Self {
            input,
            bound,
            exclusive,
        }
    }

    fn visible(&self, row: &Row) -> bool {
        match compare::rows(&self.input.schema().order, row, &self.bound) {
            Ordering::Greater => true,
            Ordering::Equal => !self.exclusive,
            Ordering::Less => false,
        }
    }

    fn apply(&self, change: Change) -> Option<Change> {
        match change {
            Change::Add(node) => self.visible(&node.row).then(|| Change::Add(node)),
            Change::Remove(node) => self.visible(&node.row).then(|| Change::Remove(node)),
            Change::Edit { node, old_node } => {
                match (self.visible(&old_node.row), self.visible(&node.row)) {
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
            } => self.visible(&node.row).then(|| Change::Child {
                node,
                relationship,
                change,
            }),
        }
    }
}

impl Operator for Skip {
    fn schema(&self) -> &StreamSchema {
        self.input.schema()
    }

    fn fetch(
        &mut self,
        req: &FetchRequest,
        visit: &mut dyn FnMut(Node) -> Step,
    ) -> Result<Step, Error> {
        let order = self.input.schema().order.clone();
        let bound_start = Start {
            basis: if self.exclusive {
                Basis::After
            } else {
                Basis::At
            },
            row: self.bound.clone(),
        };

        if req.reverse {
            // A reverse scan begins at the top; clip it at the bound.
            let bound = self.bound.clone();
            let exclusive = self.exclusive;
            return self.input.fetch(req, &mut |node| {
                let in_range = match compare::rows(&order, &node.row, &bound) {
                    Ordering::Greater => true,
                    Ordering::Equal => !exclusive,
                    Ordering::Less => false,
                };
                if in_range {
                    visit(node)
                } else {
                    Step::Stop
                }
            });
        }

        // A forward scan starts at the later of the caller's cursor and the
        // bound.
        let start = match &req.start {
            None => Some(bound_start),
            Some(start) => match compare::rows(&order, &start.row, &self.bound) {
                Ordering::Less => Some(bound_start),
                Ordering::Equal if start.basis == Basis::At => Some(bound_start),
                _ => Some(start.clone()),
            },
        };
        let clipped = FetchRequest {
            constraint: req.constraint.clone(),
            start,
            reverse: false,
        };
        self.input.fetch(&clipped, visit)
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

    fn pipeline(exclusive: bool) -> (Rc<RefCell<MemorySource>>, Skip) {
        let mut source = MemorySource::new(TableSchema::new("t", &["id"])).unwrap();
        for id in ["a", "b", "c", "d"] {
            source
                .push(SourceChange::Add(row(json!({ "id": id }))))
                .unwrap();
        }
        let source = Rc::new(RefCell::new(source));
        let input = SourceInput::connect(
            source.clone(),
            &OrderBy::new(vec![OrderPart::asc("id")]),
            None,
            [],
        )
        .unwrap();
        let skip = Skip::new(Box::new(input), row(json!({"id": "b"})), exclusive);
        (source, skip)
    }

    fn ids(nodes: &[Node]) -> Vec<Value> {
        nodes
            .iter()
            .map(|n| n.row.value_or_null("id").clone())
            .collect()
    }

    #[test]
    fn test_fetch_clips_at_bound() {
        let (_source, mut skip) = pipeline(false);
        let nodes = fetch_collect(&mut skip, &FetchRequest::default()).unwrap();
        assert_eq!(
            ids(&nodes),
            vec![Value::from("b"), Value::from("c"), Value::from("d")]
        );

        let (_source, mut skip) = pipeline(true);
        let nodes = fetch_collect(&mut skip, &FetchRequest::default()).unwrap();
        assert_eq!(ids(&nodes), vec![Value::from("c"), Value::from("d")]);

        // Reverse stops at the bound.
        let (_source, mut skip) = pipeline(false);
        let nodes = fetch_collect(
            &mut skip,
            &FetchRequest {
                reverse: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            ids(&nodes),
            vec![Value::from("d"), Value::from("c"), Value::from("b")]
        );
    }

    #[test]
    fn test_push_edit_crossing_bound() {
        let (source, mut skip) = pipeline(false);

        // Moving `a` past the bound enters as an add.
        let deliveries = source
            .borrow_mut()
            .push(SourceChange::Edit {
                old: row(json!({"id": "a"})),
                new: row(json!({"id": "e"})),
            })
            .unwrap();
        let mut out = Vec::new();
        for delivery in &deliveries {
            out.extend(
                crate::operator::push_collect(
                    &mut skip,
                    delivery.connection,
                    &delivery.change,
                    &mut PushContext::new(),
                )
                .unwrap(),
            );
        }
        // The primary key moved, so the source split the edit; only the add
        // half is on this side of the bound.
        assert_eq!(out, vec![Change::Add(Node::bare(row(json!({"id": "e"}))))]);

        // A remove before the bound is invisible here.
        let deliveries = source
            .borrow_mut()
            .push(SourceChange::Remove(row(json!({"id": "e"}))))
            .unwrap();
        let mut out = Vec::new();
        for delivery in &deliveries {
            out.extend(
                crate::operator::push_collect(
                    &mut skip,
                    delivery.connection,
                    &delivery.change,
                    &mut PushContext::new(),
                )
                .unwrap(),
            );
        }
        assert_eq!(
            out,
            vec![Change::Remove(Node::bare(row(json!({"id": "e"}))))]
        );
    }
}
