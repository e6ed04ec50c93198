use crate::exists::Exists;
use crate::fan::{BranchInput, FanIn, FanOut};
use crate::filter::{Filter, FilterBank, FilterEnd, FilterStart};
use crate::join::{FlippedJoin, Join, JoinHandle};
use crate::operator::{ConnectionId, Operator};
use crate::predicate::Predicate;
use crate::source::{MemorySource, SourceInput};
use crate::storage::Storage;
use crate::take::Take;
use crate::Error;
use query::{Ast, Condition, CorrelatedSubquery, ExistsOp, Format};
use relation::OrderBy;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

/// Hooks the host may use to wrap operators for observability. Decorators
/// must preserve semantics; the default implementation is the identity.
pub trait BuilderDelegate {
    fn decorate_input(&mut self, input: Box<dyn Operator>, name: &str) -> Box<dyn Operator> {
        let _ = name;
        input
    }

    fn decorate_source_input(
        &mut self,
        input: Box<dyn Operator>,
        table: &str,
    ) -> Box<dyn Operator> {
        let _ = table;
        input
    }

    fn decorate_filter_input(&mut self, input: Box<dyn Operator>) -> Box<dyn Operator> {
        input
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        let _ = (from, to);
    }
}

/// The no-op delegate.
impl BuilderDelegate for () {}

/// The compiled pipeline: its root, the result shape, the source
/// connections it holds, and the sibling ordering of every materialized
/// level, keyed by `/`-joined relationship path (`""` for the root).
pub struct BuiltPipeline {
    pub root: Box<dyn Operator>,
    pub format: Format,
    pub connections: Vec<ConnectionId>,
    pub orders: BTreeMap<String, OrderBy>,
    pub storage: Storage,
}

impl std::fmt::Debug for BuiltPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltPipeline")
            .field("format", &self.format)
            .field("connections", &self.connections)
            .field("orders", &self.orders)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

/// Builder walks an AST bottom-up and wires the operator tree:
/// source inputs with push-down filters, filter brackets, exists joins,
/// the root window, and the projected relationship joins feeding the view.
pub struct Builder<'a, D: BuilderDelegate> {
    sources: &'a HashMap<String, Rc<RefCell<MemorySource>>>,
    delegate: &'a mut D,
    enable_not_exists: bool,
    next_handle: u32,
    next_take: u32,
    connections: Vec<ConnectionId>,
    orders: BTreeMap<String, OrderBy>,
    storage: Storage,
}

impl<'a, D: BuilderDelegate> Builder<'a, D> {
    pub fn new(
        sources: &'a HashMap<String, Rc<RefCell<MemorySource>>>,
        delegate: &'a mut D,
        enable_not_exists: bool,
    ) -> Self {
        Self {
            sources,
            delegate,
            enable_not_exists,
            next_handle: 0,
            next_take: 0,
            connections: Vec::new(),
            orders: BTreeMap::new(),
            storage: Storage::new(),
        }
    }

    pub fn build(mut self, ast: &Ast) -> Result<BuiltPipeline, Error> {
        let root = self.build_query(ast, "")?;
        tracing::debug!(
            table = %ast.table,
            connections = self.connections.len(),
            "compiled pipeline"
        );
        Ok(BuiltPipeline {
            root,
            format: Format::for_ast(ast),
            connections: self.connections,
            orders: self.orders,
            storage: self.storage,
        })
    }

    fn build_query(&mut self, ast: &Ast, path: &str) -> Result<Box<dyn Operator>, Error> {
        let source = self
            .sources
            .get(&ast.table)
            .ok_or_else(|| Error::UnknownTable(ast.table.clone()))?;
        let schema = source.borrow().schema().clone();
        let order = ast.order_by.ensure_total(&schema);
        self.orders.insert(path.to_string(), order.clone());

        // A window downstream keys its bound on the ordering columns; edits
        // touching them must arrive split.
        let split_edit_keys: Vec<String> = if ast.limit.is_some() {
            order.columns().map(str::to_string).collect()
        } else {
            Vec::new()
        };

        let input = SourceInput::connect(
            source.clone(),
            &order,
            ast.where_.as_ref(),
            split_edit_keys,
        )?;
        self.connections.push(input.connection());
        let fully_applied = input.fully_applied_filters();
        let mut op = self
            .delegate
            .decorate_source_input(Box::new(input), &ast.table);

        if let Some(where_) = &ast.where_ {
            if !fully_applied {
                op = self.compile_condition(op, where_, path)?;
            }
        }

        if let Some(limit) = ast.limit {
            if path.is_empty() {
                let storage_key = format!("take/{}", self.next_take);
                self.next_take += 1;
                op = Box::new(Take::new(op, limit, self.storage.clone(), storage_key));
                op = self.delegate.decorate_input(op, "take");
            }
            // A nested limit shapes the Format (singular relationships)
            // rather than installing a window.
        }

        for related in &ast.related {
            if related.hidden {
                continue;
            }
            let name = related.subquery.relationship_name().to_string();
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}/{name}")
            };
            op = self.attach_join(op, related, &name, &child_path, false)?;
        }
        Ok(op)
    }

    fn compile_condition(
        &mut self,
        input: Box<dyn Operator>,
        condition: &Condition,
        path: &str,
    ) -> Result<Box<dyn Operator>, Error> {
        match condition {
            Condition::And { conditions } => {
                let (plain, subqueries): (Vec<_>, Vec<_>) = conditions
                    .iter()
                    .partition(|c| !contains_subquery(c));

                let mut op = self.compile_plain_filters(input, &plain)?;
                for condition in subqueries {
                    op = self.compile_condition(op, condition, path)?;
                }
                Ok(op)
            }
            Condition::Or { conditions } => {
                let fan = FanOut::new(input);
                let mut branches = Vec::with_capacity(conditions.len());
                for condition in conditions {
                    let feed = Rc::new(RefCell::new(VecDeque::new()));
                    let leaf: Box<dyn Operator> =
                        Box::new(BranchInput::new(fan.clone(), feed.clone()));
                    let body = self.compile_condition(leaf, condition, path)?;
                    branches.push((body, feed));
                }
                let op: Box<dyn Operator> = Box::new(FanIn::new(fan, branches));
                Ok(self.delegate.decorate_input(op, "fan-in"))
            }
            Condition::Subquery(subquery) => {
                let relationship = format!(
                    "{}#{}",
                    subquery.related.subquery.relationship_name(),
                    self.next_handle
                );
                let join = self.attach_join(
                    input,
                    &subquery.related,
                    &relationship,
                    &relationship,
                    subquery.flip,
                )?;

                if subquery.op == ExistsOp::NotExists && !self.enable_not_exists {
                    return Err(Error::NotExistsDisabled);
                }
                let op: Box<dyn Operator> =
                    Box::new(Exists::new(join, relationship, subquery.op));
                Ok(self.delegate.decorate_input(op, "exists"))
            }
            Condition::Simple(_) | Condition::Not { .. } => {
                if contains_subquery(condition) {
                    return Err(Error::NotOverSubquery);
                }
                self.compile_plain_filters(input, &[condition])
            }
        }
    }

    // One Filter for a lone predicate; a FilterStart/FilterEnd bracket
    // evaluating every predicate in a single pass for two or more.
    fn compile_plain_filters(
        &mut self,
        input: Box<dyn Operator>,
        conditions: &[&Condition],
    ) -> Result<Box<dyn Operator>, Error> {
        match conditions {
            [] => Ok(input),
            [condition] => {
                let predicate = Predicate::compile(condition)?;
                let op: Box<dyn Operator> = Box::new(Filter::new(input, predicate));
                Ok(self.delegate.decorate_filter_input(op))
            }
            conditions => {
                let bank = FilterBank::new();
                let mut op: Box<dyn Operator> =
                    Box::new(FilterStart::new(input, bank.clone()));
                for condition in conditions {
                    let predicate = Predicate::compile(condition)?;
                    let slot = bank.borrow_mut().register(predicate.clone());
                    op = Box::new(Filter::bracketed(op, predicate, bank.clone(), slot));
                    op = self.delegate.decorate_filter_input(op);
                }
                Ok(Box::new(FilterEnd::new(op, bank)))
            }
        }
    }

    fn attach_join(
        &mut self,
        parent: Box<dyn Operator>,
        related: &CorrelatedSubquery,
        relationship: &str,
        child_path: &str,
        flip: bool,
    ) -> Result<Box<dyn Operator>, Error> {
        let hidden = related.hidden || relationship.contains('#');
        let child = self.build_query(&related.subquery, child_path)?;
        let handle = JoinHandle::new(self.next_handle);
        self.next_handle += 1;

        self.delegate
            .add_edge(parent.schema().table.name.as_str(), relationship);

        let op: Box<dyn Operator> = if flip {
            Box::new(FlippedJoin::new(
                parent,
                child,
                related.correlation.parent_field.clone(),
                related.correlation.child_field.clone(),
                relationship.to_string(),
                handle,
                related.system,
                hidden,
            ))
        } else {
            Box::new(Join::new(
                parent,
                child,
                related.correlation.parent_field.clone(),
                related.correlation.child_field.clone(),
                relationship.to_string(),
                handle,
                related.system,
                hidden,
            ))
        };
        Ok(self.delegate.decorate_input(op, relationship))
    }
}

fn contains_subquery(condition: &Condition) -> bool {
    match condition {
        Condition::Simple(_) => false,
        Condition::And { conditions } | Condition::Or { conditions } => {
            conditions.iter().any(contains_subquery)
        }
        Condition::Not { condition } => contains_subquery(condition),
        Condition::Subquery(_) => true,
    }
}
