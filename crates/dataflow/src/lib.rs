//! The incremental view maintenance engine.
//!
//! A query AST compiles into a pipeline of streaming operators rooted at an
//! ordered, indexed [`MemorySource`]. The pipeline materializes an initial
//! result and thereafter maintains it row-by-row as source changes arrive,
//! preserving ordering, window bounds and reference counts for shared
//! subtrees. Everything runs on one logical task; cooperation points are
//! explicit (see [`PushContext::yield_now`]).

mod builder;
mod change;
mod engine;
mod exists;
mod fan;
mod filter;
mod join;
mod operator;
mod predicate;
mod server_queries;
mod skip;
mod source;
mod storage;
mod take;
mod view;
mod view_store;

pub use builder::{Builder, BuilderDelegate, BuiltPipeline};
pub use change::{Change, Node, RelationshipRef, SourceChange};
pub use engine::{Engine, EngineOptions, Transaction, ViewId};
pub use exists::Exists;
pub use fan::{BranchInput, FanIn, FanOut, UnionFanIn, UnionFanOut};
pub use filter::{Filter, FilterBank, FilterEnd, FilterStart};
pub use join::{FlippedJoin, Join, JoinHandle};
pub use operator::{
    fetch_collect, push_collect, Basis, ConnectionId, Constraint, FetchRequest, Operator,
    PushContext, Start, Step, StreamSchema,
};
pub use predicate::Predicate;
pub use server_queries::{GotCallback, ServerQueries};
pub use skip::Skip;
pub use source::{Connected, ConstraintViolation, Delivery, MemorySource, SourceInput};
pub use storage::Storage;
pub use take::Take;
pub use view::{QueryError, QueryErrorKind, ResultType, SubscriptionId, View};
pub use view_store::ViewStore;

/// Error is the composite failure type of the dataflow engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),
    #[error(transparent)]
    Schema(#[from] relation::SchemaError),
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error("unknown view")]
    UnknownView,
    #[error("invalid LIKE pattern: {0}")]
    LikePattern(#[from] regex::Error),
    #[error("NOT EXISTS is not enabled for this engine")]
    NotExistsDisabled,
    #[error("NOT over a correlated subquery is not supported; use a NOT_EXISTS subquery")]
    NotOverSubquery,
}
