mod ast;
mod format;
mod hash;
mod ttl;

pub use ast::{
    Ast, Condition, Correlation, CorrelatedSubquery, ExistsOp, Operand, SimpleCondition,
    SimpleOp, SubqueryCondition, System,
};
pub use format::Format;
pub use hash::query_hash;
pub use ttl::{Ttl, DEFAULT_TTL_MS};
