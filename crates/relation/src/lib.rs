pub mod compare;
mod key;
mod lite;
mod row;
mod schema;
mod value;

pub use key::RowKey;
pub use lite::{LiteType, LiteTypeError, VERSION_COLUMN};
pub use row::{Row, RowError, RowToken};
pub use schema::{Direction, OrderBy, OrderPart, SchemaError, TableSchema};
pub use value::Value;
