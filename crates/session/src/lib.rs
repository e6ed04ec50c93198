//! The client connection state machine supervising the long-lived server
//! session that feeds the dataflow engine, together with the full error
//! taxonomy and the mutation gate applied while the session is down.

mod error;
mod manager;
mod mutate;
mod state;

pub use error::{ClientErrorKind, Disposition, Origin, ServerErrorKind, SessionError};
pub use manager::{ConnectionManager, ConnectionManagerOptions, ListenerId};
pub use mutate::{
    apply_mutation, MutationError, MutationErrorType, MutationOutcome, MutationResult,
};
pub use state::ConnectionState;
