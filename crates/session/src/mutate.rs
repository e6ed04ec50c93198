use crate::error::ClientErrorKind;
use crate::state::ConnectionState;
use crate::SessionError;
use serde::Serialize;

/// Whose fault a mutation failure is: the application's mutator code, or
/// the sync engine itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationErrorType {
    App,
    Engine,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationError {
    #[serde(rename = "type")]
    pub kind: MutationErrorType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// The wire-shaped outcome of one mutation on one side.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MutationOutcome {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        error: MutationError,
    },
}

/// Both sides of a mutation: the locally applied outcome and the server's
/// acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
    pub client: MutationOutcome,
    pub server: MutationOutcome,
}

/// Run a client-originated mutation through the connection gate.
///
/// While the session is `Disconnected`, `Error` or `Closed`, the mutator
/// is not invoked: both outcomes reject with the state's reason. The one
/// exemption is a `NoSocketOrigin` disconnect, where purely local writes
/// continue. In every other state the mutator runs, and its result is
/// reported on both sides.
pub fn apply_mutation(
    state: &ConnectionState,
    mutator: impl FnOnce() -> Result<Option<serde_json::Value>, MutationError>,
) -> MutationResult {
    let gate_reason = match state {
        ConnectionState::Disconnected { reason } => Some(
            reason
                .clone()
                .unwrap_or_else(|| ClientErrorKind::Offline.into()),
        ),
        ConnectionState::NeedsAuth { .. } | ConnectionState::Connecting { .. } => None,
        ConnectionState::Error { reason } => Some(reason.clone()),
        ConnectionState::Closed => Some(ClientErrorKind::ClientClosed.into()),
        ConnectionState::Connected => None,
    };

    if let Some(reason) = gate_reason {
        let exempt = matches!(
            reason,
            SessionError::Client(ClientErrorKind::NoSocketOrigin)
        );
        if !exempt {
            let error = MutationError {
                kind: MutationErrorType::Engine,
                message: reason.to_string(),
                details: None,
            };
            return MutationResult {
                client: MutationOutcome::Error {
                    error: error.clone(),
                },
                server: MutationOutcome::Error { error },
            };
        }
    }

    match mutator() {
        Ok(data) => MutationResult {
            client: MutationOutcome::Ok { data: data.clone() },
            server: MutationOutcome::Ok { data },
        },
        Err(error) => MutationResult {
            client: MutationOutcome::Error {
                error: error.clone(),
            },
            server: MutationOutcome::Error { error },
        },
    }
}
