use crate::SessionError;

/// ConnectionState is the externally visible state of the session, with
/// per-state payloads. Every transition produces a fresh snapshot, so
/// subscribers may compare snapshots by identity.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Attempting to establish the socket.
    Connecting { attempt: u32 },
    Connected,
    /// The retry window lapsed or the host is offline; the manager owns
    /// reconnection from here.
    Disconnected { reason: Option<SessionError> },
    /// Only an explicit connect with fresh credentials leaves this state.
    NeedsAuth { reason: SessionError },
    /// Unrecoverable without an explicit connect.
    Error { reason: SessionError },
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected { .. } => "disconnected",
            ConnectionState::NeedsAuth { .. } => "needs-auth",
            ConnectionState::Error { .. } => "error",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn reason(&self) -> Option<&SessionError> {
        match self {
            ConnectionState::Disconnected { reason } => reason.as_ref(),
            ConnectionState::NeedsAuth { reason } | ConnectionState::Error { reason } => {
                Some(reason)
            }
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// `Closed` is absorbing. `Disconnected` refuses a host-requested
    /// `Connecting` (the manager owns retry pacing from there), and the
    /// recoverable terminal states (`NeedsAuth`, `Error`) leave only via
    /// an explicit connect, which maps to `Connecting`.
    pub fn may_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState as S;

        match (self, next) {
            (S::Closed, _) => false,
            (_, S::Closed) => true,

            (S::Connecting { .. }, _) => true,
            (S::Connected, _) => true,

            (S::Disconnected { .. }, S::Connecting { .. }) => false,
            (S::Disconnected { .. }, _) => true,

            (S::NeedsAuth { .. }, S::Connecting { .. }) => true,
            (S::NeedsAuth { .. }, _) => false,

            (S::Error { .. }, S::Connecting { .. }) => true,
            (S::Error { .. }, _) => false,
        }
    }
}
