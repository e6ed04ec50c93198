/// Which side of the wire produced an error. Preserved across every
/// boundary so observability layers can tag correctly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Origin {
    Client,
    Server,
}

/// What the connection manager does with an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Retryable; the machine stays in (or returns to) `Connecting`.
    Retry,
    /// Demote to `Disconnected`; the retry window survives.
    Disconnect,
    /// Credentials are no longer valid; only an explicit connect with
    /// fresh auth leaves this state.
    NeedsAuth,
    /// Unrecoverable without user intervention.
    Fatal,
    /// The client was closed; terminal.
    Close,
    /// No state transition; honor the server's requested pause before the
    /// next attempt.
    Backoff { min_backoff_ms: u64 },
    /// Surfaced on the failing mutation only; the connection is unharmed.
    PerMutation,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientErrorKind {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("ping timed out")]
    PingTimeout,
    #[error("pull timed out")]
    PullTimeout,
    #[error("socket closed abruptly")]
    AbruptClose,
    #[error("socket closed cleanly")]
    CleanClose,
    #[error("page hidden")]
    Hidden,
    #[error("no socket origin")]
    NoSocketOrigin,
    #[error("disconnect timeout elapsed")]
    DisconnectTimeout,
    #[error("unexpected base cookie")]
    UnexpectedBaseCookie,
    #[error("invalid message")]
    InvalidMessage,
    #[error("user disconnect")]
    UserDisconnect,
    #[error("internal client error")]
    Internal,
    #[error("client closed")]
    ClientClosed,
    #[error("offline")]
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerErrorKind {
    #[error("server rebalancing")]
    Rebalance { min_backoff_ms: Option<u64> },
    #[error("client rehomed")]
    Rehome { min_backoff_ms: Option<u64> },
    #[error("server overloaded")]
    ServerOverloaded { min_backoff_ms: Option<u64> },
    #[error("auth invalidated")]
    AuthInvalidated,
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid push")]
    InvalidPush,
    #[error("protocol version not supported")]
    VersionNotSupported,
    #[error("schema version not supported")]
    SchemaVersionNotSupported,
    #[error("invalid connection request")]
    InvalidConnectionRequest,
    #[error("client not found")]
    ClientNotFound,
    #[error("internal server error")]
    Internal,
    #[error("push failed")]
    PushFailed { status: Option<u16> },
    #[error("transform failed")]
    TransformFailed { status: Option<u16> },
    #[error("mutation rate limited")]
    MutationRateLimited,
    #[error("mutation failed")]
    MutationFailed,
}

/// SessionError is any failure of the client/server session, tagged by
/// origin.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Client(#[from] ClientErrorKind),
    #[error("{0}")]
    Server(#[from] ServerErrorKind),
}

impl SessionError {
    pub fn origin(&self) -> Origin {
        match self {
            SessionError::Client(_) => Origin::Client,
            SessionError::Server(_) => Origin::Server,
        }
    }

    /// How the connection manager reacts to this error.
    pub fn disposition(&self) -> Disposition {
        use ClientErrorKind as C;
        use ServerErrorKind as S;

        match self {
            SessionError::Client(kind) => match kind {
                C::ConnectTimeout
                | C::PingTimeout
                | C::PullTimeout
                | C::AbruptClose
                | C::CleanClose
                | C::Hidden
                | C::NoSocketOrigin => Disposition::Retry,
                C::DisconnectTimeout | C::Offline => Disposition::Disconnect,
                C::UnexpectedBaseCookie | C::InvalidMessage | C::UserDisconnect | C::Internal => {
                    Disposition::Fatal
                }
                C::ClientClosed => Disposition::Close,
            },
            SessionError::Server(kind) => match kind {
                S::Rebalance { min_backoff_ms }
                | S::Rehome { min_backoff_ms }
                | S::ServerOverloaded { min_backoff_ms } => Disposition::Backoff {
                    min_backoff_ms: min_backoff_ms.unwrap_or(0),
                },
                S::AuthInvalidated | S::Unauthorized => Disposition::NeedsAuth,
                S::InvalidPush
                | S::VersionNotSupported
                | S::SchemaVersionNotSupported
                | S::InvalidConnectionRequest
                | S::ClientNotFound
                | S::Internal => Disposition::Fatal,
                // An auth-shaped HTTP failure of a push or transform is an
                // auth problem, not a fatal one.
                S::PushFailed { status } | S::TransformFailed { status } => match status {
                    Some(401) | Some(403) => Disposition::NeedsAuth,
                    _ => Disposition::Fatal,
                },
                S::MutationRateLimited | S::MutationFailed => Disposition::PerMutation,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_origin_is_preserved() {
        assert_eq!(
            SessionError::from(ClientErrorKind::PingTimeout).origin(),
            Origin::Client
        );
        assert_eq!(
            SessionError::from(ServerErrorKind::Unauthorized).origin(),
            Origin::Server
        );
    }

    #[test]
    fn test_dispositions() {
        assert_eq!(
            SessionError::from(ClientErrorKind::ConnectTimeout).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            SessionError::from(ClientErrorKind::DisconnectTimeout).disposition(),
            Disposition::Disconnect
        );
        assert_eq!(
            SessionError::from(ClientErrorKind::ClientClosed).disposition(),
            Disposition::Close
        );
        assert_eq!(
            SessionError::from(ServerErrorKind::Rehome {
                min_backoff_ms: Some(1500)
            })
            .disposition(),
            Disposition::Backoff {
                min_backoff_ms: 1500
            }
        );
        assert_eq!(
            SessionError::from(ServerErrorKind::MutationRateLimited).disposition(),
            Disposition::PerMutation
        );
    }

    #[test]
    fn test_push_failed_auth_statuses() {
        for status in [401, 403] {
            assert_eq!(
                SessionError::from(ServerErrorKind::PushFailed {
                    status: Some(status)
                })
                .disposition(),
                Disposition::NeedsAuth
            );
        }
        assert_eq!(
            SessionError::from(ServerErrorKind::TransformFailed { status: Some(500) })
                .disposition(),
            Disposition::Fatal
        );
        assert_eq!(
            SessionError::from(ServerErrorKind::PushFailed { status: None }).disposition(),
            Disposition::Fatal
        );
    }

    #[test]
    fn test_offline_message_is_terse() {
        // The mutation gate surfaces this text verbatim.
        assert_eq!(
            SessionError::from(ClientErrorKind::Offline).to_string(),
            "offline"
        );
    }
}
