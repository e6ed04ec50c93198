use crate::error::{ClientErrorKind, Disposition};
use crate::state::ConnectionState;
use crate::SessionError;
use exponential_backoff::Backoff;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ConnectionManagerOptions {
    /// Maximum contiguous time allowed in `Connecting` before demotion to
    /// `Disconnected`. The window spans repeated attempts until a
    /// successful connection clears it.
    pub disconnect_timeout: Duration,
    /// How often the host is expected to drive [`ConnectionManager::tick`].
    pub tick_interval: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for ConnectionManagerOptions {
    fn default() -> Self {
        Self {
            disconnect_timeout: Duration::from_secs(5 * 60),
            tick_interval: Duration::from_secs(1),
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&Arc<ConnectionState>)>;

/// ConnectionManager supervises the session's connection lifecycle.
///
/// The host reports socket-level events (`connecting`, `connected`,
/// `report_error`) and drives time via `tick`; the manager owns the retry
/// window and reconnection pacing. Subscribers receive a fresh state
/// snapshot on every transition. Time is injected so the machine is fully
/// deterministic under test.
pub struct ConnectionManager {
    options: ConnectionManagerOptions,
    state: Arc<ConnectionState>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    connecting_started_at: Option<Instant>,
    backoff: Backoff,
    attempt: u32,
    backoff_floor: Duration,
    reconnect_at: Option<Instant>,
    auth: Option<String>,
}

impl ConnectionManager {
    pub fn new(options: ConnectionManagerOptions, now: Instant) -> Self {
        let mut backoff = Backoff::new(
            u32::MAX,
            options.backoff_min,
            Some(options.backoff_max),
        );
        backoff.set_jitter(0.0);

        Self {
            options,
            state: Arc::new(ConnectionState::Connecting { attempt: 0 }),
            listeners: Vec::new(),
            next_listener: 0,
            connecting_started_at: Some(now),
            backoff,
            attempt: 0,
            backoff_floor: Duration::ZERO,
            reconnect_at: None,
            auth: None,
        }
    }

    /// The latest state snapshot.
    pub fn current(&self) -> Arc<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&mut self, mut listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        // New subscribers immediately observe the current state.
        listener(&self.state);
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    /// The socket layer began a connection attempt. A no-op while
    /// `Disconnected`: reconnection pacing is owned by the manager there.
    pub fn connecting(&mut self, now: Instant) -> bool {
        let attempt = self.attempt;
        self.transition(ConnectionState::Connecting { attempt }, now, false)
    }

    /// The socket is established; clears the retry window and resets
    /// backoff.
    pub fn connected(&mut self, now: Instant) -> bool {
        self.transition(ConnectionState::Connected, now, false)
    }

    /// Explicit user-level connect, the only way out of `NeedsAuth` and
    /// `Error`. Fresh credentials, when given, replace the stored ones.
    pub fn connect(&mut self, auth: Option<String>, now: Instant) -> bool {
        match &*self.state {
            ConnectionState::NeedsAuth { .. } | ConnectionState::Error { .. } => {
                if auth.is_some() {
                    self.auth = auth;
                }
                let attempt = self.attempt;
                self.transition(ConnectionState::Connecting { attempt }, now, false)
            }
            _ => false,
        }
    }

    /// Terminal; listeners are released after the final notification.
    pub fn close(&mut self, now: Instant) -> bool {
        let closed = self.transition(ConnectionState::Closed, now, false);
        if closed {
            self.listeners.clear();
        }
        closed
    }

    /// Apply a session error according to its disposition.
    pub fn report_error(&mut self, error: SessionError, now: Instant) {
        match error.disposition() {
            Disposition::Retry => {
                if matches!(&*self.state, ConnectionState::Connected) {
                    let attempt = self.attempt;
                    self.transition(ConnectionState::Connecting { attempt }, now, false);
                }
                // Already connecting: the window keeps running.
            }
            Disposition::Disconnect => {
                self.transition(
                    ConnectionState::Disconnected {
                        reason: Some(error),
                    },
                    now,
                    false,
                );
            }
            Disposition::NeedsAuth => {
                self.transition(ConnectionState::NeedsAuth { reason: error }, now, false);
            }
            Disposition::Fatal => {
                self.transition(ConnectionState::Error { reason: error }, now, false);
            }
            Disposition::Close => {
                self.close(now);
            }
            Disposition::Backoff { min_backoff_ms } => {
                let floor = Duration::from_millis(min_backoff_ms);
                self.backoff_floor = self.backoff_floor.max(floor);
                if let Some(at) = self.reconnect_at {
                    self.reconnect_at = Some(at.max(now + floor));
                }
                tracing::info!(?error, min_backoff_ms, "honoring server backoff");
            }
            Disposition::PerMutation => {
                // Surfaced on the mutation result; the connection state is
                // untouched.
            }
        }
    }

    /// Drive the clock: demote a lapsed `Connecting` to `Disconnected`,
    /// and start the next attempt once the backoff deadline passes.
    pub fn tick(&mut self, now: Instant) {
        match &*self.state {
            ConnectionState::Connecting { .. } => {
                let lapsed = self
                    .connecting_started_at
                    .map(|at| now.duration_since(at) >= self.options.disconnect_timeout)
                    .unwrap_or(false);
                if lapsed {
                    self.transition(
                        ConnectionState::Disconnected {
                            reason: Some(ClientErrorKind::DisconnectTimeout.into()),
                        },
                        now,
                        false,
                    );
                }
            }
            ConnectionState::Disconnected { .. } => {
                let due = self.reconnect_at.map(|at| now >= at).unwrap_or(true);
                if due {
                    let attempt = self.attempt;
                    self.transition(ConnectionState::Connecting { attempt }, now, true);
                }
            }
            _ => {}
        }
    }

    // The one place state changes. `forced` marks manager-internal
    // transitions exempt from the host-facing legality matrix (the
    // auto-reconnect out of Disconnected).
    fn transition(&mut self, next: ConnectionState, now: Instant, forced: bool) -> bool {
        if *self.state == next {
            return true;
        }
        if !forced && !self.state.may_transition_to(&next) {
            tracing::warn!(
                from = self.state.name(),
                to = next.name(),
                "rejected connection state transition"
            );
            return false;
        }

        // The retry window starts on entry to Connecting and survives a
        // demotion to Disconnected; every other destination clears it.
        match &next {
            ConnectionState::Connecting { .. } => {
                if self.connecting_started_at.is_none() {
                    self.connecting_started_at = Some(now);
                }
                self.attempt += 1;
            }
            ConnectionState::Disconnected { .. } => {
                let delay = self
                    .backoff
                    .next(self.attempt.max(1))
                    .unwrap_or(self.options.backoff_max)
                    .max(self.backoff_floor);
                self.reconnect_at = Some(now + delay);
            }
            ConnectionState::Connected => {
                self.attempt = 0;
                self.backoff_floor = Duration::ZERO;
                self.reconnect_at = None;
            }
            _ => {}
        }
        if !matches!(
            &next,
            ConnectionState::Connecting { .. } | ConnectionState::Disconnected { .. }
        ) {
            self.connecting_started_at = None;
        }

        tracing::info!(from = self.state.name(), to = next.name(), "connection state");
        self.state = Arc::new(next);
        for (_, listener) in &mut self.listeners {
            listener(&self.state);
        }
        true
    }
}
