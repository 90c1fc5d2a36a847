//! Connection lifecycle state machine.
//!
//! Tracks the real-time subscription for one discussion topic. The driver
//! feeds in transport-level events (opened, closed, failed) plus periodic
//! ticks, and executes the returned actions. The machine performs no I/O of
//! its own; time is passed as a parameter, and the machine is generic over
//! `Instant` so tests can use virtual time.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ connect ┌────────────┐  opened   ┌───────────┐
//! │ Idle │────────>│ Connecting │──────────>│ Connected │
//! └──────┘         └────────────┘           └───────────┘
//!                     ▲      │ failed            │ abnormal close /
//!           retry due │      ▼                   ▼ idle timeout
//!                  ┌──────────────┐<─────────────┘
//!                  │ Reconnecting │
//!                  └──────────────┘
//!
//!        disconnect (any state) ──> Disconnected (terminal)
//! ```
//!
//! An unanswered connect attempt past the connect window surfaces a
//! `TimedOut` status. This is advisory only: the machine stays in its state
//! and a late transport open still transitions to `Connected`.

use std::{
    fmt,
    ops::Sub,
    time::{Duration, Instant},
};

/// Window allowed for a connect attempt before `TimedOut` is surfaced.
pub const DEFAULT_CONNECT_WINDOW: Duration = Duration::from_secs(15);

/// Fixed delay between reconnect attempts. No exponential backoff; the
/// attempt counter is surfaced instead so the caller can see how long the
/// link has been down.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Interval at which pings are requested while connected.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Maximum time without inbound traffic before the link is presumed dead.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(60);

/// Externally observable connection status.
///
/// Transport failures become status transitions, never errors: the only
/// terminal status is `Disconnected`, reached through an explicit
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection has been requested yet.
    Idle,
    /// A connect attempt is in progress.
    Connecting,
    /// The subscription is live.
    Connected,
    /// The link dropped unexpectedly; a retry is scheduled.
    Reconnecting {
        /// How many times the link has dropped since it was last up.
        attempt: u32,
    },
    /// The connection was closed deliberately. Terminal.
    Disconnected,
    /// A connect attempt exceeded the connect window. Advisory: the list may
    /// not update in real time, but the attempt is still pending.
    TimedOut,
    /// The transport reported an error. Non-fatal; a retry follows.
    Error {
        /// Human-readable failure description.
        reason: String,
    },
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Error { reason } => write!(f, "error: {reason}"),
        }
    }
}

/// Actions returned by the connection state machine.
///
/// The driver executes these: open/close the transport, publish a status,
/// schedule a retry, or send a keepalive ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Publish this status to subscribers.
    EmitStatus(ConnectionStatus),
    /// Start a transport handshake now.
    OpenTransport,
    /// Drop the transport if one is up.
    CloseTransport,
    /// Schedule a retry after this delay.
    RetryAfter(Duration),
    /// Send a keepalive ping on the live transport.
    SendPing,
}

/// Internal link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Connection timing configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Advisory window for a connect attempt.
    pub connect_window: Duration,
    /// Fixed delay between reconnect attempts.
    pub retry_delay: Duration,
    /// Keepalive ping interval while connected.
    pub heartbeat_interval: Duration,
    /// Inbound-traffic window before the link is presumed dead. Should be
    /// comfortably larger than `heartbeat_interval`.
    pub idle_window: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_window: DEFAULT_CONNECT_WINDOW,
            retry_delay: DEFAULT_RETRY_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_window: DEFAULT_IDLE_WINDOW,
        }
    }
}

/// Connection lifecycle state machine.
///
/// Pure state machine: no I/O, no timers. The driver calls the `handle_*`
/// methods as transport events arrive, `tick` on a periodic timer, and
/// executes the returned [`ConnectionAction`]s.
#[derive(Debug, Clone)]
pub struct Connection<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: LinkState,
    config: ConnectionConfig,
    /// Drops since the link was last up. Reset on a successful open.
    attempt: u32,
    /// When the in-flight connect attempt started.
    connect_started: Option<I>,
    /// Whether `TimedOut` was already surfaced for this attempt.
    timeout_reported: bool,
    /// Last inbound traffic while connected.
    last_activity: Option<I>,
    /// Last keepalive ping request.
    last_ping: Option<I>,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new machine in the `Idle` state.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            state: LinkState::Idle,
            config,
            attempt: 0,
            connect_started: None,
            timeout_reported: false,
            last_activity: None,
            last_ping: None,
        }
    }

    /// Coarse status corresponding to the current state.
    pub fn status(&self) -> ConnectionStatus {
        match self.state {
            LinkState::Idle => ConnectionStatus::Idle,
            LinkState::Connecting => {
                if self.timeout_reported {
                    ConnectionStatus::TimedOut
                } else {
                    ConnectionStatus::Connecting
                }
            },
            LinkState::Connected => ConnectionStatus::Connected,
            LinkState::Reconnecting => ConnectionStatus::Reconnecting { attempt: self.attempt },
            LinkState::Disconnected => ConnectionStatus::Disconnected,
        }
    }

    /// Whether the machine reached the terminal `Disconnected` state.
    pub fn is_terminal(&self) -> bool {
        self.state == LinkState::Disconnected
    }

    /// Drops since the link was last up.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start connecting.
    ///
    /// Idempotent: while connected this only re-emits `Connected`, and while
    /// an attempt is already in flight it only re-emits the current status.
    pub fn begin_connect(&mut self, now: I) -> Vec<ConnectionAction> {
        match self.state {
            LinkState::Connected => vec![ConnectionAction::EmitStatus(ConnectionStatus::Connected)],
            LinkState::Connecting | LinkState::Reconnecting => {
                vec![ConnectionAction::EmitStatus(self.status())]
            },
            LinkState::Idle | LinkState::Disconnected => {
                self.state = LinkState::Connecting;
                self.connect_started = Some(now);
                self.timeout_reported = false;
                vec![
                    ConnectionAction::EmitStatus(ConnectionStatus::Connecting),
                    ConnectionAction::OpenTransport,
                ]
            },
        }
    }

    /// The transport handshake completed.
    pub fn handle_opened(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.state == LinkState::Disconnected {
            // Stale open racing a deliberate disconnect.
            return vec![ConnectionAction::CloseTransport];
        }

        self.state = LinkState::Connected;
        self.attempt = 0;
        self.connect_started = None;
        self.timeout_reported = false;
        self.last_activity = Some(now);
        self.last_ping = Some(now);

        vec![ConnectionAction::EmitStatus(ConnectionStatus::Connected)]
    }

    /// The transport closed without a deliberate disconnect.
    pub fn handle_closed(&mut self, _now: I) -> Vec<ConnectionAction> {
        if self.state == LinkState::Disconnected {
            return vec![];
        }
        self.schedule_retry(None)
    }

    /// The transport reported an error (handshake failure, abnormal close
    /// with a reason, authentication rejection).
    pub fn handle_error(&mut self, reason: impl Into<String>, _now: I) -> Vec<ConnectionAction> {
        if self.state == LinkState::Disconnected {
            return vec![];
        }
        self.schedule_retry(Some(reason.into()))
    }

    /// The retry delay elapsed; start the next attempt.
    pub fn retry_due(&mut self, now: I) -> Vec<ConnectionAction> {
        if self.state != LinkState::Reconnecting {
            return vec![];
        }

        self.state = LinkState::Connecting;
        self.connect_started = Some(now);
        self.timeout_reported = false;

        vec![
            ConnectionAction::EmitStatus(ConnectionStatus::Connecting),
            ConnectionAction::OpenTransport,
        ]
    }

    /// Deliberate disconnect. Terminal; suppresses any further retry.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        if self.state == LinkState::Disconnected {
            return vec![];
        }

        self.state = LinkState::Disconnected;
        self.connect_started = None;
        self.last_activity = None;
        self.last_ping = None;

        vec![
            ConnectionAction::CloseTransport,
            ConnectionAction::EmitStatus(ConnectionStatus::Disconnected),
        ]
    }

    /// Record inbound traffic (any frame, including pongs).
    pub fn activity(&mut self, now: I) {
        if self.state == LinkState::Connected {
            self.last_activity = Some(now);
        }
    }

    /// Periodic maintenance: connect-window expiry, idle detection, and
    /// heartbeat scheduling.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        match self.state {
            LinkState::Connecting => {
                if let Some(started) = self.connect_started
                    && !self.timeout_reported
                    && now - started > self.config.connect_window
                {
                    self.timeout_reported = true;
                    return vec![ConnectionAction::EmitStatus(ConnectionStatus::TimedOut)];
                }
                vec![]
            },
            LinkState::Connected => {
                if let Some(last) = self.last_activity
                    && now - last > self.config.idle_window
                {
                    // Heartbeat timeout: treat as an abnormal close.
                    return self.schedule_retry(None);
                }

                if let Some(last) = self.last_ping
                    && now - last >= self.config.heartbeat_interval
                {
                    self.last_ping = Some(now);
                    return vec![ConnectionAction::SendPing];
                }

                vec![]
            },
            _ => vec![],
        }
    }

    fn schedule_retry(&mut self, reason: Option<String>) -> Vec<ConnectionAction> {
        self.state = LinkState::Reconnecting;
        self.attempt += 1;
        self.connect_started = None;
        self.last_activity = None;
        self.last_ping = None;

        let mut actions = vec![ConnectionAction::CloseTransport];
        if let Some(reason) = reason {
            actions.push(ConnectionAction::EmitStatus(ConnectionStatus::Error { reason }));
        }
        actions.push(ConnectionAction::EmitStatus(ConnectionStatus::Reconnecting {
            attempt: self.attempt,
        }));
        actions.push(ConnectionAction::RetryAfter(self.config.retry_delay));
        actions
    }
}

impl<I> Default for Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}
