//! Connection manager.
//!
//! Owns the real-time subscription for one discussion at a time. The manager
//! spawns a driver task per subscription; the task dials the websocket,
//! feeds transport events into the sans-IO [`Connection`] machine, and
//! executes the actions it returns (emit status, retry after a fixed delay,
//! send keepalives). Transport failures never surface as errors; they become
//! [`ConnectionStatus`] transitions on the watch channel.

use std::{sync::Arc, time::Instant};

use parley_core::{Connection, ConnectionAction, ConnectionConfig, ConnectionStatus};
use parley_proto::{DiscussionId, ServerEvent};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    auth::CachedTokens,
    config::ClientConfig,
    transport::{self, LinkFrame, WsLink},
};

/// Granularity of the machine's maintenance tick.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the decoded-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Handle to one live subscription task.
struct LinkHandle {
    discussion: DiscussionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Manages the lifecycle of one real-time subscription at a time.
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    tokens: Arc<CachedTokens>,
    parent: CancellationToken,
    status_tx: watch::Sender<ConnectionStatus>,
    status_rx: watch::Receiver<ConnectionStatus>,
    link: Option<LinkHandle>,
}

impl ConnectionManager {
    /// Create a manager whose subscription tasks live under the given
    /// cancellation scope.
    pub fn new(
        config: Arc<ClientConfig>,
        tokens: Arc<CachedTokens>,
        parent: CancellationToken,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
        Self { config, tokens, parent, status_tx, status_rx, link: None }
    }

    /// Connect to a discussion's topic.
    ///
    /// Idempotent: if the same discussion is already subscribed and its
    /// driver task is alive, the current status is re-emitted and `None` is
    /// returned (the existing event stream stays valid). A dead driver task
    /// is replaced (self-healing), and a different discussion tears the old
    /// subscription down first. `Some` carries the event stream for the new
    /// subscription.
    pub async fn connect(&mut self, id: &DiscussionId) -> Option<mpsc::Receiver<ServerEvent>> {
        let healthy = self
            .link
            .as_ref()
            .is_some_and(|link| link.discussion == *id && !link.task.is_finished());
        if healthy {
            let current = self.status_rx.borrow().clone();
            self.status_tx.send_replace(current);
            return None;
        }

        self.disconnect().await;

        let cancel = self.parent.child_token();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(run_link(
            Arc::clone(&self.config),
            Arc::clone(&self.tokens),
            id.clone(),
            self.status_tx.clone(),
            event_tx,
            cancel.clone(),
        ));

        self.link = Some(LinkHandle { discussion: id.clone(), cancel, task });
        Some(event_rx)
    }

    /// Release the subscription and the transport session.
    ///
    /// Idempotent and always safe, connected or not. A clean disconnect
    /// emits `Disconnected` and suppresses reconnection.
    pub async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.cancel.cancel();
            if link.task.await.is_err() {
                warn!(discussion = %link.discussion, "subscription task ended abnormally");
            }
        }
    }

    /// Discussion currently subscribed, if any.
    pub fn current(&self) -> Option<&DiscussionId> {
        self.link.as_ref().map(|link| &link.discussion)
    }

    /// Last-known connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to status transitions. The last-known status is delivered
    /// to new subscribers immediately.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }
}

/// Driver task for one subscription.
///
/// Bridges the websocket to the connection machine: transport events in,
/// machine actions out. Runs until the machine reaches its terminal state
/// (cancellation, which maps to a deliberate disconnect).
async fn run_link(
    config: Arc<ClientConfig>,
    tokens: Arc<CachedTokens>,
    discussion: DiscussionId,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    let mut machine: Connection = Connection::new(ConnectionConfig::default());
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut link: Option<WsLink> = None;
    let mut pending = machine.begin_connect(Instant::now());

    loop {
        let mut open = false;
        let mut retry = None;

        for action in std::mem::take(&mut pending) {
            match action {
                ConnectionAction::EmitStatus(status) => {
                    debug!(%discussion, %status, "connection status");
                    status_tx.send_replace(status);
                },
                ConnectionAction::OpenTransport => open = true,
                ConnectionAction::CloseTransport => {
                    if let Some(ws) = link.take() {
                        ws.close().await;
                    }
                },
                ConnectionAction::RetryAfter(delay) => retry = Some(delay),
                ConnectionAction::SendPing => {
                    if let Some(ws) = link.as_mut()
                        && ws.ping().await.is_err()
                    {
                        pending = machine.handle_closed(Instant::now());
                    }
                },
            }
        }
        if !pending.is_empty() {
            // A failed keepalive queued the reconnect path.
            continue;
        }

        if machine.is_terminal() {
            break;
        }

        if let Some(delay) = retry {
            tokio::select! {
                () = cancel.cancelled() => pending = machine.disconnect(),
                () = tokio::time::sleep(delay) => pending = machine.retry_due(Instant::now()),
            }
            continue;
        }

        if open {
            // A missing credential is not fatal: connect without it so the
            // server rejects uniformly instead of failing two different ways.
            let token = tokio::select! {
                () = cancel.cancelled() => {
                    pending = machine.disconnect();
                    continue;
                },
                token = tokens.bearer() => match token {
                    Ok(token) => Some(token),
                    Err(e) => {
                        warn!(error = %e, "connecting without credential");
                        None
                    },
                },
            };

            let dial = transport::open(
                &config.ws_url,
                config.auth_in_query,
                token.as_deref(),
                &discussion,
            );
            tokio::pin!(dial);

            pending = loop {
                tokio::select! {
                    () = cancel.cancelled() => break machine.disconnect(),
                    _ = tick.tick() => {
                        // Advisory connect-window expiry surfaces here.
                        for action in machine.tick(Instant::now()) {
                            if let ConnectionAction::EmitStatus(status) = action {
                                status_tx.send_replace(status);
                            }
                        }
                    },
                    result = &mut dial => match result {
                        Ok(ws) => {
                            link = Some(ws);
                            break machine.handle_opened(Instant::now());
                        },
                        Err(e) => break machine.handle_error(e.to_string(), Instant::now()),
                    },
                }
            };
            continue;
        }

        let Some(ws) = link.as_mut() else {
            // Connected according to the machine but no socket: nothing to
            // poll, wait for teardown.
            cancel.cancelled().await;
            pending = machine.disconnect();
            continue;
        };

        tokio::select! {
            () = cancel.cancelled() => pending = machine.disconnect(),
            _ = tick.tick() => pending = machine.tick(Instant::now()),
            frame = ws.next_frame() => match frame {
                Ok(Some(LinkFrame::Event(event))) => {
                    machine.activity(Instant::now());
                    if event_tx.send(event).await.is_err() {
                        // The session dropped its event stream; tear down.
                        pending = machine.disconnect();
                    }
                },
                Ok(Some(LinkFrame::Pong)) => machine.activity(Instant::now()),
                Ok(None) => pending = machine.handle_closed(Instant::now()),
                Err(e) => {
                    warn!(error = %e, "websocket read failed");
                    pending = machine.handle_closed(Instant::now());
                },
            },
        }
    }

    if let Some(ws) = link.take() {
        ws.close().await;
    }
}
