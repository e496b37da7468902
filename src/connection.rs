//! Connection lifecycle management.
//!
//! A single background task owns the transport connection and all mutable
//! connection state. The rest of the crate talks to it through
//! [`ConnectionManager`], a cheap-to-clone handle over a command channel,
//! so no lock is ever held across an await point on the connection path.
//!
//! The task drives the full lifecycle: credential-authenticated dial,
//! channel re-subscription and queue flush on every (re)connect, periodic
//! heartbeats, exponential-backoff reconnection, and routing of inbound
//! frames to the channel registry and the mutation outcome stream.

use crate::auth::RefreshCoordinator;
use crate::channels::{ChannelEvent, ChannelRegistry, MessageQueue, PendingMessage};
use crate::error::{LaneLinkError, Result};
use crate::event_handlers::{ConnectionFault, DisconnectReason, EventHandlers};
use crate::models::{
    ConnectionOptions, Envelope, EnvelopeKind, MutationConfirmed, MutationRejected,
};
use crate::timeouts::LaneLinkTimeouts;
use crate::transport::{Transport, TransportConnection, TransportFrame};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Capacity of the command channel into the connection task.
const CMD_CHANNEL_CAPACITY: usize = 64;

// ── Public state ────────────────────────────────────────────────────────────

/// Connection lifecycle state, observable through
/// [`ConnectionManager::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// Initial connection attempt in progress.
    Connecting,
    /// Connected and serving traffic.
    Connected,
    /// Connection lost; automatic reconnection in progress.
    Reconnecting,
    /// Reconnection exhausted. A new explicit `connect()` is required.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Resolved server verdict on a submitted mutation, forwarded to the
/// optimistic update coordinator.
#[derive(Debug, Clone)]
pub(crate) enum MutationOutcome {
    Confirmed(MutationConfirmed),
    Rejected(MutationRejected),
}

// ── Commands ────────────────────────────────────────────────────────────────

enum ConnCmd {
    Connect {
        result_tx: oneshot::Sender<Result<()>>,
    },
    Disconnect,
    /// Send an envelope now, or queue it while disconnected.
    Send {
        envelope: Envelope,
    },
    /// A channel gained its first handler; announce it if connected.
    Subscribe {
        channel: String,
    },
    /// A channel lost its last handler; withdraw it if connected.
    Unsubscribe {
        channel: String,
    },
    QueueLen {
        result_tx: oneshot::Sender<usize>,
    },
    Shutdown,
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// Everything the connection task needs, bundled by the client builder.
pub(crate) struct ConnectionConfig {
    pub endpoint: String,
    pub transport: Arc<dyn Transport>,
    pub auth: RefreshCoordinator,
    pub registry: Arc<ChannelRegistry>,
    pub options: ConnectionOptions,
    pub timeouts: LaneLinkTimeouts,
    pub handlers: EventHandlers,
    pub outcome_tx: mpsc::UnboundedSender<MutationOutcome>,
}

/// Handle to the background connection task.
///
/// Cloning is cheap; all clones address the same task.
#[derive(Clone)]
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<ConnCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Spawn the connection task and return its handle.
    pub(crate) fn spawn(config: ConnectionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let queue = MessageQueue::new(config.options.queue_capacity);
        let task = ConnectionTask {
            endpoint: config.endpoint,
            transport: config.transport,
            auth: config.auth,
            registry: config.registry,
            options: config.options,
            timeouts: config.timeouts,
            handlers: config.handlers,
            outcome_tx: config.outcome_tx,
            state_tx,
            queue,
            user_disconnected: false,
        };
        let handle = tokio::spawn(task.run(cmd_rx));

        Self {
            cmd_tx,
            state_rx,
            task: Arc::new(StdMutex::new(Some(handle))),
        }
    }

    /// Establish the connection. Resolves once the first attempt succeeds
    /// or fails; automatic reconnection takes over afterwards.
    pub async fn connect(&self) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send_cmd(ConnCmd::Connect { result_tx }).await?;
        result_rx
            .await
            .map_err(|_| LaneLinkError::Internal("Connection task stopped".to_string()))?
    }

    /// Close the connection. Idempotent; does not clear the message queue,
    /// so a later `connect()` flushes anything queued in between.
    pub async fn disconnect(&self) -> Result<()> {
        self.send_cmd(ConnCmd::Disconnect).await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Send an envelope. While disconnected the envelope is queued and
    /// flushed in FIFO order on the next successful (re)connect.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.send_cmd(ConnCmd::Send { envelope }).await
    }

    /// Number of messages waiting in the disconnected-send queue.
    pub async fn queued_len(&self) -> Result<usize> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send_cmd(ConnCmd::QueueLen { result_tx }).await?;
        result_rx
            .await
            .map_err(|_| LaneLinkError::Internal("Connection task stopped".to_string()))
    }

    /// Announce a newly active channel so the server starts pushing its
    /// events. No-op while disconnected; re-subscription on connect covers
    /// it.
    pub(crate) async fn channel_subscribed(&self, channel: &str) -> Result<()> {
        self.send_cmd(ConnCmd::Subscribe {
            channel: channel.to_string(),
        })
        .await
    }

    /// Withdraw a channel that lost its last handler.
    pub(crate) async fn channel_unsubscribed(&self, channel: &str) -> Result<()> {
        self.send_cmd(ConnCmd::Unsubscribe {
            channel: channel.to_string(),
        })
        .await
    }

    /// Stop the connection task for good.
    pub async fn shutdown(&self) {
        let _ = self.send_cmd(ConnCmd::Shutdown).await;
        let handle = {
            let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
            task.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn send_cmd(&self, cmd: ConnCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| LaneLinkError::Internal("Connection task stopped".to_string()))
    }
}

// ── Task ────────────────────────────────────────────────────────────────────

/// Why an active session ended.
enum SessionEnd {
    UserDisconnect,
    Shutdown,
    Lost(DisconnectReason),
}

/// Outcome of the reconnect loop.
enum Reconnect {
    Established(Box<dyn TransportConnection>),
    GaveUp,
    /// Credential renewal failed terminally; the session is over.
    Abandoned,
    UserDisconnect,
    Shutdown,
}

struct ConnectionTask {
    endpoint: String,
    transport: Arc<dyn Transport>,
    auth: RefreshCoordinator,
    registry: Arc<ChannelRegistry>,
    options: ConnectionOptions,
    timeouts: LaneLinkTimeouts,
    handlers: EventHandlers,
    outcome_tx: mpsc::UnboundedSender<MutationOutcome>,
    state_tx: watch::Sender<ConnectionState>,
    queue: MessageQueue,
    user_disconnected: bool,
}

impl ConnectionTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ConnCmd>) {
        loop {
            // Idle: no connection, waiting for commands.
            let Some(cmd) = cmd_rx.recv().await else {
                break;
            };
            match cmd {
                ConnCmd::Connect { result_tx } => {
                    self.user_disconnected = false;
                    self.set_state(ConnectionState::Connecting);
                    match self.establish().await {
                        Ok(conn) => {
                            // The caller is resolved from inside the session,
                            // once the open handshake completes.
                            if let SessionEnd::Shutdown =
                                self.drive(conn, &mut cmd_rx, Some(result_tx)).await
                            {
                                break;
                            }
                        },
                        Err(e) => {
                            log::warn!("[lane-link] Connect failed: {}", e);
                            self.set_state(ConnectionState::Disconnected);
                            let _ = result_tx.send(Err(e));
                        },
                    }
                },
                ConnCmd::Send { envelope } => self.enqueue(envelope),
                ConnCmd::QueueLen { result_tx } => {
                    let _ = result_tx.send(self.queue.len());
                },
                // Subscription changes while idle are picked up from the
                // registry on the next connect.
                ConnCmd::Subscribe { .. } | ConnCmd::Unsubscribe { .. } => {},
                ConnCmd::Disconnect => {
                    self.set_state(ConnectionState::Disconnected);
                },
                ConnCmd::Shutdown => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
        log::debug!("[lane-link] Connection task stopped");
    }

    /// Drive an established connection, reconnecting on loss, until the
    /// user disconnects, reconnection gives up, or the client shuts down.
    async fn drive(
        &mut self,
        mut conn: Box<dyn TransportConnection>,
        cmd_rx: &mut mpsc::Receiver<ConnCmd>,
        mut announce: Option<oneshot::Sender<Result<()>>>,
    ) -> SessionEnd {
        loop {
            let end = self.session(&mut conn, cmd_rx, &mut announce).await;
            let reason = match end {
                SessionEnd::Lost(reason) => reason,
                other => {
                    conn.close().await;
                    fail_announce(&mut announce);
                    if matches!(other, SessionEnd::UserDisconnect) {
                        self.set_state(ConnectionState::Disconnected);
                        self.handlers
                            .emit_disconnect(DisconnectReason::new("Disconnected by user"));
                    }
                    return other;
                },
            };

            conn.close().await;
            log::warn!("[lane-link] Connection lost: {}", reason);
            self.handlers.emit_disconnect(reason);

            if !self.options.auto_reconnect || self.user_disconnected {
                self.set_state(ConnectionState::Disconnected);
                fail_announce(&mut announce);
                return SessionEnd::UserDisconnect;
            }

            match self.reconnect(cmd_rx).await {
                Reconnect::Established(new_conn) => conn = new_conn,
                Reconnect::GaveUp => {
                    self.set_state(ConnectionState::Error);
                    self.handlers.emit_error(ConnectionFault::new(
                        "Reconnection attempts exhausted",
                        false,
                    ));
                    fail_announce(&mut announce);
                    return SessionEnd::Lost(DisconnectReason::new("Reconnection exhausted"));
                },
                Reconnect::Abandoned => {
                    fail_announce(&mut announce);
                    return SessionEnd::Lost(DisconnectReason::new("Credential renewal failed"));
                },
                Reconnect::UserDisconnect => {
                    self.set_state(ConnectionState::Disconnected);
                    fail_announce(&mut announce);
                    return SessionEnd::UserDisconnect;
                },
                Reconnect::Shutdown => {
                    fail_announce(&mut announce);
                    return SessionEnd::Shutdown;
                },
            }
        }
    }

    /// One connected session: open-handshake, then serve commands, inbound
    /// frames, and heartbeats until something ends it.
    async fn session(
        &mut self,
        conn: &mut Box<dyn TransportConnection>,
        cmd_rx: &mut mpsc::Receiver<ConnCmd>,
        announce: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> SessionEnd {
        if let Err(e) = self.on_open(conn.as_mut()).await {
            return SessionEnd::Lost(DisconnectReason::new(format!("Open handshake failed: {}", e)));
        }
        self.set_state(ConnectionState::Connected);
        self.handlers.emit_connect();
        if let Some(tx) = announce.take() {
            let _ = tx.send(Ok(()));
        }
        log::info!("[lane-link] Connected to {}", self.endpoint);

        let heartbeat_period = self.heartbeat_period();
        let heartbeats_enabled = !LaneLinkTimeouts::is_no_timeout(self.timeouts.heartbeat_interval);
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat_period,
            heartbeat_period,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The select only picks the next step; acting on it happens after,
        // once the recv future has released its borrow of the connection.
        enum Step {
            Cmd(Option<ConnCmd>),
            Frame(Option<Result<TransportFrame>>),
            Heartbeat,
        }

        loop {
            let step = tokio::select! {
                biased;
                cmd = cmd_rx.recv() => Step::Cmd(cmd),
                frame = conn.recv() => Step::Frame(frame),
                _ = heartbeat.tick(), if heartbeats_enabled => Step::Heartbeat,
            };

            match step {
                Step::Cmd(cmd) => match cmd {
                    Some(ConnCmd::Send { envelope }) => {
                        if let Err(e) = self.send_envelope(conn.as_mut(), &envelope).await {
                            // The frame may or may not have hit the wire;
                            // requeue it at the front so flush order is
                            // preserved.
                            self.queue.push_front(PendingMessage::from_envelope(envelope));
                            return SessionEnd::Lost(DisconnectReason::new(format!(
                                "Send failed: {}",
                                e
                            )));
                        }
                    },
                    Some(ConnCmd::Subscribe { channel }) => {
                        let envelope = Envelope::subscribe(channel);
                        if let Err(e) = self.send_envelope(conn.as_mut(), &envelope).await {
                            return SessionEnd::Lost(DisconnectReason::new(format!(
                                "Subscribe failed: {}",
                                e
                            )));
                        }
                    },
                    Some(ConnCmd::Unsubscribe { channel }) => {
                        let envelope = Envelope::unsubscribe(channel);
                        if let Err(e) = self.send_envelope(conn.as_mut(), &envelope).await {
                            return SessionEnd::Lost(DisconnectReason::new(format!(
                                "Unsubscribe failed: {}",
                                e
                            )));
                        }
                    },
                    Some(ConnCmd::QueueLen { result_tx }) => {
                        let _ = result_tx.send(self.queue.len());
                    },
                    Some(ConnCmd::Connect { result_tx }) => {
                        // Already connected.
                        let _ = result_tx.send(Ok(()));
                    },
                    Some(ConnCmd::Disconnect) => {
                        self.user_disconnected = true;
                        return SessionEnd::UserDisconnect;
                    },
                    Some(ConnCmd::Shutdown) | None => return SessionEnd::Shutdown,
                },

                Step::Frame(frame) => match frame {
                    Some(Ok(TransportFrame::Text(raw))) => self.route_text(&raw),
                    Some(Ok(TransportFrame::Ping(payload))) => {
                        if let Err(e) = conn.send_pong(payload).await {
                            return SessionEnd::Lost(DisconnectReason::new(format!(
                                "Pong failed: {}",
                                e
                            )));
                        }
                    },
                    Some(Ok(TransportFrame::Pong(_))) => {},
                    Some(Ok(TransportFrame::Closed(code))) => {
                        let reason = match code {
                            Some(code) => DisconnectReason::with_code("Closed by server", code),
                            None => DisconnectReason::new("Closed by server"),
                        };
                        return SessionEnd::Lost(reason);
                    },
                    Some(Err(e)) => {
                        return SessionEnd::Lost(DisconnectReason::new(format!(
                            "Transport error: {}",
                            e
                        )));
                    },
                    None => {
                        return SessionEnd::Lost(DisconnectReason::new("Stream ended"));
                    },
                },

                Step::Heartbeat => {
                    let envelope = Envelope::heartbeat();
                    if let Err(e) = self.send_envelope(conn.as_mut(), &envelope).await {
                        return SessionEnd::Lost(DisconnectReason::new(format!(
                            "Heartbeat send failed: {}",
                            e
                        )));
                    }
                },
            }
        }
    }

    /// Reconnect with exponential backoff, still servicing commands while
    /// waiting between attempts.
    async fn reconnect(&mut self, cmd_rx: &mut mpsc::Receiver<ConnCmd>) -> Reconnect {
        let backoff = self.options.reconnect_backoff();
        let mut attempt: u32 = 0;
        // One transparent credential renewal per reconnect cycle; a second
        // rejection is terminal.
        let mut auth_retry_used = false;

        loop {
            if backoff.is_exhausted(attempt) {
                log::error!(
                    "[lane-link] Giving up after {} reconnection attempts",
                    attempt
                );
                return Reconnect::GaveUp;
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff.delay(attempt);
            log::info!(
                "[lane-link] Reconnecting in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                backoff.max_attempts
            );

            if let Some(exit) = self.wait_interruptible(delay, cmd_rx).await {
                return exit;
            }

            match self.establish().await {
                Ok(conn) => return Reconnect::Established(conn),
                Err(LaneLinkError::Auth(message)) if !auth_retry_used => {
                    // The server rejected the credential at the upgrade.
                    // Renew once; the retry itself is never credential-
                    // driven beyond that.
                    log::warn!(
                        "[lane-link] Credential rejected during reconnect, renewing: {}",
                        message
                    );
                    auth_retry_used = true;
                    self.auth.invalidate().await;
                    attempt += 1;
                },
                Err(e @ LaneLinkError::Auth(_)) => {
                    log::error!("[lane-link] Reconnect abandoned: {}", e);
                    self.handlers
                        .emit_error(ConnectionFault::new(e.to_string(), false));
                    self.set_state(ConnectionState::Error);
                    return Reconnect::Abandoned;
                },
                Err(e) => {
                    log::warn!("[lane-link] Reconnect attempt failed: {}", e);
                    attempt += 1;
                },
            }
        }
    }

    /// Sleep for `delay` while still answering commands. Returns an exit
    /// if a command ends the reconnect cycle.
    async fn wait_interruptible(
        &mut self,
        delay: Duration,
        cmd_rx: &mut mpsc::Receiver<ConnCmd>,
    ) -> Option<Reconnect> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Send { envelope }) => self.enqueue(envelope),
                    Some(ConnCmd::QueueLen { result_tx }) => {
                        let _ = result_tx.send(self.queue.len());
                    },
                    Some(ConnCmd::Subscribe { .. }) | Some(ConnCmd::Unsubscribe { .. }) => {},
                    Some(ConnCmd::Connect { result_tx }) => {
                        // A reconnect cycle is already running.
                        let _ = result_tx.send(Ok(()));
                    },
                    Some(ConnCmd::Disconnect) => {
                        self.user_disconnected = true;
                        return Some(Reconnect::UserDisconnect);
                    },
                    Some(ConnCmd::Shutdown) | None => return Some(Reconnect::Shutdown),
                },
            }
        }
    }

    /// Dial the endpoint with a credential valid beyond the safety
    /// threshold. Renewal, when needed, happens inside the coordinator.
    async fn establish(&self) -> Result<Box<dyn TransportConnection>> {
        let credential = self.auth.get_valid_credential().await?;
        self.transport.connect(&self.endpoint, &credential).await
    }

    /// Post-connect handshake: re-subscribe every active channel, then
    /// flush the pending queue in FIFO order.
    async fn on_open(&mut self, conn: &mut dyn TransportConnection) -> Result<()> {
        let mut channels = self.registry.active_channels();
        channels.sort();
        for channel in channels {
            self.send_envelope(conn, &Envelope::subscribe(channel)).await?;
        }

        if !self.queue.is_empty() {
            log::info!("[lane-link] Flushing {} queued message(s)", self.queue.len());
        }
        while let Some(message) = self.queue.pop_front() {
            let envelope = message.clone().into_envelope();
            if let Err(e) = self.send_envelope(conn, &envelope).await {
                self.queue.push_front(message);
                self.queue.mark_retry();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Route one inbound text frame.
    fn route_text(&self, raw: &str) {
        self.handlers.emit_receive(raw);
        let envelope = match Envelope::from_text(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[lane-link] Dropping unparseable frame: {}", e);
                return;
            },
        };

        match envelope.kind {
            EnvelopeKind::Event => {
                self.registry.dispatch(ChannelEvent {
                    channel: envelope.channel,
                    payload: envelope.payload,
                    timestamp: envelope.timestamp,
                });
            },
            EnvelopeKind::HeartbeatAck => {
                log::trace!("[lane-link] Heartbeat acknowledged");
            },
            EnvelopeKind::MutationConfirmed => {
                match serde_json::from_value::<MutationConfirmed>(envelope.payload) {
                    Ok(confirmed) => {
                        let _ = self.outcome_tx.send(MutationOutcome::Confirmed(confirmed));
                    },
                    Err(e) => log::warn!("[lane-link] Malformed mutation confirmation: {}", e),
                }
            },
            EnvelopeKind::MutationRejected => {
                match serde_json::from_value::<MutationRejected>(envelope.payload) {
                    Ok(rejected) => {
                        let _ = self.outcome_tx.send(MutationOutcome::Rejected(rejected));
                    },
                    Err(e) => log::warn!("[lane-link] Malformed mutation rejection: {}", e),
                }
            },
            other => {
                log::debug!(
                    "[lane-link] Ignoring '{:?}' frame on channel '{}'",
                    other,
                    envelope.channel
                );
            },
        }
    }

    async fn send_envelope(
        &self,
        conn: &mut dyn TransportConnection,
        envelope: &Envelope,
    ) -> Result<()> {
        let text = envelope.to_text()?;
        self.handlers.emit_send(&text);
        if LaneLinkTimeouts::is_no_timeout(self.timeouts.send_timeout) {
            conn.send_text(&text).await
        } else {
            tokio::time::timeout(self.timeouts.send_timeout, conn.send_text(&text))
                .await
                .map_err(|_| {
                    LaneLinkError::Timeout(format!(
                        "Send timed out after {:?}",
                        self.timeouts.send_timeout
                    ))
                })?
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        if let Some(evicted) = self.queue.push(PendingMessage::from_envelope(envelope)) {
            log::warn!(
                "[lane-link] Queue full; dropped oldest message on channel '{}'",
                evicted.channel
            );
        }
    }

    /// Heartbeat period with a small deterministic jitter derived from the
    /// endpoint, so co-located clients do not tick in lockstep.
    fn heartbeat_period(&self) -> Duration {
        let base = self.timeouts.heartbeat_interval;
        if LaneLinkTimeouts::is_no_timeout(base) {
            // Disabled; the select arm is gated off, any value works.
            return Duration::from_secs(3600);
        }
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in self.endpoint.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        base + Duration::from_millis(hash % 250)
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            log::debug!("[lane-link] Connection state -> {}", state);
            let _ = self.state_tx.send(state);
        }
    }
}

/// Resolve a still-waiting `connect()` caller with an error when the
/// connection ends before the open handshake completed.
fn fail_announce(announce: &mut Option<oneshot::Sender<Result<()>>>) {
    if let Some(tx) = announce.take() {
        let _ = tx.send(Err(LaneLinkError::Connection(
            "Connection closed before it was established".to_string(),
        )));
    }
}
