//! One gateway shard connection.
//!
//! [`ShardConnection::run`] owns the socket, heartbeat timer and session for
//! one shard and drives it through its states:
//!
//! ```text
//! Disconnected → Connecting → Identifying ─┐
//!                          └→ Resuming ────┴→ Connected
//! Connected → Zombied → Connecting (resume)
//! any → Closing → Disconnected
//! ```
//!
//! Callers talk to a running shard through the cloneable [`ShardHandle`].
//! Session data survives recoverable disconnects, so calling `run` again
//! after [`ShardTermination::RecoverableDisconnect`] resumes where the shard
//! left off.

use std::sync::Arc;
use std::time::Duration;

use gatewire_rest::{RetryExecutor, WindowLimiter};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::close::CloseCode;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::heartbeat::{HeartbeatAction, HeartbeatTracker};
use crate::identify::{IdentifyGate, IdentifyPermit};
use crate::protocol::{
    ConnectionProperties, GatewayEvent, GatewayFrame, Hello, Identify, Opcode, Ready,
};
use crate::state::{ShardState, ShardStatus, StatusPublisher};
use crate::transport::{GatewaySocket, GatewayTransport, SocketMessage};

const COMMAND_QUEUE: usize = 32;

/// How a call to [`ShardConnection::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardTermination {
    /// [`ShardHandle::stop`] was called.
    StoppedByCaller,
    /// Reconnecting failed too many times in a row. Running again is safe and
    /// resumes the held session when there is one.
    RecoverableDisconnect {
        /// Last failure.
        reason: String,
        /// Whether the shard reached [`ShardState::Connected`] during the run.
        connected: bool,
    },
    /// The server refused the shard for good.
    FatalDisconnect {
        /// Close code, when the refusal came as one.
        code: Option<CloseCode>,
        /// Description.
        reason: String,
    },
}

impl ShardTermination {
    /// The error a supervisor should surface, if any.
    pub fn into_error(self) -> Option<GatewayError> {
        match self {
            ShardTermination::StoppedByCaller => None,
            ShardTermination::RecoverableDisconnect { reason, .. } => {
                Some(GatewayError::Connection { reason })
            }
            ShardTermination::FatalDisconnect {
                code: Some(code),
                reason,
            } => Some(GatewayError::ServerClosed {
                code,
                reason,
                can_reconnect: false,
            }),
            ShardTermination::FatalDisconnect { code: None, reason } => {
                Some(GatewayError::Protocol { reason })
            }
        }
    }
}

/// Session state needed to resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeData {
    /// Session id from READY.
    pub session_id: String,
    /// Last sequence number seen.
    pub sequence: Option<u64>,
    /// URL to reconnect to, from READY.
    pub resume_url: Option<String>,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    resume_url: Option<String>,
}

struct Command {
    frame: GatewayFrame,
    reply: oneshot::Sender<Result<()>>,
}

enum SessionEnd {
    Stopped,
    Fatal {
        code: Option<CloseCode>,
        reason: String,
    },
    Reconnect {
        reason: String,
        established: bool,
        delay: Option<Duration>,
    },
}

impl SessionEnd {
    fn reconnect(reason: impl ToString, established: bool) -> Self {
        SessionEnd::Reconnect {
            reason: reason.to_string(),
            established,
            delay: None,
        }
    }
}

enum Flow {
    Continue,
    End(SessionEnd),
}

/// State machine for one shard.
pub struct ShardConnection {
    shard_id: u32,
    shard_count: u32,
    config: Arc<GatewayConfig>,
    transport: Arc<dyn GatewayTransport>,
    identify: Arc<IdentifyGate>,
    events: mpsc::Sender<GatewayEvent>,
    commands: mpsc::Receiver<Command>,
    status: StatusPublisher,
    cancel: CancellationToken,
    backoff: RetryExecutor,
    session: Option<Session>,
    sequence: Option<u64>,
}

impl ShardConnection {
    /// Creates shard `shard_id` of `config.shard_count`.
    ///
    /// Events are delivered on `events`; a full channel suspends the receive
    /// loop. Cancelling `cancel` stops the shard.
    pub fn new(
        shard_id: u32,
        config: Arc<GatewayConfig>,
        transport: Arc<dyn GatewayTransport>,
        identify: Arc<IdentifyGate>,
        events: mpsc::Sender<GatewayEvent>,
        cancel: CancellationToken,
    ) -> (Self, ShardHandle) {
        let shard_count = config.shard_count.max(1);
        let (status, status_rx) = StatusPublisher::new(ShardStatus::new(shard_id, shard_count));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let limiter = WindowLimiter::new(
            "gateway-commands",
            config.command_capacity,
            config.command_period(),
        );
        let handle = ShardHandle {
            shard_id,
            commands: command_tx,
            limiter: Arc::new(limiter),
            status: status_rx,
            cancel: cancel.clone(),
        };
        let backoff = RetryExecutor::new(config.reconnect.clone());
        let connection = Self {
            shard_id,
            shard_count,
            config,
            transport,
            identify,
            events,
            commands: command_rx,
            status,
            cancel,
            backoff,
            session: None,
            sequence: None,
        };
        (connection, handle)
    }

    /// Starts from a previously held session, so the first connect resumes.
    pub fn with_resume(mut self, resume: ResumeData) -> Self {
        self.sequence = resume.sequence;
        self.status.update(|s| {
            s.session_id = Some(resume.session_id.clone());
            s.sequence = resume.sequence;
        });
        self.session = Some(Session {
            id: resume.session_id,
            resume_url: resume.resume_url,
        });
        self
    }

    /// Shard index.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Current status.
    pub fn status(&self) -> ShardStatus {
        self.status.current()
    }

    /// The held session, if any.
    pub fn resume_data(&self) -> Option<ResumeData> {
        self.session.as_ref().map(|session| ResumeData {
            session_id: session.id.clone(),
            sequence: self.sequence,
            resume_url: session.resume_url.clone(),
        })
    }

    /// Runs until stopped, refused, or out of reconnect attempts.
    ///
    /// Always leaves the shard in [`ShardState::Disconnected`].
    pub async fn run(&mut self) -> ShardTermination {
        let mut failures = 0u32;
        let mut connected = false;
        let termination = loop {
            if self.cancel.is_cancelled() {
                break ShardTermination::StoppedByCaller;
            }
            match self.run_session().await {
                SessionEnd::Stopped => break ShardTermination::StoppedByCaller,
                SessionEnd::Fatal { code, reason } => {
                    error!(shard = self.shard_id, code = ?code, reason = %reason, "shard refused by gateway");
                    break ShardTermination::FatalDisconnect { code, reason };
                }
                SessionEnd::Reconnect {
                    reason,
                    established,
                    delay,
                } => {
                    connected |= established;
                    failures = if established { 0 } else { failures + 1 };
                    if failures > self.config.reconnect.max_retries {
                        warn!(
                            shard = self.shard_id,
                            failures,
                            reason = %reason,
                            "giving up on reconnecting"
                        );
                        break ShardTermination::RecoverableDisconnect { reason, connected };
                    }
                    let delay = delay.unwrap_or_else(|| match failures {
                        0 => Duration::ZERO,
                        n => self.backoff.compute_backoff(n - 1),
                    });
                    self.status.update(|s| s.reconnects += 1);
                    info!(
                        shard = self.shard_id,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        resume = self.session.is_some(),
                        "reconnecting"
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break ShardTermination::StoppedByCaller,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        };
        self.status.transition(ShardState::Closing);
        self.status.transition(ShardState::Disconnected);
        termination
    }

    async fn run_session(&mut self) -> SessionEnd {
        self.status.transition(ShardState::Connecting);

        // Fresh sessions take the identify permit before the socket opens so
        // the wait never delays heartbeats.
        let mut permit: Option<IdentifyPermit> = None;
        if self.session.is_none() {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                acquired = self.identify.acquire(self.shard_id) => match acquired {
                    Ok(acquired) => permit = Some(acquired),
                    Err(_) => return SessionEnd::Stopped,
                },
            }
        }

        let base = self
            .session
            .as_ref()
            .and_then(|s| s.resume_url.clone())
            .unwrap_or_else(|| self.config.url.clone());
        let url = self.config.connect_url(&base);
        debug!(shard = self.shard_id, url = %url, "connecting");

        let mut socket = tokio::select! {
            _ = self.cancel.cancelled() => return SessionEnd::Stopped,
            connected = self.transport.connect(&url, self.config.connect_timeout()) => match connected {
                Ok(socket) => socket,
                Err(e) => return SessionEnd::reconnect(e, false),
            },
        };

        let hello = match self.await_hello(&mut socket).await {
            Ok(hello) => hello,
            Err(end) => {
                if matches!(end, SessionEnd::Stopped) {
                    self.status.transition(ShardState::Closing);
                    self.close(&mut socket, CloseCode::NORMAL_CLOSURE, "shard stopped")
                        .await;
                }
                return end;
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        let mut heartbeat = HeartbeatTracker::new(interval, self.config.max_missed_acks);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            shard = self.shard_id,
            interval_ms = interval.as_millis() as u64,
            "received HELLO"
        );

        let handshake = match &self.session {
            Some(session) => {
                self.status.transition(ShardState::Resuming);
                info!(
                    shard = self.shard_id,
                    session_id = %session.id,
                    seq = ?self.sequence,
                    "resuming session"
                );
                GatewayFrame::resume(&self.config.token, &session.id, self.sequence)
            }
            None => {
                self.status.transition(ShardState::Identifying);
                self.status.update(|s| s.identifies += 1);
                info!(
                    shard = self.shard_id,
                    shard_count = self.shard_count,
                    "identifying"
                );
                match GatewayFrame::identify(&self.identify_payload()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        return SessionEnd::Fatal {
                            code: None,
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };
        if let Err(e) = self.send_frame(&mut socket, &handshake).await {
            return SessionEnd::reconnect(e, false);
        }

        let mut established = false;
        let end = loop {
            let flow = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Flow::End(SessionEnd::Stopped),
                _ = ticker.tick() => {
                    self.on_tick(&mut socket, &mut heartbeat, established).await
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(&mut socket, command).await
                }
                received = socket.recv() => match received {
                    Ok(SocketMessage::Text(text)) => {
                        self.on_text(&mut socket, &text, &mut heartbeat, &mut permit, &mut established)
                            .await
                    }
                    Ok(SocketMessage::Closed { code, reason }) => {
                        Flow::End(self.on_close(code, reason, established))
                    }
                    Err(e) => Flow::End(SessionEnd::reconnect(e, established)),
                },
            };
            if let Flow::End(end) = flow {
                break end;
            }
        };

        if matches!(end, SessionEnd::Stopped) {
            self.status.transition(ShardState::Closing);
            self.close(&mut socket, CloseCode::NORMAL_CLOSURE, "shard stopped")
                .await;
        }
        end
    }

    async fn await_hello(
        &mut self,
        socket: &mut Box<dyn GatewaySocket>,
    ) -> std::result::Result<Hello, SessionEnd> {
        let received = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionEnd::Stopped),
            received = tokio::time::timeout(self.config.hello_timeout(), socket.recv()) => received,
        };
        match received {
            Err(_) => Err(SessionEnd::reconnect("timed out waiting for HELLO", false)),
            Ok(Err(e)) => Err(SessionEnd::reconnect(e, false)),
            Ok(Ok(SocketMessage::Closed { code, reason })) => {
                Err(self.on_close(code, reason, false))
            }
            Ok(Ok(SocketMessage::Text(text))) => {
                match GatewayFrame::decode(&text).and_then(|frame| Hello::from_frame(&frame)) {
                    Ok(hello) => Ok(hello),
                    Err(e) => {
                        warn!(shard = self.shard_id, error = %e, "bad first frame");
                        self.close(socket, CloseCode::PROTOCOL_ERROR, "expected HELLO")
                            .await;
                        Err(SessionEnd::reconnect(e, false))
                    }
                }
            }
        }
    }

    async fn on_tick(
        &mut self,
        socket: &mut Box<dyn GatewaySocket>,
        heartbeat: &mut HeartbeatTracker,
        established: bool,
    ) -> Flow {
        match heartbeat.on_tick(Instant::now()) {
            HeartbeatAction::Send => {
                let frame = GatewayFrame::heartbeat(self.sequence);
                if let Err(e) = self.send_frame(socket, &frame).await {
                    return Flow::End(SessionEnd::reconnect(e, established));
                }
                let sent = heartbeat.last_sent();
                self.status.update(|s| s.last_heartbeat_sent = sent);
                trace!(shard = self.shard_id, seq = ?self.sequence, "heartbeat sent");
                Flow::Continue
            }
            HeartbeatAction::Reconnect => {
                warn!(
                    shard = self.shard_id,
                    missed = heartbeat.stats().missed,
                    "connection zombied, heartbeats went unacknowledged"
                );
                self.status.transition(ShardState::Zombied);
                self.status.update(|s| s.zombies += 1);
                self.close(socket, CloseCode::CLIENT_RESUME, "zombied").await;
                Flow::End(SessionEnd::reconnect(GatewayError::Zombied, established))
            }
        }
    }

    async fn on_command(&mut self, socket: &mut Box<dyn GatewaySocket>, command: Command) -> Flow {
        if self.status.state() != ShardState::Connected {
            let _ = command.reply.send(Err(self.not_connected()));
            return Flow::Continue;
        }
        match self.send_frame(socket, &command.frame).await {
            Ok(()) => {
                let _ = command.reply.send(Ok(()));
                Flow::Continue
            }
            Err(e) => {
                let reason = e.to_string();
                let _ = command.reply.send(Err(e));
                Flow::End(SessionEnd::reconnect(reason, true))
            }
        }
    }

    async fn on_text(
        &mut self,
        socket: &mut Box<dyn GatewaySocket>,
        text: &str,
        heartbeat: &mut HeartbeatTracker,
        permit: &mut Option<IdentifyPermit>,
        established: &mut bool,
    ) -> Flow {
        let frame = match GatewayFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(shard = self.shard_id, error = %e, "undecodable frame");
                self.close(socket, CloseCode::PROTOCOL_ERROR, "undecodable frame")
                    .await;
                return Flow::End(SessionEnd::reconnect(e, *established));
            }
        };

        match frame.opcode() {
            Some(Opcode::Dispatch) => self.on_dispatch(frame, permit, established).await,
            Some(Opcode::Heartbeat) => {
                heartbeat.record_sent(Instant::now());
                let reply = GatewayFrame::heartbeat(self.sequence);
                if let Err(e) = self.send_frame(socket, &reply).await {
                    return Flow::End(SessionEnd::reconnect(e, *established));
                }
                trace!(shard = self.shard_id, "answered heartbeat request");
                Flow::Continue
            }
            Some(Opcode::HeartbeatAck) => {
                heartbeat.on_ack(Instant::now());
                let (ack, latency) = (heartbeat.last_ack(), heartbeat.latency());
                self.status.update(|s| {
                    s.last_heartbeat_ack = ack;
                    s.latency = latency;
                });
                trace!(shard = self.shard_id, latency = ?latency, "heartbeat acknowledged");
                Flow::Continue
            }
            Some(Opcode::Reconnect) => {
                info!(shard = self.shard_id, "gateway requested a reconnect");
                self.close(socket, CloseCode::CLIENT_RESUME, "reconnect requested")
                    .await;
                Flow::End(SessionEnd::reconnect(
                    GatewayError::ReconnectRequested,
                    *established,
                ))
            }
            Some(Opcode::InvalidSession) => {
                let resumable = frame.d.as_bool().unwrap_or(false);
                let reason = GatewayError::InvalidSession { resumable }.to_string();
                if resumable && self.session.is_some() {
                    warn!(shard = self.shard_id, "session invalidated, resuming");
                    self.close(socket, CloseCode::CLIENT_RESUME, "resuming").await;
                    return Flow::End(SessionEnd::reconnect(reason, *established));
                }
                let delay = Duration::from_millis(rand::thread_rng().gen_range(1_000..=5_000));
                warn!(
                    shard = self.shard_id,
                    delay_ms = delay.as_millis() as u64,
                    "session invalidated, starting a new one"
                );
                self.clear_session();
                self.close(socket, CloseCode::NORMAL_CLOSURE, "session invalidated")
                    .await;
                Flow::End(SessionEnd::Reconnect {
                    reason,
                    established: *established,
                    delay: Some(delay),
                })
            }
            Some(Opcode::Hello) => {
                debug!(shard = self.shard_id, "ignoring repeated HELLO");
                Flow::Continue
            }
            _ => {
                debug!(shard = self.shard_id, op = frame.op, "ignoring frame");
                Flow::Continue
            }
        }
    }

    async fn on_dispatch(
        &mut self,
        frame: GatewayFrame,
        permit: &mut Option<IdentifyPermit>,
        established: &mut bool,
    ) -> Flow {
        if let Some(seq) = frame.s {
            self.sequence = Some(self.sequence.map_or(seq, |current| current.max(seq)));
        }

        match frame.t.as_deref() {
            Some("READY") => {
                let ready: Ready = match serde_json::from_value(frame.d.clone()) {
                    Ok(ready) => ready,
                    Err(e) => {
                        warn!(shard = self.shard_id, error = %e, "malformed READY");
                        return Flow::End(SessionEnd::reconnect(e, *established));
                    }
                };
                info!(shard = self.shard_id, session_id = %ready.session_id, "shard is ready");
                let session_id = ready.session_id.clone();
                self.session = Some(Session {
                    id: ready.session_id,
                    resume_url: ready.resume_gateway_url,
                });
                *permit = None;
                *established = true;
                self.status.update(|s| s.session_id = Some(session_id));
                self.status.transition(ShardState::Connected);
            }
            Some("RESUMED") => {
                info!(shard = self.shard_id, seq = ?self.sequence, "session resumed");
                *established = true;
                self.status.update(|s| s.resumes += 1);
                self.status.transition(ShardState::Connected);
            }
            _ => {}
        }

        let sequence = self.sequence;
        self.status.update(|s| s.sequence = sequence);

        let event = GatewayEvent {
            shard_id: self.shard_id,
            opcode: Opcode::Dispatch,
            sequence: frame.s,
            name: frame.t,
            data: frame.d,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Flow::End(SessionEnd::Stopped),
            sent = self.events.send(event) => {
                if sent.is_err() {
                    trace!(shard = self.shard_id, "event receiver gone, dropping event");
                }
                Flow::Continue
            }
        }
    }

    fn on_close(&mut self, code: Option<CloseCode>, reason: String, established: bool) -> SessionEnd {
        match code {
            Some(code) if code.is_fatal() => SessionEnd::Fatal {
                code: Some(code),
                reason,
            },
            Some(code) => {
                if code.clears_session() {
                    self.clear_session();
                }
                warn!(
                    shard = self.shard_id,
                    code = %code,
                    reason = %reason,
                    resume = self.session.is_some(),
                    "gateway closed the connection"
                );
                SessionEnd::reconnect(format!("closed with {code} ({reason})"), established)
            }
            None => {
                warn!(shard = self.shard_id, "connection closed without a code");
                SessionEnd::reconnect("closed without a code", established)
            }
        }
    }

    fn identify_payload(&self) -> Identify {
        Identify {
            token: self.config.token.clone(),
            intents: self.config.intents,
            shard: [self.shard_id, self.shard_count],
            large_threshold: self.config.large_threshold,
            properties: ConnectionProperties::default(),
            compress: false,
        }
    }

    fn clear_session(&mut self) {
        self.session = None;
        self.sequence = None;
        self.status.update(|s| {
            s.session_id = None;
            s.sequence = None;
        });
    }

    fn not_connected(&self) -> GatewayError {
        GatewayError::conflict(format!(
            "shard {} is {}, not CONNECTED",
            self.shard_id,
            self.status.state()
        ))
    }

    async fn send_frame(
        &self,
        socket: &mut Box<dyn GatewaySocket>,
        frame: &GatewayFrame,
    ) -> Result<()> {
        let text = frame.encode()?;
        socket.send(text).await
    }

    async fn close(&self, socket: &mut Box<dyn GatewaySocket>, code: CloseCode, reason: &str) {
        if let Err(e) = socket.close(code, reason).await {
            debug!(shard = self.shard_id, error = %e, "close failed");
        }
    }
}

impl std::fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConnection")
            .field("shard_id", &self.shard_id)
            .field("shard_count", &self.shard_count)
            .field("state", &self.status.state())
            .field("session", &self.session)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Caller-side handle to a shard.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    shard_id: u32,
    commands: mpsc::Sender<Command>,
    limiter: Arc<WindowLimiter>,
    status: watch::Receiver<ShardStatus>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command").field("op", &self.frame.op).finish()
    }
}

impl ShardHandle {
    /// Shard index.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Current status.
    pub fn status(&self) -> ShardStatus {
        self.status.borrow().clone()
    }

    /// Current state.
    pub fn state(&self) -> ShardState {
        self.status.borrow().state
    }

    /// A receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<ShardStatus> {
        self.status.clone()
    }

    /// Waits until the shard reaches `state`. Fails if the shard is dropped
    /// first.
    pub async fn wait_for_state(&self, state: ShardState) -> Result<()> {
        let mut rx = self.status.clone();
        rx.wait_for(|status| status.state == state)
            .await
            .map(|_| ())
            .map_err(|_| GatewayError::Cancelled)
    }

    /// Asks the shard to close gracefully. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(shard = self.shard_id, "stopping shard");
            self.cancel.cancel();
        }
    }

    /// True once [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sends a caller command. Only presence, voice state and member
    /// requests are accepted, and only while the shard is connected.
    ///
    /// Suspends while the per-shard command window is exhausted.
    pub async fn send(&self, op: Opcode, d: Value) -> Result<()> {
        if !op.is_command() {
            return Err(GatewayError::conflict(format!(
                "opcode {} is managed by the shard",
                op as u8
            )));
        }
        self.ensure_connected()?;

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(GatewayError::Cancelled),
            waited = self.limiter.acquire(Duration::MAX) => {
                waited.map_err(|_| GatewayError::Cancelled)?
            }
        }

        let (reply, response) = oneshot::channel();
        let command = Command {
            frame: GatewayFrame::new(op, d),
            reply,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::conflict(format!("shard {} is not running", self.shard_id)))?;
        response
            .await
            .map_err(|_| GatewayError::conflict(format!("shard {} is not running", self.shard_id)))?
    }

    /// Updates the presence shown for this shard's guilds.
    pub async fn update_presence(&self, presence: Value) -> Result<()> {
        self.send(Opcode::PresenceUpdate, presence).await
    }

    /// Joins, moves or leaves (`channel_id: None`) a voice channel.
    pub async fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        self.send(
            Opcode::VoiceStateUpdate,
            json!({
                "guild_id": guild_id,
                "channel_id": channel_id,
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        )
        .await
    }

    /// Requests guild members whose names start with `query`.
    pub async fn request_guild_members(&self, guild_id: &str, query: &str, limit: u32) -> Result<()> {
        self.send(
            Opcode::RequestGuildMembers,
            json!({
                "guild_id": guild_id,
                "query": query,
                "limit": limit,
            }),
        )
        .await
    }

    fn ensure_connected(&self) -> Result<()> {
        let state = self.state();
        if state == ShardState::Connected {
            Ok(())
        } else {
            Err(GatewayError::conflict(format!(
                "shard {} is {}, not CONNECTED",
                self.shard_id, state
            )))
        }
    }
}
