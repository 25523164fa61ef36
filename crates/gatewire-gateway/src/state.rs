//! Shard lifecycle states and the status snapshot a shard publishes.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle state of one shard connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    /// No socket.
    Disconnected,
    /// Opening the socket and waiting for HELLO.
    Connecting,
    /// Starting a fresh session.
    Identifying,
    /// Resuming a held session.
    Resuming,
    /// Session established; events flow.
    Connected,
    /// Shutting down; no heartbeat may fire from here on.
    Closing,
    /// Heartbeat acks stopped arriving; about to reconnect.
    Zombied,
}

impl ShardState {
    /// True while a socket is open or being opened.
    pub fn is_active(&self) -> bool {
        !matches!(self, ShardState::Disconnected)
    }

    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardState::Disconnected => "disconnected",
            ShardState::Connecting => "connecting",
            ShardState::Identifying => "identifying",
            ShardState::Resuming => "resuming",
            ShardState::Connected => "connected",
            ShardState::Closing => "closing",
            ShardState::Zombied => "zombied",
        }
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a shard, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardStatus {
    /// Shard index.
    pub shard_id: u32,
    /// Total shard count.
    pub shard_count: u32,
    /// Current state.
    pub state: ShardState,
    /// Held session id, if any.
    pub session_id: Option<String>,
    /// Last sequence number seen.
    pub sequence: Option<u64>,
    /// When the last heartbeat was sent.
    pub last_heartbeat_sent: Option<Instant>,
    /// When the last heartbeat ack arrived.
    pub last_heartbeat_ack: Option<Instant>,
    /// Round-trip time of the last acknowledged heartbeat.
    pub latency: Option<Duration>,
    /// Fresh sessions started.
    pub identifies: u64,
    /// Sessions resumed.
    pub resumes: u64,
    /// Connections re-opened after a drop.
    pub reconnects: u64,
    /// Connections declared zombied.
    pub zombies: u64,
}

impl ShardStatus {
    /// Initial status of a shard.
    pub fn new(shard_id: u32, shard_count: u32) -> Self {
        Self {
            shard_id,
            shard_count,
            state: ShardState::Disconnected,
            session_id: None,
            sequence: None,
            last_heartbeat_sent: None,
            last_heartbeat_ack: None,
            latency: None,
            identifies: 0,
            resumes: 0,
            reconnects: 0,
            zombies: 0,
        }
    }
}

/// Owning side of a shard's status channel.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<ShardStatus>,
}

impl StatusPublisher {
    /// Creates a publisher and its first receiver.
    pub fn new(status: ShardStatus) -> (Self, watch::Receiver<ShardStatus>) {
        let (tx, rx) = watch::channel(status);
        (Self { tx }, rx)
    }

    /// Another receiver.
    pub fn subscribe(&self) -> watch::Receiver<ShardStatus> {
        self.tx.subscribe()
    }

    /// Current status.
    pub fn current(&self) -> ShardStatus {
        self.tx.borrow().clone()
    }

    /// Current state.
    pub fn state(&self) -> ShardState {
        self.tx.borrow().state
    }

    /// Moves to `state`, logging the transition.
    pub fn transition(&self, state: ShardState) {
        self.tx.send_modify(|status| {
            if status.state != state {
                debug!(
                    shard = status.shard_id,
                    from = %status.state,
                    to = %state,
                    "shard state transition"
                );
                status.state = state;
            }
        });
    }

    /// Applies an arbitrary change.
    pub fn update(&self, change: impl FnOnce(&mut ShardStatus)) {
        self.tx.send_modify(change);
    }
}
