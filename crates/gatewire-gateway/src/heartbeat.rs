//! Heartbeat tracking for one gateway connection.
//!
//! The shard sends a heartbeat on every interval tick and expects an ack
//! before the next tick. `max_missed` consecutive ticks without an ack mark
//! the connection zombied.

use std::time::Duration;

use tokio::time::Instant;

/// Liveness of a connection as judged by heartbeat acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Every heartbeat so far was acknowledged.
    Healthy,
    /// At least one heartbeat is overdue.
    Late,
    /// Too many heartbeats went unacknowledged; the connection is dead.
    Zombied,
}

/// What the shard should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a heartbeat now.
    Send,
    /// Tear the connection down and reconnect.
    Reconnect,
}

/// Heartbeat statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Heartbeats sent.
    pub total_sent: u64,
    /// Acks received.
    pub total_acked: u64,
    /// Current run of unacknowledged heartbeats.
    pub missed: u32,
}

/// Tracks heartbeats of one connection. Owned by the shard task.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    interval: Duration,
    max_missed: u32,
    awaiting_ack: bool,
    missed: u32,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
    latency: Option<Duration>,
    total_sent: u64,
    total_acked: u64,
}

impl HeartbeatTracker {
    /// Creates a tracker for `interval`. A zero `max_missed` is treated as one.
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            max_missed: max_missed.max(1),
            awaiting_ack: false,
            missed: 0,
            last_sent: None,
            last_ack: None,
            latency: None,
            total_sent: 0,
            total_acked: 0,
        }
    }

    /// Heartbeat interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Decides what to do on an interval tick at `now`.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if self.awaiting_ack {
            self.missed += 1;
            if self.missed >= self.max_missed {
                return HeartbeatAction::Reconnect;
            }
        }
        self.record_sent(now);
        HeartbeatAction::Send
    }

    /// Records a heartbeat sent outside the tick schedule, for example in
    /// reply to a server heartbeat request.
    pub fn record_sent(&mut self, now: Instant) {
        self.awaiting_ack = true;
        self.last_sent = Some(now);
        self.total_sent += 1;
    }

    /// Records an ack received at `now`.
    pub fn on_ack(&mut self, now: Instant) {
        if let Some(sent) = self.last_sent {
            if self.awaiting_ack {
                self.latency = Some(now.saturating_duration_since(sent));
            }
        }
        self.awaiting_ack = false;
        self.missed = 0;
        self.last_ack = Some(now);
        self.total_acked += 1;
    }

    /// Current liveness.
    pub fn state(&self) -> HeartbeatState {
        if self.missed >= self.max_missed {
            HeartbeatState::Zombied
        } else if self.missed > 0 {
            HeartbeatState::Late
        } else {
            HeartbeatState::Healthy
        }
    }

    /// Round-trip time of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// When the last heartbeat was sent.
    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    /// When the last ack arrived.
    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    /// Counters.
    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            total_sent: self.total_sent,
            total_acked: self.total_acked,
            missed: self.missed,
        }
    }
}
