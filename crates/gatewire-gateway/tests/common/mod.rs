#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gatewire_gateway::{
    CloseCode, GatewayConfig, GatewayError, GatewayEvent, GatewayFrame, GatewaySocket,
    GatewayTransport, IdentifyGate, Opcode, Result, ShardConnection, ShardHandle,
    ShardTermination, SocketMessage,
};
use gatewire_rest::RetryConfig;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Something the client sent.
#[derive(Debug)]
pub enum Outbound {
    Text(GatewayFrame),
    Close(CloseCode, String),
}

/// Server side of one accepted connection.
pub struct ServerConn {
    pub url: String,
    to_client: mpsc::UnboundedSender<SocketMessage>,
    from_client: mpsc::UnboundedReceiver<Outbound>,
}

impl ServerConn {
    pub fn send(&self, frame: Value) {
        let _ = self.to_client.send(SocketMessage::Text(frame.to_string()));
    }

    pub fn hello(&self, interval_ms: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}));
    }

    pub fn dispatch(&self, seq: u64, name: &str, d: Value) {
        self.send(json!({"op": 0, "s": seq, "t": name, "d": d}));
    }

    pub fn ready(&self, seq: u64, session_id: &str, resume_url: Option<&str>) {
        self.dispatch(
            seq,
            "READY",
            json!({"session_id": session_id, "resume_gateway_url": resume_url}),
        );
    }

    pub fn resumed(&self, seq: u64) {
        self.dispatch(seq, "RESUMED", Value::Null);
    }

    pub fn ack(&self) {
        self.send(json!({"op": 11}));
    }

    pub fn op(&self, op: u8, d: Value) {
        self.send(json!({"op": op, "d": d}));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(SocketMessage::Closed {
            code: Some(CloseCode(code)),
            reason: reason.to_string(),
        });
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.from_client.recv().await
    }

    /// Next frame with opcode `op`, skipping anything else.
    pub async fn expect_op(&mut self, op: Opcode) -> GatewayFrame {
        loop {
            match self.recv().await {
                Some(Outbound::Text(frame)) if frame.op == op as u8 => return frame,
                Some(Outbound::Text(_)) => continue,
                Some(Outbound::Close(code, reason)) => {
                    panic!("client closed with {code} ({reason}) while waiting for {op:?}")
                }
                None => panic!("client went away while waiting for {op:?}"),
            }
        }
    }

    /// Close code the client sent, skipping frames before it.
    pub async fn expect_close(&mut self) -> CloseCode {
        loop {
            match self.recv().await {
                Some(Outbound::Close(code, _)) => return code,
                Some(Outbound::Text(_)) => continue,
                None => panic!("client went away without closing"),
            }
        }
    }
}

struct FakeSocket {
    inbound: mpsc::UnboundedReceiver<SocketMessage>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

fn gone() -> GatewayError {
    GatewayError::Connection {
        reason: "server went away".to_string(),
    }
}

#[async_trait]
impl GatewaySocket for FakeSocket {
    async fn send(&mut self, text: String) -> Result<()> {
        let frame = GatewayFrame::decode(&text)?;
        self.outbound.send(Outbound::Text(frame)).map_err(|_| gone())
    }

    async fn recv(&mut self) -> Result<SocketMessage> {
        self.inbound.recv().await.ok_or_else(gone)
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        let _ = self.outbound.send(Outbound::Close(code, reason.to_string()));
        Ok(())
    }
}

/// In-process gateway. Every accepted connection shows up on the receiver
/// returned by [`FakeGateway::new`].
pub struct FakeGateway {
    accepted: mpsc::UnboundedSender<ServerConn>,
    refusals: AtomicU32,
    attempts: AtomicU32,
}

impl FakeGateway {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(Self {
            accepted,
            refusals: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        });
        (gateway, rx)
    }

    /// Refuses the next `n` connection attempts.
    pub fn refuse_next(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayTransport for FakeGateway {
    async fn connect(&self, url: &str, _timeout: Duration) -> Result<Box<dyn GatewaySocket>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::Connection {
                reason: "connection refused".to_string(),
            });
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.accepted
            .send(ServerConn {
                url: url.to_string(),
                to_client,
                from_client,
            })
            .map_err(|_| gone())?;
        Ok(Box::new(FakeSocket { inbound, outbound }))
    }
}

pub const INTERVAL_MS: u64 = 41_250;

pub fn config() -> GatewayConfig {
    GatewayConfig {
        url: "wss://gateway.test".to_string(),
        token: "token".to_string(),
        reconnect: RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..Default::default()
    }
}

pub struct SpawnedShard {
    pub handle: ShardHandle,
    pub events: mpsc::Receiver<GatewayEvent>,
    pub task: JoinHandle<(ShardTermination, ShardConnection)>,
}

/// Runs shard 0 of `config` against `transport`.
pub fn spawn_shard(config: GatewayConfig, transport: Arc<dyn GatewayTransport>) -> SpawnedShard {
    let (tx, events) = mpsc::channel(config.event_buffer);
    let identify = Arc::new(IdentifyGate::new(
        config.max_concurrency,
        config.identify_window(),
    ));
    let (mut connection, handle) = ShardConnection::new(
        0,
        Arc::new(config),
        transport,
        identify,
        tx,
        CancellationToken::new(),
    );
    let task = tokio::spawn(async move {
        let termination = connection.run().await;
        (termination, connection)
    });
    SpawnedShard {
        handle,
        events,
        task,
    }
}
