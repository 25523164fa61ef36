//! Shard orchestration.
//!
//! One supervisor task per shard runs its [`ShardConnection`], restarting it
//! with backoff after recoverable disconnects. A fatal disconnect on any
//! shard stops every shard and is surfaced from [`ShardOrchestrator::join`].
//! All shards share one [`IdentifyGate`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::stream::{self, BoxStream, SelectAll};
use futures_util::{Stream, StreamExt};
use gatewire_rest::RetryExecutor;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::identify::IdentifyGate;
use crate::protocol::GatewayEvent;
use crate::shard::{ShardConnection, ShardHandle, ShardTermination};
use crate::state::ShardStatus;
use crate::transport::{GatewayTransport, WsTransport};

/// Lifecycle of an orchestrator. It only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not started.
    Idle,
    /// Shards are running.
    Running,
    /// Stopped or finished; cannot be started again.
    Finished,
}

type SupervisorExit = (u32, Option<GatewayError>);

#[derive(Debug)]
struct Inner {
    phase: Phase,
    handles: Vec<ShardHandle>,
    /// First fatal error, kept until a join call returns it.
    failure: Option<GatewayError>,
}

/// Starts, supervises and stops every shard of a process.
pub struct ShardOrchestrator {
    config: Arc<GatewayConfig>,
    transport: Arc<dyn GatewayTransport>,
    identify: Arc<IdentifyGate>,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
    /// Supervisor tasks. Held across awaits by `join`, so a dropped join
    /// leaves them running for the next caller.
    tasks: tokio::sync::Mutex<JoinSet<SupervisorExit>>,
}

impl ShardOrchestrator {
    /// Creates an orchestrator connecting over WebSockets.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_transport(config, Arc::new(WsTransport))
    }

    /// Creates an orchestrator over `transport`.
    pub fn with_transport(config: GatewayConfig, transport: Arc<dyn GatewayTransport>) -> Self {
        let identify = IdentifyGate::new(config.max_concurrency, config.identify_window());
        Self {
            config: Arc::new(config),
            transport,
            identify: Arc::new(identify),
            cancel: CancellationToken::new(),
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                handles: Vec::new(),
                failure: None,
            }),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Number of shards this orchestrator runs.
    pub fn shard_count(&self) -> u32 {
        self.config.shard_count.max(1)
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Spawns a supervisor for every shard and returns the merged event
    /// stream.
    ///
    /// Fails with [`GatewayError::StateConflict`] if already started or
    /// stopped.
    pub fn start(&self) -> Result<ShardEvents> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Idle => {}
            Phase::Running => return Err(GatewayError::conflict("orchestrator is already running")),
            Phase::Finished => {
                return Err(GatewayError::conflict(
                    "orchestrator was stopped and cannot be restarted",
                ))
            }
        }

        let Ok(mut tasks) = self.tasks.try_lock() else {
            return Err(GatewayError::conflict("orchestrator is being joined"));
        };
        let shard_count = self.shard_count();
        info!(
            shard_count,
            max_concurrency = self.config.max_concurrency,
            "starting shards"
        );

        let mut streams = Vec::with_capacity(shard_count as usize);
        for shard_id in 0..shard_count {
            let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
            let (connection, handle) = ShardConnection::new(
                shard_id,
                Arc::clone(&self.config),
                Arc::clone(&self.transport),
                Arc::clone(&self.identify),
                tx,
                self.cancel.child_token(),
            );
            let backoff = RetryExecutor::new(self.config.reconnect.clone());
            tasks.spawn(supervise(connection, backoff, self.cancel.clone()));
            inner.handles.push(handle);
            streams.push(receiver_stream(rx));
        }
        inner.phase = Phase::Running;

        Ok(ShardEvents {
            inner: stream::select_all(streams),
        })
    }

    /// Handle for shard `shard_id`, once started.
    pub fn handle(&self, shard_id: u32) -> Option<ShardHandle> {
        self.lock()
            .handles
            .iter()
            .find(|handle| handle.shard_id() == shard_id)
            .cloned()
    }

    /// Handles for every shard, once started.
    pub fn handles(&self) -> Vec<ShardHandle> {
        self.lock().handles.clone()
    }

    /// Status of every shard.
    pub fn statuses(&self) -> Vec<ShardStatus> {
        self.lock().handles.iter().map(ShardHandle::status).collect()
    }

    /// Asks every shard to close. Idempotent. An orchestrator that was never
    /// started can no longer be.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.phase == Phase::Idle {
            inner.phase = Phase::Finished;
        }
        if !self.cancel.is_cancelled() {
            info!("stopping all shards");
            self.cancel.cancel();
        }
    }

    /// Waits until every shard is disconnected.
    ///
    /// Returns the first fatal error, if a shard was refused; once returned,
    /// later calls succeed immediately. Dropping the future does not affect
    /// the shards, and a later call picks up where it left off.
    pub async fn join(&self) -> Result<()> {
        if self.phase() == Phase::Idle {
            return Err(GatewayError::conflict("orchestrator was never started"));
        }

        let mut tasks = self.tasks.lock().await;
        let drained = !tasks.is_empty();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((shard_id, None)) => debug!(shard = shard_id, "shard finished"),
                Ok((shard_id, Some(e))) => {
                    error!(shard = shard_id, error = %e, "shard failed");
                    self.lock().failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "shard supervisor aborted");
                    self.cancel.cancel();
                }
            }
        }
        drop(tasks);

        let failure = {
            let mut inner = self.lock();
            inner.phase = Phase::Finished;
            inner.failure.take()
        };
        if drained {
            info!("all shards disconnected");
        }
        failure.map_or(Ok(()), Err)
    }

    /// [`stop`](Self::stop) followed by [`join`](Self::join).
    pub async fn shutdown(&self) -> Result<()> {
        self.stop();
        self.join().await
    }

    /// Starts every shard and feeds each event to `handler` until all shards
    /// finish.
    pub async fn run<F, Fut>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(GatewayEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut events = self.start()?;
        while let Some(event) = events.next().await {
            handler(event).await;
        }
        self.join().await
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ShardOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardOrchestrator")
            .field("shard_count", &self.shard_count())
            .field("phase", &self.phase())
            .finish()
    }
}

async fn supervise(
    mut connection: ShardConnection,
    backoff: RetryExecutor,
    cancel: CancellationToken,
) -> SupervisorExit {
    let shard_id = connection.shard_id();
    let mut restarts = 0u32;
    loop {
        match connection.run().await {
            ShardTermination::StoppedByCaller => return (shard_id, None),
            fatal @ ShardTermination::FatalDisconnect { .. } => {
                error!(shard = shard_id, "fatal disconnect, stopping every shard");
                cancel.cancel();
                return (shard_id, fatal.into_error());
            }
            ShardTermination::RecoverableDisconnect { reason, connected } => {
                if cancel.is_cancelled() {
                    return (shard_id, None);
                }
                if connected {
                    restarts = 0;
                }
                let delay = backoff.compute_backoff(restarts);
                restarts = restarts.saturating_add(1);
                warn!(
                    shard = shard_id,
                    reason = %reason,
                    restarts,
                    delay_ms = delay.as_millis() as u64,
                    resume = connection.resume_data().is_some(),
                    "restarting shard"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return (shard_id, None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn receiver_stream(rx: mpsc::Receiver<GatewayEvent>) -> BoxStream<'static, GatewayEvent> {
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .boxed()
}

/// Events from every shard, in arrival order per shard.
///
/// Ends once every shard has finished. Dropping it does not stop the shards.
pub struct ShardEvents {
    inner: SelectAll<BoxStream<'static, GatewayEvent>>,
}

impl ShardEvents {
    /// Next event from any shard.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        self.inner.next().await
    }
}

impl Stream for ShardEvents {
    type Item = GatewayEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<GatewayEvent>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ShardEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardEvents")
            .field("shards", &self.inner.len())
            .finish()
    }
}
