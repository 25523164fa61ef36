//! Identify pacing shared by every shard of a process.
//!
//! At most `max_concurrency` identifies may be in flight, and at most
//! `max_concurrency` may start per identify window. A permit is held from
//! before the socket opens until READY arrives or the attempt fails, so with
//! a concurrency of one, identify attempts never overlap.

use std::sync::Arc;
use std::time::Duration;

use gatewire_rest::WindowLimiter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Process-wide identify gate.
#[derive(Debug)]
pub struct IdentifyGate {
    in_flight: Arc<Semaphore>,
    window: WindowLimiter,
}

/// Permission to identify one shard. Released on drop.
#[derive(Debug)]
pub struct IdentifyPermit {
    shard_id: u32,
    _permit: OwnedSemaphorePermit,
}

impl IdentifyPermit {
    /// Shard holding the permit.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }
}

impl Drop for IdentifyPermit {
    fn drop(&mut self) {
        debug!(shard = self.shard_id, "released identify permit");
    }
}

impl IdentifyGate {
    /// Creates a gate. A zero concurrency is treated as one.
    pub fn new(max_concurrency: u32, window: Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            in_flight: Arc::new(Semaphore::new(max_concurrency as usize)),
            window: WindowLimiter::new("identify", max_concurrency, window),
        }
    }

    /// Identifies that may run at once.
    pub fn available(&self) -> usize {
        self.in_flight.available_permits()
    }

    /// Waits until `shard_id` may identify.
    pub async fn acquire(&self, shard_id: u32) -> Result<IdentifyPermit> {
        let permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Cancelled)?;
        self.window
            .acquire(Duration::MAX)
            .await
            .map_err(|_| GatewayError::Cancelled)?;
        debug!(shard = shard_id, "acquired identify permit");
        Ok(IdentifyPermit {
            shard_id,
            _permit: permit,
        })
    }
}
