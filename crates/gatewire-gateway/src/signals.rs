//! Interrupt handling for long-running clients.
//!
//! SIGINT and SIGTERM (Ctrl+C elsewhere) trigger the caller's shutdown and
//! surface as [`GatewayError::Interrupted`].

use std::future::Future;

use tracing::{info, warn};

use crate::error::{GatewayError, Result};

/// Waits for SIGINT or SIGTERM and returns its number and name.
#[cfg(unix)]
pub async fn wait_for_interrupt() -> Result<(i32, &'static str)> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok((2, "SIGINT")),
        _ = terminate.recv() => Ok((15, "SIGTERM")),
    }
}

/// Waits for Ctrl+C and reports it as SIGINT.
#[cfg(not(unix))]
pub async fn wait_for_interrupt() -> Result<(i32, &'static str)> {
    tokio::signal::ctrl_c().await?;
    Ok((2, "SIGINT"))
}

/// Runs `work` until it finishes or the process is interrupted.
///
/// On interrupt, `shutdown` runs to completion and the result is
/// [`GatewayError::Interrupted`]. If `work` fails, `shutdown` also runs
/// before the error is returned.
pub async fn run_until_interrupted<W, T, S, SF>(work: W, shutdown: S) -> Result<T>
where
    W: Future<Output = Result<T>>,
    S: FnOnce() -> SF,
    SF: Future<Output = ()>,
{
    run_until(work, wait_for_interrupt(), shutdown).await
}

/// [`run_until_interrupted`] with an arbitrary interrupt source.
pub async fn run_until<W, T, I, S, SF>(work: W, interrupt: I, shutdown: S) -> Result<T>
where
    W: Future<Output = Result<T>>,
    I: Future<Output = Result<(i32, &'static str)>>,
    S: FnOnce() -> SF,
    SF: Future<Output = ()>,
{
    tokio::select! {
        result = work => {
            if let Err(e) = &result {
                warn!(error = %e, "work failed, shutting down");
                shutdown().await;
            }
            result
        }
        interrupted = interrupt => {
            let (signum, signame) = interrupted?;
            info!(signum, signame, "interrupt received, shutting down");
            shutdown().await;
            Err(GatewayError::Interrupted {
                signum,
                signame: signame.to_string(),
            })
        }
    }
}
