//! Watches long-lived background tasks.
//!
//! The tick loop and the results reporter run forever. If either stops, the
//! process must not keep serving a frozen world.

use anyhow::anyhow;
use tokio::task::JoinHandle;
use tracing::error;

/// Waits for a background task to stop and describes why it did.
pub async fn supervise(name: &'static str, handle: JoinHandle<()>) -> anyhow::Error {
    let err = match handle.await {
        Ok(()) => anyhow!("{name} task exited"),
        Err(join) if join.is_panic() => anyhow!("{name} task panicked"),
        Err(join) => anyhow!("{name} task was cancelled: {join}"),
    };
    error!(task = name, error = %err, "background task stopped");
    err
}
