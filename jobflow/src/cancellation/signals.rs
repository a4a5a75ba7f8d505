//! SIGTERM handling.

use super::KillSwitch;
use crate::core::KillType;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Spawns a task that requests [`KillType::Current`] when the process
/// receives SIGTERM.
///
/// The returned handle should be aborted when the flow is done.
#[cfg(unix)]
pub fn spawn_sigterm_listener(kill: Arc<KillSwitch>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        if terminate.recv().await.is_some() {
            warn!("Received SIGTERM, killing builds started by this flow");
            kill.request(KillType::Current, "SIGTERM");
        }
    }))
}

/// Signals are not supported on this platform; the listener never fires.
#[cfg(not(unix))]
pub fn spawn_sigterm_listener(kill: Arc<KillSwitch>) -> std::io::Result<JoinHandle<()>> {
    drop(kill);
    Ok(tokio::spawn(async {}))
}
