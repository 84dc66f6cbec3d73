//! Process-wide stopping flag
//!
//! Once the flag is set:
//! - the fiber engine discards call responses and cuts delays short
//! - rolling restarts finish the wave in flight but start no new one
//! - the pod watcher returns
//!
//! The first stop request wins; its reason is kept for logging.

use tokio::sync::watch;
use tracing::info;

type StopReason = Option<&'static str>;

/// Receiving side of the stopping flag
///
/// Cheap to clone; every clone observes the same flag.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<StopReason>,
}

impl ShutdownSignal {
    /// Resolves once the operator is stopping, or when the controller is gone
    pub async fn stopped(&mut self) {
        while self.receiver.borrow_and_update().is_none() {
            if self.receiver.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Why the operator is stopping, `None` while running
    pub fn reason(&self) -> StopReason {
        *self.receiver.borrow()
    }
}

/// Sets the stopping flag
#[derive(Debug)]
pub struct ShutdownController {
    sender: watch::Sender<StopReason>,
}

impl ShutdownController {
    /// Start stopping; later calls keep the first reason
    pub fn stop(&self, reason: &'static str) {
        let first = self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            info!(reason = reason, "Operator stopping");
        }
    }
}

/// Create the flag; the controller stays with `main`, the signal is cloned into the engine,
/// the rolling coordinator and the watchers
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(None);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT and return its name
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

/// Wait for Ctrl+C
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "CTRL_C", "Received termination signal");
    Ok("CTRL_C")
}
