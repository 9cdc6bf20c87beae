//! Process-wide shutdown notification.
//!
//! The first SIGINT/SIGTERM requests a graceful drain and is broadcast to
//! every task through a watch channel; the second forces the process to exit
//! with a nonzero code.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// A cloneable handle observed at every blocking point.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Install the signal listener and return the shared handle.
    pub fn install() -> Shutdown {
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGINT handler");
                    return;
                }
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            info!("Shutting down, waiting for running tasks to complete");
            let _ = tx.send(true);

            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            warn!("Forcing exit");
            std::process::exit(1);
        });

        Shutdown { rx }
    }

    /// A manually triggered pair, for tests and embedding.
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { rx })
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested. Returns immediately if it already
    /// has been.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Sender gone without signalling; treat as shutdown.
                return;
            }
        }
    }
}
