//! Graceful shutdown handling.
//!
//! Listens for SIGTERM and SIGINT and fans the shutdown out to every
//! background task over a watch channel.

use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Shutdown coordinator.
pub struct ShutdownHandler {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownHandler {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Get a receiver for shutdown signals.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }

    /// Trigger a shutdown. Idempotent.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Returns `true` once shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    ///
    /// A signal handler that cannot be installed is logged and ignored, so
    /// the process still stops on the other one.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        self.trigger();
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `shutdown_fn`, giving up after `limit`.
///
/// Returns `true` if it completed in time.
pub async fn graceful_shutdown<F, Fut>(limit: Duration, shutdown_fn: F) -> bool
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    match timeout(limit, shutdown_fn()).await {
        Ok(()) => {
            info!("Graceful shutdown completed");
            true
        }
        Err(_) => {
            warn!(timeout_secs = limit.as_secs(), "Graceful shutdown timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_shutdown_handler() {
        let handler = ShutdownHandler::new();
        let mut receiver = handler.subscribe();
        assert!(!*receiver.borrow());
        assert!(!handler.is_triggered());

        handler.trigger();

        receiver.changed().await.unwrap();
        assert!(*receiver.borrow());
        assert!(handler.is_triggered());
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let handler = ShutdownHandler::default();
        let mut rx1 = handler.subscribe();
        let mut rx2 = handler.subscribe();

        handler.trigger();
        handler.trigger();

        rx1.changed().await.unwrap();
        rx2.changed().await.unwrap();
        assert!(*rx1.borrow());
        assert!(*rx2.borrow());
    }

    #[tokio::test]
    async fn test_subscribe_after_trigger() {
        let handler = ShutdownHandler::new();
        handler.trigger();
        assert!(*handler.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_completes() {
        let completed = Arc::new(AtomicBool::new(false));
        let completed_clone = completed.clone();

        let finished = graceful_shutdown(Duration::from_secs(10), || async move {
            completed_clone.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(finished);
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_timeout() {
        let finished = graceful_shutdown(Duration::from_secs(10), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .await;

        assert!(!finished);
    }
}
