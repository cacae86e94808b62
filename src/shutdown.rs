//! Cooperative cancellation of running workflows.
//!
//! The executor polls a [`ShutdownCoordinator`] between scheduling rounds:
//! once shutdown is requested no new node instances start, running ones are
//! allowed to finish, and the execution is recorded as cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared shutdown flag with async notification.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request shutdown. Calling this more than once is harmless.
    pub fn request_shutdown(&self) {
        let was_requested = self.shutdown_requested.swap(true, Ordering::SeqCst);
        if !was_requested {
            info!("Shutdown requested");
            self.notify.notify_waiters();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Spawn a task that requests shutdown on SIGTERM/SIGINT (Ctrl-C elsewhere).
    pub fn listen_for_signals(&self) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate())
                {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to create SIGTERM handler: {}", e);
                        signal::ctrl_c().await.ok();
                        coordinator.request_shutdown();
                        return;
                    }
                };

                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, finishing running nodes");
                    }
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl-C, finishing running nodes");
                    }
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
                info!("Received Ctrl-C, finishing running nodes");
            }

            coordinator.request_shutdown();
        });
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
