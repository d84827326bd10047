//! Keeps the worker alive until it is asked to stop.
//!
//! The coordinator owns a cancellation flag. Consumers hold a [`ShutdownToken`]
//! and stop taking new deliveries once it is raised; deliveries already being
//! handled run to completion before the broker connection is closed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default interval between "worker running" heartbeats.
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Raises and observes the cancellation flag.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    sender: Arc<watch::Sender<bool>>,
    heartbeat: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_heartbeat(DEFAULT_HEARTBEAT)
    }

    pub fn with_heartbeat(heartbeat: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            heartbeat,
        }
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// A handle that observes this coordinator. Tokens taken after
    /// [`trigger`](Self::trigger) are already cancelled.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.sender.subscribe(),
        }
    }

    /// Raises the flag. Calling it more than once has no further effect.
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            log::info!("Shutdown requested");
        }
    }

    /// Whether shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Supervisory loop: logs a heartbeat until the flag is raised.
    ///
    /// Returning does not interrupt anything; callers drain their consumers
    /// afterwards.
    pub async fn hold(&self) {
        let mut token = self.token();
        while !token.is_cancelled() {
            log::info!("Worker running at: {}", chrono::Local::now().to_rfc3339());
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(self.heartbeat) => {}
            }
        }
    }

    /// Raises the flag on Ctrl+C or SIGTERM.
    pub async fn listen_for_signals(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    log::info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = terminate.recv() => {
                    log::info!("Received SIGTERM, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            log::info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the cancellation flag.
#[derive(Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the flag is raised or its coordinator is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }
}
