//! Graceful shutdown
//!
//! Background loops hold a [`ShutdownListener`] and exit at their next
//! suspension point once shutdown is requested. The owner then drains their
//! join handles under a bounded timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / SIGTERM
    Graceful,
    /// Requested by a component (e.g. a fatal startup error)
    Internal,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Internal => write!(f, "internal"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    requested: AtomicBool,
    tx: watch::Sender<bool>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new(drain_timeout: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            requested: AtomicBool::new(false),
            tx,
            drain_timeout,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(30))
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }
        info!("Shutdown requested: {}", signal);
        self.tx.send_replace(true);
    }

    /// Resolve on SIGINT or SIGTERM, then broadcast shutdown
    pub async fn wait_for_os_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Cannot install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        self.request_shutdown(ShutdownSignal::Graceful);
    }

    /// Wait for background tasks, aborting whatever outlives the timeout
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>) {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("Background task did not stop in time; aborting");
                abort.abort();
            }
        }
        info!("Shutdown complete");
    }
}

/// Receiver side of the shutdown broadcast
#[derive(Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested (immediately if it already was)
    pub async fn recv(&mut self) {
        // A dropped sender also means the process is going away
        let _ = self.rx.wait_for(|requested| *requested).await;
    }
}
