//! At most one reconciliation run in flight, plus the readiness gate.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

use crate::error::Result;
use crate::services::ReconciliationReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Must finish (or time out) before the system trades
    Startup,
    Periodic,
    /// Operator-triggered
    Manual,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Startup => write!(f, "startup"),
            RunMode::Periodic => write!(f, "periodic"),
            RunMode::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running {
        mode: RunMode,
        started_at: DateTime<Utc>,
    },
    Succeeded {
        mode: RunMode,
        finished_at: DateTime<Utc>,
    },
    Failed {
        mode: RunMode,
        finished_at: DateTime<Utc>,
        error: String,
    },
}

/// Serializable view for the readiness endpoint
#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub ready: bool,
    pub startup_timed_out: bool,
    #[serde(flatten)]
    pub state: RunState,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_report: Option<ReconciliationReport>,
}

#[derive(Debug)]
struct GateInner {
    state: RunState,
    startup_timed_out: bool,
    last_success_at: Option<DateTime<Utc>>,
    last_report: Option<ReconciliationReport>,
}

/// Held for the duration of one run
pub struct RunPermit {
    mode: RunMode,
    _guard: OwnedMutexGuard<()>,
}

impl RunPermit {
    pub fn mode(&self) -> RunMode {
        self.mode
    }
}

pub struct ReconciliationGate {
    run_lock: Arc<Mutex<()>>,
    inner: RwLock<GateInner>,
    /// Flips to true once and stays there
    ready: watch::Sender<bool>,
}

impl Default for ReconciliationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationGate {
    pub fn new() -> Self {
        Self {
            run_lock: Arc::new(Mutex::new(())),
            inner: RwLock::new(GateInner {
                state: RunState::Idle,
                startup_timed_out: false,
                last_success_at: None,
                last_report: None,
            }),
            ready: watch::channel(false).0,
        }
    }

    /// Wait for any in-flight run to finish, then start this one
    pub async fn begin_run(&self, mode: RunMode) -> RunPermit {
        let guard = Arc::clone(&self.run_lock).lock_owned().await;
        self.mark_running(mode).await;
        RunPermit {
            mode,
            _guard: guard,
        }
    }

    /// Start a run only if none is in flight
    pub async fn try_begin_run(&self, mode: RunMode) -> Option<RunPermit> {
        let guard = Arc::clone(&self.run_lock).try_lock_owned().ok()?;
        self.mark_running(mode).await;
        Some(RunPermit {
            mode,
            _guard: guard,
        })
    }

    async fn mark_running(&self, mode: RunMode) {
        self.inner.write().await.state = RunState::Running {
            mode,
            started_at: Utc::now(),
        };
    }

    /// Record the outcome and release the run lock. Any successful run
    /// satisfies the readiness gate.
    pub async fn end_run(&self, permit: RunPermit, result: &Result<ReconciliationReport>) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        match result {
            Ok(report) => {
                inner.state = RunState::Succeeded {
                    mode: permit.mode,
                    finished_at: now,
                };
                inner.last_success_at = Some(now);
                inner.last_report = Some(report.clone());
                let opened = self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
                if opened {
                    info!(mode = %permit.mode, "reconciliation gate open: ready to trade");
                }
            }
            Err(e) => {
                inner.state = RunState::Failed {
                    mode: permit.mode,
                    finished_at: now,
                    error: e.to_string(),
                };
            }
        }
        drop(inner);
        drop(permit);
    }

    /// Startup deadline passed; the run itself keeps going
    pub async fn mark_startup_timed_out(&self) {
        warn!("startup reconciliation timed out; not ready to trade");
        self.inner.write().await.startup_timed_out = true;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait up to `timeout` for the gate to open; true when it is open
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.subscribe();
        let opened = async {
            loop {
                if *ready.borrow_and_update() {
                    return true;
                }
                if ready.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, opened).await.unwrap_or(false)
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.inner.read().await.state, RunState::Running { .. })
    }

    pub async fn last_report(&self) -> Option<ReconciliationReport> {
        self.inner.read().await.last_report.clone()
    }

    pub async fn snapshot(&self) -> GateSnapshot {
        let inner = self.inner.read().await;
        GateSnapshot {
            ready: self.is_ready(),
            startup_timed_out: inner.startup_timed_out,
            state: inner.state.clone(),
            last_success_at: inner.last_success_at,
            last_report: inner.last_report.clone(),
        }
    }
}
