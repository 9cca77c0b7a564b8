//! Submission circuit breaker
//!
//! Opens after a run of consecutive broker failures and blocks slice
//! submission until the recovery timeout elapses. Half-open admits exactly
//! one trial submission; its reported outcome closes or reopens the
//! circuit. A trial that never reports frees the slot after another
//! recovery timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::safety::CircuitBreaker;
use crate::error::Result;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failure threshold exceeded, submissions blocked
    Open,
    /// One trial submission allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Seconds before Open moves to HalfOpen
    pub recovery_timeout_secs: u64,
}

impl Default for SubmissionBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 300,
        }
    }
}

/// Why the circuit opened
#[derive(Debug, Clone)]
pub enum TripReason {
    ConsecutiveFailures { count: u32, last_error: String },
    ManualTrip(String),
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::ConsecutiveFailures { count, last_error } => {
                write!(f, "{} consecutive broker failures (last: {})", count, last_error)
            }
            TripReason::ManualTrip(reason) => write!(f, "manual: {}", reason),
        }
    }
}

/// In-process circuit breaker
pub struct SubmissionCircuitBreaker {
    config: SubmissionBreakerConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    last_trip_reason: RwLock<Option<TripReason>>,
    opened_at: RwLock<Option<DateTime<Utc>>>,
    /// Set while the half-open trial is outstanding
    trial_started_at: RwLock<Option<DateTime<Utc>>>,
    total_trips: AtomicU64,
}

impl SubmissionCircuitBreaker {
    pub fn new(config: SubmissionBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            last_trip_reason: RwLock::new(None),
            opened_at: RwLock::new(None),
            trial_started_at: RwLock::new(None),
            total_trips: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SubmissionBreakerConfig::default())
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    fn recovery_elapsed(&self, since: DateTime<Utc>) -> bool {
        Utc::now().signed_duration_since(since).num_seconds()
            >= self.config.recovery_timeout_secs as i64
    }

    /// Admission check for one submission. Moves Open to HalfOpen once the
    /// recovery timeout has elapsed and hands the single trial slot to the
    /// first caller; everyone else waits for its outcome.
    pub async fn should_allow(&self) -> bool {
        let mut state = self.state.write().await;
        match *state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.read().await;
                if !opened_at.is_some_and(|at| self.recovery_elapsed(at)) {
                    return false;
                }
                *state = CircuitState::HalfOpen;
                *self.trial_started_at.write().await = Some(Utc::now());
                info!("Circuit breaker HALF-OPEN; admitting one trial submission");
                true
            }
            CircuitState::HalfOpen => {
                let mut trial = self.trial_started_at.write().await;
                match *trial {
                    Some(started) if !self.recovery_elapsed(started) => false,
                    Some(_) => {
                        warn!("Half-open trial never reported; admitting another");
                        *trial = Some(Utc::now());
                        true
                    }
                    None => {
                        *trial = Some(Utc::now());
                        true
                    }
                }
            }
        }
    }

    /// Whether a submission would be refused right now. Never claims the
    /// trial slot.
    pub async fn is_blocking(&self) -> bool {
        match self.state().await {
            CircuitState::Closed => false,
            CircuitState::Open => !self
                .opened_at
                .read()
                .await
                .is_some_and(|at| self.recovery_elapsed(at)),
            CircuitState::HalfOpen => self
                .trial_started_at
                .read()
                .await
                .is_some_and(|at| !self.recovery_elapsed(at)),
        }
    }

    pub async fn success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.state().await == CircuitState::HalfOpen {
            self.close().await;
        }
    }

    pub async fn failure(&self, reason: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!("Broker failure #{}: {}", failures, reason);

        let half_open = self.state().await == CircuitState::HalfOpen;
        if failures >= self.config.failure_threshold || half_open {
            self.trip(TripReason::ConsecutiveFailures {
                count: failures,
                last_error: reason.to_string(),
            })
            .await;
        }
    }

    pub async fn trip(&self, reason: TripReason) {
        let mut state = self.state.write().await;
        if *state != CircuitState::Open {
            *state = CircuitState::Open;
            *self.opened_at.write().await = Some(Utc::now());
            *self.last_trip_reason.write().await = Some(reason.clone());
            *self.trial_started_at.write().await = None;
            self.total_trips.fetch_add(1, Ordering::SeqCst);

            warn!("Circuit breaker TRIPPED: {}", reason);
        }
    }

    pub async fn manual_trip(&self, reason: &str) {
        self.trip(TripReason::ManualTrip(reason.to_string())).await;
    }

    pub async fn close(&self) {
        *self.state.write().await = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.write().await = None;
        *self.last_trip_reason.write().await = None;
        *self.trial_started_at.write().await = None;
        info!("Circuit breaker CLOSED - normal operation resumed");
    }

    pub fn total_trips(&self) -> u64 {
        self.total_trips.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CircuitBreaker for SubmissionCircuitBreaker {
    async fn is_tripped(&self) -> Result<bool> {
        Ok(!self.should_allow().await)
    }

    async fn is_blocking(&self) -> Result<bool> {
        Ok(self.is_blocking().await)
    }

    async fn trip_reason(&self) -> Result<Option<String>> {
        Ok(self
            .last_trip_reason
            .read()
            .await
            .as_ref()
            .map(|r| r.to_string()))
    }

    async fn record_success(&self) {
        self.success().await;
    }

    async fn record_failure(&self, reason: &str) {
        debug!(reason, "submission failure reported to breaker");
        self.failure(reason).await;
    }
}
