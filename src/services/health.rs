//! Health check HTTP server
//!
//! Liveness and readiness endpoints for process supervision, plus a Prometheus
//! metrics endpoint. Readiness follows the reconciliation gate: the process
//! is not ready to trade until a reconciliation run has succeeded.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coordination::SafetyGate;
use crate::error::TallyError;
use crate::services::{Metrics, ReconciliationGate};

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall system health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
}

/// Shared state for health server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub gate: Arc<ReconciliationGate>,
    pub metrics: Arc<Metrics>,
    pub safety: Option<SafetyGate>,
}

impl HealthState {
    pub fn new(gate: Arc<ReconciliationGate>, metrics: Arc<Metrics>) -> Self {
        Self {
            started_at: Utc::now(),
            gate,
            metrics,
            safety: None,
        }
    }

    pub fn with_safety(mut self, safety: SafetyGate) -> Self {
        self.safety = Some(safety);
        self
    }

    pub async fn get_health(&self) -> HealthResponse {
        let mut components = Vec::new();

        let snapshot = self.gate.snapshot().await;
        let recon_status = if snapshot.ready {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        components.push(ComponentHealth {
            name: "reconciliation".to_string(),
            status: recon_status,
            message: (!snapshot.ready).then(|| "no successful reconciliation run yet".to_string()),
        });

        if let Some(ref safety) = self.safety {
            let (status, message) = match safety.kill_switch.is_engaged().await {
                Ok(false) => (HealthStatus::Healthy, None),
                Ok(true) => (HealthStatus::Degraded, Some("kill switch engaged".to_string())),
                Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
            };
            components.push(ComponentHealth {
                name: "kill_switch".to_string(),
                status,
                message,
            });

            let (status, message) = match safety.breaker.is_blocking().await {
                Ok(false) => (HealthStatus::Healthy, None),
                Ok(true) => (
                    HealthStatus::Degraded,
                    safety.breaker.trip_reason().await.ok().flatten(),
                ),
                Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
            };
            components.push(ComponentHealth {
                name: "circuit_breaker".to_string(),
                status,
                message,
            });
        }

        let status = if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            components,
        }
    }
}

/// Build the health router
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Start the health server
    pub async fn run(&self) -> crate::Result<()> {
        let app = router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TallyError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Liveness check - is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness check - has reconciliation opened the trading gate?
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let snapshot = state.gate.snapshot().await;
    let status_code = if snapshot.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(snapshot))
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    let ready = if state.gate.is_ready() { 1 } else { 0 };

    let body = format!(
        r#"# HELP tally_ready Reconciliation gate open (1) or closed (0)
# TYPE tally_ready gauge
tally_ready {}

# HELP tally_uptime_seconds Uptime in seconds
# TYPE tally_uptime_seconds counter
tally_uptime_seconds {}

{}"#,
        ready,
        uptime,
        state.metrics.prometheus(),
    );

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{InProcessKillSwitch, LedgerQuarantine, SubmissionCircuitBreaker};
    use crate::ledger::InMemoryLedger;

    #[tokio::test]
    async fn test_not_ready_before_first_run() {
        let state = HealthState::new(Arc::new(ReconciliationGate::new()), Arc::new(Metrics::new()));
        let health = state.get_health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.components[0].name, "reconciliation");
    }

    #[tokio::test]
    async fn test_engaged_kill_switch_degrades() {
        let kill_switch = Arc::new(InProcessKillSwitch::new());
        kill_switch.engage("maintenance").await;
        let safety = SafetyGate::new(
            kill_switch,
            Arc::new(SubmissionCircuitBreaker::with_defaults()),
            Arc::new(LedgerQuarantine::new(Arc::new(InMemoryLedger::new()))),
        );
        let state = HealthState::new(Arc::new(ReconciliationGate::new()), Arc::new(Metrics::new()))
            .with_safety(safety);
        let health = state.get_health().await;
        let ks = health
            .components
            .iter()
            .find(|c| c.name == "kill_switch")
            .unwrap();
        assert_eq!(ks.status, HealthStatus::Degraded);
    }
}
