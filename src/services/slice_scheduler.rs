//! Slice Scheduler.
//!
//! Each TWAP slice is a one-shot job keyed `{parent}_slice_{n}`. At its
//! scheduled time the job re-reads the ledger, consults the safety gate and
//! submits to the broker:
//!
//! ```text
//! scheduled ─┬─ aborted_canceled
//!            ├─ blocked_not_ready (failed)
//!            ├─ blocked_kill_switch | blocked_quarantine (rejected)
//!            ├─ blocked_circuit_breaker
//!            ├─ failed (infrastructure)
//!            ├─ dry_run
//!            ├─ rejected
//!            ├─ retrying ── failed (retry exhausted)
//!            └─ submitted | submitted_unconfirmed
//! ```
//!
//! With a live broker nothing is sent until the reconciliation gate is open;
//! a due slice waits a bounded time for it. The gate checks run before
//! every submission attempt. Once the broker has
//! accepted an order it is never resubmitted; only the ledger write is
//! retried.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::adapters::{BrokerAck, BrokerClient, SubmitOrder};
use crate::config::SchedulerConfig;
use crate::coordination::SafetyGate;
use crate::domain::{Order, OrderStatus};
use crate::error::{BrokerError, Result, TallyError};
use crate::ledger::LedgerStore;
use crate::services::retry::{retry_with_backoff, RetryPolicy};
use crate::services::{JobScheduler, Metrics, PlannedSlice, ReconciliationGate};

/// Final disposition of one slice execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SliceOutcome {
    /// Canceled before submission; nothing written
    AbortedCanceled,
    /// Already moved past `pending_new`; nothing written
    AlreadyProcessed { status: OrderStatus },
    /// No successful reconciliation within the wait; recorded as `failed`
    BlockedNotReady,
    BlockedKillSwitch,
    BlockedCircuitBreaker { reason: String },
    /// Recorded as `rejected`
    BlockedQuarantine { symbol: String },
    DryRun,
    Submitted { broker_order_id: String },
    /// Broker accepted; the ledger only holds the fallback record
    SubmittedUnconfirmed { broker_order_id: String },
    /// Broker accepted; nothing could be recorded (manual intervention)
    AcceptedUnrecorded { broker_order_id: String },
    Rejected { message: String },
    Failed { message: String },
}

enum Preflight {
    Proceed(Order),
    Halt(SliceOutcome),
}

/// Why a submission attempt did not produce an acknowledgement
enum AttemptError {
    Broker(BrokerError),
    Halted(SliceOutcome),
    Infra(TallyError),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Broker(e) => write!(f, "{}", e),
            AttemptError::Halted(outcome) => write!(f, "halted: {:?}", outcome),
            AttemptError::Infra(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Clone)]
pub struct SliceScheduler {
    ledger: Arc<dyn LedgerStore>,
    /// `None` runs in dry-run mode
    broker: Option<Arc<dyn BrokerClient>>,
    safety: SafetyGate,
    gate: Arc<ReconciliationGate>,
    readiness_wait: Duration,
    jobs: JobScheduler,
    submit_policy: RetryPolicy,
    ledger_policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl SliceScheduler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        broker: Option<Arc<dyn BrokerClient>>,
        safety: SafetyGate,
        gate: Arc<ReconciliationGate>,
        config: &SchedulerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ledger,
            broker,
            safety,
            gate,
            readiness_wait: config.readiness_wait(),
            jobs: JobScheduler::new(),
            submit_policy: RetryPolicy::submission(config),
            ledger_policy: RetryPolicy::ledger_write(config),
            metrics,
        }
    }

    pub fn jobs(&self) -> &JobScheduler {
        &self.jobs
    }

    pub fn is_dry_run(&self) -> bool {
        self.broker.is_none()
    }

    /// Schedule one job per planned slice. Re-scheduling a pending slice is
    /// a no-op; its id is still returned.
    pub fn schedule_slices(&self, parent_order_id: &str, slices: &[PlannedSlice]) -> Vec<String> {
        slices
            .iter()
            .map(|slice| {
                let job_id = JobScheduler::slice_job_id(parent_order_id, slice.slice_num);
                let this = self.clone();
                let client_order_id = slice.client_order_id.clone();
                self.jobs.schedule_at(job_id.clone(), slice.scheduled_time, async move {
                    this.run_slice(&client_order_id).await;
                });
                job_id
            })
            .collect()
    }

    /// Cancel every slice still `pending_new`: ledger first, then the
    /// scheduled jobs. Returns (scheduler removals, ledger updates); the two
    /// may differ when a slice fires in between.
    pub async fn cancel_remaining_slices(&self, parent_order_id: &str) -> Result<(usize, u64)> {
        let ledger_count = self.ledger.cancel_pending_slices(parent_order_id).await?;
        let scheduler_count = self
            .jobs
            .remove_jobs_with_prefix(&JobScheduler::slice_job_prefix(parent_order_id));
        info!(
            parent_order_id,
            scheduler_count, ledger_count, "remaining slices canceled"
        );
        Ok((scheduler_count, ledger_count))
    }

    /// Job entry point. Converts retry exhaustion into `failed`; every
    /// other error was already recorded best-effort and is only logged.
    pub async fn run_slice(&self, client_order_id: &str) -> SliceOutcome {
        match self.execute_slice(client_order_id).await {
            Ok(outcome) => {
                debug!(client_order_id, ?outcome, "slice finished");
                outcome
            }
            Err(TallyError::Broker(e)) if e.is_retryable() => {
                let message = format!(
                    "retry exhausted after {} attempts: {}",
                    self.submit_policy.max_attempts, e
                );
                error!(client_order_id, error = %e, "slice submission retry exhausted");
                self.safety.breaker.record_failure(&message).await;
                self.metrics.inc_slices_failed();
                self.record_failed(client_order_id, &message).await;
                SliceOutcome::Failed { message }
            }
            Err(e) => {
                error!(client_order_id, error = %e, "slice job failed");
                SliceOutcome::Failed {
                    message: e.to_string(),
                }
            }
        }
    }

    /// One slice execution. Connection-class broker errors come back as
    /// `Err(TallyError::Broker(_))` once the retry budget is spent.
    pub async fn execute_slice(&self, client_order_id: &str) -> Result<SliceOutcome> {
        let order = match self.preflight(client_order_id).await {
            Ok(Preflight::Proceed(order)) => order,
            Ok(Preflight::Halt(outcome)) => return Ok(outcome),
            Err(e) => return Err(self.infrastructure_failure(client_order_id, e).await),
        };

        // Second cancellation check, immediately before the broker call
        match self.ledger.get_order(client_order_id).await {
            Ok(Some(current)) if current.status == OrderStatus::Canceled => {
                info!(client_order_id, "slice canceled before submission");
                self.metrics.inc_slices_aborted();
                return Ok(SliceOutcome::AbortedCanceled);
            }
            Ok(_) => {}
            Err(e) => return Err(self.infrastructure_failure(client_order_id, e).await),
        }

        let Some(broker) = self.broker.clone() else {
            self.ledger
                .update_order_status(client_order_id, OrderStatus::DryRun, None)
                .await?;
            info!(client_order_id, symbol = %order.symbol, qty = order.qty, "dry run: slice not sent");
            self.metrics.inc_slices_dry_run();
            return Ok(SliceOutcome::DryRun);
        };

        let request = SubmitOrder::from(&order);
        let submitted = retry_with_backoff(
            &self.submit_policy,
            "submit_order",
            |e: &AttemptError| matches!(e, AttemptError::Broker(b) if b.is_retryable()),
            |attempt| {
                let broker = Arc::clone(&broker);
                let request = request.clone();
                async move {
                    if attempt > 0 {
                        self.metrics.inc_submit_retries();
                        if let Err(e) = self.ledger.increment_retry_count(client_order_id).await {
                            warn!(client_order_id, error = %e, "could not record retry");
                        }
                        match self.preflight(client_order_id).await {
                            Ok(Preflight::Proceed(_)) => {}
                            Ok(Preflight::Halt(outcome)) => {
                                return Err(AttemptError::Halted(outcome))
                            }
                            Err(e) => return Err(AttemptError::Infra(e)),
                        }
                    }
                    broker
                        .submit_order(&request, client_order_id)
                        .await
                        .map_err(AttemptError::Broker)
                }
            },
        )
        .await;

        match submitted {
            Ok(ack) => Ok(self.record_acceptance(client_order_id, ack).await),
            Err(AttemptError::Halted(outcome)) => Ok(outcome),
            Err(AttemptError::Infra(e)) => Err(self.infrastructure_failure(client_order_id, e).await),
            Err(AttemptError::Broker(e)) if e.is_retryable() => Err(TallyError::Broker(e)),
            Err(AttemptError::Broker(e)) => {
                let message = e.to_string();
                warn!(client_order_id, error = %e, "slice rejected by broker");
                self.ledger
                    .update_order_status(client_order_id, OrderStatus::Rejected, Some(&message))
                    .await?;
                self.metrics.inc_slices_rejected();
                Ok(SliceOutcome::Rejected { message })
            }
        }
    }

    /// Cancellation guard, readiness, kill switch, symbol quarantine, then
    /// circuit breaker
    async fn preflight(&self, client_order_id: &str) -> Result<Preflight> {
        let order = self
            .ledger
            .get_order(client_order_id)
            .await?
            .ok_or_else(|| TallyError::Validation(format!("slice {} not found", client_order_id)))?;

        if order.status == OrderStatus::Canceled {
            info!(client_order_id, "slice already canceled; skipping");
            self.metrics.inc_slices_aborted();
            return Ok(Preflight::Halt(SliceOutcome::AbortedCanceled));
        }
        if order.status != OrderStatus::PendingNew {
            warn!(client_order_id, status = %order.status, "slice already processed; skipping");
            return Ok(Preflight::Halt(SliceOutcome::AlreadyProcessed {
                status: order.status,
            }));
        }

        if self.broker.is_some() && !self.gate.wait_until_ready(self.readiness_wait).await {
            warn!(
                client_order_id,
                wait_secs = self.readiness_wait.as_secs(),
                "reconciliation gate still closed; slice not submitted"
            );
            self.ledger
                .update_order_status(
                    client_order_id,
                    OrderStatus::Failed,
                    Some("reconciliation not ready; slice not submitted"),
                )
                .await?;
            self.metrics.inc_slices_blocked();
            return Ok(Preflight::Halt(SliceOutcome::BlockedNotReady));
        }

        if self.safety.kill_switch.is_engaged().await? {
            warn!(client_order_id, symbol = %order.symbol, "kill switch engaged; slice blocked");
            self.ledger
                .update_order_status(
                    client_order_id,
                    OrderStatus::BlockedKillSwitch,
                    Some("kill switch engaged; slice not submitted"),
                )
                .await?;
            self.metrics.inc_slices_blocked();
            return Ok(Preflight::Halt(SliceOutcome::BlockedKillSwitch));
        }

        if self
            .safety
            .quarantine
            .is_quarantined(&order.strategy_id, &order.symbol)
            .await?
        {
            warn!(
                client_order_id,
                symbol = %order.symbol,
                strategy_id = %order.strategy_id,
                "symbol quarantined; slice blocked"
            );
            self.ledger
                .update_order_status(
                    client_order_id,
                    OrderStatus::Rejected,
                    Some(&format!("symbol {} quarantined; slice not submitted", order.symbol)),
                )
                .await?;
            self.metrics.inc_slices_blocked();
            return Ok(Preflight::Halt(SliceOutcome::BlockedQuarantine {
                symbol: order.symbol,
            }));
        }

        // Last check: a half-open breaker hands its single trial to this call
        if self.safety.breaker.is_tripped().await? {
            let reason = self
                .safety
                .breaker
                .trip_reason()
                .await?
                .unwrap_or_else(|| "unknown".to_string());
            warn!(client_order_id, reason = %reason, "circuit breaker tripped; slice blocked");
            self.ledger
                .update_order_status(
                    client_order_id,
                    OrderStatus::BlockedCircuitBreaker,
                    Some(&format!("circuit breaker tripped: {}", reason)),
                )
                .await?;
            self.metrics.inc_slices_blocked();
            return Ok(Preflight::Halt(SliceOutcome::BlockedCircuitBreaker { reason }));
        }

        Ok(Preflight::Proceed(order))
    }

    /// Best-effort `failed` record, handing the original error back
    async fn infrastructure_failure(&self, client_order_id: &str, err: TallyError) -> TallyError {
        error!(client_order_id, error = %err, "infrastructure failure before submission");
        self.metrics.inc_slices_failed();
        self.record_failed(client_order_id, &format!("infrastructure failure: {}", err))
            .await;
        err
    }

    async fn record_failed(&self, client_order_id: &str, message: &str) {
        match self
            .ledger
            .update_order_status(client_order_id, OrderStatus::Failed, Some(message))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => debug!(client_order_id, "slice already terminal; failure not recorded"),
            Err(e) => error!(client_order_id, error = %e, "could not record slice failure"),
        }
    }

    /// The broker holds the order from here on; never resubmit
    async fn record_acceptance(&self, client_order_id: &str, ack: BrokerAck) -> SliceOutcome {
        let broker_order_id = ack.broker_order_id;
        self.safety.breaker.record_success().await;
        self.metrics.inc_slices_submitted();

        let written = retry_with_backoff(
            &self.ledger_policy,
            "mark_submitted",
            |e: &TallyError| e.is_store_error(),
            |_| self.ledger.mark_submitted(client_order_id, &broker_order_id),
        )
        .await;

        match written {
            Ok(Some(_)) => {
                info!(client_order_id, broker_order_id = %broker_order_id, "slice submitted");
                return SliceOutcome::Submitted { broker_order_id };
            }
            Ok(None) => {
                error!(
                    client_order_id,
                    broker_order_id = %broker_order_id,
                    alert = "manual_intervention",
                    "broker accepted a slice whose ledger row is already terminal"
                );
                return SliceOutcome::AcceptedUnrecorded { broker_order_id };
            }
            Err(e) => {
                warn!(
                    client_order_id,
                    broker_order_id = %broker_order_id,
                    error = %e,
                    "ledger write failed after broker acceptance; recording submitted_unconfirmed"
                );
            }
        }

        let note = format!(
            "broker accepted as {}; ledger confirmation failed",
            broker_order_id
        );
        match self
            .ledger
            .update_order_status(client_order_id, OrderStatus::SubmittedUnconfirmed, Some(&note))
            .await
        {
            Ok(Some(_)) => {
                self.metrics.inc_ledger_write_fallbacks();
                SliceOutcome::SubmittedUnconfirmed { broker_order_id }
            }
            Ok(None) => {
                error!(
                    client_order_id,
                    broker_order_id = %broker_order_id,
                    alert = "manual_intervention",
                    "broker accepted a slice whose ledger row is already terminal"
                );
                SliceOutcome::AcceptedUnrecorded { broker_order_id }
            }
            Err(e) => {
                error!(
                    client_order_id,
                    broker_order_id = %broker_order_id,
                    error = %e,
                    alert = "manual_intervention",
                    "broker accepted a slice but no ledger write succeeded"
                );
                SliceOutcome::AcceptedUnrecorded { broker_order_id }
            }
        }
    }
}
