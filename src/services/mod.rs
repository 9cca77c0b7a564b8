pub mod fill_processor;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod reconciliation;
pub mod reconciliation_gate;
pub mod retry;
pub mod slice_scheduler;
pub mod twap;

pub use fill_processor::{ExecutionEvent, ExecutionFill, FillProcessor, ProcessOutcome};
pub use health::{ComponentHealth, HealthResponse, HealthServer, HealthState, HealthStatus};
pub use jobs::JobScheduler;
pub use metrics::Metrics;
pub use reconciliation::{merge_by_client_order_id, ReconciliationReport, ReconciliationService};
pub use reconciliation_gate::{GateSnapshot, ReconciliationGate, RunMode, RunPermit, RunState};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use slice_scheduler::{SliceOutcome, SliceScheduler};
pub use twap::{PlannedSlice, TwapRequest, TwapService, TwapSlicer, TwapSubmission};
