//! Safety gate consulted before every broker submission.
//!
//! Each check is fallible: an unreachable gate is an infrastructure
//! failure, never an implicit "all clear".

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::QuarantineEntry;
use crate::error::Result;

#[async_trait]
pub trait KillSwitch: Send + Sync {
    async fn is_engaged(&self) -> Result<bool>;
}

#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    /// Admission check made once per submission attempt. A half-open
    /// breaker answers false for exactly one caller.
    async fn is_tripped(&self) -> Result<bool>;

    /// Read-only view for status reporting; never admits a trial
    async fn is_blocking(&self) -> Result<bool>;

    async fn trip_reason(&self) -> Result<Option<String>>;

    /// Outcome feedback from the submission path
    async fn record_success(&self) {}

    async fn record_failure(&self, _reason: &str) {}
}

/// Blocks new orders for a symbol, per strategy or for all strategies
/// under the `*` key. Entries stay until cleared by an operator.
#[async_trait]
pub trait SymbolQuarantine: Send + Sync {
    async fn set(&self, strategy_id: &str, symbol: &str) -> Result<()>;

    /// True for a direct entry or a wildcard one
    async fn is_quarantined(&self, strategy_id: &str, symbol: &str) -> Result<bool>;

    /// Removes one exact key; true when it existed
    async fn clear(&self, strategy_id: &str, symbol: &str) -> Result<bool>;

    async fn entries(&self) -> Result<Vec<QuarantineEntry>>;
}

/// The three collaborators bundled for sharing between services
#[derive(Clone)]
pub struct SafetyGate {
    pub kill_switch: Arc<dyn KillSwitch>,
    pub breaker: Arc<dyn CircuitBreaker>,
    pub quarantine: Arc<dyn SymbolQuarantine>,
}

impl SafetyGate {
    pub fn new(
        kill_switch: Arc<dyn KillSwitch>,
        breaker: Arc<dyn CircuitBreaker>,
        quarantine: Arc<dyn SymbolQuarantine>,
    ) -> Self {
        Self {
            kill_switch,
            breaker,
            quarantine,
        }
    }
}
