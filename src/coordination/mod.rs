//! Coordination layer
//!
//! - Safety gate consulted before every submission (kill switch, circuit
//!   breaker, symbol quarantine)
//! - Graceful shutdown handling for background loops

pub mod circuit_breaker;
pub mod kill_switch;
pub mod quarantine;
pub mod safety;
pub mod shutdown;

pub use circuit_breaker::{
    CircuitState, SubmissionBreakerConfig, SubmissionCircuitBreaker, TripReason,
};
pub use kill_switch::{AnyKillSwitch, FileKillSwitch, InProcessKillSwitch, KillSwitchState};
pub use quarantine::LedgerQuarantine;
pub use safety::{CircuitBreaker, KillSwitch, SafetyGate, SymbolQuarantine};
pub use shutdown::{GracefulShutdown, ShutdownListener, ShutdownSignal};
