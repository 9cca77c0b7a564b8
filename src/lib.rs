pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod services;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, SafetyGate, ShutdownSignal};
pub use error::{BrokerError, Result, TallyError};
pub use ledger::{InMemoryLedger, LedgerStore, LedgerTx, PostgresLedger};
pub use services::{
    FillProcessor, ReconciliationService, SliceScheduler, TwapService,
};
