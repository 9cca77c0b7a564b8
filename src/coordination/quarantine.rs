use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::safety::SymbolQuarantine;
use crate::domain::QuarantineEntry;
use crate::error::{Result, TallyError};
use crate::ledger::LedgerStore;

/// Quarantine registry persisted in the ledger, so entries set by one
/// process (a one-shot reconcile) block submissions in every other
pub struct LedgerQuarantine {
    ledger: Arc<dyn LedgerStore>,
}

impl LedgerQuarantine {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }
}

fn unavailable(err: TallyError) -> TallyError {
    TallyError::Infrastructure(format!("quarantine registry unavailable: {err}"))
}

#[async_trait]
impl SymbolQuarantine for LedgerQuarantine {
    async fn set(&self, strategy_id: &str, symbol: &str) -> Result<()> {
        let inserted = self
            .ledger
            .quarantine_symbol(strategy_id, symbol, Utc::now())
            .await
            .map_err(unavailable)?;
        if inserted {
            warn!(strategy_id, symbol, "symbol quarantined");
        }
        Ok(())
    }

    async fn is_quarantined(&self, strategy_id: &str, symbol: &str) -> Result<bool> {
        self.ledger
            .is_symbol_quarantined(strategy_id, symbol)
            .await
            .map_err(unavailable)
    }

    async fn clear(&self, strategy_id: &str, symbol: &str) -> Result<bool> {
        let removed = self
            .ledger
            .clear_quarantine(strategy_id, symbol)
            .await
            .map_err(unavailable)?;
        if removed {
            info!(strategy_id, symbol, "quarantine cleared");
        }
        Ok(removed)
    }

    async fn entries(&self) -> Result<Vec<QuarantineEntry>> {
        self.ledger.list_quarantine().await.map_err(unavailable)
    }
}
