#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally::adapters::{BrokerClient, BrokerOrder, PaperBroker};
use tally::config::{ReconciliationConfig, SchedulerConfig};
use tally::coordination::{
    InProcessKillSwitch, LedgerQuarantine, SafetyGate, SubmissionCircuitBreaker,
};
use tally::domain::{NewOrder, Order, OrderSide, OrderStatus};
use tally::ledger::{InMemoryLedger, LedgerStore};
use tally::services::{
    Metrics, ReconciliationGate, ReconciliationService, RunMode, SliceScheduler,
};

/// In-memory ledger, paper broker and safety collaborators wired together
pub struct Harness {
    pub ledger: InMemoryLedger,
    pub broker: Arc<PaperBroker>,
    pub kill_switch: Arc<InProcessKillSwitch>,
    pub breaker: Arc<SubmissionCircuitBreaker>,
    pub quarantine: Arc<LedgerQuarantine>,
    pub gate: Arc<ReconciliationGate>,
    pub metrics: Arc<Metrics>,
}

impl Harness {
    pub fn new() -> Self {
        let ledger = InMemoryLedger::new();
        Self {
            quarantine: Arc::new(LedgerQuarantine::new(Arc::new(ledger.clone()))),
            ledger,
            broker: Arc::new(PaperBroker::new()),
            kill_switch: Arc::new(InProcessKillSwitch::new()),
            breaker: Arc::new(SubmissionCircuitBreaker::with_defaults()),
            gate: Arc::new(ReconciliationGate::new()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::new(self.ledger.clone())
    }

    pub fn safety(&self) -> SafetyGate {
        SafetyGate::new(
            self.kill_switch.clone(),
            self.breaker.clone(),
            self.quarantine.clone(),
        )
    }

    /// Short backoffs so paused-clock tests stay quick. The gate stays
    /// closed until a reconciliation run succeeds.
    pub fn scheduler(&self) -> SliceScheduler {
        let config = SchedulerConfig {
            submit_initial_backoff_ms: 10,
            submit_max_backoff_ms: 40,
            ledger_initial_backoff_ms: 10,
            readiness_wait_secs: 30,
            ..SchedulerConfig::default()
        };
        let broker: Arc<dyn BrokerClient> = self.broker.clone();
        SliceScheduler::new(
            self.store(),
            Some(broker),
            self.safety(),
            Arc::clone(&self.gate),
            &config,
            Arc::clone(&self.metrics),
        )
    }

    /// Scheduler behind a gate already opened by a startup reconciliation
    pub async fn ready_scheduler(&self) -> SliceScheduler {
        self.reconciler().run(RunMode::Startup).await.unwrap();
        assert!(self.gate.is_ready());
        self.scheduler()
    }

    pub fn reconciler_with(&self, config: ReconciliationConfig) -> Arc<ReconciliationService> {
        Arc::new(ReconciliationService::new(
            self.store(),
            self.broker.clone(),
            self.quarantine.clone(),
            Arc::clone(&self.gate),
            config,
            Arc::clone(&self.metrics),
        ))
    }

    pub fn reconciler(&self) -> Arc<ReconciliationService> {
        self.reconciler_with(ReconciliationConfig::default())
    }

    /// A plain order row in the given status, created `age` ago
    pub async fn seed_order(
        &self,
        client_order_id: &str,
        status: OrderStatus,
        age: chrono::Duration,
    ) -> Order {
        let now = Utc::now();
        let mut order = Order::from_new(
            NewOrder::market("AAPL", OrderSide::Buy, 10)
                .with_client_order_id(client_order_id)
                .with_status(status),
            now - age,
        );
        order.updated_at = now - age;
        self.ledger.put_order(order.clone()).await;
        order
    }

    pub async fn status(&self, client_order_id: &str) -> OrderStatus {
        self.order(client_order_id).await.status
    }

    pub async fn order(&self, client_order_id: &str) -> Order {
        self.ledger
            .get_order(client_order_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("order {client_order_id} missing"))
    }
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_767_225_600 + secs, 0).unwrap()
}

pub fn broker_order(
    id: &str,
    client_order_id: Option<&str>,
    symbol: &str,
    status: OrderStatus,
    updated_at: DateTime<Utc>,
) -> BrokerOrder {
    BrokerOrder {
        id: id.to_string(),
        client_order_id: client_order_id.map(str::to_string),
        symbol: symbol.to_string(),
        side: OrderSide::Buy,
        qty: 10,
        filled_qty: 0,
        filled_avg_price: None,
        limit_price: None,
        notional: None,
        status,
        created_at: Some(updated_at),
        updated_at,
        filled_at: None,
    }
}
