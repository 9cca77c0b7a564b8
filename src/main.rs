use clap::Parser;
use std::sync::Arc;
use tally::adapters::{AlpacaClient, BrokerClient, PaperBroker};
use tally::cli::{
    self, Cli, Commands, OrphanRow, OutputMode, PositionRow, QuarantineAction, QuarantineRow,
    SliceRow,
};
use tally::config::{AppConfig, LoggingConfig};
use tally::coordination::{
    AnyKillSwitch, FileKillSwitch, GracefulShutdown, InProcessKillSwitch, KillSwitch,
    LedgerQuarantine, SafetyGate, SubmissionBreakerConfig, SubmissionCircuitBreaker,
    SymbolQuarantine,
};
use tally::domain::{OrderStatus, OrderType};
use tally::error::{Result, TallyError};
use tally::ledger::{InMemoryLedger, LedgerStore, PostgresLedger};
use tally::services::{
    HealthServer, HealthState, Metrics, ReconciliationGate, ReconciliationService, RunMode,
    SliceScheduler, TwapRequest, TwapService,
};
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config: {}", e);
        }
        return Err(TallyError::Validation(errors.join("; ")));
    }
    let mode = OutputMode::from_json_flag(cli.json);

    match &cli.command {
        Commands::Run { paper } => {
            init_logging(&config.logging);
            run_service(&config, *paper).await?;
        }
        Commands::Reconcile => {
            init_logging_simple();
            run_reconcile_once(&config, mode).await?;
        }
        Commands::Migrate => {
            init_logging_simple();
            let url = config
                .database
                .url
                .as_deref()
                .ok_or_else(|| TallyError::Validation("database.url is not set".into()))?;
            let ledger = PostgresLedger::new(url, config.database.max_connections).await?;
            ledger.migrate().await?;
            println!("migrations applied");
        }
        Commands::Orphans { all } => {
            init_logging_simple();
            let ledger = open_ledger(&config).await?;
            let orphans = ledger.list_orphans(*all).await?;
            let rows: Vec<OrphanRow> = orphans.iter().map(OrphanRow::from).collect();
            cli::print_items(&rows, mode)?;
        }
        Commands::Positions => {
            init_logging_simple();
            let ledger = open_ledger(&config).await?;
            let positions = ledger.get_all_positions().await?;
            let rows: Vec<PositionRow> = positions.iter().map(PositionRow::from).collect();
            cli::print_items(&rows, mode)?;
        }
        Commands::Quarantine { action } => {
            init_logging_simple();
            let ledger = open_ledger(&config).await?;
            let quarantine = LedgerQuarantine::new(ledger);
            match action {
                QuarantineAction::List => {
                    let entries = quarantine.entries().await?;
                    let rows: Vec<QuarantineRow> = entries.iter().map(QuarantineRow::from).collect();
                    cli::print_items(&rows, mode)?;
                }
                QuarantineAction::Clear { symbol, strategy } => {
                    let symbol = symbol.to_uppercase();
                    if quarantine.clear(strategy, &symbol).await? {
                        println!("quarantine lifted: {} ({})", symbol, strategy);
                    } else {
                        println!("no quarantine for {} ({})", symbol, strategy);
                    }
                }
            }
        }
        Commands::Twap {
            symbol,
            side,
            qty,
            slices,
            interval_secs,
            strategy,
            limit_price,
            paper,
        } => {
            init_logging(&config.logging);
            let mut request = TwapRequest::market(symbol.clone(), *side, *qty, *slices);
            request.interval_secs = *interval_secs;
            request.strategy_id = strategy.clone();
            if let Some(price) = limit_price {
                request.order_type = OrderType::Limit;
                request.limit_price = Some(*price);
            }
            run_twap(&config, request, *paper, mode).await?;
        }
    }

    Ok(())
}

/// Console logging plus an optional daily-rotated file under TALLY_LOG_DIR.
fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},tally=debug,sqlx=warn", logging.level))
    });

    // Only log to file when a directory is configured.
    let log_dir = std::env::var("TALLY_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .ok();

    // `rolling::daily` panics if the first file can't be created, so preflight writability.
    let file_layer = log_dir.as_ref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: Could not create log directory {} ({}), file logging disabled", dir, e);
            return None;
        }
        let test_path = std::path::Path::new(dir).join(".tally_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(dir, "tally.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Lives as long as the process
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Warning: Could not write to log directory {} ({}), file logging disabled", dir, e);
                None
            }
        }
    });

    let (json_layer, text_layer) = if logging.json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/tally.log", dir);
    }
}

fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn open_ledger(config: &AppConfig) -> Result<Arc<dyn LedgerStore>> {
    match config.database.url.as_deref() {
        Some(url) => {
            let ledger = PostgresLedger::new(url, config.database.max_connections).await?;
            ledger.migrate().await?;
            info!("Connected to ledger database");
            Ok(Arc::new(ledger))
        }
        None => {
            warn!("database.url not set; using an in-memory ledger (state is lost on exit)");
            Ok(Arc::new(InMemoryLedger::new()))
        }
    }
}

/// `None` means dry-run: slices are recorded but never sent.
fn open_broker(config: &AppConfig, paper: bool) -> Result<Option<Arc<dyn BrokerClient>>> {
    if paper {
        info!("Using in-memory paper broker");
        return Ok(Some(Arc::new(PaperBroker::new())));
    }
    if config.broker.enabled {
        info!(base_url = %config.broker.base_url, "Using broker API");
        return Ok(Some(Arc::new(AlpacaClient::new(&config.broker)?)));
    }
    warn!("broker.enabled is false; running in dry-run mode");
    Ok(None)
}

/// The quarantine registry lives in the ledger so every process sees it.
fn build_safety(config: &AppConfig, ledger: &Arc<dyn LedgerStore>) -> SafetyGate {
    let in_process = Arc::new(InProcessKillSwitch::new());
    let kill_switch: Arc<dyn KillSwitch> = match &config.safety.kill_switch_file {
        Some(path) => Arc::new(AnyKillSwitch::new(vec![
            in_process as Arc<dyn KillSwitch>,
            Arc::new(FileKillSwitch::new(path)),
        ])),
        None => in_process,
    };
    let breaker = Arc::new(SubmissionCircuitBreaker::new(SubmissionBreakerConfig {
        failure_threshold: config.safety.breaker_failure_threshold,
        recovery_timeout_secs: config.safety.breaker_recovery_timeout_secs,
    }));
    SafetyGate::new(kill_switch, breaker, Arc::new(LedgerQuarantine::new(Arc::clone(ledger))))
}

async fn run_service(config: &AppConfig, paper: bool) -> Result<()> {
    info!("Starting tally");

    let ledger = open_ledger(config).await?;
    let broker = open_broker(config, paper)?;
    let safety = build_safety(config, &ledger);
    let metrics = Arc::new(Metrics::new());
    let gate = Arc::new(ReconciliationGate::new());
    let shutdown = Arc::new(GracefulShutdown::with_defaults());
    let mut handles = Vec::new();

    if let Some(port) = config.health_port {
        let state = Arc::new(
            HealthState::new(Arc::clone(&gate), Arc::clone(&metrics)).with_safety(safety.clone()),
        );
        handles.push(tokio::spawn(async move {
            if let Err(e) = HealthServer::new(state, port).run().await {
                error!("Health server error: {}", e);
            }
        }));
    }

    let scheduler = SliceScheduler::new(
        Arc::clone(&ledger),
        broker.clone(),
        safety.clone(),
        Arc::clone(&gate),
        &config.scheduler,
        Arc::clone(&metrics),
    );

    match broker {
        Some(broker) => {
            let recon = Arc::new(ReconciliationService::new(
                Arc::clone(&ledger),
                broker,
                Arc::clone(&safety.quarantine),
                Arc::clone(&gate),
                config.reconciliation.clone(),
                Arc::clone(&metrics),
            ));
            if !recon.run_startup().await {
                warn!("Startup reconciliation did not complete; waiting for a periodic run before trading");
            }
            let listener = shutdown.subscribe();
            handles.push(tokio::spawn(recon.run_periodic(listener)));
        }
        None => {
            // Nothing to reconcile against
            warn!("No broker configured; reconciliation disabled and readiness stays closed");
            gate.mark_startup_timed_out().await;
        }
    }

    info!(dry_run = scheduler.is_dry_run(), "tally running; press Ctrl+C to stop");
    shutdown.wait_for_os_signal().await;

    let dropped = scheduler.jobs().shutdown();
    if dropped > 0 {
        warn!(dropped, "Pending slice jobs dropped at shutdown; they stay pending_new in the ledger");
    }
    shutdown.drain(handles).await;
    info!("tally stopped");
    Ok(())
}

async fn run_reconcile_once(config: &AppConfig, mode: OutputMode) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let broker = open_broker(config, false)?
        .ok_or_else(|| TallyError::Validation("reconcile requires broker.enabled".into()))?;
    let safety = build_safety(config, &ledger);
    let recon = ReconciliationService::new(
        ledger,
        broker,
        safety.quarantine,
        Arc::new(ReconciliationGate::new()),
        config.reconciliation.clone(),
        Arc::new(Metrics::new()),
    );
    let report = recon.run(RunMode::Manual).await?;
    cli::print_report(&report, mode)?;
    Ok(())
}

async fn run_twap(
    config: &AppConfig,
    request: TwapRequest,
    paper: bool,
    mode: OutputMode,
) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let broker = open_broker(config, paper)?;
    let safety = build_safety(config, &ledger);
    let metrics = Arc::new(Metrics::new());
    let gate = Arc::new(ReconciliationGate::new());

    // Nothing is sent until the ledger agrees with the broker
    if let Some(broker) = &broker {
        let recon = Arc::new(ReconciliationService::new(
            Arc::clone(&ledger),
            Arc::clone(broker),
            Arc::clone(&safety.quarantine),
            Arc::clone(&gate),
            config.reconciliation.clone(),
            Arc::clone(&metrics),
        ));
        if !recon.run_startup().await {
            return Err(TallyError::Infrastructure(
                "startup reconciliation failed; not submitting".into(),
            ));
        }
    }

    let scheduler = SliceScheduler::new(
        Arc::clone(&ledger),
        broker,
        safety,
        gate,
        &config.scheduler,
        metrics,
    );
    let twap = TwapService::new(Arc::clone(&ledger), scheduler.clone());

    let side = request.side;
    let submission = twap.submit(request).await?;
    let parent_id = submission.parent.client_order_id.clone();
    info!(
        parent = %parent_id,
        side = %side,
        slices = submission.slices.len(),
        "TWAP scheduled"
    );

    let shutdown = GracefulShutdown::with_defaults();
    tokio::select! {
        res = wait_for_slices(&scheduler, ledger.as_ref(), &parent_id) => res?,
        _ = shutdown.wait_for_os_signal() => {
            let (jobs, rows) = twap.cancel(&parent_id).await?;
            warn!(jobs, rows, "Interrupted; remaining slices canceled");
        }
    }

    let slices = ledger.get_slices_by_parent(&parent_id).await?;
    let rows: Vec<SliceRow> = slices.iter().map(SliceRow::from).collect();
    cli::print_items(&rows, mode)?;

    let failed = slices
        .iter()
        .filter(|s| matches!(s.status, OrderStatus::Failed | OrderStatus::Rejected))
        .count();
    if failed > 0 {
        warn!(failed, "Some slices did not reach the broker");
    }
    Ok(())
}

/// Jobs leave the scheduler when they fire; the slice row leaves
/// pending_new once the attempt is recorded.
async fn wait_for_slices(
    scheduler: &SliceScheduler,
    ledger: &dyn LedgerStore,
    parent_id: &str,
) -> Result<()> {
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        if !scheduler.jobs().is_empty() {
            continue;
        }
        let slices = ledger.get_slices_by_parent(parent_id).await?;
        if slices.iter().all(|s| s.status != OrderStatus::PendingNew) {
            return Ok(());
        }
    }
}
