//! Command-line interface and output formatting.
//!
//! Supports two output modes: human-readable tables (default) and JSON (--json).

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::domain::{Order, OrderSide, OrphanOrder, Position, QuarantineEntry};
use crate::services::ReconciliationReport;

#[derive(Parser)]
#[command(name = "tally")]
#[command(version)]
#[command(about = "Order ledger, broker reconciliation and TWAP slice scheduling", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory
    #[arg(short, long, default_value = "config", env = "TALLY_CONFIG_DIR")]
    pub config: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run startup reconciliation, the periodic loop and the health server
    Run {
        /// Use the in-memory paper broker
        #[arg(long)]
        paper: bool,
    },
    /// Run one reconciliation pass and print its report
    Reconcile,
    /// Apply database migrations
    Migrate,
    /// List orphan orders
    Orphans {
        /// Include resolved orphans
        #[arg(long)]
        all: bool,
    },
    /// List the position ledger
    Positions,
    /// Inspect or lift symbol quarantines
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },
    /// Slice a parent order over time and run it to completion
    Twap {
        symbol: String,
        /// buy or sell
        #[arg(value_parser = parse_side)]
        side: OrderSide,
        /// Total shares
        qty: i64,
        #[arg(long, default_value = "5")]
        slices: i32,
        #[arg(long, default_value = "60")]
        interval_secs: i64,
        #[arg(long, default_value = "manual")]
        strategy: String,
        /// Submit limit slices at this price instead of market
        #[arg(long)]
        limit_price: Option<Decimal>,
        /// Use the in-memory paper broker
        #[arg(long)]
        paper: bool,
    },
}

#[derive(Subcommand)]
pub enum QuarantineAction {
    /// List quarantined symbols
    List,
    /// Lift one quarantine entry
    Clear {
        symbol: String,
        /// Strategy key; `*` is the all-strategies entry
        #[arg(long, default_value = "*")]
        strategy: String,
    },
}

fn parse_side(s: &str) -> Result<OrderSide, String> {
    OrderSide::try_from(s).map_err(|e| e.to_string())
}

/// Output mode for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print a vec of Tabled + Serialize items in the chosen mode.
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

pub fn print_report(report: &ReconciliationReport, mode: OutputMode) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputMode::Table => {
            let rows = vec![
                KeyValue::new("mode", report.mode),
                KeyValue::new("started_at", report.started_at),
                KeyValue::new("orders_checked", report.orders_checked),
                KeyValue::new("orders_in_sync", report.orders_in_sync),
                KeyValue::new("orders_updated", report.orders_updated),
                KeyValue::new("orders_skipped", report.orders_skipped),
                KeyValue::new("orders_failed", report.orders_failed),
                KeyValue::new("orders_deferred", report.orders_deferred),
                KeyValue::new("orders_unreconcilable", report.orders_unreconcilable),
                KeyValue::new("lookups_performed", report.lookups_performed),
                KeyValue::new("lookup_cap_reached", report.lookup_cap_reached),
                KeyValue::new("orphans_detected", report.orphans_detected),
                KeyValue::new("orphans_resolved", report.orphans_resolved),
                KeyValue::new("positions_synced", report.positions_synced),
                KeyValue::new("positions_flattened", report.positions_flattened),
                KeyValue::new("positions_unreadable", report.positions_unreadable),
                KeyValue::new("flatten_skipped", report.flatten_skipped),
            ];
            println!("{}", Table::new(rows));
        }
    }
    Ok(())
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Serialize, Tabled)]
pub struct KeyValue {
    pub field: String,
    pub value: String,
}

impl KeyValue {
    fn new(field: &str, value: impl ToString) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct OrphanRow {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: i64,
    pub notional: String,
    pub status: String,
    pub detected_at: String,
    pub resolved_at: String,
}

impl From<&OrphanOrder> for OrphanRow {
    fn from(o: &OrphanOrder) -> Self {
        Self {
            broker_order_id: o.broker_order_id.clone(),
            client_order_id: or_dash(o.client_order_id.as_deref()),
            symbol: o.symbol.clone(),
            side: o.side.as_str().to_string(),
            qty: o.qty,
            notional: o.estimated_notional.round_dp(2).to_string(),
            status: o.status.clone(),
            detected_at: o.detected_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            resolved_at: or_dash(o.resolved_at.map(|t| t.format("%Y-%m-%d %H:%M:%S"))),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct PositionRow {
    pub symbol: String,
    pub qty: i64,
    pub avg_entry_price: String,
    pub current_price: String,
    pub unrealized_pl: String,
    pub realized_pl: String,
    pub updated_at: String,
}

impl From<&Position> for PositionRow {
    fn from(p: &Position) -> Self {
        Self {
            symbol: p.symbol.clone(),
            qty: p.qty,
            avg_entry_price: p.avg_entry_price.round_dp(4).to_string(),
            current_price: or_dash(p.current_price),
            unrealized_pl: or_dash(p.unrealized_pl().map(|v| v.round_dp(2))),
            realized_pl: p.realized_pl.round_dp(2).to_string(),
            updated_at: p.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct QuarantineRow {
    pub symbol: String,
    pub strategy: String,
    pub quarantined_at: String,
}

impl From<&QuarantineEntry> for QuarantineRow {
    fn from(e: &QuarantineEntry) -> Self {
        Self {
            symbol: e.symbol.clone(),
            strategy: e.strategy_id.clone(),
            quarantined_at: e.quarantined_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct SliceRow {
    pub slice: String,
    pub client_order_id: String,
    pub qty: i64,
    pub status: String,
    pub scheduled: String,
    pub broker_order_id: String,
    pub error: String,
}

impl From<&Order> for SliceRow {
    fn from(o: &Order) -> Self {
        Self {
            slice: or_dash(o.slice_num),
            client_order_id: o.client_order_id.clone(),
            qty: o.qty,
            status: o.status.to_string(),
            scheduled: or_dash(o.scheduled_time.map(|t| t.format("%H:%M:%S"))),
            broker_order_id: or_dash(o.broker_order_id.as_deref()),
            error: or_dash(o.error_message.as_deref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_twap_command() {
        let cli = Cli::try_parse_from([
            "tally", "twap", "AAPL", "buy", "100", "--slices", "4", "--paper",
        ])
        .unwrap();
        match cli.command {
            Commands::Twap {
                side, qty, slices, paper, ..
            } => {
                assert_eq!(side, OrderSide::Buy);
                assert_eq!(qty, 100);
                assert_eq!(slices, 4);
                assert!(paper);
            }
            _ => panic!("expected twap"),
        }
    }

    #[test]
    fn test_quarantine_clear_defaults_to_wildcard() {
        let cli = Cli::try_parse_from(["tally", "quarantine", "clear", "AAPL"]).unwrap();
        match cli.command {
            Commands::Quarantine {
                action: QuarantineAction::Clear { symbol, strategy },
            } => {
                assert_eq!(symbol, "AAPL");
                assert_eq!(strategy, "*");
            }
            _ => panic!("expected quarantine clear"),
        }
    }
}
