//! Per-symbol position ledger and the fill-driven update algorithm.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Aggregate signed exposure for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Positive long, negative short, zero flat
    pub qty: i64,
    pub avg_entry_price: Decimal,
    /// Cumulative; never reset when the position flattens
    pub realized_pl: Decimal,
    pub current_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn flat(symbol: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            qty: 0,
            avg_entry_price: Decimal::ZERO,
            realized_pl: Decimal::ZERO,
            current_price: None,
            updated_at: now,
            last_trade_at: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.qty == 0
    }

    /// Mark-to-market P&L on the open quantity, when a price is known
    pub fn unrealized_pl(&self) -> Option<Decimal> {
        self.current_price
            .map(|price| (price - self.avg_entry_price) * Decimal::from(self.qty))
    }

    /// Apply a fill and return the new position along with the P&L realized
    /// by this fill alone.
    pub fn apply_fill(
        &self,
        fill_qty: i64,
        fill_price: Decimal,
        side: OrderSide,
        at: DateTime<Utc>,
    ) -> (Position, Decimal) {
        let outcome = compute_fill(
            self.qty,
            self.avg_entry_price,
            fill_qty,
            fill_price,
            side,
        );
        let next = Position {
            symbol: self.symbol.clone(),
            qty: outcome.qty,
            avg_entry_price: outcome.avg_entry_price,
            realized_pl: self.realized_pl + outcome.realized_pl,
            current_price: self.current_price,
            updated_at: at,
            last_trade_at: Some(at),
        };
        (next, outcome.realized_pl)
    }
}

/// Authoritative broker-side view of one position, applied wholesale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub qty: i64,
    pub avg_entry_price: Decimal,
    pub current_price: Option<Decimal>,
}

/// Result of applying one fill to `(qty, avg_entry_price)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    pub qty: i64,
    pub avg_entry_price: Decimal,
    /// P&L realized by this fill only
    pub realized_pl: Decimal,
}

/// Pure position arithmetic.
///
/// - open from flat: avg = fill price
/// - add in the same direction: quantity-weighted average
/// - partial close: avg unchanged, P&L realized on the closed quantity
/// - full close: avg resets to zero
/// - flip: P&L realized on the closed portion only, avg = fill price
pub fn compute_fill(
    current_qty: i64,
    current_avg: Decimal,
    fill_qty: i64,
    fill_price: Decimal,
    side: OrderSide,
) -> FillOutcome {
    let signed_fill = fill_qty.abs() * side.sign();
    let new_qty = current_qty + signed_fill;

    if current_qty == 0 {
        return FillOutcome {
            qty: new_qty,
            avg_entry_price: if new_qty == 0 { Decimal::ZERO } else { fill_price },
            realized_pl: Decimal::ZERO,
        };
    }

    let same_direction = current_qty.signum() == signed_fill.signum();
    if same_direction {
        let total_cost = current_avg * Decimal::from(current_qty.abs())
            + fill_price * Decimal::from(signed_fill.abs());
        return FillOutcome {
            qty: new_qty,
            avg_entry_price: total_cost / Decimal::from(new_qty.abs()),
            realized_pl: Decimal::ZERO,
        };
    }

    let closed_qty = signed_fill.abs().min(current_qty.abs());
    let direction = Decimal::from(current_qty.signum());
    let realized = (fill_price - current_avg) * Decimal::from(closed_qty) * direction;

    let avg_entry_price = if new_qty == 0 {
        Decimal::ZERO
    } else if new_qty.signum() == current_qty.signum() {
        current_avg
    } else {
        fill_price
    };

    FillOutcome {
        qty: new_qty,
        avg_entry_price,
        realized_pl: realized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_long() {
        let out = compute_fill(0, Decimal::ZERO, 100, dec!(150), OrderSide::Buy);
        assert_eq!(out.qty, 100);
        assert_eq!(out.avg_entry_price, dec!(150));
        assert_eq!(out.realized_pl, Decimal::ZERO);
    }

    #[test]
    fn test_open_short() {
        let out = compute_fill(0, Decimal::ZERO, 40, dec!(25), OrderSide::Sell);
        assert_eq!(out.qty, -40);
        assert_eq!(out.avg_entry_price, dec!(25));
    }

    #[test]
    fn test_add_to_long_weights_average() {
        let out = compute_fill(100, dec!(150), 100, dec!(160), OrderSide::Buy);
        assert_eq!(out.qty, 200);
        assert_eq!(out.avg_entry_price, dec!(155));
        assert_eq!(out.realized_pl, Decimal::ZERO);
    }

    #[test]
    fn test_partial_close_at_loss() {
        let out = compute_fill(100, dec!(150), 50, dec!(120), OrderSide::Sell);
        assert_eq!(out.qty, 50);
        assert_eq!(out.avg_entry_price, dec!(150));
        assert_eq!(out.realized_pl, dec!(-1500));
    }

    #[test]
    fn test_partial_cover_short_at_profit() {
        let out = compute_fill(-100, dec!(50), 30, dec!(40), OrderSide::Buy);
        assert_eq!(out.qty, -70);
        assert_eq!(out.avg_entry_price, dec!(50));
        assert_eq!(out.realized_pl, dec!(300));
    }

    #[test]
    fn test_full_close_resets_average() {
        let out = compute_fill(50, dec!(150), 50, dec!(155), OrderSide::Sell);
        assert_eq!(out.qty, 0);
        assert_eq!(out.avg_entry_price, Decimal::ZERO);
        assert_eq!(out.realized_pl, dec!(250));
    }

    #[test]
    fn test_flip_long_to_short() {
        let out = compute_fill(50, dec!(100), 100, dec!(120), OrderSide::Sell);
        assert_eq!(out.qty, -50);
        assert_eq!(out.avg_entry_price, dec!(120));
        assert_eq!(out.realized_pl, dec!(1000));
    }

    #[test]
    fn test_flatten_preserves_cumulative_realized() {
        let now = Utc::now();
        let pos = Position::flat("AAPL", now);
        let (pos, _) = pos.apply_fill(100, dec!(150), OrderSide::Buy, now);
        let (pos, first) = pos.apply_fill(50, dec!(120), OrderSide::Sell, now);
        let (pos, second) = pos.apply_fill(50, dec!(160), OrderSide::Sell, now);

        assert_eq!(first, dec!(-1500));
        assert_eq!(second, dec!(500));
        assert!(pos.is_flat());
        assert_eq!(pos.avg_entry_price, Decimal::ZERO);
        assert_eq!(pos.realized_pl, dec!(-1000));
        assert_eq!(pos.last_trade_at, Some(now));
    }

    #[test]
    fn test_unrealized_pl_on_short() {
        let mut pos = Position::flat("TSLA", Utc::now());
        pos.qty = -10;
        pos.avg_entry_price = dec!(200);
        pos.current_price = Some(dec!(190));
        assert_eq!(pos.unrealized_pl(), Some(dec!(100)));
    }
}
