//! Per-engine position book. Converts fills into realized PnL.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{FillEvent, Position};

/// PnL recognised when a fill reduces or reverses a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealizedPnl {
    pub symbol: String,

    /// Absolute quantity that was closed
    pub closed_quantity: Decimal,

    /// Gross PnL before commission
    pub pnl: Decimal,
}

/// Net positions by symbol. Flat positions are removed.
#[derive(Debug, Default, Clone)]
pub struct PositionTracker {
    positions: HashMap<String, Position>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a fill. Returns realized PnL when any quantity was closed.
    pub fn process_fill(&mut self, fill: &FillEvent) -> Option<RealizedPnl> {
        let signed_qty = fill.signed_quantity();
        if signed_qty.is_zero() {
            return None;
        }

        let Some(position) = self.positions.get_mut(&fill.symbol) else {
            self.positions.insert(
                fill.symbol.clone(),
                Position::open(fill.symbol.clone(), signed_qty, fill.fill_price),
            );
            return None;
        };

        // Same direction: re-weight the average
        if position.quantity.is_sign_negative() == signed_qty.is_sign_negative() {
            position.add(signed_qty, fill.fill_price);
            return None;
        }

        let old_qty = position.quantity;
        let closed_quantity = old_qty.abs().min(signed_qty.abs());
        let direction = if old_qty > Decimal::ZERO {
            Decimal::ONE
        } else {
            Decimal::NEGATIVE_ONE
        };
        let pnl = closed_quantity * (fill.fill_price - position.avg_price) * direction;

        let remaining = old_qty + signed_qty;
        if remaining.is_zero() {
            self.positions.remove(&fill.symbol);
        } else if remaining.is_sign_negative() == old_qty.is_sign_negative() {
            // Partial reduction keeps the original entry price
            position.quantity = remaining;
        } else {
            // Flip: residual opens at the fill price
            position.quantity = remaining;
            position.avg_price = fill.fill_price;
            debug!(symbol = %fill.symbol, residual = %remaining, "Position reversed");
        }

        Some(RealizedPnl {
            symbol: fill.symbol.clone(),
            closed_quantity,
            pnl,
        })
    }

    pub fn get_position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Read-only snapshot for risk evaluation.
    pub fn all_positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    /// Mark open positions to the given prices. Symbols without a mark are skipped.
    pub fn unrealized_pnl(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        self.positions
            .values()
            .filter_map(|p| marks.get(&p.symbol).map(|mark| p.unrealized_pnl(*mark)))
            .sum()
    }

    /// Aggregate open notional at entry prices.
    pub fn gross_exposure(&self) -> Decimal {
        self.positions.values().map(Position::notional).sum()
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderDirection;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn fill(direction: OrderDirection, quantity: Decimal, price: Decimal) -> FillEvent {
        FillEvent {
            order_id: "test".to_string(),
            symbol: "BTC".to_string(),
            direction,
            quantity,
            fill_price: price,
            commission: Decimal::ZERO,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_open_and_average() {
        let mut tracker = PositionTracker::new();
        assert!(tracker.process_fill(&fill(OrderDirection::Buy, dec!(1), dec!(100))).is_none());
        assert!(tracker.process_fill(&fill(OrderDirection::Buy, dec!(3), dec!(200))).is_none());

        let pos = tracker.get_position("BTC").unwrap();
        assert_eq!(pos.quantity, dec!(4));
        assert_eq!(pos.avg_price, dec!(175)); // (100 + 600) / 4
    }

    #[test]
    fn test_partial_close_realizes_pnl() {
        let mut tracker = PositionTracker::new();
        tracker.process_fill(&fill(OrderDirection::Buy, dec!(2), dec!(100)));

        let realized = tracker
            .process_fill(&fill(OrderDirection::Sell, dec!(0.5), dec!(120)))
            .unwrap();
        assert_eq!(realized.closed_quantity, dec!(0.5));
        assert_eq!(realized.pnl, dec!(10));

        let pos = tracker.get_position("BTC").unwrap();
        assert_eq!(pos.quantity, dec!(1.5));
        assert_eq!(pos.avg_price, dec!(100));
    }

    #[test]
    fn test_short_close_removes_position() {
        let mut tracker = PositionTracker::new();
        tracker.process_fill(&fill(OrderDirection::Sell, dec!(1), dec!(100)));

        // Short covered lower is a gain
        let realized = tracker
            .process_fill(&fill(OrderDirection::Buy, dec!(1), dec!(90)))
            .unwrap();
        assert_eq!(realized.pnl, dec!(10));
        assert!(tracker.get_position("BTC").is_none());
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn test_flip_opens_residual_at_fill_price() {
        let mut tracker = PositionTracker::new();
        tracker.process_fill(&fill(OrderDirection::Buy, dec!(1), dec!(100)));

        let realized = tracker
            .process_fill(&fill(OrderDirection::Sell, dec!(3), dec!(110)))
            .unwrap();
        // Only the closed unit is realized
        assert_eq!(realized.closed_quantity, dec!(1));
        assert_eq!(realized.pnl, dec!(10));

        let pos = tracker.get_position("BTC").unwrap();
        assert_eq!(pos.quantity, dec!(-2));
        assert_eq!(pos.avg_price, dec!(110));
    }

    #[test]
    fn test_unrealized_and_exposure() {
        let mut tracker = PositionTracker::new();
        tracker.process_fill(&fill(OrderDirection::Buy, dec!(2), dec!(100)));

        let mut marks = HashMap::new();
        marks.insert("BTC".to_string(), dec!(105));
        assert_eq!(tracker.unrealized_pnl(&marks), dec!(10));
        assert_eq!(tracker.gross_exposure(), dec!(200));
    }
}
