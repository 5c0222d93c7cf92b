//! Net position held by a single engine in one symbol.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Signed net position. Positive quantity is long, negative is short.
///
/// A position only exists while its quantity is non-zero, so `avg_price`
/// is always meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,

    /// Signed quantity in base-asset units
    pub quantity: Decimal,

    /// Volume-weighted entry price of the open quantity
    pub avg_price: Decimal,
}

impl Position {
    /// Open a new position at a fill price.
    pub fn open(symbol: String, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol,
            quantity,
            avg_price: price,
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    /// Cost basis in collateral currency.
    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.avg_price
    }

    /// Mark-to-market PnL at a given price.
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        (mark_price - self.avg_price) * self.quantity
    }

    /// Add quantity in the same direction, re-weighting the average price.
    pub fn add(&mut self, quantity: Decimal, price: Decimal) {
        let total = self.quantity + quantity;
        if total.is_zero() {
            return;
        }
        self.avg_price = (self.quantity * self.avg_price + quantity * price) / total;
        self.quantity = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_pnl() {
        let long = Position::open("BTC".to_string(), dec!(0.5), dec!(60000));
        assert_eq!(long.unrealized_pnl(dec!(62000)), dec!(1000));

        let short = Position::open("BTC".to_string(), dec!(-0.5), dec!(60000));
        assert_eq!(short.unrealized_pnl(dec!(62000)), dec!(-1000));
        assert_eq!(short.notional(), dec!(30000));
    }

    #[test]
    fn test_position_averaging() {
        let mut pos = Position::open("ETH".to_string(), dec!(1), dec!(3000));
        pos.add(dec!(1), dec!(3200));
        assert_eq!(pos.quantity, dec!(2));
        assert_eq!(pos.avg_price, dec!(3100));

        // Shorts average the same way
        let mut short = Position::open("ETH".to_string(), dec!(-1), dec!(3000));
        short.add(dec!(-3), dec!(2600));
        assert_eq!(short.quantity, dec!(-4));
        assert_eq!(short.avg_price, dec!(2700));
    }
}
