//! Append-only equity curve.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

/// Equity snapshots, seeded with initial capital. Only `push` mutates it,
/// so a value at index n can only depend on fills before it.
#[derive(Debug, Clone)]
pub struct EquityCurve {
    points: Vec<EquityPoint>,
}

impl EquityCurve {
    pub fn new(initial_capital: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            points: vec![EquityPoint {
                timestamp,
                equity: initial_capital,
            }],
        }
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, equity: Decimal) {
        self.points.push(EquityPoint { timestamp, equity });
    }

    /// Latest equity. The seed guarantees there is always one.
    pub fn last(&self) -> Decimal {
        self.points.last().map(|p| p.equity).unwrap_or_default()
    }

    pub fn initial(&self) -> Decimal {
        self.points.first().map(|p| p.equity).unwrap_or_default()
    }

    pub fn points(&self) -> &[EquityPoint] {
        &self.points
    }

    pub fn values(&self) -> impl Iterator<Item = Decimal> + '_ {
        self.points.iter().map(|p| p.equity)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_seeded_and_append_only() {
        let now = Utc::now();
        let mut curve = EquityCurve::new(dec!(10000), now);
        assert_eq!(curve.len(), 1);
        assert_eq!(curve.last(), dec!(10000));

        curve.push(now, dec!(10050));
        curve.push(now, dec!(9990));
        assert_eq!(curve.len(), 3);
        assert_eq!(curve.initial(), dec!(10000));
        assert_eq!(curve.last(), dec!(9990));
        assert_eq!(curve.values().collect::<Vec<_>>(), vec![dec!(10000), dec!(10050), dec!(9990)]);
    }
}
