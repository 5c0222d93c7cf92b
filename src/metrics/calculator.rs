//! Performance metrics computed from an engine's equity curve and realized trades.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use super::MarketTracker;
use crate::engine::EquityPoint;

/// Summary statistics for a bot or a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub initial_equity: Decimal,
    pub final_equity: Decimal,

    /// Fractional return, 0.05 = 5%
    pub total_return_pct: Decimal,

    /// Largest peak-to-trough decline as a fraction of the peak
    pub max_drawdown_pct: f64,

    /// Annualized, zero risk-free rate
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,

    pub fills: usize,
    pub rejections: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub realized_pnl: Decimal,
    pub total_commission: Decimal,

    /// Equal-weighted return of simply holding the traded symbols
    pub buy_hold_return: Decimal,

    /// Fraction of market events with an open position
    pub exposure_time: f64,
}

impl std::fmt::Display for PerformanceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:       ${:.2}", self.initial_equity)?;
        writeln!(f, "Final:         ${:.2}", self.final_equity)?;
        writeln!(f, "Return:        {:.2}%", self.total_return_pct * dec!(100))?;
        writeln!(f, "Buy & Hold:    {:.2}%", self.buy_hold_return * dec!(100))?;
        writeln!(f, "Realized P&L:  ${:.2}", self.realized_pnl)?;
        writeln!(f, "Commission:    ${:.2}", self.total_commission)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Fills:         {} ({} rejected)", self.fills, self.rejections)?;
        writeln!(f, "Closed:        {}", self.closed_trades)?;
        writeln!(f, "Winners:       {} ({:.1}%)", self.winning_trades, self.win_rate * 100.0)?;
        writeln!(f, "Losers:        {}", self.losing_trades)?;
        writeln!(f, "Exposure:      {:.1}%", self.exposure_time * 100.0)?;
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown:  {:.2}%", self.max_drawdown_pct * 100.0)?;
        writeln!(f, "Sharpe Ratio:  {:.2}", self.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio: {:.2}", self.sortino_ratio)?;
        Ok(())
    }
}

/// Stateless metric computations.
pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn calculate(
        curve: &[EquityPoint],
        realized: &[Decimal],
        total_commission: Decimal,
        fills: usize,
        rejections: usize,
        market: &MarketTracker,
    ) -> PerformanceMetrics {
        let initial_equity = curve.first().map(|p| p.equity).unwrap_or_default();
        let final_equity = curve.last().map(|p| p.equity).unwrap_or_default();

        let total_return_pct = if initial_equity > Decimal::ZERO {
            (final_equity - initial_equity) / initial_equity
        } else {
            Decimal::ZERO
        };

        let winning_trades = realized.iter().filter(|p| **p > Decimal::ZERO).count();
        let losing_trades = realized.iter().filter(|p| **p < Decimal::ZERO).count();
        let win_rate = if realized.is_empty() {
            0.0
        } else {
            winning_trades as f64 / realized.len() as f64
        };

        let (sharpe_ratio, sortino_ratio) = Self::risk_ratios(curve);

        PerformanceMetrics {
            initial_equity,
            final_equity,
            total_return_pct,
            max_drawdown_pct: Self::max_drawdown(curve),
            sharpe_ratio,
            sortino_ratio,
            fills,
            rejections,
            closed_trades: realized.len(),
            winning_trades,
            losing_trades,
            win_rate,
            realized_pnl: realized.iter().copied().sum(),
            total_commission,
            buy_hold_return: market.buy_hold_return(),
            exposure_time: market.exposure_time(),
        }
    }

    /// Maximum drawdown as a fraction of the running peak.
    pub fn max_drawdown(curve: &[EquityPoint]) -> f64 {
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;

        for point in curve {
            if point.equity > peak {
                peak = point.equity;
            }
            if peak > Decimal::ZERO {
                let dd = (peak - point.equity) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }

        max_dd.to_f64().unwrap_or(0.0)
    }

    /// Sharpe and Sortino from step-to-step returns, annualized with sqrt(252).
    fn risk_ratios(curve: &[EquityPoint]) -> (f64, f64) {
        let returns: Vec<f64> = curve
            .windows(2)
            .filter_map(|w| {
                let prev = w[0].equity.to_f64()?;
                let curr = w[1].equity.to_f64()?;
                (prev > 0.0).then(|| (curr - prev) / prev)
            })
            .collect();

        if returns.len() < 2 {
            return (0.0, 0.0);
        }

        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        let annualize = 252.0_f64.sqrt();

        let sharpe = if std_dev > 0.0 && std_dev.is_finite() {
            mean / std_dev * annualize
        } else {
            0.0
        };

        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let sortino = if downside.len() >= 2 {
            let downside_dev = downside.iter().std_dev();
            if downside_dev > 0.0 {
                mean / downside_dev * annualize
            } else {
                0.0
            }
        } else {
            0.0
        };

        (sharpe, sortino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn curve(values: &[Decimal]) -> Vec<EquityPoint> {
        let now = Utc::now();
        values
            .iter()
            .map(|v| EquityPoint {
                timestamp: now,
                equity: *v,
            })
            .collect()
    }

    #[test]
    fn test_calculate_drawdown() {
        let points = curve(&[dec!(100), dec!(150), dec!(70), dec!(50), dec!(150), dec!(200)]);
        let dd = MetricsCalculator::max_drawdown(&points);

        // 150 -> 50 is a 66.7% drawdown
        assert!(dd > 0.66 && dd < 0.67);
    }

    #[test]
    fn test_calculate_trade_stats() {
        let points = curve(&[dec!(1000), dec!(1100), dec!(1050), dec!(1250)]);
        let realized = [dec!(100), dec!(-50), dec!(200)];
        let mut market = MarketTracker::new();
        market.record("SOL", dec!(20), false);
        market.record("SOL", dec!(22), true);
        let metrics = MetricsCalculator::calculate(&points, &realized, dec!(3), 6, 1, &market);

        assert_eq!(metrics.total_return_pct, dec!(0.25));
        assert_eq!(metrics.winning_trades, 2);
        assert_eq!(metrics.losing_trades, 1);
        assert_eq!(metrics.realized_pnl, dec!(250));
        assert!((metrics.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(metrics.sharpe_ratio > 0.0);
        assert_eq!(metrics.buy_hold_return, dec!(0.1));
        assert_eq!(metrics.exposure_time, 0.5);
        assert!(metrics.to_string().contains("Buy & Hold:    10.00%"));
    }

    #[test]
    fn test_flat_curve_has_no_ratios() {
        let points = curve(&[dec!(1000)]);
        let metrics =
            MetricsCalculator::calculate(&points, &[], Decimal::ZERO, 0, 0, &MarketTracker::new());
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.buy_hold_return, Decimal::ZERO);
        assert_eq!(metrics.max_drawdown_pct, 0.0);
        assert_eq!(metrics.total_return_pct, Decimal::ZERO);
    }
}
