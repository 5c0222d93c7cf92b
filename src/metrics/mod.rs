//! Performance metrics over equity curves.

mod calculator;
mod market;

pub use calculator::{MetricsCalculator, PerformanceMetrics};
pub use market::MarketTracker;
