//! Backtesting: replay historical market events through the same engine
//! that runs live bots.
//!
//! Features:
//! - Builds the engine from a regular bot config (fills always simulated)
//! - Primes strategies from the config's warmup history, if any
//! - Replays in-memory or JSON-lines history in timestamp order
//! - Reports performance metrics and the full equity curve

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::bot::{BotConfig, DefaultEngineFactory, EngineFactory, ExecutionMode};
use crate::data::HistoricalDataProvider;
use crate::engine::EquityPoint;
use crate::metrics::PerformanceMetrics;
use crate::models::MarketEvent;

/// Backtest results summary.
#[derive(Debug, Clone)]
pub struct BacktestResults {
    pub bot_id: String,
    pub strategy: String,

    /// Number of market events replayed
    pub events: usize,

    /// First and last event timestamps
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub metrics: PerformanceMetrics,
    pub equity_curve: Vec<EquityPoint>,
}

impl std::fmt::Display for BacktestResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Bot:      {} ({})", self.bot_id, self.strategy)?;
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            writeln!(
                f,
                "Period:   {} to {}",
                start.format("%Y-%m-%d %H:%M"),
                end.format("%Y-%m-%d %H:%M")
            )?;
        }
        writeln!(f, "Events:   {}", self.events)?;
        writeln!(f)?;
        write!(f, "{}", self.metrics)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Backtesting driver.
pub struct Backtester {
    config: BotConfig,
    factory: Box<dyn EngineFactory>,
}

impl Backtester {
    pub fn new(config: BotConfig) -> Self {
        Self::with_factory(config, Box::new(DefaultEngineFactory::default()))
    }

    pub fn with_factory(mut config: BotConfig, factory: Box<dyn EngineFactory>) -> Self {
        // History is replayed against simulated fills only
        config.mode = ExecutionMode::Paper;
        if config.bot_id.is_empty() {
            config.bot_id = "backtest".to_string();
        }
        Self { config, factory }
    }

    /// Replay a JSON-lines market data file.
    pub async fn run_file(&self, path: impl AsRef<Path>) -> Result<BacktestResults> {
        let path = path.as_ref();
        let provider = HistoricalDataProvider::from_json_lines(path)
            .with_context(|| format!("Failed to load market data from {}", path.display()))?;
        self.run_provider(provider).await
    }

    /// Replay in-memory events.
    pub async fn run_events(&self, events: Vec<MarketEvent>) -> Result<BacktestResults> {
        self.run_provider(HistoricalDataProvider::from_events(events)).await
    }

    async fn run_provider(&self, mut provider: HistoricalDataProvider) -> Result<BacktestResults> {
        self.config.validate().context("Invalid bot config")?;
        if provider.is_empty() {
            bail!("No market events to replay");
        }

        let events = provider.len();
        let start_time = provider.first_timestamp();
        let end_time = provider.last_timestamp();

        info!(
            bot_id = %self.config.bot_id,
            strategy = %self.config.strategy.name,
            events,
            "Starting backtest"
        );

        let mut engine = self.factory.build(&self.config)?;
        if let Some(warmup) = &self.config.warmup {
            engine.warmup(&mut warmup.provider()?).await?;
        }
        let metrics = engine.run(&mut provider).await?;

        info!(
            bot_id = %self.config.bot_id,
            fills = metrics.fills,
            final_equity = %metrics.final_equity,
            "Backtest complete"
        );

        Ok(BacktestResults {
            bot_id: self.config.bot_id.clone(),
            strategy: self.config.strategy.name.clone(),
            events,
            start_time,
            end_time,
            metrics,
            equity_curve: engine.equity_curve().points().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::config::tests::sample_config;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn trades(prices: &[Decimal]) -> Vec<MarketEvent> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| MarketEvent::Trade {
                symbol: "SOL".to_string(),
                price: *price,
                size: dec!(1),
                timestamp: start + Duration::minutes(i as i64),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_crossover_backtest() {
        let mut config = sample_config("bt");
        config.execution.slippage_bps = Decimal::ZERO;
        config.execution.commission_rate = Decimal::ZERO;

        // Rally flips the 2/3 crossover long, the selloff flips it short
        let prices = [
            dec!(100), dec!(100), dec!(100), dec!(110), dec!(120), dec!(90), dec!(80),
        ];
        let results = Backtester::new(config).run_events(trades(&prices)).await.unwrap();

        assert_eq!(results.events, 7);
        assert_eq!(results.metrics.fills, 2);
        assert_eq!(results.equity_curve.len(), 3);
        assert_eq!(results.metrics.initial_equity, dec!(1000));
        // Long 0.45454 SOL @ 110 closed @ 90 by the reversal
        assert_eq!(results.metrics.realized_pnl, dec!(-9.0908));
        assert!(results.to_string().contains("BACKTEST RESULTS"));
    }

    #[tokio::test]
    async fn test_live_config_is_simulated() {
        // Live mode with no exchange client would refuse to build outside a backtest
        let mut config = sample_config("bt");
        config.mode = ExecutionMode::Live;
        config.execution.slippage_bps = Decimal::ZERO;
        config.execution.commission_rate = Decimal::ZERO;

        let prices = [
            dec!(100), dec!(100), dec!(100), dec!(110), dec!(120), dec!(90), dec!(80),
        ];
        let results = Backtester::new(config).run_events(trades(&prices)).await.unwrap();

        assert_eq!(results.metrics.fills, 2);
        assert_eq!(results.metrics.realized_pnl, dec!(-9.0908));
    }

    #[tokio::test]
    async fn test_warmup_history_primes_strategy() {
        let history = trades(&[dec!(100), dec!(100), dec!(100)]);
        let start = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let replay: Vec<MarketEvent> = [dec!(110), dec!(120)]
            .iter()
            .enumerate()
            .map(|(i, price)| MarketEvent::Trade {
                symbol: "SOL".to_string(),
                price: *price,
                size: dec!(1),
                timestamp: start + Duration::minutes(i as i64),
            })
            .collect();

        // Two events cannot fill a three-period average on their own
        let cold = Backtester::new(sample_config("bt"))
            .run_events(replay.clone())
            .await
            .unwrap();
        assert_eq!(cold.metrics.fills, 0);

        let path = std::env::temp_dir().join(format!("bt_warmup_{}.jsonl", uuid::Uuid::new_v4()));
        let lines: Vec<String> = history
            .iter()
            .map(|event| serde_json::to_string(event).unwrap())
            .collect();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let mut config = sample_config("bt");
        config.warmup = Some(crate::bot::WarmupConfig {
            path: path.clone(),
            periods: None,
        });
        let warm = Backtester::new(config).run_events(replay).await.unwrap();
        let _ = std::fs::remove_file(path);

        assert_eq!(warm.metrics.fills, 1);
        assert_eq!(warm.events, 2);
    }

    #[tokio::test]
    async fn test_empty_history_rejected() {
        let result = Backtester::new(sample_config("bt")).run_events(Vec::new()).await;
        assert!(result.is_err());
    }
}
