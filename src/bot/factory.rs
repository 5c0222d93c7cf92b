//! Builds a fresh trading engine from a bot config.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use super::{BotConfig, ExecutionMode};
use crate::engine::TradingEngine;
use crate::trading::{
    build_risk_manager, ExchangeClient, ExecutionHandler, LiveExecutionHandler, RetryPolicy,
    SimulatedExecutionHandler, StrategyRegistry,
};

/// Picks the strategy, risk and execution variants for a bot.
pub trait EngineFactory: Send + Sync {
    fn build(&self, config: &BotConfig) -> Result<TradingEngine>;
}

/// Registry strategies, config-selected risk manager, simulated fills for
/// paper bots and the shared exchange client for live ones.
pub struct DefaultEngineFactory {
    strategies: StrategyRegistry,
    exchange: Option<Arc<dyn ExchangeClient>>,
    retry: RetryPolicy,
}

impl DefaultEngineFactory {
    pub fn new(strategies: StrategyRegistry) -> Self {
        Self {
            strategies,
            exchange: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Enable live bots.
    pub fn with_exchange(mut self, client: Arc<dyn ExchangeClient>, retry: RetryPolicy) -> Self {
        self.exchange = Some(client);
        self.retry = retry;
        self
    }
}

impl Default for DefaultEngineFactory {
    fn default() -> Self {
        Self::new(StrategyRegistry::with_builtin())
    }
}

impl EngineFactory for DefaultEngineFactory {
    fn build(&self, config: &BotConfig) -> Result<TradingEngine> {
        let strategy = self
            .strategies
            .build(&config.strategy)
            .with_context(|| format!("Failed to build strategy '{}'", config.strategy.name))?;

        let risk_manager = build_risk_manager(&config.risk)?;

        let execution: Box<dyn ExecutionHandler> = match config.mode {
            ExecutionMode::Paper => {
                Box::new(SimulatedExecutionHandler::new(config.execution.clone()))
            }
            ExecutionMode::Live => {
                let client = self
                    .exchange
                    .clone()
                    .ok_or_else(|| anyhow!("No exchange client configured for live trading"))?;
                Box::new(LiveExecutionHandler::new(client, self.retry.clone()))
            }
        };

        Ok(
            TradingEngine::new(&config.bot_id, config.initial_capital, risk_manager, execution)
                .with_strategy(strategy),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::config::tests::sample_config;
    use crate::engine::EngineState;

    #[test]
    fn test_builds_paper_engine() {
        let factory = DefaultEngineFactory::default();
        let engine = factory.build(&sample_config("alpha")).unwrap();
        assert_eq!(engine.bot_id(), "alpha");
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_live_without_exchange_fails() {
        let mut config = sample_config("alpha");
        config.mode = ExecutionMode::Live;
        assert!(DefaultEngineFactory::default().build(&config).is_err());
    }

    #[test]
    fn test_unknown_strategy_fails() {
        let mut config = sample_config("alpha");
        config.strategy.name = "martingale".to_string();
        let err = match DefaultEngineFactory::default().build(&config) {
            Ok(_) => panic!("unknown strategy must not build"),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("martingale"));
    }
}
