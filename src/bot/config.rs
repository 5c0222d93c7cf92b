//! Persisted bot configuration.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::HistoricalDataProvider;
use crate::trading::{RiskConfig, SimulationConfig, StrategySpec};

/// Where a bot's orders go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Simulated fills against live market data
    #[default]
    Paper,
    /// Orders submitted through an exchange adapter
    Live,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Paper => write!(f, "paper"),
            ExecutionMode::Live => write!(f, "live"),
        }
    }
}

/// History replayed through a bot's strategies before it trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// JSON-lines market events
    pub path: PathBuf,

    /// Most recent events to replay; all when absent
    #[serde(default)]
    pub periods: Option<usize>,
}

impl WarmupConfig {
    /// Load the warmup history, trimmed to `periods`.
    pub fn provider(&self) -> Result<HistoricalDataProvider> {
        let provider = HistoricalDataProvider::from_json_lines(&self.path)
            .context("Failed to load warmup history")?;
        Ok(match self.periods {
            Some(n) => provider.keep_last(n),
            None => provider,
        })
    }
}

/// Bot configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    /// Unique bot id; generated on create when empty
    #[serde(default)]
    pub bot_id: String,

    /// Bumped by every successful config update
    #[serde(default = "default_version")]
    pub version: i64,

    /// Disabled bots are never restarted on recovery
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub mode: ExecutionMode,

    /// Symbols the bot reacts to; empty means all
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Starting equity in collateral currency
    pub initial_capital: Decimal,

    pub strategy: StrategySpec,

    pub risk: RiskConfig,

    #[serde(default)]
    pub execution: SimulationConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup: Option<WarmupConfig>,
}

fn default_version() -> i64 {
    1
}

fn default_enabled() -> bool {
    true
}

impl BotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bot_id.trim().is_empty() {
            bail!("bot_id must not be empty");
        }
        if self.initial_capital <= Decimal::ZERO {
            bail!("initial_capital must be positive, got {}", self.initial_capital);
        }
        if self.strategy.name.trim().is_empty() {
            bail!("strategy name must not be empty");
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            bail!("symbols must not contain empty entries");
        }
        self.risk.validate().context("Invalid risk config")?;
        self.execution.validate().context("Invalid execution config")?;
        if let Some(warmup) = &self.warmup {
            if warmup.path.as_os_str().is_empty() {
                bail!("warmup path must not be empty");
            }
            if warmup.periods == Some(0) {
                bail!("warmup periods must be positive");
            }
        }
        Ok(())
    }

    /// Whether a market event for `symbol` is routed to this bot.
    pub fn trades_symbol(&self, symbol: &str) -> bool {
        self.symbols.is_empty() || self.symbols.iter().any(|s| s == symbol)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize bot config")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse bot config")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::trading::SizingBase;
    use rust_decimal_macros::dec;

    /// Paper bot on SOL with a fast crossover.
    pub(crate) fn sample_config(bot_id: &str) -> BotConfig {
        BotConfig {
            bot_id: bot_id.to_string(),
            version: 1,
            enabled: true,
            mode: ExecutionMode::Paper,
            symbols: vec!["SOL".to_string()],
            initial_capital: dec!(1000),
            strategy: StrategySpec {
                name: "ma_crossover".to_string(),
                params: serde_json::json!({
                    "symbol": "SOL",
                    "fast_period": 2,
                    "slow_period": 3,
                }),
            },
            risk: RiskConfig::equity_percentage(SizingBase::CurrentEquity),
            execution: SimulationConfig::default(),
            warmup: None,
        }
    }

    #[test]
    fn test_json_round_trip_preserves_config() {
        let config = sample_config("alpha");
        let parsed = BotConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "initial_capital": "500",
            "strategy": {"name": "ma_crossover"},
            "risk": {
                "policy": {"kind": "fixed_size", "quantity": "1"},
                "sizing_base": {"kind": "current_equity"},
                "max_position_value": "1000",
                "lot_size": "0.01"
            }
        }"#;
        let config = BotConfig::from_json(json).unwrap();
        assert!(config.bot_id.is_empty());
        assert_eq!(config.version, 1);
        assert!(config.enabled);
        assert_eq!(config.mode, ExecutionMode::Paper);
        assert_eq!(config.execution, SimulationConfig::default());
        assert!(config.warmup.is_none());
    }

    #[test]
    fn test_missing_sizing_base_is_rejected() {
        let json = r#"{
            "bot_id": "alpha",
            "initial_capital": "500",
            "strategy": {"name": "ma_crossover"},
            "risk": {
                "policy": {"kind": "fixed_size", "quantity": "1"},
                "max_position_value": "1000",
                "lot_size": "0.01"
            }
        }"#;
        assert!(BotConfig::from_json(json).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(sample_config("alpha").validate().is_ok());
        assert!(sample_config("").validate().is_err());

        let mut config = sample_config("alpha");
        config.initial_capital = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = sample_config("alpha");
        config.risk.lot_size = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = sample_config("alpha");
        config.warmup = Some(WarmupConfig {
            path: PathBuf::from("history.jsonl"),
            periods: Some(0),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_symbol_filter() {
        let mut config = sample_config("alpha");
        assert!(config.trades_symbol("SOL"));
        assert!(!config.trades_symbol("BTC"));

        config.symbols.clear();
        assert!(config.trades_symbol("BTC"));
    }
}
