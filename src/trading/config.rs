//! Risk and execution configuration.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Which equity figure position sizing is based on during drawdowns.
///
/// There is no default: every bot config has to choose one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizingBase {
    /// Size off the latest equity curve value
    CurrentEquity,
    /// Size off `max(equity, initial_capital)` while equity is positive
    InitialCapitalFloor { initial_capital: Decimal },
}

impl SizingBase {
    /// Equity figure to size from, or `None` when trading must be skipped.
    pub fn sizing_equity(&self, account_equity: Decimal) -> Option<Decimal> {
        if account_equity <= Decimal::ZERO {
            return None;
        }
        match self {
            SizingBase::CurrentEquity => Some(account_equity),
            SizingBase::InitialCapitalFloor { initial_capital } => {
                Some(account_equity.max(*initial_capital))
            }
        }
    }
}

impl std::fmt::Display for SizingBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizingBase::CurrentEquity => write!(f, "current equity"),
            SizingBase::InitialCapitalFloor { initial_capital } => {
                write!(f, "initial capital floor (${})", initial_capital)
            }
        }
    }
}

/// Position sizing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizingPolicy {
    /// Fixed fraction of equity, capped at `max_position_value`
    EquityPercentage { position_size_pct: Decimal },
    /// Risk a fraction of equity against a stop distance
    RiskBased {
        risk_per_trade_pct: Decimal,
        stop_loss_pct: Decimal,
    },
    /// Constant quantity in base-asset units
    FixedSize { quantity: Decimal },
}

impl std::fmt::Display for SizingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizingPolicy::EquityPercentage { position_size_pct } => {
                write!(f, "equity percentage ({}%)", position_size_pct * dec!(100))
            }
            SizingPolicy::RiskBased {
                risk_per_trade_pct,
                stop_loss_pct,
            } => write!(
                f,
                "risk based ({}% risk, {}% stop)",
                risk_per_trade_pct * dec!(100),
                stop_loss_pct * dec!(100)
            ),
            SizingPolicy::FixedSize { quantity } => write!(f, "fixed size ({})", quantity),
        }
    }
}

/// Configuration for converting signals into sized orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Sizing algorithm
    pub policy: SizingPolicy,

    /// Equity base for sizing
    pub sizing_base: SizingBase,

    /// Hard cap on a single entry's notional
    pub max_position_value: Decimal,

    /// Entries below this notional are skipped
    #[serde(default)]
    pub min_notional: Decimal,

    /// Quantity granularity accepted by the venue
    pub lot_size: Decimal,

    /// Cap on aggregate open notional across symbols (portfolio-aware sizing)
    #[serde(default)]
    pub max_total_exposure: Option<Decimal>,

    /// Emit limit orders this many bps through the signal price instead of market orders
    #[serde(default)]
    pub limit_offset_bps: Option<Decimal>,
}

impl RiskConfig {
    /// Baseline equity-percentage config with an explicit sizing base.
    pub fn equity_percentage(sizing_base: SizingBase) -> Self {
        Self {
            policy: SizingPolicy::EquityPercentage {
                position_size_pct: dec!(0.05), // 5% of equity per entry
            },
            sizing_base,
            max_position_value: dec!(5000),
            min_notional: dec!(10),
            lot_size: dec!(0.00001),
            max_total_exposure: None,
            limit_offset_bps: None,
        }
    }

    /// Reject configs that would produce nonsensical orders.
    pub fn validate(&self) -> Result<()> {
        if self.lot_size <= Decimal::ZERO {
            bail!("lot_size must be positive, got {}", self.lot_size);
        }
        if self.min_notional < Decimal::ZERO {
            bail!("min_notional must not be negative, got {}", self.min_notional);
        }
        if self.max_position_value <= Decimal::ZERO {
            bail!("max_position_value must be positive, got {}", self.max_position_value);
        }
        if let Some(cap) = self.max_total_exposure {
            if cap <= Decimal::ZERO {
                bail!("max_total_exposure must be positive, got {}", cap);
            }
        }
        if let Some(bps) = self.limit_offset_bps {
            if bps < Decimal::ZERO || bps >= dec!(10000) {
                bail!("limit_offset_bps must be in [0, 10000), got {}", bps);
            }
        }
        if let SizingBase::InitialCapitalFloor { initial_capital } = self.sizing_base {
            if initial_capital <= Decimal::ZERO {
                bail!("initial capital floor must be positive, got {}", initial_capital);
            }
        }

        match &self.policy {
            SizingPolicy::EquityPercentage { position_size_pct } => {
                if *position_size_pct <= Decimal::ZERO || *position_size_pct > Decimal::ONE {
                    bail!("position_size_pct must be in (0, 1], got {}", position_size_pct);
                }
            }
            SizingPolicy::RiskBased {
                risk_per_trade_pct,
                stop_loss_pct,
            } => {
                if *risk_per_trade_pct <= Decimal::ZERO || *risk_per_trade_pct > Decimal::ONE {
                    bail!("risk_per_trade_pct must be in (0, 1], got {}", risk_per_trade_pct);
                }
                if *stop_loss_pct <= Decimal::ZERO || *stop_loss_pct > Decimal::ONE {
                    bail!("stop_loss_pct must be in (0, 1], got {}", stop_loss_pct);
                }
            }
            SizingPolicy::FixedSize { quantity } => {
                if *quantity <= Decimal::ZERO {
                    bail!("fixed quantity must be positive, got {}", quantity);
                }
            }
        }

        Ok(())
    }
}

/// Slippage and commission model for simulated fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Adverse price move applied to market orders, in basis points
    pub slippage_bps: Decimal,

    /// Commission as a fraction of fill notional
    pub commission_rate: Decimal,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            slippage_bps: dec!(10),            // 0.1% slippage
            commission_rate: dec!(0.00025),    // 2.5 bps taker fee
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slippage_bps < Decimal::ZERO || self.slippage_bps >= dec!(10000) {
            bail!("slippage_bps must be in [0, 10000), got {}", self.slippage_bps);
        }
        if self.commission_rate < Decimal::ZERO || self.commission_rate >= Decimal::ONE {
            bail!("commission_rate must be in [0, 1), got {}", self.commission_rate);
        }
        Ok(())
    }
}
