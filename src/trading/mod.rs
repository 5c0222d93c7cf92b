//! Trading pipeline components: strategies, risk sizing, execution, positions.

mod config;
mod execution;
mod position_tracker;
mod risk_manager;
mod strategy;

pub use config::{RiskConfig, SimulationConfig, SizingBase, SizingPolicy};
pub use execution::{
    ExchangeClient, ExchangeError, ExchangeFill, ExecutionError, ExecutionHandler,
    LiveExecutionHandler, RetryPolicy, SimulatedExecutionHandler,
};
pub use position_tracker::{PositionTracker, RealizedPnl};
pub use risk_manager::{
    build_risk_manager, EquityPercentageRiskManager, ExposureCappedRiskManager,
    FixedSizeRiskManager, OrderLimits, RiskBasedRiskManager, RiskError, RiskManager,
};
pub use strategy::{MaCrossover, MaCrossoverParams, Strategy, StrategyRegistry, StrategySpec};
