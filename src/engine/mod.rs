//! Trading engine: the per-bot event loop.
//!
//! One code path for backtests and live trading:
//! MarketEvent -> Strategy -> RiskManager -> ExecutionHandler -> PositionTracker
//! -> equity curve. Sizing for a signal only ever sees equity from earlier fills.

mod equity;

pub use equity::{EquityCurve, EquityPoint};

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::data::DataProvider;
use crate::metrics::{MarketTracker, MetricsCalculator, PerformanceMetrics};
use crate::models::{FillEvent, MarketEvent, OrderEvent, Position, SignalEvent};
use crate::trading::{
    ExecutionError, ExecutionHandler, PositionTracker, RealizedPnl, RiskManager, Strategy,
};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Running,
    /// Keeps strategies, positions and equity but accepts no events
    Paused,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("engine is {0}, not accepting events")]
    NotRunning(EngineState),
}

/// Everything that happened while processing one market event.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub signals: Vec<SignalEvent>,
    pub orders: Vec<OrderEvent>,
    pub fills: Vec<FillEvent>,
    pub realized: Vec<RealizedPnl>,
    pub rejections: Vec<ExecutionError>,

    /// Event arrived out of timestamp order and was ignored
    pub stale: bool,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.orders.is_empty() && self.rejections.is_empty()
    }
}

/// Point-in-time view of an engine for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub equity: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: usize,
    pub fills: usize,
    pub rejections: usize,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Per-bot trading engine. Exclusively owns its strategies, positions and equity.
pub struct TradingEngine {
    bot_id: String,
    strategies: Vec<Box<dyn Strategy>>,
    risk_manager: Box<dyn RiskManager>,
    execution: Box<dyn ExecutionHandler>,
    positions: PositionTracker,
    equity_curve: EquityCurve,
    state: EngineState,

    // Bookkeeping
    last_event_at: Option<DateTime<Utc>>,
    market: MarketTracker,
    realized: Vec<Decimal>,
    total_commission: Decimal,
    fills: usize,
    rejections: usize,
}

impl TradingEngine {
    pub fn new(
        bot_id: impl Into<String>,
        initial_capital: Decimal,
        risk_manager: Box<dyn RiskManager>,
        execution: Box<dyn ExecutionHandler>,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            strategies: Vec::new(),
            risk_manager,
            execution,
            positions: PositionTracker::new(),
            equity_curve: EquityCurve::new(initial_capital, Utc::now()),
            state: EngineState::Idle,
            last_event_at: None,
            market: MarketTracker::new(),
            realized: Vec::new(),
            total_commission: Decimal::ZERO,
            fills: 0,
            rejections: 0,
        }
    }

    /// Attach a strategy. Strategies are evaluated in attachment order.
    pub fn with_strategy(mut self, strategy: Box<dyn Strategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn add_strategy(&mut self, strategy: Box<dyn Strategy>) {
        self.strategies.push(strategy);
    }

    pub fn start(&mut self) {
        if self.state == EngineState::Idle {
            info!(
                bot_id = %self.bot_id,
                strategies = self.strategies.len(),
                risk = self.risk_manager.name(),
                execution = self.execution.name(),
                "Engine started"
            );
            self.state = EngineState::Running;
        }
    }

    /// Running -> Paused. Returns whether the state changed.
    pub fn pause(&mut self) -> bool {
        if self.state != EngineState::Running {
            return false;
        }
        info!(bot_id = %self.bot_id, "Engine paused");
        self.state = EngineState::Paused;
        true
    }

    /// Paused -> Running. Returns whether the state changed.
    pub fn resume(&mut self) -> bool {
        if self.state != EngineState::Paused {
            return false;
        }
        info!(bot_id = %self.bot_id, "Engine resumed");
        self.state = EngineState::Running;
        true
    }

    /// Stop accepting events. The event in progress, if any, has already completed
    /// because processing takes `&mut self`.
    pub fn stop(&mut self) {
        if self.state != EngineState::Stopped {
            info!(bot_id = %self.bot_id, equity = %self.equity_curve.last(), "Engine stopped");
            self.state = EngineState::Stopped;
        }
    }

    /// Run one market event through the full pipeline.
    pub async fn process_market_event(
        &mut self,
        event: &MarketEvent,
    ) -> Result<CycleReport, EngineError> {
        if self.state != EngineState::Running {
            return Err(EngineError::NotRunning(self.state));
        }

        let mut report = CycleReport::default();

        // 1. Enforce timestamp order per bot
        let ts = event.timestamp();
        if let Some(last) = self.last_event_at {
            if ts < last {
                warn!(
                    bot_id = %self.bot_id,
                    symbol = %event.symbol(),
                    event_at = %ts,
                    last_at = %last,
                    "Dropping out-of-order market event"
                );
                report.stale = true;
                return Ok(report);
            }
        }
        self.last_event_at = Some(ts);
        let in_position = !self.positions.all_positions().is_empty();
        self.market.record(event.symbol(), event.price(), in_position);

        // 2. Strategies
        for strategy in self.strategies.iter_mut() {
            match strategy.on_market_event(event) {
                Ok(Some(signal)) => report.signals.push(signal),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        bot_id = %self.bot_id,
                        strategy = %strategy.name(),
                        error = %e,
                        "Strategy failed on market event"
                    );
                }
            }
        }

        // 3-5. Each signal is sized against equity from fills strictly before it
        for signal in &report.signals {
            let equity = self.equity_curve.last();
            let order = match self
                .risk_manager
                .evaluate(signal, equity, self.positions.all_positions())
            {
                Ok(Some(order)) => order,
                Ok(None) => {
                    debug!(bot_id = %self.bot_id, symbol = %signal.symbol, "Signal produced no order");
                    continue;
                }
                Err(e) => {
                    warn!(bot_id = %self.bot_id, error = %e, "Risk evaluation failed");
                    continue;
                }
            };

            report.orders.push(order.clone());

            let fill = match self.execution.execute_order(&order).await {
                Ok(fill) => fill,
                Err(e) => {
                    warn!(bot_id = %self.bot_id, error = %e, "Order not executed");
                    self.rejections += 1;
                    report.rejections.push(e);
                    continue;
                }
            };

            if let Some(realized) = self.apply_fill(&fill) {
                report.realized.push(realized);
            }
            report.fills.push(fill);
        }

        Ok(report)
    }

    /// Feed a fill to the tracker and append the resulting equity.
    fn apply_fill(&mut self, fill: &FillEvent) -> Option<RealizedPnl> {
        let realized = self.positions.process_fill(fill);
        let pnl = realized.as_ref().map(|r| r.pnl).unwrap_or(Decimal::ZERO);

        let equity = self.equity_curve.last() + pnl - fill.commission;
        self.equity_curve.push(fill.timestamp, equity);

        self.fills += 1;
        self.total_commission += fill.commission;
        if let Some(r) = &realized {
            self.realized.push(r.pnl);
        }

        info!(
            bot_id = %self.bot_id,
            symbol = %fill.symbol,
            side = %fill.direction,
            quantity = %fill.quantity,
            price = %fill.fill_price,
            equity = %equity,
            "Fill applied"
        );

        realized
    }

    /// Prime the strategies with history before the engine starts. Signals are
    /// discarded: no orders, no fills, equity untouched. Returns the number of
    /// events replayed.
    pub async fn warmup<D>(&mut self, provider: &mut D) -> Result<usize>
    where
        D: DataProvider + ?Sized,
    {
        if self.state != EngineState::Idle {
            anyhow::bail!("warmup requires an idle engine, engine is {}", self.state);
        }

        let mut replayed = 0usize;
        while let Some(event) = provider
            .next_event()
            .await
            .map_err(|e| e.context("Warmup data provider failed"))?
        {
            for strategy in self.strategies.iter_mut() {
                if let Err(e) = strategy.on_market_event(&event) {
                    warn!(
                        bot_id = %self.bot_id,
                        strategy = %strategy.name(),
                        error = %e,
                        "Strategy failed during warmup"
                    );
                }
            }
            replayed += 1;
        }

        info!(bot_id = %self.bot_id, events = replayed, "Strategies warmed up");
        Ok(replayed)
    }

    /// Drain a finite provider through the engine and report performance.
    pub async fn run<D>(&mut self, provider: &mut D) -> Result<PerformanceMetrics>
    where
        D: DataProvider + ?Sized,
    {
        self.start();

        let mut processed = 0usize;
        loop {
            let event = match provider.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    self.stop();
                    return Err(e.context("Market data provider failed"));
                }
            };
            self.process_market_event(&event).await?;
            processed += 1;
        }

        self.stop();
        debug!(bot_id = %self.bot_id, events = processed, "Market data exhausted");
        Ok(self.metrics())
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        MetricsCalculator::calculate(
            self.equity_curve.points(),
            &self.realized,
            self.total_commission,
            self.fills,
            self.rejections,
            &self.market,
        )
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state,
            equity: self.equity_curve.last(),
            unrealized_pnl: self.positions.unrealized_pnl(self.market.last_prices()),
            open_positions: self.positions.open_count(),
            fills: self.fills,
            rejections: self.rejections,
            last_event_at: self.last_event_at,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn equity_curve(&self) -> &EquityCurve {
        &self.equity_curve
    }

    pub fn current_equity(&self) -> Decimal {
        self.equity_curve.last()
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        self.positions.all_positions()
    }
}
