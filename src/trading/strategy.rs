//! Strategy capability and the registry that builds strategies from config.
//!
//! The engine only depends on the [`Strategy`] trait. Concrete strategies are
//! registered by name and constructed from their opaque JSON parameters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{MarketEvent, SignalDirection, SignalEvent};

/// Produces trading signals from market data.
pub trait Strategy: Send {
    fn on_market_event(&mut self, event: &MarketEvent) -> Result<Option<SignalEvent>>;

    fn name(&self) -> &str;
}

/// Strategy selection stored inside a bot config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,

    /// Opaque to everything except the strategy's constructor
    #[serde(default)]
    pub params: serde_json::Value,
}

type StrategyConstructor = dyn Fn(&serde_json::Value) -> Result<Box<dyn Strategy>> + Send + Sync;

/// Named strategy constructors.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    constructors: HashMap<String, Arc<StrategyConstructor>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategies.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("ma_crossover", |params| {
            let params: MaCrossoverParams = serde_json::from_value(params.clone())
                .context("Invalid ma_crossover parameters")?;
            Ok(Box::new(MaCrossover::new(params)?) as Box<dyn Strategy>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Strategy>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Arc::new(constructor));
    }

    pub fn build(&self, spec: &StrategySpec) -> Result<Box<dyn Strategy>> {
        let constructor = self
            .constructors
            .get(&spec.name)
            .ok_or_else(|| anyhow!("Unknown strategy '{}'", spec.name))?;
        constructor(&spec.params)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaCrossoverParams {
    pub symbol: String,
    pub fast_period: usize,
    pub slow_period: usize,
}

/// Moving-average crossover. Signals only when the fast/slow ordering flips.
pub struct MaCrossover {
    params: MaCrossoverParams,
    fast: VecDeque<Decimal>,
    slow: VecDeque<Decimal>,
    last_direction: Option<SignalDirection>,
}

impl MaCrossover {
    pub fn new(params: MaCrossoverParams) -> Result<Self> {
        if params.fast_period == 0 || params.fast_period >= params.slow_period {
            return Err(anyhow!(
                "fast_period ({}) must be positive and below slow_period ({})",
                params.fast_period,
                params.slow_period
            ));
        }
        Ok(Self {
            fast: VecDeque::with_capacity(params.fast_period + 1),
            slow: VecDeque::with_capacity(params.slow_period + 1),
            params,
            last_direction: None,
        })
    }

    fn push(window: &mut VecDeque<Decimal>, period: usize, price: Decimal) {
        window.push_back(price);
        if window.len() > period {
            window.pop_front();
        }
    }

    fn mean(window: &VecDeque<Decimal>) -> Decimal {
        window.iter().sum::<Decimal>() / Decimal::from(window.len())
    }
}

impl Strategy for MaCrossover {
    fn on_market_event(&mut self, event: &MarketEvent) -> Result<Option<SignalEvent>> {
        // Quotes are too noisy for this one
        if matches!(event, MarketEvent::Quote { .. }) || event.symbol() != self.params.symbol {
            return Ok(None);
        }

        let price = event.price();
        Self::push(&mut self.fast, self.params.fast_period, price);
        Self::push(&mut self.slow, self.params.slow_period, price);

        if self.slow.len() < self.params.slow_period {
            return Ok(None);
        }

        let fast_ma = Self::mean(&self.fast);
        let slow_ma = Self::mean(&self.slow);
        let direction = match fast_ma.cmp(&slow_ma) {
            std::cmp::Ordering::Greater => SignalDirection::Long,
            std::cmp::Ordering::Less => SignalDirection::Short,
            std::cmp::Ordering::Equal => return Ok(None),
        };

        if self.last_direction == Some(direction) {
            return Ok(None);
        }
        self.last_direction = Some(direction);

        Ok(Some(SignalEvent {
            symbol: self.params.symbol.clone(),
            direction,
            strength: 1.0,
            price,
            timestamp: event.timestamp(),
        }))
    }

    fn name(&self) -> &str {
        "ma_crossover"
    }
}
