//! Market-side bookkeeping for benchmark and exposure metrics.

use std::collections::HashMap;

use rust_decimal::Decimal;

/// First and last price per symbol plus how many events saw an open position.
#[derive(Debug, Clone, Default)]
pub struct MarketTracker {
    first_prices: HashMap<String, Decimal>,
    last_prices: HashMap<String, Decimal>,
    events: usize,
    events_in_position: usize,
}

impl MarketTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one processed event. `in_position` is whether any position was
    /// open when the event arrived.
    pub fn record(&mut self, symbol: &str, price: Decimal, in_position: bool) {
        self.first_prices.entry(symbol.to_string()).or_insert(price);
        self.last_prices.insert(symbol.to_string(), price);

        self.events += 1;
        if in_position {
            self.events_in_position += 1;
        }
    }

    /// Latest price per symbol, used to mark open positions.
    pub fn last_prices(&self) -> &HashMap<String, Decimal> {
        &self.last_prices
    }

    /// Equal-weighted return of holding every traded symbol from its first
    /// to its last observed price.
    pub fn buy_hold_return(&self) -> Decimal {
        let returns: Vec<Decimal> = self
            .first_prices
            .iter()
            .filter(|(_, first)| **first > Decimal::ZERO)
            .filter_map(|(symbol, first)| {
                let last = self.last_prices.get(symbol)?;
                Some((*last - *first) / *first)
            })
            .collect();

        if returns.is_empty() {
            return Decimal::ZERO;
        }
        returns.iter().copied().sum::<Decimal>() / Decimal::from(returns.len())
    }

    /// Fraction of events during which a position was open.
    pub fn exposure_time(&self) -> f64 {
        if self.events == 0 {
            0.0
        } else {
            self.events_in_position as f64 / self.events as f64
        }
    }

    pub fn events(&self) -> usize {
        self.events
    }
}
