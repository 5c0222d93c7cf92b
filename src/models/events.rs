//! Event types flowing through the trading pipeline.
//!
//! MarketEvent -> SignalEvent -> OrderEvent -> FillEvent. All values are
//! immutable once built; prices and quantities are exact decimals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Market data update delivered to strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarketEvent {
    Quote {
        symbol: String,
        bid: Decimal,
        ask: Decimal,
        timestamp: DateTime<Utc>,
    },
    Trade {
        symbol: String,
        price: Decimal,
        size: Decimal,
        timestamp: DateTime<Utc>,
    },
    Bar {
        symbol: String,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        timestamp: DateTime<Utc>,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Quote { symbol, .. } | Self::Trade { symbol, .. } | Self::Bar { symbol, .. } => {
                symbol
            }
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Quote { timestamp, .. }
            | Self::Trade { timestamp, .. }
            | Self::Bar { timestamp, .. } => *timestamp,
        }
    }

    /// Reference price: bar close, trade price or quote mid.
    pub fn price(&self) -> Decimal {
        match self {
            Self::Quote { bid, ask, .. } => (*bid + *ask) / Decimal::TWO,
            Self::Trade { price, .. } => *price,
            Self::Bar { close, .. } => *close,
        }
    }
}

/// Direction a strategy wants to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalDirection {
    Long,
    Short,
    /// Flatten whatever position is open.
    Exit,
}

/// Trading intent emitted by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub symbol: String,
    pub direction: SignalDirection,

    /// Conviction in [0, 1], informational only
    pub strength: f64,

    /// Price the strategy observed when deciding
    pub price: Decimal,

    pub timestamp: DateTime<Utc>,
}

/// Side of an order or fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderDirection {
    Buy,
    Sell,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Buy => "BUY",
            OrderDirection::Sell => "SELL",
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            OrderDirection::Buy => Decimal::ONE,
            OrderDirection::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderDirection::Buy => OrderDirection::Sell,
            OrderDirection::Sell => OrderDirection::Buy,
        }
    }
}

impl std::fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
}

/// Sized order produced by the risk manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub direction: OrderDirection,

    /// Base-asset units, never collateral value
    pub quantity: Decimal,

    /// Reference price the order was sized at
    pub price: Decimal,

    pub timestamp: DateTime<Utc>,
}

impl OrderEvent {
    /// Collateral value of the order at its reference price.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Execution report for an order. Live fills may be partial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub symbol: String,
    pub direction: OrderDirection,
    pub quantity: Decimal,
    pub fill_price: Decimal,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl FillEvent {
    /// Quantity with sign applied: positive for buys.
    pub fn signed_quantity(&self) -> Decimal {
        self.quantity * self.direction.sign()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_event_price() {
        let ts = Utc::now();
        let quote = MarketEvent::Quote {
            symbol: "BTC".to_string(),
            bid: dec!(100),
            ask: dec!(102),
            timestamp: ts,
        };
        assert_eq!(quote.price(), dec!(101));
        assert_eq!(quote.symbol(), "BTC");
        assert_eq!(quote.timestamp(), ts);
    }

    #[test]
    fn test_market_event_json() {
        let json = r#"{"type":"bar","symbol":"SOL","open":"150","high":"155","low":"149","close":"152.5","volume":"1000","timestamp":"2024-01-01T00:00:00Z"}"#;
        let event: MarketEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.symbol(), "SOL");
        assert_eq!(event.price(), dec!(152.5));
    }

    #[test]
    fn test_signed_quantity() {
        let fill = FillEvent {
            order_id: "o1".to_string(),
            symbol: "ETH".to_string(),
            direction: OrderDirection::Sell,
            quantity: dec!(2),
            fill_price: dec!(3000),
            commission: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        assert_eq!(fill.signed_quantity(), dec!(-2));
        assert_eq!(OrderDirection::Sell.opposite(), OrderDirection::Buy);
    }
}
