//! Data models for market events, orders, fills and positions.

mod events;
mod position;

pub use events::{
    FillEvent, MarketEvent, OrderDirection, OrderEvent, OrderType, SignalDirection, SignalEvent,
};
pub use position::Position;
