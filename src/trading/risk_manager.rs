//! Risk managers: turn a signal plus account state into a sized order.
//!
//! Every variant is a pure function of its inputs. "No trade" is `Ok(None)`;
//! errors are reserved for malformed signals.

use std::collections::HashMap;

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::debug;

use super::config::{RiskConfig, SizingBase, SizingPolicy};
use crate::models::{OrderDirection, OrderEvent, OrderType, Position, SignalDirection, SignalEvent};

/// Malformed input to a risk manager.
#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("non-positive price {price} in signal for {symbol}")]
    InvalidPrice { symbol: String, price: Decimal },

    #[error("malformed signal: {0}")]
    InvalidSignal(String),
}

/// Converts signals into orders sized in base-asset units.
pub trait RiskManager: Send + Sync {
    fn evaluate(
        &self,
        signal: &SignalEvent,
        account_equity: Decimal,
        positions: &HashMap<String, Position>,
    ) -> Result<Option<OrderEvent>, RiskError>;

    fn name(&self) -> &'static str;
}

/// Limits shared by every sizing variant.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLimits {
    pub sizing_base: SizingBase,
    pub max_position_value: Decimal,
    pub min_notional: Decimal,
    pub lot_size: Decimal,
    pub limit_offset_bps: Option<Decimal>,
}

impl OrderLimits {
    fn from_config(config: &RiskConfig) -> Self {
        Self {
            sizing_base: config.sizing_base,
            max_position_value: config.max_position_value,
            min_notional: config.min_notional,
            lot_size: config.lot_size,
            limit_offset_bps: config.limit_offset_bps,
        }
    }

    /// Round a quantity down to the lot granularity. `None` on overflow.
    pub fn floor_to_lot(&self, quantity: Decimal) -> Option<Decimal> {
        if self.lot_size <= Decimal::ZERO {
            return Some(quantity);
        }
        quantity
            .checked_div(self.lot_size)?
            .floor()
            .checked_mul(self.lot_size)
    }
}

fn sizing_overflow(signal: &SignalEvent) -> RiskError {
    RiskError::InvalidSignal(format!("order size for {} overflows", signal.symbol))
}

/// Fixed fraction of equity per entry.
#[derive(Debug, Clone)]
pub struct EquityPercentageRiskManager {
    pub position_size_pct: Decimal,
    pub limits: OrderLimits,
}

impl RiskManager for EquityPercentageRiskManager {
    fn evaluate(
        &self,
        signal: &SignalEvent,
        account_equity: Decimal,
        positions: &HashMap<String, Position>,
    ) -> Result<Option<OrderEvent>, RiskError> {
        evaluate_with(&self.limits, signal, account_equity, positions, |equity| {
            equity.checked_mul(self.position_size_pct)
        })
    }

    fn name(&self) -> &'static str {
        "equity_percentage"
    }
}

/// Sizes so that hitting the stop loses `risk_per_trade_pct` of equity.
#[derive(Debug, Clone)]
pub struct RiskBasedRiskManager {
    pub risk_per_trade_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub limits: OrderLimits,
}

impl RiskManager for RiskBasedRiskManager {
    fn evaluate(
        &self,
        signal: &SignalEvent,
        account_equity: Decimal,
        positions: &HashMap<String, Position>,
    ) -> Result<Option<OrderEvent>, RiskError> {
        evaluate_with(&self.limits, signal, account_equity, positions, |equity| {
            if self.stop_loss_pct <= Decimal::ZERO {
                return Some(Decimal::ZERO);
            }
            equity
                .checked_mul(self.risk_per_trade_pct)?
                .checked_div(self.stop_loss_pct)
        })
    }

    fn name(&self) -> &'static str {
        "risk_based"
    }
}

/// Constant quantity per entry.
#[derive(Debug, Clone)]
pub struct FixedSizeRiskManager {
    pub quantity: Decimal,
    pub limits: OrderLimits,
}

impl RiskManager for FixedSizeRiskManager {
    fn evaluate(
        &self,
        signal: &SignalEvent,
        account_equity: Decimal,
        positions: &HashMap<String, Position>,
    ) -> Result<Option<OrderEvent>, RiskError> {
        let notional = self.quantity.checked_mul(signal.price);
        evaluate_with(&self.limits, signal, account_equity, positions, |_| notional)
    }

    fn name(&self) -> &'static str {
        "fixed_size"
    }
}

/// Portfolio-aware wrapper capping aggregate open notional across symbols.
pub struct ExposureCappedRiskManager<R> {
    inner: R,
    max_total_exposure: Decimal,
    limits: OrderLimits,
}

impl<R: RiskManager> ExposureCappedRiskManager<R> {
    pub fn new(inner: R, max_total_exposure: Decimal, limits: OrderLimits) -> Self {
        Self {
            inner,
            max_total_exposure,
            limits,
        }
    }
}

impl<R: RiskManager> RiskManager for ExposureCappedRiskManager<R> {
    fn evaluate(
        &self,
        signal: &SignalEvent,
        account_equity: Decimal,
        positions: &HashMap<String, Position>,
    ) -> Result<Option<OrderEvent>, RiskError> {
        let Some(mut order) = self.inner.evaluate(signal, account_equity, positions)? else {
            return Ok(None);
        };

        let existing = positions.get(&order.symbol);
        let existing_qty = existing.map(|p| p.quantity).unwrap_or(Decimal::ZERO);
        let opposes = !existing_qty.is_zero()
            && existing_qty.is_sign_negative() != order.direction.sign().is_sign_negative();

        let closing = if opposes {
            existing_qty.abs().min(order.quantity)
        } else {
            Decimal::ZERO
        };
        let opening = order.quantity - closing;
        if opening.is_zero() {
            // Pure reduction never adds exposure
            return Ok(Some(order));
        }

        let freed = existing.map(|p| p.avg_price * closing).unwrap_or(Decimal::ZERO);
        let exposure: Decimal = positions.values().map(Position::notional).sum::<Decimal>() - freed;
        let room = self.max_total_exposure - exposure;

        let mut allowed_open = if room > Decimal::ZERO {
            room.checked_div(order.price)
                .and_then(|quantity| self.limits.floor_to_lot(quantity))
                .ok_or_else(|| sizing_overflow(signal))?
                .min(opening)
        } else {
            Decimal::ZERO
        };
        if allowed_open
            .checked_mul(order.price)
            .map_or(true, |notional| notional < self.limits.min_notional)
        {
            allowed_open = Decimal::ZERO;
        }

        if allowed_open < opening {
            debug!(
                symbol = %order.symbol,
                exposure = %exposure,
                cap = %self.max_total_exposure,
                requested = %opening,
                allowed = %allowed_open,
                "Entry reduced by exposure cap"
            );
        }

        order.quantity = closing + allowed_open;
        if order.quantity.is_zero() {
            return Ok(None);
        }
        Ok(Some(order))
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Build the risk manager described by a config.
pub fn build_risk_manager(config: &RiskConfig) -> Result<Box<dyn RiskManager>> {
    config.validate()?;
    let limits = OrderLimits::from_config(config);

    let cap = config.max_total_exposure;

    let manager = match &config.policy {
        SizingPolicy::EquityPercentage { position_size_pct } => {
            let inner = EquityPercentageRiskManager {
                position_size_pct: *position_size_pct,
                limits: limits.clone(),
            };
            wrap(inner, cap, limits)
        }
        SizingPolicy::RiskBased {
            risk_per_trade_pct,
            stop_loss_pct,
        } => {
            let inner = RiskBasedRiskManager {
                risk_per_trade_pct: *risk_per_trade_pct,
                stop_loss_pct: *stop_loss_pct,
                limits: limits.clone(),
            };
            wrap(inner, cap, limits)
        }
        SizingPolicy::FixedSize { quantity } => {
            let inner = FixedSizeRiskManager {
                quantity: *quantity,
                limits: limits.clone(),
            };
            wrap(inner, cap, limits)
        }
    };

    Ok(manager)
}

fn wrap<R: RiskManager + 'static>(
    inner: R,
    cap: Option<Decimal>,
    limits: OrderLimits,
) -> Box<dyn RiskManager> {
    match cap {
        Some(cap) => Box::new(ExposureCappedRiskManager::new(inner, cap, limits)),
        None => Box::new(inner),
    }
}

/// Shared evaluation: validation, exits, reversals, caps and lot rounding.
/// `entry_value` maps the sizing equity to a target notional, `None` when the
/// arithmetic overflows.
fn evaluate_with(
    limits: &OrderLimits,
    signal: &SignalEvent,
    account_equity: Decimal,
    positions: &HashMap<String, Position>,
    entry_value: impl Fn(Decimal) -> Option<Decimal>,
) -> Result<Option<OrderEvent>, RiskError> {
    validate_signal(signal)?;

    let existing = positions.get(&signal.symbol).filter(|p| !p.quantity.is_zero());

    let direction = match signal.direction {
        SignalDirection::Exit => {
            return Ok(existing.map(|pos| {
                let direction = if pos.is_long() {
                    OrderDirection::Sell
                } else {
                    OrderDirection::Buy
                };
                build_order(limits, signal, direction, pos.quantity.abs())
            }));
        }
        SignalDirection::Long => OrderDirection::Buy,
        SignalDirection::Short => OrderDirection::Sell,
    };

    let Some(sizing_equity) = limits.sizing_base.sizing_equity(account_equity) else {
        debug!(symbol = %signal.symbol, equity = %account_equity, "Non-positive equity, skipping entry");
        return Ok(None);
    };

    let position_value = entry_value(sizing_equity)
        .ok_or_else(|| sizing_overflow(signal))?
        .min(limits.max_position_value);
    if position_value <= Decimal::ZERO || position_value < limits.min_notional {
        debug!(
            symbol = %signal.symbol,
            position_value = %position_value,
            min_notional = %limits.min_notional,
            "Entry below minimum notional, skipping"
        );
        return Ok(None);
    }

    let entry_quantity = position_value
        .checked_div(signal.price)
        .and_then(|quantity| limits.floor_to_lot(quantity))
        .ok_or_else(|| sizing_overflow(signal))?;
    if entry_quantity <= Decimal::ZERO {
        return Ok(None);
    }

    // Reversal: close the opposing leg and open the new one in a single order
    let closing_quantity = match existing {
        Some(pos) if pos.quantity.is_sign_negative() != direction.sign().is_sign_negative() => {
            pos.quantity.abs()
        }
        _ => Decimal::ZERO,
    };

    let quantity = entry_quantity
        .checked_add(closing_quantity)
        .ok_or_else(|| sizing_overflow(signal))?;
    Ok(Some(build_order(limits, signal, direction, quantity)))
}

fn validate_signal(signal: &SignalEvent) -> Result<(), RiskError> {
    if signal.symbol.trim().is_empty() {
        return Err(RiskError::InvalidSignal("empty symbol".to_string()));
    }
    if signal.price <= Decimal::ZERO {
        return Err(RiskError::InvalidPrice {
            symbol: signal.symbol.clone(),
            price: signal.price,
        });
    }
    if !signal.strength.is_finite() {
        return Err(RiskError::InvalidSignal(format!(
            "strength {} is not finite",
            signal.strength
        )));
    }
    Ok(())
}

fn build_order(
    limits: &OrderLimits,
    signal: &SignalEvent,
    direction: OrderDirection,
    quantity: Decimal,
) -> OrderEvent {
    let order_type = match limits.limit_offset_bps {
        Some(bps) => {
            let offset = signal.price * bps / dec!(10000);
            let price = match direction {
                OrderDirection::Buy => signal.price - offset,
                OrderDirection::Sell => signal.price + offset,
            };
            OrderType::Limit { price }
        }
        None => OrderType::Market,
    };

    OrderEvent {
        order_id: format!(
            "{}-{}-{}",
            signal.symbol,
            direction.as_str(),
            signal.timestamp.timestamp_millis()
        ),
        symbol: signal.symbol.clone(),
        order_type,
        direction,
        quantity,
        price: signal.price,
        timestamp: signal.timestamp,
    }
}
