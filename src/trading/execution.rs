//! Order execution: simulated fills for backtests and paper trading, and a
//! live handler that drives an exchange adapter with retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::{debug, warn};

use super::config::SimulationConfig;
use crate::models::{FillEvent, OrderDirection, OrderEvent, OrderType};

/// Terminal outcome of an order that did not fill.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("order {order_id} rejected: {reason}")]
    Rejected { order_id: String, reason: String },

    #[error("order {order_id} timed out after {elapsed:?}")]
    Timeout { order_id: String, elapsed: Duration },

    #[error("transport failure for order {order_id}: {message}")]
    Transport { order_id: String, message: String },
}

impl ExecutionError {
    pub fn order_id(&self) -> &str {
        match self {
            Self::Rejected { order_id, .. }
            | Self::Timeout { order_id, .. }
            | Self::Transport { order_id, .. } => order_id,
        }
    }
}

/// Turns orders into fills.
#[async_trait]
pub trait ExecutionHandler: Send {
    async fn execute_order(&mut self, order: &OrderEvent) -> Result<FillEvent, ExecutionError>;

    fn name(&self) -> &'static str;
}

// ==================== Simulated ====================

/// Deterministic fill model: slippage moves the price, never the quantity.
#[derive(Debug, Clone)]
pub struct SimulatedExecutionHandler {
    config: SimulationConfig,
    fills: u64,
}

impl SimulatedExecutionHandler {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config, fills: 0 }
    }

    /// Apply adverse slippage to a market order price.
    fn apply_slippage(&self, price: Decimal, direction: OrderDirection) -> Decimal {
        let slip = price * self.config.slippage_bps / dec!(10000);
        match direction {
            OrderDirection::Buy => price + slip,
            OrderDirection::Sell => price - slip,
        }
    }

    pub fn fill_count(&self) -> u64 {
        self.fills
    }
}

#[async_trait]
impl ExecutionHandler for SimulatedExecutionHandler {
    async fn execute_order(&mut self, order: &OrderEvent) -> Result<FillEvent, ExecutionError> {
        if order.quantity <= Decimal::ZERO {
            return Err(ExecutionError::Rejected {
                order_id: order.order_id.clone(),
                reason: format!("non-positive quantity {}", order.quantity),
            });
        }

        let fill_price = match order.order_type {
            OrderType::Market => self.apply_slippage(order.price, order.direction),
            OrderType::Limit { price } => price,
        };
        if fill_price <= Decimal::ZERO {
            return Err(ExecutionError::Rejected {
                order_id: order.order_id.clone(),
                reason: format!("non-positive fill price {}", fill_price),
            });
        }

        let commission = fill_price * order.quantity * self.config.commission_rate;
        self.fills += 1;

        Ok(FillEvent {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            direction: order.direction,
            quantity: order.quantity,
            fill_price,
            commission,
            timestamp: order.timestamp,
        })
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

// ==================== Live ====================

/// Execution report from an exchange adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeFill {
    pub exchange_order_id: String,
    pub filled_quantity: Decimal,
    pub avg_price: Decimal,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    /// Worth retrying: network blips, rate limits
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Final: the venue refused the order
    #[error("exchange rejected order: {0}")]
    Rejected(String),
}

/// Venue-specific order gateway. Wire protocols live behind this trait.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn submit_order(&self, order: &OrderEvent) -> Result<ExchangeFill, ExchangeError>;
}

#[async_trait]
impl<T: ExchangeClient + ?Sized> ExchangeClient for Arc<T> {
    async fn submit_order(&self, order: &OrderEvent) -> Result<ExchangeFill, ExchangeError> {
        (**self).submit_order(order).await
    }
}

/// Retry budget for live order submission.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Total time budget across all attempts
    pub max_elapsed: Duration,
    /// Per-attempt timeout
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Live execution through an exchange adapter.
pub struct LiveExecutionHandler<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C: ExchangeClient> LiveExecutionHandler<C> {
    pub fn new(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    async fn submit_with_retry(&self, order: &OrderEvent) -> Result<ExchangeFill, ExchangeError> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_interval)
            .with_max_interval(self.retry.max_interval)
            .with_max_elapsed_time(Some(self.retry.max_elapsed))
            .build();

        let client = &self.client;
        let request_timeout = self.retry.request_timeout;

        backoff::future::retry(backoff, || async move {
            let attempt = tokio::time::timeout(request_timeout, client.submit_order(order)).await;
            match attempt {
                Ok(Ok(fill)) => Ok(fill),
                Ok(Err(ExchangeError::Rejected(reason))) => {
                    Err(backoff::Error::permanent(ExchangeError::Rejected(reason)))
                }
                Ok(Err(e)) => {
                    debug!(order_id = %order.order_id, error = %e, "Retrying order submission");
                    Err(backoff::Error::transient(e))
                }
                Err(_) => Err(backoff::Error::transient(ExchangeError::Transient(
                    "request timed out".to_string(),
                ))),
            }
        })
        .await
    }
}

#[async_trait]
impl<C: ExchangeClient> ExecutionHandler for LiveExecutionHandler<C> {
    async fn execute_order(&mut self, order: &OrderEvent) -> Result<FillEvent, ExecutionError> {
        let started = std::time::Instant::now();

        let report = match self.submit_with_retry(order).await {
            Ok(report) => report,
            Err(ExchangeError::Rejected(reason)) => {
                return Err(ExecutionError::Rejected {
                    order_id: order.order_id.clone(),
                    reason,
                });
            }
            Err(ExchangeError::Transient(message)) => {
                let elapsed = started.elapsed();
                warn!(order_id = %order.order_id, error = %message, "Order submission exhausted retries");
                if elapsed >= self.retry.max_elapsed {
                    return Err(ExecutionError::Timeout {
                        order_id: order.order_id.clone(),
                        elapsed,
                    });
                }
                return Err(ExecutionError::Transport {
                    order_id: order.order_id.clone(),
                    message,
                });
            }
        };

        if report.filled_quantity <= Decimal::ZERO {
            return Err(ExecutionError::Rejected {
                order_id: order.order_id.clone(),
                reason: "no quantity filled".to_string(),
            });
        }
        if report.filled_quantity < order.quantity {
            debug!(
                order_id = %order.order_id,
                ordered = %order.quantity,
                filled = %report.filled_quantity,
                "Partial fill"
            );
        } else if report.filled_quantity > order.quantity {
            warn!(
                order_id = %order.order_id,
                ordered = %order.quantity,
                filled = %report.filled_quantity,
                "Exchange reported fill above ordered quantity"
            );
        }

        Ok(FillEvent {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            direction: order.direction,
            quantity: report.filled_quantity,
            fill_price: report.avg_price,
            commission: report.commission,
            timestamp: report.timestamp,
        })
    }

    fn name(&self) -> &'static str {
        "live"
    }
}
