use chrono::{Duration, TimeZone, Utc};
use perp_fleet::data::HistoricalDataProvider;
use perp_fleet::engine::TradingEngine;
use perp_fleet::models::{FillEvent, MarketEvent, OrderDirection, SignalDirection, SignalEvent};
use perp_fleet::trading::{
    EquityPercentageRiskManager, OrderLimits, PositionTracker, RiskManager,
    SimulatedExecutionHandler, SimulationConfig, SizingBase, Strategy,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;

fn signal(direction: SignalDirection, price: Decimal) -> SignalEvent {
    SignalEvent {
        symbol: "BTC".to_string(),
        direction,
        strength: 1.0,
        price,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

fn risk_manager(pct: Decimal, max_position_value: Decimal, lot_size: Decimal) -> EquityPercentageRiskManager {
    EquityPercentageRiskManager {
        position_size_pct: pct,
        limits: OrderLimits {
            sizing_base: SizingBase::CurrentEquity,
            max_position_value,
            min_notional: Decimal::ONE,
            lot_size,
            limit_offset_bps: None,
        },
    }
}

fn fill(direction: OrderDirection, quantity: Decimal, price: Decimal, idx: usize) -> FillEvent {
    FillEvent {
        order_id: format!("f{}", idx),
        symbol: "BTC".to_string(),
        direction,
        quantity,
        fill_price: price,
        commission: Decimal::ZERO,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(idx as i64),
    }
}

/// Flips between long and short every `period` events.
struct Flipper {
    period: usize,
    seen: usize,
}

impl Strategy for Flipper {
    fn on_market_event(&mut self, event: &MarketEvent) -> anyhow::Result<Option<SignalEvent>> {
        self.seen += 1;
        if self.seen % self.period != 0 {
            return Ok(None);
        }
        let direction = if (self.seen / self.period) % 2 == 1 {
            SignalDirection::Long
        } else {
            SignalDirection::Short
        };
        Ok(Some(SignalEvent {
            symbol: event.symbol().to_string(),
            direction,
            strength: 1.0,
            price: event.price(),
            timestamp: event.timestamp(),
        }))
    }

    fn name(&self) -> &str {
        "flipper"
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn equity_percentage_order_stays_within_budget(
        equity_cents in 100i64..100_000_000,
        pct_bps in 1i64..=10_000,
        price_cents in 1i64..10_000_000,
        max_value in 1i64..1_000_000,
        lot_exp in 0u32..6,
    ) {
        let equity = Decimal::new(equity_cents, 2);
        let pct = Decimal::new(pct_bps, 4);
        let price = Decimal::new(price_cents, 2);
        let max_position_value = Decimal::from(max_value);
        let lot_size = Decimal::new(1, lot_exp);

        let manager = risk_manager(pct, max_position_value, lot_size);
        let budget = (equity * pct).min(max_position_value);

        let order = manager
            .evaluate(&signal(SignalDirection::Long, price), equity, &HashMap::new())
            .unwrap();

        if let Some(order) = order {
            prop_assert_eq!(order.direction, OrderDirection::Buy);
            prop_assert!(order.quantity > Decimal::ZERO);
            prop_assert!(order.quantity * price <= budget);
            // Rounded down by less than one lot
            prop_assert!(budget - order.quantity * price < lot_size * price);
            prop_assert_eq!(order.quantity % lot_size, Decimal::ZERO);
        } else {
            prop_assert!(budget < Decimal::ONE || (budget / price) < lot_size);
        }
    }

    #[test]
    fn non_positive_equity_never_trades(
        equity_cents in -10_000_000i64..=0,
        price_cents in 1i64..10_000_000,
        short in any::<bool>(),
    ) {
        let manager = risk_manager(Decimal::new(5, 2), Decimal::from(10_000), Decimal::new(1, 3));
        let direction = if short { SignalDirection::Short } else { SignalDirection::Long };

        let order = manager
            .evaluate(
                &signal(direction, Decimal::new(price_cents, 2)),
                Decimal::new(equity_cents, 2),
                &HashMap::new(),
            )
            .unwrap();
        prop_assert!(order.is_none());
    }

    #[test]
    fn position_tracker_is_deterministic(
        fills in prop::collection::vec((any::<bool>(), 1i64..1_000, 1i64..100_000), 1..60),
    ) {
        let fills: Vec<FillEvent> = fills
            .into_iter()
            .enumerate()
            .map(|(idx, (buy, qty, price))| {
                let direction = if buy { OrderDirection::Buy } else { OrderDirection::Sell };
                fill(direction, Decimal::new(qty, 2), Decimal::new(price, 2), idx)
            })
            .collect();

        let mut first = PositionTracker::new();
        let mut second = PositionTracker::new();
        let mut net = Decimal::ZERO;

        for fill in &fills {
            let a = first.process_fill(fill);
            let b = second.process_fill(fill);
            prop_assert_eq!(a, b);
            net += fill.signed_quantity();
        }

        prop_assert_eq!(first.all_positions(), second.all_positions());

        // Net quantity is conserved; flat positions are removed
        let tracked = first.get_position("BTC").map(|p| p.quantity).unwrap_or(Decimal::ZERO);
        prop_assert_eq!(tracked, net);
        if net.is_zero() {
            prop_assert!(first.all_positions().is_empty());
        }
    }

    #[test]
    fn equity_curve_is_append_only(
        prices in prop::collection::vec(1_000i64..200_000, 2..80),
        period in 1usize..6,
    ) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let events: Vec<MarketEvent> = prices
            .iter()
            .enumerate()
            .map(|(idx, price)| MarketEvent::Trade {
                symbol: "BTC".to_string(),
                price: Decimal::new(*price, 2),
                size: Decimal::ONE,
                timestamp: start + Duration::minutes(idx as i64),
            })
            .collect();

        let mut engine = TradingEngine::new(
            "prop",
            Decimal::from(10_000),
            Box::new(risk_manager(Decimal::new(10, 2), Decimal::from(5_000), Decimal::new(1, 4))),
            Box::new(SimulatedExecutionHandler::new(SimulationConfig::default())),
        )
        .with_strategy(Box::new(Flipper { period, seen: 0 }));
        engine.start();

        let mut seen: Vec<Decimal> = engine.equity_curve().values().collect();

        for event in &events {
            let report = tokio_test::block_on(engine.process_market_event(event)).unwrap();
            let now: Vec<Decimal> = engine.equity_curve().values().collect();

            // Earlier points never change; one point per fill
            prop_assert_eq!(&now[..seen.len()], &seen[..]);
            prop_assert_eq!(now.len(), seen.len() + report.fills.len());
            seen = now;
        }

        prop_assert_eq!(seen.len(), engine.metrics().fills + 1);
        prop_assert!(engine.metrics().max_drawdown_pct >= 0.0);
    }

    #[test]
    fn replay_is_reproducible(prices in prop::collection::vec(1_000i64..200_000, 2..40)) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let events: Vec<MarketEvent> = prices
            .iter()
            .enumerate()
            .map(|(idx, price)| MarketEvent::Trade {
                symbol: "BTC".to_string(),
                price: Decimal::new(*price, 2),
                size: Decimal::ONE,
                timestamp: start + Duration::minutes(idx as i64),
            })
            .collect();

        let run = |events: Vec<MarketEvent>| {
            let mut engine = TradingEngine::new(
                "prop",
                Decimal::from(10_000),
                Box::new(risk_manager(Decimal::new(10, 2), Decimal::from(5_000), Decimal::new(1, 4))),
                Box::new(SimulatedExecutionHandler::new(SimulationConfig::default())),
            )
            .with_strategy(Box::new(Flipper { period: 2, seen: 0 }));
            let mut provider = HistoricalDataProvider::from_events(events);
            tokio_test::block_on(engine.run(&mut provider)).unwrap();
            engine.equity_curve().values().collect::<Vec<Decimal>>()
        };

        prop_assert_eq!(run(events.clone()), run(events));
    }
}
