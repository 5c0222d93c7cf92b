//! Per-bot task: owns one trading engine and drives it from the market feed.
//!
//! The task loops over:
//! - Lifecycle commands from the registry
//! - The heartbeat interval (persisted as liveness)
//! - Market events fanned out by the registry
//!
//! An event is processed to completion before the next select, so a Stop
//! command only ever lands between events. A panic inside the task is caught,
//! persisted as Failed and reported like any other exit.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{BotConfig, BotState};
use crate::db::BotStore;
use crate::engine::{EngineSnapshot, EngineState, TradingEngine};
use crate::models::{FillEvent, MarketEvent, SignalEvent};

/// Commands sent from the registry to a bot task.
#[derive(Debug)]
pub enum BotCommand {
    /// Stop after the current event; replies with the final engine snapshot
    Stop { ack: oneshot::Sender<EngineSnapshot> },
    /// Ignore market events until resumed; replies whether the engine paused
    Pause { ack: oneshot::Sender<bool> },
    /// Resume processing; replies whether the engine was paused
    Resume { ack: oneshot::Sender<bool> },
}

/// Activity published by bots to registry subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEvent {
    StateChanged {
        bot_id: String,
        state: BotState,
    },
    Signal {
        bot_id: String,
        signal: SignalEvent,
    },
    Fill {
        bot_id: String,
        fill: FillEvent,
        equity: Decimal,
    },
    Rejected {
        bot_id: String,
        order_id: String,
        reason: String,
    },
}

impl BotEvent {
    pub fn bot_id(&self) -> &str {
        match self {
            BotEvent::StateChanged { bot_id, .. }
            | BotEvent::Signal { bot_id, .. }
            | BotEvent::Fill { bot_id, .. }
            | BotEvent::Rejected { bot_id, .. } => bot_id,
        }
    }
}

/// Latest view of a running bot, published by its task.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerStatus {
    pub engine: EngineSnapshot,
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Set once the task has returned
    pub exit: Option<RunnerExit>,
}

/// Why a bot task returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    /// Stop command acknowledged
    Stopped,
    /// Market feed closed
    FeedClosed,
    /// Registry dropped the command channel
    Detached,
    /// Task panicked; Failed was persisted
    Panicked,
}

impl RunnerExit {
    /// Lifecycle state a bot settles in after its task returned this way.
    pub fn final_state(self) -> BotState {
        match self {
            RunnerExit::Panicked => BotState::Failed,
            _ => BotState::Stopped,
        }
    }
}

/// Registry-side handle to a spawned bot task.
pub struct BotHandle {
    pub(crate) commands: mpsc::Sender<BotCommand>,
    pub(crate) status: watch::Receiver<RunnerStatus>,
    pub(crate) join: JoinHandle<RunnerExit>,
}

impl BotHandle {
    pub fn status(&self) -> RunnerStatus {
        self.status.borrow().clone()
    }

    /// Task returned on its own (feed closed or panicked).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// State of a finished task. A task that ended without recording an exit
    /// was cancelled and counts as Failed.
    pub fn exit_state(&self) -> BotState {
        self.status
            .borrow()
            .exit
            .map(RunnerExit::final_state)
            .unwrap_or(BotState::Failed)
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

pub(crate) struct BotRunner {
    bot_id: String,
    config: BotConfig,
    engine: TradingEngine,
    store: Arc<BotStore>,
    commands: mpsc::Receiver<BotCommand>,
    market: broadcast::Receiver<MarketEvent>,
    events: broadcast::Sender<BotEvent>,
    status: Arc<watch::Sender<RunnerStatus>>,
    heartbeat_interval: Duration,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl BotRunner {
    /// Spawn the task and return its handle. The engine is started inside the task.
    pub(crate) fn spawn(
        config: BotConfig,
        engine: TradingEngine,
        store: Arc<BotStore>,
        market: broadcast::Receiver<MarketEvent>,
        events: broadcast::Sender<BotEvent>,
        heartbeat_interval: Duration,
    ) -> BotHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(RunnerStatus {
            engine: engine.snapshot(),
            last_heartbeat: Some(Utc::now()),
            exit: None,
        });
        let status_tx = Arc::new(status_tx);
        let bot_id = config.bot_id.clone();

        let runner = Self {
            bot_id: bot_id.clone(),
            config,
            engine,
            store: store.clone(),
            commands: command_rx,
            market,
            events: events.clone(),
            status: status_tx.clone(),
            heartbeat_interval,
            last_heartbeat: Some(Utc::now()),
        };

        let join = tokio::spawn(async move {
            match AssertUnwindSafe(runner.run()).catch_unwind().await {
                Ok(exit) => exit,
                Err(panic) => {
                    error!(bot_id = %bot_id, reason = %panic_reason(&*panic), "Bot task panicked");
                    if let Err(e) = store.set_state(&bot_id, BotState::Failed, None).await {
                        error!(bot_id = %bot_id, error = %e, "Failed to persist failed state");
                    }
                    status_tx.send_modify(|status| {
                        status.engine.state = EngineState::Stopped;
                        status.exit = Some(RunnerExit::Panicked);
                    });
                    let _ = events.send(BotEvent::StateChanged {
                        bot_id,
                        state: BotState::Failed,
                    });
                    RunnerExit::Panicked
                }
            }
        });

        BotHandle {
            commands: command_tx,
            status: status_rx,
            join,
        }
    }

    async fn run(mut self) -> RunnerExit {
        self.engine.start();
        self.publish_status();

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; start() already recorded liveness
        heartbeat.tick().await;

        info!(bot_id = %self.bot_id, symbols = ?self.config.symbols, "Bot task running");

        let exit = loop {
            let event = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(BotCommand::Stop { ack }) => {
                        self.engine.stop();
                        let _ = ack.send(self.engine.snapshot());
                        break RunnerExit::Stopped;
                    }
                    Some(BotCommand::Pause { ack }) => {
                        let _ = ack.send(self.engine.pause());
                        self.publish_status();
                        continue;
                    }
                    Some(BotCommand::Resume { ack }) => {
                        let _ = ack.send(self.engine.resume());
                        self.publish_status();
                        continue;
                    }
                    None => break RunnerExit::Detached,
                },

                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                    continue;
                }

                received = self.market.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(bot_id = %self.bot_id, lagged = n, "Market feed lagged, events skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break RunnerExit::FeedClosed,
                },
            };

            if !self.config.trades_symbol(event.symbol()) {
                continue;
            }
            if self.engine.state() == EngineState::Paused {
                debug!(bot_id = %self.bot_id, symbol = %event.symbol(), "Paused, market event dropped");
                continue;
            }
            self.handle_event(&event).await;
        };

        self.engine.stop();

        if exit == RunnerExit::FeedClosed {
            info!(bot_id = %self.bot_id, "Market feed closed, stopping bot");
            if let Err(e) = self.store.set_state(&self.bot_id, BotState::Stopped, None).await {
                error!(bot_id = %self.bot_id, error = %e, "Failed to persist stopped state");
            }
            let _ = self.events.send(BotEvent::StateChanged {
                bot_id: self.bot_id.clone(),
                state: BotState::Stopped,
            });
        }

        self.status.send_modify(|status| {
            status.engine = self.engine.snapshot();
            status.exit = Some(exit);
        });
        exit
    }

    async fn handle_event(&mut self, event: &MarketEvent) {
        let report = match self.engine.process_market_event(event).await {
            Ok(report) => report,
            Err(e) => {
                warn!(bot_id = %self.bot_id, error = %e, "Market event not processed");
                return;
            }
        };

        if report.stale {
            return;
        }

        for signal in report.signals {
            debug!(bot_id = %self.bot_id, symbol = %signal.symbol, direction = ?signal.direction, "Signal");
            let _ = self.events.send(BotEvent::Signal {
                bot_id: self.bot_id.clone(),
                signal,
            });
        }

        let equity = self.engine.current_equity();
        for fill in report.fills {
            let _ = self.events.send(BotEvent::Fill {
                bot_id: self.bot_id.clone(),
                fill,
                equity,
            });
        }

        for rejection in report.rejections {
            let _ = self.events.send(BotEvent::Rejected {
                bot_id: self.bot_id.clone(),
                order_id: rejection.order_id().to_string(),
                reason: rejection.to_string(),
            });
        }

        self.publish_status();
    }

    async fn heartbeat(&mut self) {
        let now = Utc::now();
        match self.store.heartbeat(&self.bot_id, now).await {
            Ok(()) => {
                self.last_heartbeat = Some(now);
                self.publish_status();
            }
            Err(e) => warn!(bot_id = %self.bot_id, error = %e, "Failed to record heartbeat"),
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(RunnerStatus {
            engine: self.engine.snapshot(),
            last_heartbeat: self.last_heartbeat,
            exit: None,
        });
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        reason.to_string()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_string()
    }
}
