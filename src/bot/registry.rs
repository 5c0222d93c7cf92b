//! Bot registry: directory of bots, lifecycle control and crash recovery.
//!
//! Every lifecycle transition is persisted before it is reflected in memory,
//! and one bot's lifecycle calls are serialized by a per-bot mutex so there is
//! never more than one live engine per bot id. A bot that misses its stop
//! deadline is marked Failed but never cancelled mid-order: its task keeps
//! draining and blocks a restart until it returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::runner::{BotCommand, BotEvent, BotHandle, BotRunner, RunnerExit};
use super::{BotConfig, BotRuntimeState, BotState, BotStatus, EngineFactory, RegistryError};
use crate::db::BotStore;
use crate::engine::TradingEngine;
use crate::models::MarketEvent;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often running bots persist a heartbeat
    pub heartbeat_interval: Duration,

    /// Grace period for a bot to acknowledge Stop, Pause or Resume
    pub shutdown_timeout: Duration,

    /// Market events buffered per bot before it lags
    pub market_buffer: usize,

    /// Bot events buffered per subscriber
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            market_buffer: 1024,
            event_buffer: 1024,
        }
    }
}

/// Outcome of `restore()`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub registered: Vec<String>,
    pub restarted: Vec<String>,
    pub failed: Vec<String>,
}

struct BotEntry {
    config: BotConfig,
    runtime: BotRuntimeState,
    lifecycle: Arc<Mutex<()>>,
    handle: Option<BotHandle>,

    /// Task that missed its stop deadline and is finishing its in-flight event
    draining: Option<JoinHandle<RunnerExit>>,
}

impl BotEntry {
    fn new(config: BotConfig, runtime: BotRuntimeState) -> Self {
        Self {
            config,
            runtime,
            lifecycle: Arc::new(Mutex::new(())),
            handle: None,
            draining: None,
        }
    }

    /// State as seen by callers. An active bot whose task returned by itself
    /// reports the state the task settled in: Stopped when the feed closed,
    /// Failed when it panicked.
    fn effective_state(&self) -> BotState {
        match &self.handle {
            Some(handle) if self.runtime.state.is_active() && handle.is_finished() => {
                handle.exit_state()
            }
            _ => self.runtime.state,
        }
    }

    /// Settle a task that already returned and forget a drained one. The task
    /// persisted its own final state.
    fn reap(&mut self) {
        if self.handle.as_ref().is_some_and(BotHandle::is_finished) {
            if let Some(handle) = self.handle.take() {
                if self.runtime.state.is_active() {
                    self.runtime.state = handle.exit_state();
                }
            }
        }
        if self.draining.as_ref().is_some_and(JoinHandle::is_finished) {
            self.draining = None;
        }
    }

    fn is_draining(&self) -> bool {
        self.draining.as_ref().is_some_and(|join| !join.is_finished())
    }

    fn status(&self) -> BotStatus {
        let runner = self.handle.as_ref().map(BotHandle::status);

        BotStatus {
            bot_id: self.config.bot_id.clone(),
            state: self.effective_state(),
            enabled: self.config.enabled,
            version: self.config.version,
            started_at: self.runtime.started_at,
            last_heartbeat: runner
                .as_ref()
                .and_then(|r| r.last_heartbeat)
                .or(self.runtime.last_heartbeat),
            equity: runner.as_ref().map(|r| r.engine.equity),
            open_positions: runner.as_ref().map(|r| r.engine.open_positions).unwrap_or(0),
            fills: runner.as_ref().map(|r| r.engine.fills).unwrap_or(0),
            rejections: runner.as_ref().map(|r| r.engine.rejections).unwrap_or(0),
        }
    }
}

/// Runs many bots concurrently and keeps their lifecycle durable.
pub struct BotRegistry {
    store: Arc<BotStore>,
    factory: Arc<dyn EngineFactory>,
    config: OrchestratorConfig,
    bots: RwLock<HashMap<String, BotEntry>>,
    market_tx: broadcast::Sender<MarketEvent>,
    events_tx: broadcast::Sender<BotEvent>,
}

impl BotRegistry {
    pub fn new(
        store: Arc<BotStore>,
        factory: Arc<dyn EngineFactory>,
        config: OrchestratorConfig,
    ) -> Self {
        let (market_tx, _) = broadcast::channel(config.market_buffer.max(1));
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));

        Self {
            store,
            factory,
            config,
            bots: RwLock::new(HashMap::new()),
            market_tx,
            events_tx,
        }
    }

    // ==================== Directory ====================

    /// Validate, persist and register a new bot. Generates an id when empty.
    pub async fn create(&self, mut config: BotConfig) -> Result<String, RegistryError> {
        if config.bot_id.trim().is_empty() {
            config.bot_id = Uuid::new_v4().to_string();
        }
        config.version = 1;
        config.validate().map_err(RegistryError::InvalidConfig)?;

        let bot_id = config.bot_id.clone();
        if self.bots.read().await.contains_key(&bot_id) {
            return Err(RegistryError::conflict(&bot_id, "bot already exists"));
        }

        let json = config.to_json().map_err(RegistryError::InvalidConfig)?;
        let inserted = self
            .store
            .insert_bot(&bot_id, &json, config.enabled)
            .await
            .map_err(RegistryError::Persistence)?;
        if !inserted {
            return Err(RegistryError::conflict(&bot_id, "bot already exists"));
        }

        self.bots
            .write()
            .await
            .insert(bot_id.clone(), BotEntry::new(config, BotRuntimeState::stopped(&bot_id)));

        info!(bot_id = %bot_id, "Bot created");
        Ok(bot_id)
    }

    /// Consistent snapshot of every bot, ordered by id.
    pub async fn list(&self) -> Vec<BotStatus> {
        let bots = self.bots.read().await;
        let mut statuses: Vec<BotStatus> = bots.values().map(BotEntry::status).collect();
        statuses.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        statuses
    }

    pub async fn status(&self, bot_id: &str) -> Result<BotStatus, RegistryError> {
        self.bots
            .read()
            .await
            .get(bot_id)
            .map(BotEntry::status)
            .ok_or_else(|| RegistryError::NotFound(bot_id.to_string()))
    }

    pub async fn config(&self, bot_id: &str) -> Result<BotConfig, RegistryError> {
        self.bots
            .read()
            .await
            .get(bot_id)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| RegistryError::NotFound(bot_id.to_string()))
    }

    // ==================== Lifecycle ====================

    /// Start a stopped or failed bot with a freshly built engine.
    pub async fn start(&self, bot_id: &str) -> Result<(), RegistryError> {
        let lock = self.lifecycle_lock(bot_id).await?;
        let _guard = lock.lock().await;

        let config = {
            let mut bots = self.bots.write().await;
            let entry = bots
                .get_mut(bot_id)
                .ok_or_else(|| RegistryError::NotFound(bot_id.to_string()))?;
            entry.reap();
            if entry.runtime.state.is_active() {
                return Err(RegistryError::busy(bot_id, entry.runtime.state));
            }
            if entry.is_draining() {
                return Err(RegistryError::conflict(
                    bot_id,
                    "previous engine is still finishing an order",
                ));
            }
            if !entry.config.enabled {
                return Err(RegistryError::conflict(bot_id, "bot is disabled"));
            }
            entry.config.clone()
        };

        // 1. Durable Starting record before anything runs
        self.store
            .set_state(bot_id, BotState::Starting, None)
            .await
            .map_err(RegistryError::Persistence)?;
        self.set_memory_state(bot_id, BotState::Starting).await;

        // 2. Fresh engine, warmed up when the config asks for it
        let engine = match self.prepare_engine(&config).await {
            Ok(engine) => engine,
            Err(e) => {
                error!(bot_id = %bot_id, error = %e, "Failed to build engine");
                self.mark_failed(bot_id).await;
                return Err(RegistryError::Engine {
                    bot_id: bot_id.to_string(),
                    source: e,
                });
            }
        };

        // 3. Spawn the task
        let handle = BotRunner::spawn(
            config,
            engine,
            self.store.clone(),
            self.market_tx.subscribe(),
            self.events_tx.clone(),
            self.config.heartbeat_interval,
        );

        // 4. Durable Running record
        let started_at = Utc::now();
        if let Err(e) = self
            .store
            .set_state(bot_id, BotState::Running, Some(started_at))
            .await
        {
            handle.abort();
            self.mark_failed(bot_id).await;
            return Err(RegistryError::Persistence(e));
        }

        {
            let mut bots = self.bots.write().await;
            if let Some(entry) = bots.get_mut(bot_id) {
                entry.runtime.state = BotState::Running;
                entry.runtime.started_at = Some(started_at);
                entry.runtime.last_heartbeat = Some(started_at);
                entry.handle = Some(handle);
            }
        }

        self.emit_state(bot_id, BotState::Running);
        info!(bot_id = %bot_id, "Bot started");
        Ok(())
    }

    async fn prepare_engine(&self, config: &BotConfig) -> anyhow::Result<TradingEngine> {
        let mut engine = self.factory.build(config)?;
        if let Some(warmup) = &config.warmup {
            let mut history = warmup.provider()?;
            engine.warmup(&mut history).await?;
        }
        Ok(engine)
    }

    /// Stop a running or paused bot. Returns the final state; a no-op when
    /// no task is live.
    pub async fn stop(&self, bot_id: &str) -> Result<BotState, RegistryError> {
        let lock = self.lifecycle_lock(bot_id).await?;
        let _guard = lock.lock().await;
        self.stop_locked(bot_id).await
    }

    /// Caller must hold the bot's lifecycle lock.
    async fn stop_locked(&self, bot_id: &str) -> Result<BotState, RegistryError> {
        let handle = {
            let mut bots = self.bots.write().await;
            let entry = bots
                .get_mut(bot_id)
                .ok_or_else(|| RegistryError::NotFound(bot_id.to_string()))?;
            entry.reap();

            match entry.handle.take() {
                Some(handle) => handle,
                None => return Ok(entry.runtime.state),
            }
        };

        if let Err(e) = self.store.set_state(bot_id, BotState::Stopping, None).await {
            warn!(bot_id = %bot_id, error = %e, "Failed to persist stopping state");
        }
        self.set_memory_state(bot_id, BotState::Stopping).await;

        let (final_state, draining) = self.stop_task(bot_id, handle).await;

        if let Err(e) = self.store.set_state(bot_id, final_state, None).await {
            error!(bot_id = %bot_id, state = %final_state, error = %e, "Failed to persist final state");
        }
        if let Some(entry) = self.bots.write().await.get_mut(bot_id) {
            entry.runtime.state = final_state;
            entry.draining = draining;
        }
        self.emit_state(bot_id, final_state);

        Ok(final_state)
    }

    /// Ask the task to stop and wait for its ack within the shutdown timeout.
    /// A late task is left running so its in-flight order completes; its join
    /// handle is returned for the entry to hold.
    async fn stop_task(
        &self,
        bot_id: &str,
        handle: BotHandle,
    ) -> (BotState, Option<JoinHandle<RunnerExit>>) {
        let (ack, ack_rx) = oneshot::channel();

        let acknowledged = tokio::time::timeout(self.config.shutdown_timeout, async {
            if handle.commands.send(BotCommand::Stop { ack }).await.is_err() {
                return None;
            }
            ack_rx.await.ok()
        })
        .await;

        match acknowledged {
            Ok(Some(snapshot)) => {
                info!(
                    bot_id = %bot_id,
                    equity = %snapshot.equity,
                    fills = snapshot.fills,
                    "Bot stopped"
                );
                (BotState::Stopped, None)
            }
            // Task went away without acknowledging
            Ok(None) => match handle.join.await {
                Ok(exit) => {
                    info!(bot_id = %bot_id, exit = ?exit, "Bot task already finished");
                    (exit.final_state(), None)
                }
                Err(e) => {
                    error!(bot_id = %bot_id, error = %e, "Bot task died");
                    (BotState::Failed, None)
                }
            },
            Err(_) => {
                error!(
                    bot_id = %bot_id,
                    timeout_secs = self.config.shutdown_timeout.as_secs_f64(),
                    "Bot did not stop in time, marked failed while its in-flight event finishes"
                );
                (BotState::Failed, Some(handle.join))
            }
        }
    }

    /// Hold a running bot. Its task and positions stay alive but market events
    /// are dropped until `resume`.
    pub async fn pause(&self, bot_id: &str) -> Result<(), RegistryError> {
        self.switch(bot_id, BotState::Running, BotState::Paused, |ack| {
            BotCommand::Pause { ack }
        })
        .await
    }

    pub async fn resume(&self, bot_id: &str) -> Result<(), RegistryError> {
        self.switch(bot_id, BotState::Paused, BotState::Running, |ack| {
            BotCommand::Resume { ack }
        })
        .await
    }

    /// Move a live bot between Running and Paused. Already in `to` is a no-op.
    async fn switch(
        &self,
        bot_id: &str,
        from: BotState,
        to: BotState,
        command: impl FnOnce(oneshot::Sender<bool>) -> BotCommand,
    ) -> Result<(), RegistryError> {
        let lock = self.lifecycle_lock(bot_id).await?;
        let _guard = lock.lock().await;

        let commands: mpsc::Sender<BotCommand> = {
            let mut bots = self.bots.write().await;
            let entry = bots
                .get_mut(bot_id)
                .ok_or_else(|| RegistryError::NotFound(bot_id.to_string()))?;
            entry.reap();
            if entry.runtime.state == to {
                return Ok(());
            }
            match &entry.handle {
                Some(handle) if entry.runtime.state == from => handle.commands.clone(),
                _ => return Err(RegistryError::busy(bot_id, entry.runtime.state)),
            }
        };

        self.store
            .set_state(bot_id, to, None)
            .await
            .map_err(RegistryError::Persistence)?;

        let (ack, ack_rx) = oneshot::channel();
        let acknowledged = tokio::time::timeout(self.config.shutdown_timeout, async {
            commands.send(command(ack)).await.ok()?;
            ack_rx.await.ok()
        })
        .await;

        let failure = match acknowledged {
            Ok(Some(true)) => None,
            Ok(Some(false)) => Some(anyhow::anyhow!("engine was not {}", from)),
            Ok(None) => Some(anyhow::anyhow!("bot task is gone")),
            Err(_) => Some(anyhow::anyhow!(
                "no acknowledgement within {:?}",
                self.config.shutdown_timeout
            )),
        };
        if let Some(source) = failure {
            if let Err(e) = self.store.set_state(bot_id, from, None).await {
                error!(bot_id = %bot_id, error = %e, "Failed to roll back runtime state");
            }
            return Err(RegistryError::Engine {
                bot_id: bot_id.to_string(),
                source,
            });
        }

        self.set_memory_state(bot_id, to).await;
        self.emit_state(bot_id, to);
        info!(bot_id = %bot_id, state = %to, "Bot state changed");
        Ok(())
    }

    /// Wait up to `limit` for bots that missed their stop deadline to finish
    /// the event they were processing. Returns how many are still busy.
    pub async fn wait_for_draining(&self, limit: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let busy = self
                .bots
                .read()
                .await
                .values()
                .filter(|entry| entry.is_draining())
                .count();
            if busy == 0 || tokio::time::Instant::now() >= deadline {
                return busy;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop every running bot concurrently. Returns each bot's final state.
    pub async fn shutdown_all(&self) -> Vec<(String, BotState)> {
        let running: Vec<String> = {
            let bots = self.bots.read().await;
            bots.iter()
                .filter(|(_, entry)| entry.handle.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };

        if running.is_empty() {
            return Vec::new();
        }
        info!(count = running.len(), "Shutting down bots");

        let results = join_all(running.iter().map(|id| self.stop(id))).await;

        running
            .into_iter()
            .zip(results)
            .map(|(id, result)| {
                let state = result.unwrap_or_else(|e| {
                    error!(bot_id = %id, error = %e, "Failed to stop bot");
                    BotState::Failed
                });
                (id, state)
            })
            .collect()
    }

    /// Load every persisted bot and restart those that were running when the
    /// process went down or have a queued start request.
    pub async fn restore(&self) -> Result<RestoreReport, RegistryError> {
        let recoverable: HashSet<String> = self
            .store
            .load_recoverable()
            .await
            .map_err(RegistryError::Persistence)?
            .into_iter()
            .map(|stored| stored.bot_id)
            .collect();
        let configs = self
            .store
            .load_all_bots()
            .await
            .map_err(RegistryError::Persistence)?;
        let mut runtime: HashMap<String, BotRuntimeState> = self
            .store
            .load_runtime_states()
            .await
            .map_err(RegistryError::Persistence)?
            .into_iter()
            .map(|state| (state.bot_id.clone(), state))
            .collect();

        let mut report = RestoreReport::default();
        let mut to_restart = Vec::new();

        for stored in configs {
            let bot_id = stored.bot_id.clone();
            if self.bots.read().await.contains_key(&bot_id) {
                continue;
            }

            let mut config = match BotConfig::from_json(&stored.config_json) {
                Ok(config) => config,
                Err(e) => {
                    error!(bot_id = %bot_id, error = %e, "Skipping bot with unreadable config");
                    report.failed.push(bot_id);
                    continue;
                }
            };
            // Columns are authoritative over the JSON copy
            config.bot_id = bot_id.clone();
            config.version = stored.version;
            config.enabled = stored.enabled;

            let mut state = runtime
                .remove(&bot_id)
                .unwrap_or_else(|| BotRuntimeState::stopped(&bot_id));
            let recover = recoverable.contains(&bot_id);

            // Interrupted transitions, paused and disabled running bots settle to Stopped
            let settled = match state.state {
                BotState::Failed => BotState::Failed,
                _ => BotState::Stopped,
            };
            if state.state != settled && !recover {
                if let Err(e) = self.store.set_state(&bot_id, settled, None).await {
                    warn!(bot_id = %bot_id, error = %e, "Failed to normalize runtime state");
                }
            }
            state.state = settled;

            self.bots
                .write()
                .await
                .insert(bot_id.clone(), BotEntry::new(config, state));
            report.registered.push(bot_id.clone());

            if recover {
                to_restart.push(bot_id);
            }
        }

        for bot_id in to_restart {
            match self.start(&bot_id).await {
                Ok(()) => {
                    info!(bot_id = %bot_id, "Bot restored");
                    report.restarted.push(bot_id);
                }
                Err(e) => {
                    error!(bot_id = %bot_id, error = %e, "Failed to restore bot");
                    report.failed.push(bot_id);
                }
            }
        }

        info!(
            registered = report.registered.len(),
            restarted = report.restarted.len(),
            failed = report.failed.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    // ==================== Configuration ====================

    /// Replace a stopped bot's config. Returns the new version.
    pub async fn update_config(
        &self,
        bot_id: &str,
        expected_version: i64,
        mut config: BotConfig,
    ) -> Result<i64, RegistryError> {
        let lock = self.lifecycle_lock(bot_id).await?;
        let _guard = lock.lock().await;

        let enabled = {
            let mut bots = self.bots.write().await;
            let entry = bots
                .get_mut(bot_id)
                .ok_or_else(|| RegistryError::NotFound(bot_id.to_string()))?;
            entry.reap();
            if entry.runtime.state.is_active() {
                return Err(RegistryError::busy(bot_id, entry.runtime.state));
            }
            entry.config.enabled
        };

        if !config.bot_id.is_empty() && config.bot_id != bot_id {
            return Err(RegistryError::InvalidConfig(anyhow::anyhow!(
                "config is for bot {}, not {}",
                config.bot_id,
                bot_id
            )));
        }
        config.bot_id = bot_id.to_string();
        config.enabled = enabled;
        config.version = expected_version + 1;
        config.validate().map_err(RegistryError::InvalidConfig)?;

        let json = config.to_json().map_err(RegistryError::InvalidConfig)?;
        let version = self
            .store
            .update_config(bot_id, expected_version, &json)
            .await
            .map_err(RegistryError::Persistence)?
            .ok_or_else(|| {
                RegistryError::conflict(
                    bot_id,
                    format!("config version {} is stale", expected_version),
                )
            })?;

        if let Some(entry) = self.bots.write().await.get_mut(bot_id) {
            config.version = version;
            entry.config = config;
        }

        info!(bot_id = %bot_id, version, "Bot config updated");
        Ok(version)
    }

    /// Enable or disable a bot. Disabled bots cannot be started and are not
    /// restored after a restart; a running bot keeps running.
    pub async fn set_enabled(&self, bot_id: &str, enabled: bool) -> Result<(), RegistryError> {
        let lock = self.lifecycle_lock(bot_id).await?;
        let _guard = lock.lock().await;

        let found = self
            .store
            .set_enabled(bot_id, enabled)
            .await
            .map_err(RegistryError::Persistence)?;
        if !found {
            return Err(RegistryError::NotFound(bot_id.to_string()));
        }

        if let Some(entry) = self.bots.write().await.get_mut(bot_id) {
            entry.config.enabled = enabled;
        }
        info!(bot_id = %bot_id, enabled, "Bot enabled flag changed");
        Ok(())
    }

    /// Stop the bot if needed and delete it everywhere.
    pub async fn remove(&self, bot_id: &str) -> Result<(), RegistryError> {
        let lock = self.lifecycle_lock(bot_id).await?;
        let _guard = lock.lock().await;

        self.stop_locked(bot_id).await?;
        if self
            .bots
            .read()
            .await
            .get(bot_id)
            .is_some_and(BotEntry::is_draining)
        {
            return Err(RegistryError::conflict(
                bot_id,
                "engine is still finishing an order",
            ));
        }

        self.store
            .delete_bot(bot_id)
            .await
            .map_err(RegistryError::Persistence)?;
        self.bots.write().await.remove(bot_id);

        info!(bot_id = %bot_id, "Bot removed");
        Ok(())
    }

    // ==================== Feeds ====================

    /// Fan a market event out to every running bot. Returns how many received it.
    pub fn publish(&self, event: MarketEvent) -> usize {
        self.market_tx.send(event).unwrap_or(0)
    }

    /// Feed of signals, fills, rejections and lifecycle changes from all bots.
    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.events_tx.subscribe()
    }

    pub fn store(&self) -> &BotStore {
        &self.store
    }

    // ==================== Helpers ====================

    async fn lifecycle_lock(&self, bot_id: &str) -> Result<Arc<Mutex<()>>, RegistryError> {
        self.bots
            .read()
            .await
            .get(bot_id)
            .map(|entry| entry.lifecycle.clone())
            .ok_or_else(|| RegistryError::NotFound(bot_id.to_string()))
    }

    async fn set_memory_state(&self, bot_id: &str, state: BotState) {
        if let Some(entry) = self.bots.write().await.get_mut(bot_id) {
            entry.runtime.state = state;
        }
    }

    /// Best-effort Failed record after a failed start.
    async fn mark_failed(&self, bot_id: &str) {
        if let Err(e) = self.store.set_state(bot_id, BotState::Failed, None).await {
            error!(bot_id = %bot_id, error = %e, "Failed to persist failed state");
        }
        self.set_memory_state(bot_id, BotState::Failed).await;
        self.emit_state(bot_id, BotState::Failed);
    }

    fn emit_state(&self, bot_id: &str, state: BotState) {
        let _ = self.events_tx.send(BotEvent::StateChanged {
            bot_id: bot_id.to_string(),
            state,
        });
    }
}

impl Drop for BotRegistry {
    /// Without `shutdown_all` the bots are torn down like a crash: tasks are
    /// aborted and their persisted state is left as is.
    fn drop(&mut self) {
        for entry in self.bots.get_mut().values() {
            if let Some(handle) = &entry.handle {
                handle.abort();
            }
            if let Some(join) = &entry.draining {
                join.abort();
            }
        }
    }
}
