//! Bot lifecycle states and status snapshots.

use std::str::FromStr;

use anyhow::{anyhow, Error};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Persisted lifecycle state of a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BotState {
    Stopped,
    Starting,
    Running,
    /// Engine alive but ignoring market events
    Paused,
    Stopping,
    Failed,
}

impl BotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotState::Stopped => "stopped",
            BotState::Starting => "starting",
            BotState::Running => "running",
            BotState::Paused => "paused",
            BotState::Stopping => "stopping",
            BotState::Failed => "failed",
        }
    }

    /// A live engine may exist in these states.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BotState::Starting | BotState::Running | BotState::Paused | BotState::Stopping
        )
    }
}

impl FromStr for BotState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stopped" => Ok(BotState::Stopped),
            "starting" => Ok(BotState::Starting),
            "running" => Ok(BotState::Running),
            "paused" => Ok(BotState::Paused),
            "stopping" => Ok(BotState::Stopping),
            "failed" => Ok(BotState::Failed),
            other => Err(anyhow!("Unknown bot state '{}'", other)),
        }
    }
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness record kept for every bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotRuntimeState {
    pub bot_id: String,
    pub state: BotState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Queued by `fleet start`; the next orchestrator boot starts the bot
    pub start_requested: bool,
}

impl BotRuntimeState {
    pub fn stopped(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            state: BotState::Stopped,
            started_at: None,
            last_heartbeat: None,
            start_requested: false,
        }
    }

    /// Active with a heartbeat newer than `within`: some orchestrator owns it.
    pub fn is_live(&self, within: chrono::Duration) -> bool {
        self.state.is_active()
            && self
                .last_heartbeat
                .is_some_and(|at| Utc::now() - at < within)
    }
}

/// Snapshot returned by `list()` and `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotStatus {
    pub bot_id: String,
    pub state: BotState,
    pub enabled: bool,
    pub version: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Engine figures; only present while an engine exists
    pub equity: Option<Decimal>,
    pub open_positions: usize,
    pub fills: usize,
    pub rejections: usize,
}
