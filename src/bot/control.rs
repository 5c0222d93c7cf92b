//! Lifecycle requests from one-shot CLI commands.
//!
//! These only touch the store. Engines belong to whichever process runs the
//! registry, so a start is queued for its next boot, and stop or remove are
//! refused while a live orchestrator still heartbeats the bot.

use chrono::Duration;
use tracing::info;

use super::{BotConfig, BotRuntimeState, BotState, EngineFactory, RegistryError};
use crate::db::BotStore;

/// Queue a start for a stopped or failed bot. Enables it when disabled.
pub async fn request_start(
    store: &BotStore,
    factory: &dyn EngineFactory,
    bot_id: &str,
) -> Result<(), RegistryError> {
    let stored = store
        .get_bot(bot_id)
        .await
        .map_err(RegistryError::Persistence)?
        .ok_or_else(|| RegistryError::NotFound(bot_id.to_string()))?;

    let runtime = runtime_state(store, bot_id).await?;
    if runtime.state.is_active() {
        return Err(RegistryError::busy(bot_id, runtime.state));
    }

    // Surface config problems now rather than at the next boot
    let config = BotConfig::from_json(&stored.config_json).map_err(RegistryError::InvalidConfig)?;
    factory.build(&config).map_err(|source| RegistryError::Engine {
        bot_id: bot_id.to_string(),
        source,
    })?;

    if !stored.enabled {
        store
            .set_enabled(bot_id, true)
            .await
            .map_err(RegistryError::Persistence)?;
    }

    let queued = store
        .request_start(bot_id)
        .await
        .map_err(RegistryError::Persistence)?;
    if !queued {
        return Err(RegistryError::conflict(bot_id, "bot changed state"));
    }

    info!(bot_id = %bot_id, "Start queued");
    Ok(())
}

/// Mark a bot Stopped when no orchestrator owns it. Returns the state it had.
/// A heartbeat newer than `live_within` counts as owned.
pub async fn request_stop(
    store: &BotStore,
    bot_id: &str,
    live_within: Duration,
) -> Result<BotState, RegistryError> {
    let runtime = offline_state(store, bot_id, live_within).await?;
    store
        .set_state(bot_id, BotState::Stopped, None)
        .await
        .map_err(RegistryError::Persistence)?;

    info!(bot_id = %bot_id, previous = %runtime.state, "Bot marked stopped");
    Ok(runtime.state)
}

/// Delete a bot that no orchestrator owns.
pub async fn remove_offline(
    store: &BotStore,
    bot_id: &str,
    live_within: Duration,
) -> Result<(), RegistryError> {
    offline_state(store, bot_id, live_within).await?;
    let deleted = store
        .delete_bot(bot_id)
        .await
        .map_err(RegistryError::Persistence)?;
    if !deleted {
        return Err(RegistryError::NotFound(bot_id.to_string()));
    }

    info!(bot_id = %bot_id, "Bot removed");
    Ok(())
}

async fn offline_state(
    store: &BotStore,
    bot_id: &str,
    live_within: Duration,
) -> Result<BotRuntimeState, RegistryError> {
    if store
        .get_bot(bot_id)
        .await
        .map_err(RegistryError::Persistence)?
        .is_none()
    {
        return Err(RegistryError::NotFound(bot_id.to_string()));
    }

    let runtime = runtime_state(store, bot_id).await?;
    if runtime.is_live(live_within) {
        return Err(RegistryError::conflict(
            bot_id,
            format!("bot is {} under a running orchestrator", runtime.state),
        ));
    }
    Ok(runtime)
}

async fn runtime_state(store: &BotStore, bot_id: &str) -> Result<BotRuntimeState, RegistryError> {
    Ok(store
        .get_runtime_state(bot_id)
        .await
        .map_err(RegistryError::Persistence)?
        .unwrap_or_else(|| BotRuntimeState::stopped(bot_id)))
}
