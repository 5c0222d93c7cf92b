//! Durable storage for bot configuration and runtime state.
//!
//! Stores everything needed to resume after a restart:
//! - Bot configuration JSON (opaque here) with enabled flag and version
//! - Previous config versions
//! - Runtime state, heartbeat and queued start requests per bot

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::bot::{BotRuntimeState, BotState};

/// SQLite-backed bot store.
pub struct BotStore {
    pool: SqlitePool,
}

/// Stored bot configuration row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredBotConfig {
    pub bot_id: String,
    pub config_json: String,
    pub enabled: bool,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Stored runtime state row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredRuntimeState {
    pub bot_id: String,
    pub state: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub start_requested: bool,
}

impl StoredRuntimeState {
    pub fn into_runtime_state(self) -> Result<BotRuntimeState> {
        Ok(BotRuntimeState {
            state: self
                .state
                .parse()
                .with_context(|| format!("Corrupt runtime state for bot {}", self.bot_id))?,
            bot_id: self.bot_id,
            started_at: self.started_at,
            last_heartbeat: self.last_heartbeat,
            start_requested: self.start_requested,
        })
    }
}

impl BotStore {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is its own database, so keep exactly one alive
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_configs (
                bot_id TEXT PRIMARY KEY,
                config_json TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create bot_configs")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_runtime_state (
                bot_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                started_at TEXT,
                last_heartbeat TEXT,
                start_requested INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (bot_id) REFERENCES bot_configs(bot_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create bot_runtime_state")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_config_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                config_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(bot_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create bot_config_history")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runtime_state ON bot_runtime_state(state)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Configs ====================

    /// Insert a new bot with a Stopped runtime row. Returns false if the id exists.
    pub async fn insert_bot(&self, bot_id: &str, config_json: &str, enabled: bool) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO bot_configs (bot_id, config_json, enabled, version, created_at, updated_at)
            VALUES (?, ?, ?, 1, datetime('now'), datetime('now'))
            ON CONFLICT(bot_id) DO NOTHING
            "#,
        )
        .bind(bot_id)
        .bind(config_json)
        .bind(enabled)
        .execute(&mut *tx)
        .await
        .context("Failed to insert bot config")?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("INSERT INTO bot_config_history (bot_id, version, config_json) VALUES (?, 1, ?)")
            .bind(bot_id)
            .bind(config_json)
            .execute(&mut *tx)
            .await
            .context("Failed to record config history")?;

        sqlx::query("INSERT INTO bot_runtime_state (bot_id, state) VALUES (?, ?)")
            .bind(bot_id)
            .bind(BotState::Stopped.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to insert runtime state")?;

        tx.commit().await.context("Failed to commit new bot")?;
        Ok(true)
    }

    pub async fn get_bot(&self, bot_id: &str) -> Result<Option<StoredBotConfig>> {
        sqlx::query_as::<_, StoredBotConfig>("SELECT * FROM bot_configs WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch bot config")
    }

    pub async fn load_all_bots(&self) -> Result<Vec<StoredBotConfig>> {
        sqlx::query_as::<_, StoredBotConfig>("SELECT * FROM bot_configs ORDER BY created_at, bot_id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load bot configs")
    }

    /// Enabled bots that were Running when the process went down, or that
    /// have a queued start request.
    pub async fn load_recoverable(&self) -> Result<Vec<StoredBotConfig>> {
        sqlx::query_as::<_, StoredBotConfig>(
            r#"
            SELECT c.* FROM bot_configs c
            JOIN bot_runtime_state s ON s.bot_id = c.bot_id
            WHERE c.enabled = 1 AND (s.state = ? OR s.start_requested = 1)
            ORDER BY c.created_at, c.bot_id
            "#,
        )
        .bind(BotState::Running.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load recoverable bots")
    }

    /// Replace a config if `expected_version` matches. Returns the new version,
    /// or `None` when the stored version differs (or the bot does not exist).
    pub async fn update_config(
        &self,
        bot_id: &str,
        expected_version: i64,
        config_json: &str,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let updated = sqlx::query(
            r#"
            UPDATE bot_configs SET
                config_json = ?,
                version = version + 1,
                updated_at = datetime('now')
            WHERE bot_id = ? AND version = ?
            "#,
        )
        .bind(config_json)
        .bind(bot_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .context("Failed to update bot config")?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let new_version = expected_version + 1;
        sqlx::query("INSERT INTO bot_config_history (bot_id, version, config_json) VALUES (?, ?, ?)")
            .bind(bot_id)
            .bind(new_version)
            .bind(config_json)
            .execute(&mut *tx)
            .await
            .context("Failed to record config history")?;

        tx.commit().await.context("Failed to commit config update")?;
        Ok(Some(new_version))
    }

    /// All stored versions of a bot's config, oldest first.
    pub async fn config_history(&self, bot_id: &str) -> Result<Vec<(i64, String)>> {
        sqlx::query_as(
            "SELECT version, config_json FROM bot_config_history WHERE bot_id = ? ORDER BY version",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch config history")
    }

    pub async fn set_enabled(&self, bot_id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE bot_configs SET enabled = ?, updated_at = datetime('now') WHERE bot_id = ?",
        )
        .bind(enabled)
        .bind(bot_id)
        .execute(&self.pool)
        .await
        .context("Failed to update enabled flag")?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a bot and everything recorded for it.
    pub async fn delete_bot(&self, bot_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM bot_runtime_state WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM bot_config_history WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM bot_configs WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await.context("Failed to commit bot deletion")?;
        Ok(deleted > 0)
    }

    // ==================== Runtime State ====================

    /// Record a state transition. `started_at` is kept unless a new one is given.
    /// Any transition consumes a queued start request.
    pub async fn set_state(
        &self,
        bot_id: &str,
        state: BotState,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let heartbeat = (state == BotState::Running).then(Utc::now);

        sqlx::query(
            r#"
            INSERT INTO bot_runtime_state (bot_id, state, started_at, last_heartbeat, start_requested)
            VALUES (?, ?, ?, ?, 0)
            ON CONFLICT(bot_id) DO UPDATE SET
                state = excluded.state,
                started_at = COALESCE(excluded.started_at, bot_runtime_state.started_at),
                last_heartbeat = COALESCE(excluded.last_heartbeat, bot_runtime_state.last_heartbeat),
                start_requested = 0
            "#,
        )
        .bind(bot_id)
        .bind(state.as_str())
        .bind(started_at)
        .bind(heartbeat)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to persist state {} for bot {}", state, bot_id))?;

        Ok(())
    }

    /// Queue a start for the next orchestrator boot. Returns false when the
    /// bot is unknown or its recorded state is active.
    pub async fn request_start(&self, bot_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bot_runtime_state SET start_requested = 1
            WHERE bot_id = ? AND state IN (?, ?)
            "#,
        )
        .bind(bot_id)
        .bind(BotState::Stopped.as_str())
        .bind(BotState::Failed.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to queue start request")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn heartbeat(&self, bot_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE bot_runtime_state SET last_heartbeat = ? WHERE bot_id = ?")
            .bind(at)
            .bind(bot_id)
            .execute(&self.pool)
            .await
            .context("Failed to record heartbeat")?;
        Ok(())
    }

    pub async fn get_runtime_state(&self, bot_id: &str) -> Result<Option<BotRuntimeState>> {
        let row = sqlx::query_as::<_, StoredRuntimeState>(
            "SELECT bot_id, state, started_at, last_heartbeat, start_requested FROM bot_runtime_state WHERE bot_id = ?",
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch runtime state")?;

        row.map(StoredRuntimeState::into_runtime_state).transpose()
    }

    pub async fn load_runtime_states(&self) -> Result<Vec<BotRuntimeState>> {
        let rows = sqlx::query_as::<_, StoredRuntimeState>(
            "SELECT bot_id, state, started_at, last_heartbeat, start_requested FROM bot_runtime_state",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load runtime states")?;

        rows.into_iter()
            .map(StoredRuntimeState::into_runtime_state)
            .collect()
    }

    /// Close the pool. Later calls fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> BotStore {
        BotStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_creates_stopped_runtime_row() {
        let store = store().await;
        assert!(store.insert_bot("alpha", r#"{"a":1}"#, true).await.unwrap());

        let config = store.get_bot("alpha").await.unwrap().unwrap();
        assert_eq!(config.version, 1);
        assert!(config.enabled);

        let state = store.get_runtime_state("alpha").await.unwrap().unwrap();
        assert_eq!(state.state, BotState::Stopped);
        assert!(state.started_at.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let store = store().await;
        assert!(store.insert_bot("alpha", "{}", true).await.unwrap());
        assert!(!store.insert_bot("alpha", r#"{"b":2}"#, true).await.unwrap());

        // Original config untouched
        let config = store.get_bot("alpha").await.unwrap().unwrap();
        assert_eq!(config.config_json, "{}");
    }

    #[tokio::test]
    async fn test_versioned_update() {
        let store = store().await;
        store.insert_bot("alpha", "{}", true).await.unwrap();

        assert_eq!(store.update_config("alpha", 1, r#"{"v":2}"#).await.unwrap(), Some(2));
        // Stale expected version
        assert_eq!(store.update_config("alpha", 1, r#"{"v":3}"#).await.unwrap(), None);

        let history = store.config_history("alpha").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], (2, r#"{"v":2}"#.to_string()));
    }

    #[tokio::test]
    async fn test_recoverable_requires_enabled_and_running() {
        let store = store().await;
        for id in ["a", "b", "c"] {
            store.insert_bot(id, "{}", true).await.unwrap();
        }
        let now = Utc::now();
        store.set_state("a", BotState::Running, Some(now)).await.unwrap();
        store.set_state("b", BotState::Stopped, None).await.unwrap();
        store.set_state("c", BotState::Running, Some(now)).await.unwrap();
        store.set_enabled("c", false).await.unwrap();

        let recoverable: Vec<String> = store
            .load_recoverable()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.bot_id)
            .collect();
        assert_eq!(recoverable, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_start_request_is_recoverable_until_consumed() {
        let store = store().await;
        store.insert_bot("alpha", "{}", true).await.unwrap();

        assert!(store.request_start("alpha").await.unwrap());
        assert!(store.get_runtime_state("alpha").await.unwrap().unwrap().start_requested);
        let recoverable = store.load_recoverable().await.unwrap();
        assert_eq!(recoverable[0].bot_id, "alpha");

        // Starting consumes the request
        store.set_state("alpha", BotState::Starting, None).await.unwrap();
        let state = store.get_runtime_state("alpha").await.unwrap().unwrap();
        assert!(!state.start_requested);

        // Active bots cannot be queued
        store.set_state("alpha", BotState::Running, Some(Utc::now())).await.unwrap();
        assert!(!store.request_start("alpha").await.unwrap());
        assert!(!store.request_start("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_state_keeps_started_at_and_heartbeat() {
        let store = store().await;
        store.insert_bot("alpha", "{}", true).await.unwrap();

        let started = Utc::now();
        store.set_state("alpha", BotState::Running, Some(started)).await.unwrap();
        store.heartbeat("alpha", Utc::now()).await.unwrap();
        store.set_state("alpha", BotState::Stopped, None).await.unwrap();

        let state = store.get_runtime_state("alpha").await.unwrap().unwrap();
        assert_eq!(state.state, BotState::Stopped);
        assert_eq!(state.started_at, Some(started));
        assert!(state.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_delete_bot() {
        let store = store().await;
        store.insert_bot("alpha", "{}", true).await.unwrap();

        assert!(store.delete_bot("alpha").await.unwrap());
        assert!(store.get_bot("alpha").await.unwrap().is_none());
        assert!(store.get_runtime_state("alpha").await.unwrap().is_none());
        assert!(!store.delete_bot("alpha").await.unwrap());
    }
}
