//! Errors surfaced by the bot registry.

use thiserror::Error;

use super::BotState;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Duplicate id, stale config version, or a lifecycle call that clashes
    /// with the bot's current state
    #[error("conflict for bot {bot_id}: {reason}")]
    Conflict { bot_id: String, reason: String },

    #[error("bot {0} not found")]
    NotFound(String),

    #[error("invalid bot config: {0:#}")]
    InvalidConfig(anyhow::Error),

    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),

    /// Engine could not be built or the bot task died
    #[error("engine failure for bot {bot_id}: {source:#}")]
    Engine {
        bot_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RegistryError {
    pub(crate) fn conflict(bot_id: &str, reason: impl Into<String>) -> Self {
        RegistryError::Conflict {
            bot_id: bot_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn busy(bot_id: &str, state: BotState) -> Self {
        Self::conflict(bot_id, format!("bot is {}", state))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RegistryError::busy("a", BotState::Running).is_conflict());
        assert!(RegistryError::NotFound("a".into()).is_not_found());
        assert!(!RegistryError::Persistence(anyhow::anyhow!("disk full")).is_conflict());
    }

    #[test]
    fn test_message_includes_state() {
        let err = RegistryError::busy("alpha", BotState::Starting);
        assert_eq!(err.to_string(), "conflict for bot alpha: bot is starting");
    }
}
