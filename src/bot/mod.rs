//! Bot orchestration: many concurrent trading engines with durable lifecycle.

pub(crate) mod config;
pub mod control;
mod error;
mod factory;
mod registry;
mod runner;
mod state;

pub use config::{BotConfig, ExecutionMode, WarmupConfig};
pub use error::RegistryError;
pub use factory::{DefaultEngineFactory, EngineFactory};
pub use registry::{BotRegistry, OrchestratorConfig, RestoreReport};
pub use runner::{BotCommand, BotEvent, BotHandle, RunnerExit, RunnerStatus};
pub use state::{BotRuntimeState, BotState, BotStatus};
