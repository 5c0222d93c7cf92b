//! Fleet CLI: manage bots, run the orchestrator and backtest configs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use perp_fleet::backtest::Backtester;
use perp_fleet::bot::{
    control, BotConfig, BotEvent, BotRegistry, DefaultEngineFactory, OrchestratorConfig,
};
use perp_fleet::db::BotStore;
use perp_fleet::models::MarketEvent;
use perp_fleet::trading::StrategyRegistry;

/// Multi-bot perpetuals trading CLI.
#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Run many crash-recoverable trading bots", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./fleet.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seconds between persisted heartbeats of running bots
    #[arg(long, env = "FLEET_HEARTBEAT_SECS", default_value = "5")]
    heartbeat_secs: u64,

    /// Seconds a bot gets to acknowledge a stop before it is marked failed
    #[arg(long, env = "FLEET_SHUTDOWN_TIMEOUT_SECS", default_value = "10")]
    shutdown_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a bot from a JSON config file
    Create {
        /// Path to the bot config
        file: PathBuf,

        /// Override the bot id in the file
        #[arg(long)]
        id: Option<String>,
    },

    /// List all bots
    List,

    /// Queue a stopped bot to start with the next `run`
    Start {
        bot_id: String,
    },

    /// Mark a bot stopped; refused while a live `run` owns it
    Stop {
        bot_id: String,
    },

    /// Delete a bot and its history; refused while a live `run` owns it
    Remove {
        bot_id: String,
    },

    /// Restore bots and feed them market events until Ctrl+C
    Run {
        /// JSON-lines market events; stdin when omitted
        #[arg(short, long)]
        feed: Option<PathBuf>,

        /// Delay between published events, for replaying files
        #[arg(long, default_value = "0")]
        replay_delay_ms: u64,
    },

    /// Replay historical market data through a bot config
    Backtest {
        /// Path to the bot config
        #[arg(short, long)]
        config: PathBuf,

        /// JSON-lines market events
        #[arg(short, long)]
        data: PathBuf,
    },

    /// Show orchestrator settings, strategies or a bot's config
    Config {
        /// Print this bot's stored config and version history
        bot_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level.to_string().to_lowercase())),
        )
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let orchestrator = OrchestratorConfig {
        heartbeat_interval: Duration::from_secs(cli.heartbeat_secs.max(1)),
        shutdown_timeout: Duration::from_secs(cli.shutdown_timeout_secs),
        ..Default::default()
    };

    match cli.command {
        Commands::Backtest { config, data } => {
            let config = load_config(&config)?;
            let results = Backtester::new(config).run_file(&data).await?;
            println!("{}", results);
        }

        Commands::Create { file, id } => {
            let mut config = load_config(&file)?;
            if let Some(id) = id {
                config.bot_id = id;
            }

            let registry = open_registry(&cli.database, orchestrator).await?;
            let bot_id = registry.create(config).await?;
            println!("Created bot: {}", bot_id);
        }

        Commands::List => {
            let store = BotStore::new(&cli.database).await?;
            let bots = store.load_all_bots().await?;

            if bots.is_empty() {
                println!("No bots yet. Use 'fleet create <config.json>' to add one.");
                return Ok(());
            }

            let states = store.load_runtime_states().await?;

            println!(
                "\n{:<24} {:<10} {:<8} {:>4} {:<6} {:<16} {:<20}",
                "BOT", "STATE", "ENABLED", "VER", "MODE", "STRATEGY", "LAST HEARTBEAT"
            );
            println!("{}", "-".repeat(94));

            for stored in bots {
                let state = states.iter().find(|s| s.bot_id == stored.bot_id);
                let (mode, strategy) = BotConfig::from_json(&stored.config_json)
                    .map(|c| (c.mode.to_string(), c.strategy.name))
                    .unwrap_or_else(|_| ("?".to_string(), "<unreadable>".to_string()));

                println!(
                    "{:<24} {:<10} {:<8} {:>4} {:<6} {:<16} {:<20}",
                    truncate(&stored.bot_id, 22),
                    state.map(|s| s.state.as_str()).unwrap_or("unknown"),
                    if stored.enabled { "yes" } else { "no" },
                    stored.version,
                    mode,
                    truncate(&strategy, 14),
                    state
                        .and_then(|s| s.last_heartbeat)
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }

        Commands::Start { bot_id } => {
            let store = BotStore::new(&cli.database).await?;
            control::request_start(&store, &DefaultEngineFactory::default(), &bot_id).await?;
            println!("Bot {} queued. It starts with the next 'fleet run'.", bot_id);
        }

        Commands::Stop { bot_id } => {
            let store = BotStore::new(&cli.database).await?;
            let previous = control::request_stop(&store, &bot_id, live_within(&orchestrator)).await?;
            println!("Bot {} marked stopped (was {}).", bot_id, previous);
        }

        Commands::Remove { bot_id } => {
            let store = BotStore::new(&cli.database).await?;
            control::remove_offline(&store, &bot_id, live_within(&orchestrator)).await?;
            println!("Removed bot: {}", bot_id);
        }

        Commands::Run {
            feed,
            replay_delay_ms,
        } => {
            let registry = Arc::new(open_registry(&cli.database, orchestrator.clone()).await?);
            let report = registry.restore().await?;

            println!("\n=== Fleet ===");
            println!("Bots registered: {}", report.registered.len());
            println!("Bots running:    {}", report.restarted.len());
            if !report.failed.is_empty() {
                println!("Failed to start: {}", report.failed.join(", "));
            }
            println!("\nPress Ctrl+C to stop.\n");

            let event_log = tokio::spawn(log_bot_events(registry.subscribe()));
            let publisher = tokio::spawn(publish_feed(
                registry.clone(),
                feed,
                Duration::from_millis(replay_delay_ms),
            ));

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Shutdown signal received");

            publisher.abort();
            let results = registry.shutdown_all().await;
            let busy = registry.wait_for_draining(orchestrator.shutdown_timeout).await;
            if busy > 0 {
                warn!(bots = busy, "Exiting while bots are still finishing orders");
            }
            event_log.abort();

            println!("\n{:<24} {:<10}", "BOT", "FINAL STATE");
            println!("{}", "-".repeat(36));
            for (bot_id, state) in results {
                println!("{:<24} {:<10}", truncate(&bot_id, 22), state);
            }
        }

        Commands::Config { bot_id } => match bot_id {
            Some(bot_id) => {
                let store = BotStore::new(&cli.database).await?;
                let stored = store
                    .get_bot(&bot_id)
                    .await?
                    .ok_or_else(|| anyhow!("Bot {} not found", bot_id))?;
                let config = BotConfig::from_json(&stored.config_json)?;

                println!("\n=== Bot {} (v{}) ===\n", bot_id, stored.version);
                println!("{}", serde_json::to_string_pretty(&config)?);
                println!("\nRisk:      {} on {}", config.risk.policy, config.risk.sizing_base);

                let history = store.config_history(&bot_id).await?;
                println!("\n--- History ({} versions) ---", history.len());
                for (version, _) in history {
                    println!("  v{}", version);
                }
            }
            None => {
                println!("\n=== Orchestrator ===\n");
                println!("  Database:          {}", cli.database);
                println!("  Heartbeat:         {}s", orchestrator.heartbeat_interval.as_secs());
                println!("  Shutdown timeout:  {}s", orchestrator.shutdown_timeout.as_secs());
                println!("  Market buffer:     {}", orchestrator.market_buffer);

                println!("\n=== Strategies ===\n");
                for name in StrategyRegistry::with_builtin().names() {
                    println!("  {}", name);
                }
            }
        },
    }

    Ok(())
}

/// Heartbeat age under which a bot counts as owned by a running orchestrator.
fn live_within(config: &OrchestratorConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.heartbeat_interval * 3)
        .unwrap_or_else(|_| chrono::Duration::seconds(15))
}

async fn open_registry(database_url: &str, config: OrchestratorConfig) -> Result<BotRegistry> {
    let store = Arc::new(BotStore::new(database_url).await?);
    Ok(BotRegistry::new(
        store,
        Arc::new(DefaultEngineFactory::default()),
        config,
    ))
}

fn load_config(path: &Path) -> Result<BotConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    BotConfig::from_json(&json).with_context(|| format!("Invalid bot config in {}", path.display()))
}

/// Read JSON-lines market events and fan them out to the bots.
async fn publish_feed(registry: Arc<BotRegistry>, feed: Option<PathBuf>, delay: Duration) {
    let result = match feed {
        Some(path) => match tokio::fs::File::open(&path).await {
            Ok(file) => publish_lines(&registry, BufReader::new(file), delay).await,
            Err(e) => Err(anyhow!("Failed to open feed {}: {}", path.display(), e)),
        },
        None => publish_lines(&registry, BufReader::new(tokio::io::stdin()), delay).await,
    };

    match result {
        Ok(count) => info!(events = count, "Market feed finished"),
        Err(e) => error!(error = %e, "Market feed failed"),
    }
}

async fn publish_lines<R>(registry: &BotRegistry, reader: BufReader<R>, delay: Duration) -> Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    let mut count = 0usize;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<MarketEvent>(line) {
            Ok(event) => {
                registry.publish(event);
                count += 1;
            }
            Err(e) => warn!(error = %e, "Skipping malformed market event"),
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    Ok(count)
}

async fn log_bot_events(mut events: tokio::sync::broadcast::Receiver<BotEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(BotEvent::Fill { bot_id, fill, equity }) => info!(
                bot_id = %bot_id,
                symbol = %fill.symbol,
                side = %fill.direction,
                quantity = %fill.quantity,
                price = %fill.fill_price,
                equity = %equity,
                "Fill"
            ),
            Ok(BotEvent::Rejected { bot_id, order_id, reason }) => {
                warn!(bot_id = %bot_id, order_id = %order_id, reason = %reason, "Order rejected")
            }
            Ok(BotEvent::StateChanged { bot_id, state }) => {
                info!(bot_id = %bot_id, state = %state, "Bot state changed")
            }
            Ok(BotEvent::Signal { .. }) => {}
            Err(RecvError::Lagged(n)) => warn!(lagged = n, "Event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Truncate a string to max length in characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("alpha", 22), "alpha");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");

        // Multi-byte ids must not be split inside a character
        assert_eq!(truncate("bot-éééééééé", 8), "bot-é...");
    }
}
