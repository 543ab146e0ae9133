// Auction server entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file)
// 2. Load config
// 3. Open database
// 4. Create the event bus and engine, seed team budgets
// 5. Build shared application state
// 6. Spawn WebSocket server task
// 7. Wait for Ctrl+C, then shut down

use std::sync::Arc;

use roundbid_core::db::Database;
use roundbid_core::events::EventBus;
use roundbid_core::Engine;
use roundbid_server::app::AppState;
use roundbid_server::config;
use roundbid_server::ws_server;

use anyhow::Context;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing (log to file)
    init_tracing()?;
    info!("Auction server starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: {} teams, {} identity tokens, increment {}",
        config.auction.teams.len(),
        config.credentials.tokens.len(),
        config.auction.rounds.bid_increment
    );

    // 3. Open database
    let db = Database::open(&config.db_path).context("failed to open database")?;
    info!("Database opened at {}", config.db_path);

    // 4. Event bus, engine, and team budgets. Existing balances are kept so
    // a restart does not undo committed spending.
    let events = EventBus::new(config.event_channel_capacity);
    let engine = Arc::new(Engine::new(db, events));
    for team in &config.auction.teams {
        let budget = engine
            .register_team(&team.id, &team.name, team.budget)
            .with_context(|| format!("failed to register team {}", team.id))?;
        info!("Team {} ready with balance {}", budget.team_id, budget.balance);
    }

    // 5. Shared application state
    let state = Arc::new(AppState::from_config(Arc::clone(&engine), &config));
    if state.identities.is_empty() {
        error!("No identity tokens configured; every command will be rejected");
    }

    // 6. Spawn WebSocket server task
    let ws_port = config.ws_port;
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(ws_port, state).await {
            error!("WebSocket server error: {}", e);
        }
    });
    info!("Server ready. WebSocket server listening on 127.0.0.1:{}", ws_port);

    // 7. Wait for Ctrl+C
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    ws_handle.abort();
    info!("Auction server shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to `logs/roundbid.log`.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("roundbid.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("roundbid=info,roundbid_core=info,roundbid_server=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
