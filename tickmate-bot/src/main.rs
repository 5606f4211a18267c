use clap::Parser;
use std::sync::Arc;
use teloxide::Bot;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use tickmate_bot::transport::{run_dispatcher, AgentStore, AppContext};
use tickmate_bot::{ConnectionRegistry, SessionStore};
use tickmate_core::llm::CompletionClient;
use tickmate_core::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print the resolved configuration (secrets redacted) and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    if args.check_config {
        println!("broker base url: {}", config.broker.base_url);
        println!("openai model:    {}", config.openai.model);
        println!("session timeout: {}min", config.session.timeout_minutes);
        println!("config OK");
        return Ok(());
    }

    let llm = match CompletionClient::new(config.openai.clone()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to build completion client: {e}");
            std::process::exit(1);
        }
    };

    let sessions = SessionStore::new(config.session.clone());
    let registry = ConnectionRegistry::new(config.broker.clone(), config.session.clone());

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tokio::spawn(tickmate_bot::state::run_session_sweep(
        sessions.clone(),
        registry.clone(),
        tx.subscribe(),
    ));
    tokio::spawn(tickmate_bot::registry::run_connection_sweep(
        registry.clone(),
        tx.subscribe(),
    ));

    let ctx = Arc::new(AppContext {
        sessions,
        registry: registry.clone(),
        llm,
        agents: AgentStore::default(),
        agent_config: config.agent.clone(),
    });

    let bot = Bot::new(config.telegram.bot_token.clone());
    tracing::info!("tickmate bot starting");
    run_dispatcher(bot, ctx).await;

    // Dispatcher exited (Ctrl+C). Stop sweeps and log everyone out.
    let _ = tx.send(());
    registry.shutdown_all().await;
    tracing::info!("tickmate bot stopped");

    Ok(())
}
