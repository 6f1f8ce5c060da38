use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use relay_core::{
    AlertSource, DispatchChannel, MessageFormatter, MonitorApiClient, RelayConfig, SessionStore,
    SlackChannel, StoreBackend,
};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use relay_server::commands::CommandHandler;
use relay_server::http::{self, HttpState};
use relay_server::subsystems::{self, poller};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "relay.toml")]
    config: String,

    /// Check the session store and exit
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match RelayConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over service.log_level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.as_str()));
    fmt().with_env_filter(filter).init();

    let store = match subsystems::create_store_from_config(&config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open session store: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        if config.database.backend == StoreBackend::Postgres {
            let version = match relay_core::db::create_pool(&config.database).await {
                Ok(pool) => relay_core::db::health_check(&pool).await,
                Err(e) => Err(e),
            };
            match version {
                Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                Err(e) => {
                    println!("❌ PostgreSQL connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        match store.find_all().await {
            Ok(sessions) => println!(
                "✅ Session store ({}) reachable: {} sessions",
                store.name(),
                sessions.len()
            ),
            Err(e) => {
                println!("❌ Session store check failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Relay health check passed");
        return Ok(());
    }

    let source: Arc<dyn AlertSource> = Arc::new(MonitorApiClient::new(&config.upstream)?);
    let channel: Arc<dyn DispatchChannel> = match SlackChannel::new(&config.slack) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to set up Slack channel: {}", e);
            std::process::exit(1);
        }
    };
    let formatter = MessageFormatter::new(
        config.upstream.dashboard_url.clone(),
        config.polling.max_components,
    );

    let engine = Arc::new(poller::PollingEngine::new(
        store.clone(),
        source.clone(),
        channel,
        formatter,
        config.polling.clone(),
        Utc::now(),
    ));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // HTTP API and slash commands, if enabled
    let http_task = if config.http.enabled {
        let state = Arc::new(HttpState {
            store: store.clone(),
            engine: engine.clone(),
            commands: CommandHandler::new(
                store.clone(),
                source.clone(),
                config.upstream.dashboard_url.clone(),
            ),
            signing_secret: config.slack.signing_secret.clone(),
        });
        if state.signing_secret.is_empty() {
            tracing::warn!("slack.signing_secret is empty; slash commands will be rejected");
        }
        let http_config = config.http.clone();
        let http_shutdown = tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = http::start_http_server(state, http_config, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        }))
    } else {
        None
    };

    poller::run_polling_loop(engine, tx.subscribe()).await;

    if let Some(task) = http_task {
        let _ = task.await;
    }

    tracing::info!("Relay stopped");
    Ok(())
}
