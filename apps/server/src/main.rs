//! Ceremony Monitor - Telegram bot server
//!
//! Watches Silent Protocol ceremony tokens for users and reports status
//! and queue position changes to their Telegram chats.

mod config;
mod health;

use ceremony_alerts::{Database, TelegramAlertSink, TelegramBot};
use ceremony_engine::{
    HttpStatusClient, MonitorContext, MonitorRegistry, MonitorStore, RetryingProbe,
};
use clap::Parser;
use config::AppConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use teloxide::Bot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Ceremony Monitor CLI
#[derive(Parser, Debug)]
#[command(name = "ceremony-bot")]
#[command(about = "Telegram bot tracking ceremony status and queue position", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// SQLite database URL (overrides config file)
    #[arg(long)]
    database_url: Option<String>,

    /// Health endpoint port (overrides config file)
    #[arg(long)]
    health_port: Option<u16>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long)]
    log_level: Option<String>,

    /// Seconds between polls of a user's tokens (overrides config file)
    #[arg(long)]
    interval_secs: Option<u64>,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(url) = self.database_url {
            config.database_url = url;
        }
        if let Some(port) = self.health_port {
            config.health_port = port;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(secs) = self.interval_secs {
            config.monitor.interval_secs = secs;
        }
    }
}

fn init_logging(level: &str) {
    let level = match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let mut app_config = match AppConfig::load(Path::new(&args.config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    args.apply(&mut app_config);

    init_logging(&app_config.log_level);

    info!("🚀 Ceremony Monitor starting...");
    info!("  Database: {}", app_config.database_url);
    info!("  Service: {}", app_config.service.base_url);
    info!("  Poll interval: {}s", app_config.monitor.interval_secs);
    info!("  Health port: {}", app_config.health_port);

    let Some(bot_token) = config::bot_token_from_env() else {
        error!("{} is not set", config::BOT_TOKEN_ENV);
        std::process::exit(1);
    };

    let db = match Database::connect(&app_config.database_url).await {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    let store: Arc<dyn MonitorStore> = Arc::new(db);

    let client = match HttpStatusClient::new((&app_config.service).into()) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build status client: {}", e);
            std::process::exit(1);
        }
    };
    let probe = Arc::new(RetryingProbe::new(
        Arc::new(client),
        (&app_config.retry).into(),
    ));

    let bot = Bot::new(bot_token);
    let sink = Arc::new(TelegramAlertSink::new(
        bot.clone(),
        (&app_config.notifier).into(),
    ));

    let registry = Arc::new(MonitorRegistry::new(
        MonitorContext {
            probe,
            sink,
            store: store.clone(),
        },
        (&app_config.monitor).into(),
    ));

    let shutdown = CancellationToken::new();
    let supervisor = registry.spawn_supervisor(shutdown.clone());

    match registry.resume_all().await {
        Ok(resumed) => info!("Resumed {} monitor(s)", resumed),
        Err(e) => warn!("Failed to resume monitors: {}", e),
    }

    let health = match health::start_health_server(
        registry.clone(),
        app_config.health_port,
        shutdown.clone(),
    )
    .await
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Failed to start health endpoint: {}", e);
            None
        }
    };

    // Runs until Ctrl+C.
    info!("Press Ctrl+C to stop...");
    let telegram = Arc::new(TelegramBot::new(bot, registry.clone(), store));
    telegram.run().await;

    warn!("Shutdown signal received");
    shutdown.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(2), supervisor).await;
    let stopped = registry.shutdown().await;
    if let Some(handle) = health {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    info!("  Monitors stopped: {}", stopped);
    info!("👋 Ceremony Monitor stopped");
}
