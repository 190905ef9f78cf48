use arcanum::config::Config;
use arcanum::db::Db;
use arcanum::handlers::{self, BotContext};
use arcanum::telegram::{BotCommand, TelegramApi};
use arcanum::Result;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Pause between polls after a getUpdates failure, to avoid hammering a
/// struggling API.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(3);

const COMMANDS: &[BotCommand] = &[
    BotCommand {
        command: "start",
        description: "Introduction and first-time setup",
    },
    BotCommand {
        command: "help",
        description: "How to use the bot",
    },
    BotCommand {
        command: "ask",
        description: "Ask the model a question",
    },
];

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env()?;
    init_tracing(config.debug);

    let db = Db::connect(&config.db_path).await?;
    let api = Arc::new(TelegramApi::new(&config.telegram_token));

    // Long polling and webhooks are mutually exclusive.
    api.delete_webhook().await?;
    if let Err(error) = api.set_my_commands(COMMANDS).await {
        tracing::warn!(%error, "failed to register command menu");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let context = Arc::new(BotContext::new(&config, api.clone(), &db, shutdown_rx.clone()));

    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(model = %config.gemini_model, "bot started, polling for updates");
    poll_updates(context, api, shutdown_rx).await;

    db.close().await;
    tracing::info!("shut down cleanly");
    Ok(())
}

/// Long-poll getUpdates until shutdown, spawning a handler per update.
async fn poll_updates(
    context: Arc<BotContext>,
    api: Arc<TelegramApi>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut offset = 0i64;
    loop {
        let updates = tokio::select! {
            biased;
            _ = shutdown.wait_for(|flag| *flag) => break,
            updates = api.get_updates(offset) => updates,
        };

        match updates {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    tokio::spawn(handlers::dispatch(context.clone(), update));
                }
            }
            Err(error) => {
                tracing::warn!(%error, "getUpdates failed, backing off");
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|flag| *flag) => break,
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::new("info")
    };
    let fmt_layer = tracing_subscriber::fmt::layer().compact();
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
