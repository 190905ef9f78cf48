//! Command dispatch for incoming Telegram updates.

use crate::config::Config;
use crate::db::Db;
use crate::delivery::DeliveryEngine;
use crate::error::{DeliveryError, Result};
use crate::llm::GeminiClient;
use crate::repo::{ExchangeRepo, UserRepo};
use crate::telegram::{IncomingMessage, TelegramApi, Update};
use crate::ChatId;

use std::sync::Arc;
use tokio::sync::watch;

const HELP_TEXT: &str = "Ask me anything with /ask <question>.\n\
    The answer streams into the chat as it is generated.\n\n\
    /start — introduction\n\
    /help — this message\n\
    /ask <question> — ask the model";

const START_NEW_USER: &str =
    "Hello! I answer questions using Gemini, streaming the reply as it is written.\n\
     Try /ask followed by your question.";

const START_RETURNING: &str = "Welcome back. /ask is ready when you are.";

const BUSY_TEXT: &str = "I'm still answering your previous question. \
    Wait for it to finish, then ask again.";

const FAILURE_TEXT: &str = "Sorry, I couldn't produce an answer this time. Please try again.";

/// Everything a handler needs, shared across all in-flight updates.
pub struct BotContext {
    pub api: Arc<TelegramApi>,
    pub engine: DeliveryEngine<TelegramApi>,
    pub gemini: GeminiClient,
    pub users: UserRepo,
    pub exchanges: ExchangeRepo,
    /// Flipped to true on shutdown; cancels every in-flight delivery.
    pub shutdown: watch::Receiver<bool>,
}

impl BotContext {
    pub fn new(config: &Config, api: Arc<TelegramApi>, db: &Db, shutdown: watch::Receiver<bool>) -> Self {
        let engine = DeliveryEngine::new(api.clone(), config.delivery.clone());
        let gemini = GeminiClient::new(config.gemini_api_key.clone(), config.gemini_model.clone());
        Self {
            api,
            engine,
            gemini,
            users: UserRepo::new(db.sqlite.clone()),
            exchanges: ExchangeRepo::new(db.sqlite.clone()),
            shutdown,
        }
    }
}

/// Route one update to its handler. Non-command messages and updates
/// without text are ignored.
#[tracing::instrument(skip(context, update), fields(update_id = update.update_id))]
pub async fn dispatch(context: Arc<BotContext>, update: Update) {
    let Some(message) = update.message else {
        return;
    };
    let Some(text) = message.text.clone() else {
        return;
    };
    let Some((command, args)) = parse_command(&text) else {
        return;
    };

    let chat_id = message.chat.id;
    let result = match command.as_str() {
        "start" => handle_start(&context, &message).await,
        "help" => handle_help(&context, chat_id).await,
        "ask" => handle_ask(&context, chat_id, args).await,
        other => {
            tracing::debug!(command = other, "ignoring unknown command");
            Ok(())
        }
    };

    if let Err(error) = result {
        tracing::error!(chat_id, %error, "handler failed");
    }
}

/// Extract `(command, args)` from a `/command@botname args` message.
/// Returns `None` for non-command text.
fn parse_command(text: &str) -> Option<(String, &str)> {
    let text = text.trim_start();
    let rest = text.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    // Group chats append the bot's username: /ask@somebot.
    let command = head.split('@').next().unwrap_or(head);
    if command.is_empty() {
        return None;
    }
    Some((command.to_ascii_lowercase(), args))
}

async fn handle_start(context: &BotContext, message: &IncomingMessage) -> Result<()> {
    let chat_id = message.chat.id;
    let greeting = match &message.from {
        Some(user) => {
            let is_new = context.users.ensure(user.id).await?;
            tracing::info!(chat_id, user_id = user.id, is_new, "start command");
            if is_new { START_NEW_USER } else { START_RETURNING }
        }
        None => START_NEW_USER,
    };
    context
        .api
        .send_message(chat_id, greeting)
        .await
        .map_err(|error| anyhow::anyhow!("failed to send greeting: {error}"))?;
    Ok(())
}

async fn handle_help(context: &BotContext, chat_id: ChatId) -> Result<()> {
    context
        .api
        .send_message(chat_id, HELP_TEXT)
        .await
        .map_err(|error| anyhow::anyhow!("failed to send help: {error}"))?;
    Ok(())
}

async fn handle_ask(context: &BotContext, chat_id: ChatId, question: &str) -> Result<()> {
    if question.is_empty() {
        context
            .api
            .send_message(chat_id, "Usage: /ask <question>")
            .await
            .map_err(|error| anyhow::anyhow!("failed to send usage hint: {error}"))?;
        return Ok(());
    }

    if let Err(error) = context.api.send_chat_action(chat_id, "typing").await {
        tracing::debug!(chat_id, %error, "typing indicator failed");
    }

    let stream = context.gemini.stream_answer(question).await;
    let cancel = session_cancel(
        context.shutdown.clone(),
        context.engine.config().generation_timeout,
    );

    match context.engine.deliver(chat_id, stream, cancel).await {
        Ok(outcome) => {
            tracing::info!(
                chat_id,
                operations = outcome.operations,
                messages = outcome.messages,
                answer_len = outcome.final_text.len(),
                "answer delivered"
            );
            if !outcome.final_text.is_empty() {
                context
                    .exchanges
                    .record(chat_id, question, &outcome.final_text)
                    .await?;
            }
            Ok(())
        }
        Err(DeliveryError::ConversationBusy(_)) => {
            context
                .api
                .send_message(chat_id, BUSY_TEXT)
                .await
                .map_err(|error| anyhow::anyhow!("failed to send busy notice: {error}"))?;
            Ok(())
        }
        Err(DeliveryError::Cancelled(_)) => {
            tracing::info!(chat_id, "delivery cancelled");
            Ok(())
        }
        Err(error) => {
            tracing::error!(chat_id, %error, delivered = error.delivered(), "delivery failed");
            // The engine already appended its failure notice when partial
            // output reached the chat; only the nothing-delivered case needs
            // a message from here.
            if error.delivered() == 0 {
                if let Err(send_error) = context.api.send_message(chat_id, FAILURE_TEXT).await {
                    tracing::warn!(chat_id, %send_error, "failed to send failure notice");
                }
            }
            Ok(())
        }
    }
}

/// Cancellation for one delivery session: fires on shutdown or once the
/// generation deadline passes. The timer task ends as soon as the session
/// drops its receiver, not after the full deadline.
fn session_cancel(
    shutdown: watch::Receiver<bool>,
    timeout: std::time::Duration,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(cancel_timer(tx, shutdown, timeout));
    rx
}

async fn cancel_timer(
    tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
    timeout: std::time::Duration,
) {
    tokio::select! {
        // Every receiver gone means the session already finished.
        _ = tx.closed() => {}
        _ = crate::delivery::cancelled(&mut shutdown) => {
            let _ = tx.send(true);
        }
        _ = tokio::time::sleep(timeout) => {
            let _ = tx.send(true);
        }
    }
}
