//! Telegram Bot API adapter.
//!
//! A thin typed client over the HTTP API, plus the [`MessageSink`]
//! implementation the delivery engine runs against. Error classification
//! lives here: HTTP 429 maps to a throttle with the server's advisory
//! delay, server-side 5xx and connection failures are transient, and
//! everything else is terminal.

use crate::delivery::MessageSink;
use crate::error::{Result, SinkError};
use crate::{ChatId, MessageRef};

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Long-poll hold time requested from the server, in seconds.
const POLL_TIMEOUT_SECS: u64 = 50;

/// Client-side timeout for long-poll requests; must exceed the server hold.
const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(70);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<TelegramUser>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BotCommand {
    pub command: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

pub struct TelegramApi {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramApi {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        payload: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> std::result::Result<T, SinkError> {
        let mut request = self
            .http
            .post(format!("{}/{}", self.base_url, method))
            .json(payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|error| {
            // Connection-level failures are worth retrying.
            SinkError::Transient(format!("{method}: {error}"))
        })?;

        let status = response.status();
        let parsed: ApiResponse<T> = response.json().await.map_err(|error| {
            SinkError::Transient(format!("{method}: malformed response: {error}"))
        })?;

        if parsed.ok {
            return parsed.result.ok_or_else(|| {
                SinkError::Terminal(format!("{method}: ok response without result"))
            });
        }

        let description = parsed
            .description
            .unwrap_or_else(|| "no description".to_string());
        let code = parsed.error_code.unwrap_or_else(|| status.as_u16() as i64);

        if code == 429 {
            let retry_after = parsed.parameters.and_then(|p| p.retry_after);
            return Err(SinkError::Throttled { retry_after });
        }
        if (500..600).contains(&code) {
            return Err(SinkError::Transient(format!("{method}: {code} {description}")));
        }
        Err(SinkError::Terminal(format!("{method}: {code} {description}")))
    }

    pub async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
    ) -> std::result::Result<MessageRef, SinkError> {
        let payload = json!({ "chat_id": chat_id, "text": text });
        let sent: SentMessage = self.call("sendMessage", &payload, None).await?;
        Ok(MessageRef {
            chat_id,
            message_id: sent.message_id,
        })
    }

    pub async fn edit_message_text(
        &self,
        message: MessageRef,
        text: &str,
    ) -> std::result::Result<(), SinkError> {
        let payload = json!({
            "chat_id": message.chat_id,
            "message_id": message.message_id,
            "text": text,
        });
        match self
            .call::<serde_json::Value>("editMessageText", &payload, None)
            .await
        {
            Ok(_) => Ok(()),
            // Editing to identical text is a no-op for us, not a failure.
            Err(SinkError::Terminal(description))
                if description.contains("message is not modified") =>
            {
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    pub async fn get_updates(&self, offset: i64) -> std::result::Result<Vec<Update>, SinkError> {
        let payload = json!({
            "offset": offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"],
        });
        self.call("getUpdates", &payload, Some(POLL_REQUEST_TIMEOUT))
            .await
    }

    /// Long polling and webhooks are mutually exclusive; drop any webhook
    /// left over from a previous deployment before polling.
    pub async fn delete_webhook(&self) -> Result<()> {
        self.call::<serde_json::Value>("deleteWebhook", &json!({}), None)
            .await
            .map_err(|error| anyhow::anyhow!("deleteWebhook failed: {error}"))?;
        Ok(())
    }

    pub async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<()> {
        let payload = json!({ "commands": commands });
        self.call::<serde_json::Value>("setMyCommands", &payload, None)
            .await
            .map_err(|error| anyhow::anyhow!("setMyCommands failed: {error}"))?;
        Ok(())
    }

    /// Best-effort "typing" indicator; failures are ignored by callers.
    pub async fn send_chat_action(&self, chat_id: ChatId, action: &str) -> Result<()> {
        let payload = json!({ "chat_id": chat_id, "action": action });
        self.call::<serde_json::Value>("sendChatAction", &payload, None)
            .await
            .map_err(|error| anyhow::anyhow!("sendChatAction failed: {error}"))?;
        Ok(())
    }
}

impl MessageSink for TelegramApi {
    async fn send(
        &self,
        chat_id: ChatId,
        text: &str,
    ) -> std::result::Result<MessageRef, SinkError> {
        self.send_message(chat_id, text).await
    }

    async fn edit(&self, message: MessageRef, text: &str) -> std::result::Result<(), SinkError> {
        self.edit_message_text(message, text).await
    }
}
