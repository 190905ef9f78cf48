//! Error types shared across the crate.

use crate::ChatId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error for the binary's glue paths. The delivery engine and the
/// transport adapter keep their own typed errors below; everything else is
/// wrapped through here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is missing")]
    Missing(&'static str),

    #[error("environment variable {key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failure of the generation backend mid-stream. Carried inside the delta
/// stream so the delivery session can report how much text made it out.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SourceError(pub String);

/// Transport (sink) errors, classified for the retry policy: throttled and
/// transient failures are retried with backoff, terminal ones are not.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("transport throttled{}", retry_after.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    Throttled { retry_after: Option<u64> },

    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("terminal transport failure: {0}")]
    Terminal(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Transient(_))
    }
}

/// Failure of one delivery session, with enough context for the caller to
/// decide on user messaging: the conversation key and how much text had
/// already been delivered when things went wrong.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("generation stream failed for chat {chat_id} after {delivered} delivered bytes: {message}")]
    Source {
        chat_id: ChatId,
        delivered: usize,
        message: String,
    },

    #[error("transport failed for chat {chat_id} after {delivered} delivered bytes: {source}")]
    Sink {
        chat_id: ChatId,
        delivered: usize,
        #[source]
        source: SinkError,
    },

    #[error("chat {0} already has an answer in flight")]
    ConversationBusy(ChatId),

    #[error("delivery for chat {0} was cancelled")]
    Cancelled(ChatId),
}

impl DeliveryError {
    /// Bytes of text successfully delivered before the failure. Zero for
    /// busy/cancelled outcomes, where nothing user-visible happened yet.
    pub fn delivered(&self) -> usize {
        match self {
            Self::Source { delivered, .. } | Self::Sink { delivered, .. } => *delivered,
            Self::ConversationBusy(_) | Self::Cancelled(_) => 0,
        }
    }
}
