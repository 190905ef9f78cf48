//! Arcanum: a Telegram bot that streams AI-generated answers into chat.
//!
//! The core of the crate is the [`delivery`] module — the engine that turns
//! an incrementally produced text stream into a paced, correctly chunked
//! sequence of send/edit operations against the messaging transport. The
//! rest is glue: the Telegram adapter, the Gemini stream source, command
//! handling, and persistence.

pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod llm;
pub mod repo;
pub mod telegram;

pub use error::{Error, Result};

/// Telegram chat identifier. Doubles as the conversation key partitioning
/// delivery serialization domains — one lock per chat.
pub type ChatId = i64;

/// Opaque reference to a previously sent message, enabling later edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: i64,
}
