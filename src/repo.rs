//! Persistence for users and question/answer exchanges.

use crate::error::Result;
use crate::ChatId;

use sqlx::SqlitePool;

/// Known users, keyed by Telegram user id.
#[derive(Clone)]
pub struct UserRepo {
    pool: SqlitePool,
}

impl UserRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the user if unseen. Returns true when this was a first
    /// contact, so callers can vary the greeting.
    pub async fn ensure(&self, telegram_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO users (telegram_id) VALUES (?) ON CONFLICT (telegram_id) DO NOTHING",
        )
        .bind(telegram_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Completed question/answer exchanges.
#[derive(Clone)]
pub struct ExchangeRepo {
    pool: SqlitePool,
}

impl ExchangeRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, chat_id: ChatId, question: &str, answer: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO exchanges (chat_id, question, answer, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(chat_id)
        .bind(question)
        .bind(answer)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
