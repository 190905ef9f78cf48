//! Database connection management and migrations.

use crate::error::Result;
use anyhow::Context as _;
use sqlx::SqlitePool;
use std::path::Path;

pub struct Db {
    pub sqlite: SqlitePool,
}

impl Db {
    /// Connect to the SQLite database, creating it if absent, and run
    /// migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let sqlite = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("failed to connect to SQLite at {}", path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&sqlite)
            .await
            .context("failed to run database migrations")?;

        Ok(Self { sqlite })
    }

    pub async fn close(self) {
        self.sqlite.close().await;
    }
}
