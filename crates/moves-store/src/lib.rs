pub mod error;
pub mod models;

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Sqlite;

pub use error::StoreError;

/// Embedded transactional storage. One pool per process, WAL journal mode
/// for concurrent readers, serialized writers.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the sqlite file at `database_url` and
    /// apply any pending migrations under `migrations/`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.apply_migrations().await?;
        Ok(store)
    }

    async fn apply_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction. Commits on `.commit()`, rolls back on drop
    /// without commit or on `.rollback()`.
    pub async fn transaction(&self) -> Result<sqlx::Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn get_schema_version(&self) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM _sqlx_migrations ORDER BY version DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0).unwrap_or(0))
    }

    pub fn exists(path: &str) -> bool {
        let file_path = path.strip_prefix("sqlite:").unwrap_or(path);
        Path::new(file_path).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_creates_schema() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let version = store.get_schema_version().await.unwrap();
        assert!(version >= 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_drop() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        {
            let mut tx = store.transaction().await.unwrap();
            sqlx::query("INSERT INTO accounts (name, broker_label, account_type) VALUES ('a', 'mock', 'individual')")
                .execute(&mut *tx)
                .await
                .unwrap();
            // dropped without commit
        }
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
