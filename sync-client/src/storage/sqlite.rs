//! SQLite storage backend.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use inline_sync_core::{BucketState, SyncState};
use inline_sync_types::{BucketKey, Seq};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use super::SyncStorage;
use crate::error::StorageError;

/// Watermarks persisted in a SQLite database.
///
/// Uses WAL mode so the embedding app can read the same file while the
/// engine writes.
#[derive(Clone)]
pub struct SqliteSyncStorage {
    pool: SqlitePool,
}

impl SqliteSyncStorage {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path
            .to_str()
            .ok_or_else(|| StorageError::Unavailable(format!("non-utf8 path: {}", path.display())))?;
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// In-memory database (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // One connection: every connection to :memory: is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_sync_date INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bucket_state (
                bucket TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                date INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Every stored bucket watermark.
    pub async fn bucket_states(&self) -> Result<HashMap<BucketKey, BucketState>, StorageError> {
        let rows: Vec<(String, i64, i64)> =
            sqlx::query_as("SELECT bucket, seq, date FROM bucket_state")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(bucket, seq, date)| {
                let key = BucketKey::from_str(&bucket)
                    .map_err(|_| StorageError::InvalidBucketKey(bucket.clone()))?;
                Ok((key, row_state(seq, date)))
            })
            .collect()
    }
}

fn row_state(seq: i64, date: i64) -> BucketState {
    BucketState {
        seq: Seq::new(u64::try_from(seq).unwrap_or(0)),
        date,
    }
}

fn seq_column(state: &BucketState) -> i64 {
    i64::try_from(state.seq.value()).unwrap_or(i64::MAX)
}

const UPSERT_BUCKET: &str = r#"
    INSERT INTO bucket_state (bucket, seq, date)
    VALUES (?1, ?2, ?3)
    ON CONFLICT(bucket) DO UPDATE SET seq = excluded.seq, date = excluded.date
"#;

#[async_trait]
impl SyncStorage for SqliteSyncStorage {
    async fn get_state(&self) -> Result<SyncState, StorageError> {
        let row: Option<Option<i64>> =
            sqlx::query_scalar("SELECT last_sync_date FROM sync_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(SyncState {
            last_sync_date: row.flatten(),
        })
    }

    async fn set_state(&self, state: SyncState) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (id, last_sync_date) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET last_sync_date = excluded.last_sync_date
            "#,
        )
        .bind(state.last_sync_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_bucket_state(&self, bucket: BucketKey) -> Result<BucketState, StorageError> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT seq, date FROM bucket_state WHERE bucket = ?1")
                .bind(bucket.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row
            .map(|(seq, date)| row_state(seq, date))
            .unwrap_or_default())
    }

    async fn set_bucket_state(
        &self,
        bucket: BucketKey,
        state: BucketState,
    ) -> Result<(), StorageError> {
        sqlx::query(UPSERT_BUCKET)
            .bind(bucket.to_string())
            .bind(seq_column(&state))
            .bind(state.date)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_bucket_states(
        &self,
        states: &HashMap<BucketKey, BucketState>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for (bucket, state) in states {
            sqlx::query(UPSERT_BUCKET)
                .bind(bucket.to_string())
                .bind(seq_column(state))
                .bind(state.date)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_sync_state(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM bucket_state")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_state").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
