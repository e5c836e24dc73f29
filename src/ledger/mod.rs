//! Processed-file ledger.
//!
//! A single SQLite table records every export file whose messages have been
//! indexed *and* positioned. The pipeline consults it to skip finished files
//! and appends to it only after a chat has been reconciled. The set of
//! processed paths only grows.
//!
//! Writes go through [`Ledger::mark_processed`], which commits a whole batch
//! in one transaction or nothing at all. Batches are serialized; two commits
//! never interleave. [`LedgerQueue`] sits in front of it and groups paths
//! into batches.

mod queue;

pub use queue::{FlushTrigger, LedgerQueue, QueueState};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::path::Path;
use tokio::sync::Mutex;

use crate::db;
use crate::error::ArchiveError;
use crate::migrate;

pub struct Ledger {
    pool: SqlitePool,
    commit_lock: Mutex<()>,
}

impl Ledger {
    /// Open (creating if needed) the ledger database at `path`.
    ///
    /// Failure here is fatal for the process: without the ledger the pipeline
    /// cannot tell finished files from new ones.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to initialize processed-file ledger")?;
        tracing::info!(path = %path.display(), "ledger initialized");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an already-migrated pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn is_processed(&self, path: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM processed_files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Record `paths` as processed, all or nothing.
    ///
    /// Paths already present are ignored. On failure the transaction is
    /// rolled back and the error returned; no path of the batch is recorded.
    pub async fn mark_processed(&self, paths: &[String]) -> Result<(), ArchiveError> {
        if paths.is_empty() {
            return Ok(());
        }
        let _guard = self.commit_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        for path in paths {
            let inserted = sqlx::query("INSERT OR IGNORE INTO processed_files (path) VALUES (?)")
                .bind(path)
                .execute(&mut *tx)
                .await;
            if let Err(e) = inserted {
                tracing::error!(error = %e, path = %path, "marking files as processed failed");
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(error = %rollback_err, "ledger rollback failed");
                }
                return Err(e.into());
            }
        }
        tx.commit().await?;

        tracing::debug!(count = paths.len(), "files marked as processed");
        Ok(())
    }

    pub async fn processed_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, Ledger) {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(&tmp.path().join("ledger/processed.db"))
            .await
            .unwrap();
        (tmp, ledger)
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn mark_then_lookup() {
        let (_tmp, ledger) = open_temp().await;

        assert!(!ledger.is_processed("general/2024-01-01.json").await.unwrap());
        ledger
            .mark_processed(&paths(&["general/2024-01-01.json", "general/2024-01-02.json"]))
            .await
            .unwrap();

        assert!(ledger.is_processed("general/2024-01-01.json").await.unwrap());
        assert!(ledger.is_processed("general/2024-01-02.json").await.unwrap());
        assert!(!ledger.is_processed("general/2024-01-03.json").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_marks_are_noops() {
        let (_tmp, ledger) = open_temp().await;

        ledger.mark_processed(&paths(&["a.json"])).await.unwrap();
        ledger
            .mark_processed(&paths(&["a.json", "a.json", "b.json"]))
            .await
            .unwrap();

        assert_eq!(ledger.processed_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_batch_records_nothing() {
        let (_tmp, ledger) = open_temp().await;

        sqlx::query(
            r#"
            CREATE TRIGGER reject_poison BEFORE INSERT ON processed_files
            WHEN NEW.path = 'poison.json'
            BEGIN
                SELECT RAISE(ABORT, 'poisoned path');
            END
            "#,
        )
        .execute(ledger.pool())
        .await
        .unwrap();

        let result = ledger
            .mark_processed(&paths(&["first.json", "poison.json", "last.json"]))
            .await;

        assert!(matches!(result, Err(ArchiveError::Ledger(_))));
        assert!(!ledger.is_processed("first.json").await.unwrap());
        assert!(!ledger.is_processed("poison.json").await.unwrap());
        assert!(!ledger.is_processed("last.json").await.unwrap());
        assert_eq!(ledger.processed_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reopen_keeps_records() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("processed.db");

        let ledger = Ledger::open(&db_path).await.unwrap();
        ledger.mark_processed(&paths(&["x.json"])).await.unwrap();
        ledger.close().await;

        let reopened = Ledger::open(&db_path).await.unwrap();
        assert!(reopened.is_processed("x.json").await.unwrap());
    }
}
