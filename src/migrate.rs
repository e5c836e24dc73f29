use anyhow::Result;
use sqlx::SqlitePool;

/// Create the ledger schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_files (
            path TEXT NOT NULL PRIMARY KEY,
            indexed_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processed_files_indexed_at ON processed_files(indexed_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
