use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the reservation and stats tables if they do not exist.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One claim per (file version, row); the primary key is the atomic lock
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS row_reservations (
            file_id TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            payload_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            attempts INTEGER NOT NULL DEFAULT 1,
            reserved_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (file_id, row_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_stats (
            file_id TEXT PRIMARY KEY,
            total_rows INTEGER NOT NULL,
            successful_rows INTEGER NOT NULL,
            failed_rows INTEGER NOT NULL,
            skipped_rows INTEGER NOT NULL,
            completed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_row_reservations_status ON row_reservations(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_stats_completed_at ON file_stats(completed_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
