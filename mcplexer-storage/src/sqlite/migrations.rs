//! Numbered, transaction-wrapped schema migrations
//!
//! Each migration runs at most once; applied versions are recorded in the
//! `schema_version` table.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// Embedded migrations, ordered by version
const MIGRATIONS: &[(i64, &str, &str)] = &[(1, "init", include_str!("../../migrations/0001_init.sql"))];

/// Apply all pending migrations
pub async fn run(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER PRIMARY KEY,
            name        TEXT NOT NULL,
            applied_at  TEXT NOT NULL
         )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query("SELECT version FROM schema_version")
        .fetch_all(pool)
        .await?
        .into_iter()
        .filter_map(|row| row.try_get::<i64, _>("version").ok())
        .collect();

    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        let mut txn = pool.begin().await?;
        sqlx::raw_sql(sql)
            .execute(&mut *txn)
            .await
            .map_err(|e| StoreError::Migration {
                version: *version,
                message: e.to_string(),
            })?;
        sqlx::query("INSERT INTO schema_version (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(version)
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *txn)
            .await?;
        txn.commit().await?;

        info!(version, name, "applied migration");
    }

    Ok(())
}
