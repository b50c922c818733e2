//! Linear schema migration ladder.
//!
//! Migrations run at startup in ascending order, each inside its own
//! transaction, and are recorded in `schema_migrations`. The ladder is
//! append-only: no rollbacks at runtime, no implicit column additions.

use crate::error::StoreError;
use sqlx::{Row, SqlitePool};

/// Version the ladder currently ends at.
pub const LATEST_VERSION: i64 = 2;

/// (version, statements) pairs, ascending.
const MIGRATIONS: &[(i64, &[&str])] = &[
    (
        1,
        &[
            "CREATE TABLE IF NOT EXISTS positions (
                position_id TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER
            )",
            "CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                position_id TEXT,
                value TEXT NOT NULL,
                state TEXT,
                created_at INTEGER,
                updated_at INTEGER
            )",
        ],
    ),
    (
        2,
        &[
            "CREATE INDEX IF NOT EXISTS idx_orders_position_id ON orders(position_id)",
            "CREATE INDEX IF NOT EXISTS idx_orders_state ON orders(state)",
        ],
    ),
];

/// Apply pending migrations; returns the versions applied this run.
pub(crate) async fn apply_migrations(pool: &SqlitePool) -> Result<Vec<i64>, StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let applied: Vec<i64> = sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| row.get::<i64, _>(0))
        .collect();

    let mut applied_now = Vec::new();
    for (version, statements) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in *statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Migration {
                    version: *version,
                    message: e.to_string(),
                })?;
        }
        sqlx::query("INSERT INTO schema_migrations(version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version = version, "applied schema migration");
        applied_now.push(*version);
    }

    Ok(applied_now)
}

/// Highest applied migration version, 0 when the ladder has not run.
pub async fn current_version(pool: &SqlitePool) -> Result<i64, StoreError> {
    let row = sqlx::query("SELECT MAX(version) FROM schema_migrations")
        .fetch_optional(pool)
        .await?;
    Ok(row
        .and_then(|r| r.try_get::<Option<i64>, _>(0).ok().flatten())
        .unwrap_or(0))
}
