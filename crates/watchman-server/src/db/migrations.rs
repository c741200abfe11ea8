//! Embedded SQL migrations.
//!
//! Migration files follow the `NNNN_description` convention with a
//! zero-padded, strictly incrementing version number. Applied versions are
//! tracked in the `_migrations` table.

use super::DbError;
use sqlx::SqlitePool;
use tracing::{debug, info, instrument};

struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const V0001_RULES: &str = r#"
CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    rule_name TEXT NOT NULL,
    target_id TEXT NOT NULL,
    webhook_token TEXT NOT NULL UNIQUE,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rules_webhook_token ON rules(webhook_token);
"#;

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "0001_rules",
    sql: V0001_RULES,
}];

/// Apply all pending migrations.
#[instrument(skip_all)]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM _migrations")
        .fetch_one(pool)
        .await?;
    let applied = applied.unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version <= applied {
            debug!(
                version = migration.version,
                "migration already applied, skipping"
            );
            continue;
        }

        info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );

        let mut tx = pool.begin().await?;
        for statement in migration
            .sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|error| DbError::Migration {
                    version: migration.version,
                    detail: error.to_string(),
                })?;
        }
        sqlx::query("INSERT INTO _migrations (version, description) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.description)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    Ok(())
}
