//! SQLite persistence for the Watchman server.
//!
//! One database holds the notification rules. Migrations are embedded SQL,
//! versioned through a `_migrations` table and applied on startup.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

mod migrations;
mod rules;

pub use migrations::run_migrations;
pub use rules::{NewRule, Rule, RuleStore, RuleUpdate};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration {version} failed: {detail}")]
    Migration { version: i64, detail: String },
}

/// Open the database pool: file-backed when a path is given, in-memory
/// otherwise.
pub async fn connect(db_path: Option<&str>) -> Result<SqlitePool, DbError> {
    let pool = match db_path {
        Some(path) => {
            info!("Using file-based database at: {}", path);
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .foreign_keys(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        }
        None => {
            info!("Using in-memory database (development mode)");
            // A single connection keeps every query on the same in-memory
            // database.
            let options = SqliteConnectOptions::new()
                .in_memory(true)
                .foreign_keys(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        }
    };
    Ok(pool)
}

/// Verify the database answers queries.
pub async fn health_check(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = connect(None).await.expect("failed to open test database");
    run_migrations(&pool)
        .await
        .expect("failed to run migrations");
    pool
}
