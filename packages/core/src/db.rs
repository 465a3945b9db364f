//! SQLite pool creation and schema bootstrap.
//!
//! File databases run in WAL mode so sync-engine reads never block
//! producer writes. `sqlite::memory:` pools are pinned to a single
//! long-lived connection, otherwise every pooled connection would see
//! its own empty database.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS domain_records (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        id              TEXT NOT NULL UNIQUE,
        entity_type     TEXT NOT NULL,
        payload         TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        sync_status     TEXT NOT NULL DEFAULT 'pending',
        retry_count     INTEGER NOT NULL DEFAULT 0,
        last_error      TEXT,
        next_attempt_at TEXT,
        updated_at      TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_unsynced
        ON domain_records (created_at, seq)
        WHERE sync_status IN ('pending', 'failed')",
    "CREATE INDEX IF NOT EXISTS idx_records_type_status
        ON domain_records (entity_type, sync_status)",
];

/// Open a pool for `database_url` and make sure the schema exists.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    if !in_memory {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options.connect_with(options).await?;
    migrate(&pool).await?;

    tracing::debug!("SQLite pool ready ({})", database_url);
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
