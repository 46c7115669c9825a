use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

use opsbot_core::config::DatabaseConfig;

pub type DbPool = sqlx::SqlitePool;

/// Open the session database described by the config. Every connection
/// gets WAL and a busy timeout; turn persistence writes while the next
/// checkout may already be reading.
pub async fn connect(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await
}
