//! `SessionStore` over the sessions table. The context column holds the
//! opaque serialized snapshot; this crate never looks inside it.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use opsbot_core::context::{SessionStore, SessionStoreError};
use opsbot_core::SessionId;

use crate::DbPool;

pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn backend(error: sqlx::Error) -> SessionStoreError {
    SessionStoreError::Backend(error.to_string())
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn save(&self, session_id: &SessionId, blob: &str) -> Result<(), SessionStoreError> {
        sqlx::query(
            "INSERT INTO sessions (session_id, context, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                 context = excluded.context,
                 updated_at = excluded.updated_at",
        )
        .bind(&session_id.0)
        .bind(blob)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<String>, SessionStoreError> {
        let row = sqlx::query("SELECT context FROM sessions WHERE session_id = ?1")
            .bind(&session_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|row| row.get::<String, _>("context")))
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionStoreError> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ?1")
            .bind(&session_id.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
