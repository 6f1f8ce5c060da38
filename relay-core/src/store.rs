//! Session store: durable mapping of session id → session record.
//!
//! `save` is an atomic upsert keyed by session id with two guards:
//! - a record from an older registration never overwrites a newer one
//! - within the same registration the cursor never moves backwards
//!
//! Both backends (Postgres and in-memory) implement the same rules.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::Session;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Storage boundary for sessions. The polling engine only calls
/// `find_all` and `save`; registration and forget own the rest.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Session>, StoreError>;

    async fn find_by_id(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Returns `true` if a session was removed.
    async fn delete_by_id(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Postgres
// ============================================================================

#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn find_all(&self) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query_as::<_, Session>(
            r#"
            SELECT session_id, client_id, api_key, registered_at, last_delivered_id
            FROM sessions
            ORDER BY session_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, Session>(
            r#"
            SELECT session_id, client_id, api_key, registered_at, last_delivered_id
            FROM sessions
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, client_id, api_key, registered_at, last_delivered_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id) DO UPDATE SET
                client_id = EXCLUDED.client_id,
                api_key = EXCLUDED.api_key,
                registered_at = EXCLUDED.registered_at,
                last_delivered_id = CASE
                    WHEN sessions.registered_at = EXCLUDED.registered_at
                    THEN GREATEST(sessions.last_delivered_id, EXCLUDED.last_delivered_id)
                    ELSE EXCLUDED.last_delivered_id
                END
            WHERE sessions.registered_at <= EXCLUDED.registered_at
            "#,
        )
        .bind(&session.session_id)
        .bind(session.credentials.client_id)
        .bind(&session.credentials.api_key)
        .bind(session.registered_at)
        .bind(session.last_delivered_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_by_id(&self, session_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store. Sessions are lost on restart.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(sessions: impl IntoIterator<Item = Session>) -> Self {
        let map = sessions
            .into_iter()
            .map(|s| (s.session_id.clone(), s))
            .collect();
        Self {
            sessions: RwLock::new(map),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find_all(&self) -> Result<Vec<Session>, StoreError> {
        let mut all: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(all)
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.session_id) {
            Some(existing) if existing.registered_at > session.registered_at => {
                tracing::debug!(
                    session_id = %session.session_id,
                    "Ignoring write from an older registration"
                );
            }
            Some(existing) if existing.registered_at == session.registered_at => {
                let cursor = existing.last_delivered_id.max(session.last_delivered_id);
                *existing = session.clone();
                existing.last_delivered_id = cursor;
            }
            _ => {
                sessions.insert(session.session_id.clone(), session.clone());
            }
        }
        Ok(())
    }

    async fn delete_by_id(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// TESTS
// ============================================================================
