use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream identity for one session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Credentials {
    pub client_id: i64,
    pub api_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// A registered chat destination. `session_id` is the destination channel id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub session_id: String,
    #[sqlx(flatten)]
    pub credentials: Credentials,
    pub registered_at: DateTime<Utc>,
    pub last_delivered_id: i64,
}

impl Session {
    /// A fresh registration with its cursor at zero.
    pub fn new(
        session_id: impl Into<String>,
        credentials: Credentials,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            credentials,
            registered_at,
            last_delivered_id: 0,
        }
    }

    /// Earliest source time an alert may carry to be delivered to this session.
    pub fn delivery_floor(&self, engine_started_at: DateTime<Utc>) -> DateTime<Utc> {
        self.registered_at.max(engine_started_at)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            client_id: self.credentials.client_id,
            registered_at: self.registered_at,
            last_delivered_id: self.last_delivered_id,
        }
    }
}

/// Session view without secrets, for the operational API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub client_id: i64,
    pub registered_at: DateTime<Utc>,
    pub last_delivered_id: i64,
}
