pub mod poller;

use std::sync::Arc;

use relay_core::config::{RelayConfig, StoreBackend};
use relay_core::{MemorySessionStore, PgSessionStore, RelayError, SessionStore};

/// Build the session store selected by `database.backend`.
///
/// The Postgres backend connects and creates the `sessions` table if needed.
pub async fn create_store_from_config(
    config: &RelayConfig,
) -> Result<Arc<dyn SessionStore>, RelayError> {
    match config.database.backend {
        StoreBackend::Postgres => {
            if config.database.url.is_empty() {
                return Err(RelayError::Other(
                    "database.url is required for the postgres backend".to_string(),
                ));
            }
            let pool = relay_core::db::create_pool(&config.database).await?;
            relay_core::db::ensure_schema(&pool).await?;
            tracing::info!("Using Postgres session store");
            Ok(Arc::new(PgSessionStore::new(pool)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory session store; registrations are lost on restart");
            Ok(Arc::new(MemorySessionStore::new()))
        }
    }
}
