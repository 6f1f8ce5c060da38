pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod models;
pub mod store;
pub mod upstream;

pub use config::{CursorPolicy, PollingConfig, RelayConfig, StoreBackend};
pub use dispatch::{DispatchChannel, DispatchError, SlackChannel};
pub use error::RelayError;
pub use format::MessageFormatter;
pub use models::{Alert, Credentials, FailingComponent, Session, SessionSummary};
pub use store::{MemorySessionStore, PgSessionStore, SessionStore, StoreError};
pub use upstream::{AlertSource, MonitorApiClient, PingStatus, UpstreamError};
