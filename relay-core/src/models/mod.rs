pub mod alert;
pub mod session;

pub use alert::{Alert, FailingComponent};
pub use session::{Credentials, Session, SessionSummary};
