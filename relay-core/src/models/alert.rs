use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One component reported as failing by an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingComponent {
    pub component_id: i64,
    pub label: String,
    pub diagnosis_lines: Vec<String>,
}

/// One upstream event. An empty `failing_components` list is a recovery notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub subject: String,
    pub failing_components: Vec<FailingComponent>,
    /// Source-side time, when the upstream reports one.
    pub created_at: Option<DateTime<Utc>>,
    /// Placeholder for an entry whose body could not be read.
    #[serde(default)]
    pub degraded: bool,
}

impl Alert {
    pub fn is_failing(&self) -> bool {
        !self.failing_components.is_empty()
    }

    /// Placeholder for an entry whose id was readable but whose body was not.
    pub fn degraded(id: i64) -> Self {
        Self {
            id,
            subject: format!("Unreadable alert #{}", id),
            failing_components: Vec::new(),
            created_at: None,
            degraded: true,
        }
    }
}
