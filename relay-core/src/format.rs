//! Alert → Slack mrkdwn rendering.

use crate::models::{Alert, FailingComponent};
use std::fmt::Write;

pub const FAILING_GLYPH: &str = ":x:";
pub const HEALTHY_GLYPH: &str = ":white_check_mark:";
pub const DEGRADED_GLYPH: &str = ":warning:";

const EMPTY_SUBJECT: &str = "(no subject)";

/// Pure, deterministic renderer. Holds only the dashboard base URL and the
/// component cap.
#[derive(Debug, Clone)]
pub struct MessageFormatter {
    dashboard_url: String,
    max_components: usize,
}

impl MessageFormatter {
    pub fn new(dashboard_url: impl Into<String>, max_components: usize) -> Self {
        Self {
            dashboard_url: dashboard_url.into().trim_end_matches('/').to_string(),
            max_components,
        }
    }

    pub fn render(&self, alert: &Alert) -> String {
        let mut out = String::new();

        let glyph = if alert.degraded {
            DEGRADED_GLYPH
        } else if alert.is_failing() {
            FAILING_GLYPH
        } else {
            HEALTHY_GLYPH
        };
        let subject = alert.subject.trim();
        let subject = if subject.is_empty() {
            EMPTY_SUBJECT
        } else {
            subject
        };
        let _ = write!(out, "{} *{}*", glyph, subject);

        if !alert.is_failing() {
            return out;
        }

        out.push_str("\n\n");
        for component in alert.failing_components.iter().take(self.max_components) {
            self.append_component(component, &mut out);
        }

        let total = alert.failing_components.len();
        if total > self.max_components {
            let _ = write!(
                out,
                "*...and {} more.* Head to <{}/dashboard/|your dashboard> to see the rest",
                total - self.max_components,
                self.dashboard_url
            );
        }

        out.trim_end().to_string()
    }

    fn append_component(&self, component: &FailingComponent, out: &mut String) {
        let _ = writeln!(
            out,
            "<{}/dashboard/miners/{}/details/|{}>",
            self.dashboard_url,
            component.component_id,
            escape_link_label(&component.label)
        );
        for line in &component.diagnosis_lines {
            let _ = writeln!(out, "{}", line);
        }
        out.push('\n');
    }
}

/// `|` and `>` would end a Slack link early.
fn escape_link_label(label: &str) -> String {
    label.replace('|', "¦").replace('>', "&gt;")
}
