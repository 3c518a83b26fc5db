use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::workflow::Outcome;

use super::metrics::RunMetrics;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// 1-based.
    pub ordinal: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: Outcome,
    /// Sleep taken after the attempt; `None` after the final one.
    #[serde(with = "optional_seconds")]
    pub delay_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: Vec<AttemptRecord>,
    pub metrics: RunMetrics,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let status = match self.status {
            RunStatus::Success => "success",
            RunStatus::Exhausted => "exhausted",
        };
        let _ = writeln!(
            out,
            "{status} after {}/{} attempts ({}s spent waiting)",
            self.attempts.len(),
            self.max_retries,
            self.metrics.total_wait().as_secs()
        );
        for record in &self.attempts {
            let _ = write!(
                out,
                "  #{:<4} {}  {}",
                record.ordinal,
                record.started_at.format("%H:%M:%S"),
                record.outcome
            );
            if let Some(delay) = record.delay_after {
                let _ = write!(out, "  (slept {:.1}s)", delay.as_secs_f64());
            }
            out.push('\n');
        }
        let metrics = &self.metrics;
        let _ = writeln!(
            out,
            "rate_limited={} rejected={} timeouts={} no_transition={} validation={} step_failed={} transport={}",
            metrics.rate_limited,
            metrics.rejected,
            metrics.session_timeouts,
            metrics.no_transition,
            metrics.validation_failures,
            metrics.step_failures,
            metrics.transport_errors
        );
        out
    }
}

mod optional_seconds {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(delay) => serializer.serialize_some(&delay.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }
}
