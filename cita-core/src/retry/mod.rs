mod backoff;
mod controller;
mod metrics;
mod report;

pub use backoff::{BackoffState, CoolOff};
pub use controller::{RetryController, RunResult, Termination};
pub use metrics::RunMetrics;
pub use report::{AttemptRecord, RunReport, RunStatus};
