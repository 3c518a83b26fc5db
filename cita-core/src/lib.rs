pub mod browser;
pub mod captcha;
pub mod config;
pub mod error;
pub mod notify;
pub mod retry;
pub mod telemetry;
pub mod testing;
pub mod workflow;

pub use config::{load_cita_config, load_env_file, CaptchaMode, CitaConfig};
pub use error::{ConfigError, Result};
pub use retry::{RetryController, RunReport, RunResult, Termination};
pub use telemetry::{AttemptJournal, TelemetryError};
pub use workflow::{Outcome, StepSequencer, StepServices};
