use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cita_core::browser::{ChromiumSessionFactory, Session};
use cita_core::captcha::{AntiCaptchaClient, CaptchaError, CaptchaGate, CaptchaSolver};
use cita_core::notify::{ConsoleOperator, Operator, SpeechNotifier};
use cita_core::{
    load_env_file, AttemptJournal, CaptchaMode, CitaConfig, RetryController, RunReport,
    StepSequencer, StepServices, TelemetryError, Termination,
};
use clap::{Parser, ValueEnum};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "cita.toml";

/// Process exit code when every attempt was used without booking.
pub const EXIT_EXHAUSTED: i32 = 2;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] cita_core::ConfigError),
    #[error("captcha backend error: {0}")]
    Captcha(#[from] CaptchaError),
    #[error("journal error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Books an appointment slot, retrying until one is confirmed", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration (defaults to ./cita.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Environment file loaded before overrides are applied (defaults to ./.env)
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// Run the browser without a window
    #[arg(long, default_value_t = false)]
    pub headless: bool,
    /// Attempt budget, overriding config and MAX_RETRIES
    #[arg(long)]
    pub max_retries: Option<u32>,
    /// Solve challenges by hand instead of through the solving service
    #[arg(long, default_value_t = false)]
    pub manual_captcha: bool,
    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Debug-level logging
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Runs to completion and returns the process exit code.
pub fn run(cli: Cli) -> Result<i32> {
    init_tracing(cli.verbose);
    if let Some(path) = load_env_file(cli.env_file.as_deref())? {
        info!(path = %path.display(), "environment file loaded");
    }
    let config = resolve_config(&cli, |key| std::env::var(key).ok())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(config, cli.format))
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// File (or defaults), then environment, then command-line flags; validated last.
pub fn resolve_config<F>(cli: &Cli, lookup: F) -> Result<CitaConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let path = cli.config.clone().or_else(|| {
        let fallback = Path::new(DEFAULT_CONFIG);
        fallback.exists().then(|| fallback.to_path_buf())
    });
    let mut config = CitaConfig::from_sources(path.as_deref(), lookup)?;
    if cli.headless {
        config.chromium.headless = true;
    }
    if let Some(max_retries) = cli.max_retries {
        config.timing.max_retries = max_retries;
    }
    if cli.manual_captcha {
        config.captcha.mode = CaptchaMode::Manual;
    }
    config.validate()?;
    Ok(config)
}

async fn execute(config: CitaConfig, format: OutputFormat) -> Result<i32> {
    let config = Arc::new(config);
    let notifier = Arc::new(SpeechNotifier::detect());
    let operator: Arc<dyn Operator> = Arc::new(ConsoleOperator);
    let solver = match config.captcha.mode {
        CaptchaMode::Auto => {
            Some(Arc::new(AntiCaptchaClient::from_config(&config.captcha)?) as Arc<dyn CaptchaSolver>)
        }
        CaptchaMode::Manual => None,
    };
    let gate = CaptchaGate::new(&config, solver, notifier.clone(), operator.clone());
    let sequencer = StepSequencer::new(StepServices::new(config.clone(), gate, operator));
    let factory = Arc::new(ChromiumSessionFactory::new(config.chromium.clone()));
    let journal = AttemptJournal::from_config(&config.journal)?;

    let mut controller =
        RetryController::new(&config, factory, sequencer, notifier.clone()).with_journal(journal);
    let result = controller.run().await;
    print_report(&result.report, format)?;

    match result.termination {
        Termination::Success(mut session) => {
            println!("Appointment booked. The browser session remains open; press Ctrl-C to exit.");
            hold_session(session.as_mut(), tokio::signal::ctrl_c()).await?;
            Ok(0)
        }
        Termination::Exhausted => {
            notifier.settle().await;
            Ok(EXIT_EXHAUSTED)
        }
    }
}

/// Keeps the booked session open until `interrupt` resolves, then releases
/// it whether or not the interrupt listener itself failed.
async fn hold_session<F>(session: &mut dyn Session, interrupt: F) -> std::io::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let interrupted = interrupt.await;
    match &interrupted {
        Ok(()) => info!("interrupt received; releasing session"),
        Err(err) => warn!(error = %err, "interrupt listener failed; releasing session"),
    }
    if let Err(err) = session.close().await {
        warn!(error = %err, "session release failed");
    }
    interrupted
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    use cita_core::testing::{PageFixture, ScriptedSession};

    const IDENTITY: &str = r#"
[identity]
applicant_id = "Y1234567Z"
full_name = "ANA PEREZ"
country_code = "248"
phone = "600000000"
email = "ana@example.com"

[captcha]
mode = "auto"
api_key = "file-key"
"#;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("citactl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_file_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cita.toml");
        fs::write(&path, IDENTITY).unwrap();
        let cli = cli(&[
            "--config",
            path.to_str().unwrap(),
            "--headless",
            "--max-retries",
            "7",
            "--manual-captcha",
            "--format",
            "json",
        ]);
        let env = HashMap::from([("MAX_RETRIES", "99"), ("PROVINCE", "Madrid")]);

        let config = resolve_config(&cli, |key| env.get(key).map(|v| v.to_string())).unwrap();
        assert!(config.chromium.headless);
        assert_eq!(config.timing.max_retries, 7);
        assert_eq!(config.captcha.mode, CaptchaMode::Manual);
        assert_eq!(config.workflow.province, "Madrid");
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[tokio::test]
    async fn session_is_released_even_when_the_interrupt_listener_fails() {
        let mut session = ScriptedSession::new(PageFixture::at("about:blank"));
        let probe = session.probe();
        let failed = async {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler"))
        };

        assert!(hold_session(&mut session, failed).await.is_err());
        assert!(probe.snapshot().closed());

        let mut session = ScriptedSession::new(PageFixture::at("about:blank"));
        let probe = session.probe();
        hold_session(&mut session, async { Ok(()) }).await.unwrap();
        assert_eq!(probe.snapshot().close_calls, 1);
    }

    #[test]
    fn invalid_configuration_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cita.toml");
        fs::write(&path, "[identity]\napplicant_id = \"Y1234567Z\"\n").unwrap();
        let cli = cli(&["--config", path.to_str().unwrap(), "--manual-captcha"]);
        let err = resolve_config(&cli, |_| None).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn env_key_satisfies_auto_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cita.toml");
        fs::write(&path, IDENTITY.replace("api_key = \"file-key\"", "")).unwrap();
        let cli = cli(&["--config", path.to_str().unwrap()]);
        assert!(resolve_config(&cli, |_| None).is_err());
        let config = resolve_config(&cli, |key| {
            (key == "ANTICAPTCHA_API_KEY").then(|| "env-key".to_string())
        })
        .unwrap();
        assert_eq!(config.captcha.usable_api_key(), Some("env-key"));
    }
}
