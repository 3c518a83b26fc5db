use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Speech programs probed on `PATH`, in order.
const SPEAKERS: [&str; 3] = ["say", "espeak", "wsay"];

/// Fire-and-forget audible notification.
pub trait Notifier: Send + Sync {
    /// Repeats `message` roughly once per second for `seconds`. Never blocks the caller.
    fn emit(&self, message: &str, seconds: u64);
}

/// Speaks through the first available speech command, falling back to a
/// terminal bell line.
#[derive(Debug, Default)]
pub struct SpeechNotifier {
    speaker: Option<PathBuf>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl SpeechNotifier {
    pub fn detect() -> Self {
        let speaker = SPEAKERS
            .iter()
            .find_map(|program| which::which(program).ok());
        match &speaker {
            Some(path) => debug!(speaker = %path.display(), "speech command located"),
            None => debug!("no speech command found; falling back to terminal bell"),
        }
        Self::with_speaker(speaker)
    }

    pub fn with_speaker(speaker: Option<PathBuf>) -> Self {
        Self {
            speaker,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Waits for every alarm emitted so far to finish.
    pub async fn settle(&self) {
        let handles = match self.pending.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "notification task failed");
            }
        }
    }
}

impl Notifier for SpeechNotifier {
    fn emit(&self, message: &str, seconds: u64) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(message, "no async runtime available; notification dropped");
            return;
        };
        let handle = runtime.spawn(repeat_phrase(
            self.speaker.clone(),
            message.to_string(),
            seconds,
        ));
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.retain(|alarm| !alarm.is_finished());
        pending.push(handle);
    }
}

async fn repeat_phrase(mut speaker: Option<PathBuf>, phrase: String, seconds: u64) {
    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        match &speaker {
            Some(program) => {
                let status = Command::new(program)
                    .arg(&phrase)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                if let Err(err) = status {
                    warn!(speaker = %program.display(), error = %err, "speech command failed");
                    speaker = None;
                }
            }
            None => eprintln!("\x07{}", phrase.to_uppercase()),
        }
        sleep(Duration::from_secs(1)).await;
    }
}

/// Blocking interaction with the person running the tool.
#[async_trait]
pub trait Operator: Send + Sync {
    async fn wait_for_enter(&self, prompt: &str) -> io::Result<()>;
    async fn read_line(&self, prompt: &str) -> io::Result<String>;
}

/// Prompts on stdout and reads stdin on a blocking worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleOperator;

impl ConsoleOperator {
    async fn prompt(prompt: &str) -> io::Result<String> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stdout = io::stdout();
            write!(stdout, "{prompt}")?;
            stdout.flush()?;
            let mut line = String::new();
            let read = io::stdin().lock().read_line(&mut line)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stdin closed while waiting for the operator",
                ));
            }
            Ok(line.trim_end_matches(['\r', '\n']).to_string())
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
    }
}

#[async_trait]
impl Operator for ConsoleOperator {
    async fn wait_for_enter(&self, prompt: &str) -> io::Result<()> {
        Self::prompt(prompt).await.map(|_| ())
    }

    async fn read_line(&self, prompt: &str) -> io::Result<String> {
        Self::prompt(prompt).await.map(|line| line.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bell_fallback_runs_for_the_requested_window() {
        let notifier = SpeechNotifier::with_speaker(None);
        let started = Instant::now();
        notifier.emit("success", 3);
        notifier.settle().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_speech_program_degrades_to_bell() {
        let notifier =
            SpeechNotifier::with_speaker(Some(PathBuf::from("/nonexistent/cita-speaker")));
        notifier.emit("failure", 2);
        notifier.settle().await;
        assert!(notifier.pending.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_alarms_are_dropped_on_the_next_emit() {
        let notifier = SpeechNotifier::with_speaker(None);
        notifier.emit("ALARM", 1);
        notifier.emit("ALARM", 1);
        sleep(Duration::from_secs(5)).await;
        notifier.emit("ALARM", 1);
        assert_eq!(notifier.pending.lock().unwrap().len(), 1);
        notifier.settle().await;
    }

    #[test]
    fn emit_outside_a_runtime_is_dropped() {
        let notifier = SpeechNotifier::with_speaker(None);
        notifier.emit("success", 30);
        assert!(notifier.pending.lock().unwrap().is_empty());
    }
}
