use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::browser::{Session, SessionFactory};
use crate::config::{CitaConfig, NotificationSection};
use crate::notify::Notifier;
use crate::telemetry::AttemptJournal;
use crate::workflow::{Outcome, StepSequencer};

use super::backoff::{BackoffState, CoolOff};
use super::metrics::RunMetrics;
use super::report::{AttemptRecord, RunReport, RunStatus};

/// How the attempt loop ended.
pub enum Termination {
    /// The session that completed the booking; the caller now owns it.
    Success(Box<dyn Session>),
    Exhausted,
}

pub struct RunResult {
    pub termination: Termination,
    pub report: RunReport,
}

impl RunResult {
    pub fn into_session(self) -> Option<Box<dyn Session>> {
        match self.termination {
            Termination::Success(session) => Some(session),
            Termination::Exhausted => None,
        }
    }
}

/// Owns the attempt loop: one fresh session per attempt, strictly sequential,
/// until success or the budget runs out.
pub struct RetryController {
    factory: Arc<dyn SessionFactory>,
    sequencer: StepSequencer,
    max_retries: u32,
    backoff: BackoffState,
    cooloff: CoolOff,
    reset_after_other_outcomes: bool,
    rng: ChaCha8Rng,
    notifier: Arc<dyn Notifier>,
    notifications: NotificationSection,
    journal: Option<AttemptJournal>,
}

impl RetryController {
    pub fn new(
        config: &CitaConfig,
        factory: Arc<dyn SessionFactory>,
        sequencer: StepSequencer,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            factory,
            sequencer,
            max_retries: config.timing.max_retries.max(1),
            backoff: BackoffState::from_config(&config.backoff),
            cooloff: CoolOff::from_config(&config.backoff),
            reset_after_other_outcomes: config.backoff.reset_after_other_outcomes,
            rng: ChaCha8Rng::from_entropy(),
            notifier,
            notifications: config.notifications.clone(),
            journal: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn with_journal(mut self, journal: Option<AttemptJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    pub async fn run(&mut self) -> RunResult {
        let started_at = Utc::now();
        let mut metrics = RunMetrics::default();
        let mut attempts = Vec::new();

        for ordinal in 1..=self.max_retries {
            let attempt_started = Utc::now();
            info!(attempt = ordinal, max_retries = self.max_retries, "attempt started");
            let (outcome, session) = self.attempt().await;
            metrics.record_outcome(&outcome);
            info!(attempt = ordinal, outcome = %outcome, "attempt finished");

            if let Some(session) = session {
                let record = AttemptRecord {
                    ordinal,
                    started_at: attempt_started,
                    outcome,
                    delay_after: None,
                };
                self.journal_attempt(&record);
                attempts.push(record);
                self.announce(&self.notifications.success_phrase, self.notifications.success_seconds);
                info!(attempt = ordinal, "appointment booked; session remains open");
                let report = self.finish(RunStatus::Success, started_at, attempts, metrics);
                return RunResult {
                    termination: Termination::Success(session),
                    report,
                };
            }

            let delay_after = (ordinal < self.max_retries)
                .then(|| self.delay_after(&outcome, &mut metrics));
            let record = AttemptRecord {
                ordinal,
                started_at: attempt_started,
                outcome,
                delay_after,
            };
            self.journal_attempt(&record);
            attempts.push(record);
            if let Some(delay) = delay_after {
                sleep(delay).await;
            }
        }

        error!(attempts = self.max_retries, "attempt budget exhausted without a booking");
        self.announce(&self.notifications.failure_phrase, self.notifications.failure_seconds);
        let report = self.finish(RunStatus::Exhausted, started_at, attempts, metrics);
        RunResult {
            termination: Termination::Exhausted,
            report,
        }
    }

    /// One attempt against one fresh session. The session is returned only on
    /// success; otherwise it has been released.
    async fn attempt(&self) -> (Outcome, Option<Box<dyn Session>>) {
        let mut session = match self.factory.create().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "session could not be created");
                return (Outcome::TransportError(err.to_string()), None);
            }
        };
        let outcome = match self.sequencer.run(session.as_mut()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "transport fault during attempt");
                Outcome::TransportError(err.to_string())
            }
        };
        if outcome.is_success() {
            return (outcome, Some(session));
        }
        if let Err(err) = session.close().await {
            warn!(error = %err, "session release failed");
        }
        (outcome, None)
    }

    fn delay_after(&mut self, outcome: &Outcome, metrics: &mut RunMetrics) -> Duration {
        if matches!(outcome, Outcome::RateLimited) {
            let delay = self.backoff.next_delay(&mut self.rng);
            warn!(delay_seconds = delay.as_secs_f64(), "rate limited; backing off");
            metrics.record_backoff(delay);
            return delay;
        }
        if self.reset_after_other_outcomes {
            self.backoff.reset();
        }
        let delay = self.cooloff.next_delay(&mut self.rng);
        metrics.record_cooloff(delay);
        delay
    }

    fn announce(&self, phrase: &str, seconds: u64) {
        if self.notifications.enabled {
            self.notifier.emit(phrase, seconds);
        }
    }

    fn journal_attempt(&self, record: &AttemptRecord) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record_attempt(record) {
                warn!(error = %err, attempt = record.ordinal, "attempt journal write failed");
            }
        }
    }

    fn finish(
        &self,
        status: RunStatus,
        started_at: chrono::DateTime<Utc>,
        attempts: Vec<AttemptRecord>,
        metrics: RunMetrics,
    ) -> RunReport {
        let report = RunReport {
            status,
            max_retries: self.max_retries,
            started_at,
            finished_at: Utc::now(),
            attempts,
            metrics,
        };
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record_run(&report) {
                warn!(error = %err, "run journal write failed");
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::CaptchaGate;
    use crate::testing::{
        sample_config, PageFixture, RecordingNotifier, RecordingOperator, ScriptedSession,
        ScriptedSessionFactory,
    };
    use crate::workflow::StepServices;

    fn controller(
        config: &CitaConfig,
        factory: Arc<ScriptedSessionFactory>,
        notifier: RecordingNotifier,
    ) -> RetryController {
        let config = Arc::new(config.clone());
        let operator = Arc::new(RecordingOperator::default());
        let gate = CaptchaGate::new(&config, None, Arc::new(notifier.clone()), operator.clone());
        let sequencer = StepSequencer::new(StepServices::new(config.clone(), gate, operator));
        RetryController::new(&config, factory, sequencer, Arc::new(notifier)).with_seed(42)
    }

    #[tokio::test(start_paused = true)]
    async fn launch_faults_count_as_transport_errors() {
        let mut config = sample_config();
        config.timing.max_retries = 2;
        let factory = Arc::new(
            ScriptedSessionFactory::repeating(|| ScriptedSession::new(PageFixture::at("about:blank")))
                .failing_first(2),
        );
        let notifier = RecordingNotifier::default();
        let result = controller(&config, factory.clone(), notifier.clone()).run().await;

        assert!(!result.report.succeeded());
        assert!(result
            .report
            .attempts
            .iter()
            .all(|record| matches!(record.outcome, Outcome::TransportError(_))));
        assert_eq!(result.report.metrics.transport_errors, 2);
        assert_eq!(factory.created(), 0);
        assert_eq!(notifier.messages(), vec![("failure".to_string(), 30)]);
    }

    #[tokio::test(start_paused = true)]
    async fn final_attempt_is_not_followed_by_a_sleep() {
        let mut config = sample_config();
        config.timing.max_retries = 3;
        let factory = Arc::new(ScriptedSessionFactory::default().failing_first(3));
        let result = controller(&config, factory, RecordingNotifier::default())
            .run()
            .await;
        let delays: Vec<_> = result.report.attempts.iter().map(|r| r.delay_after).collect();
        assert!(delays[0].is_some() && delays[1].is_some());
        assert_eq!(delays[2], None);
    }
}
