use std::sync::Arc;
use std::time::Duration;

use cita_core::captcha::CaptchaGate;
use cita_core::config::CitaConfig;
use cita_core::retry::{RetryController, RunStatus, Termination};
use cita_core::telemetry::AttemptJournal;
use cita_core::testing::{
    sample_config, BookingSite, PageFixture, RecordingNotifier, RecordingOperator,
    ScriptedSessionFactory,
};
use cita_core::workflow::{Outcome, StepSequencer, StepServices};
use tempfile::tempdir;

fn controller(
    config: &CitaConfig,
    factory: Arc<ScriptedSessionFactory>,
    notifier: &RecordingNotifier,
) -> RetryController {
    let shared = Arc::new(config.clone());
    let operator = Arc::new(RecordingOperator::default());
    let gate = CaptchaGate::new(&shared, None, Arc::new(notifier.clone()), operator.clone());
    let sequencer = StepSequencer::new(StepServices::new(shared, gate, operator));
    RetryController::new(config, factory, sequencer, Arc::new(notifier.clone())).with_seed(7)
}

fn rate_limited_page() -> PageFixture {
    BookingSite::page("/icpplustieb/citar?p=8")
        .titled("429 Too Many Requests")
        .with_content("<h1>Too Many Requests</h1>")
}

fn outcomes(result: &cita_core::RunResult) -> Vec<Outcome> {
    result
        .report
        .attempts
        .iter()
        .map(|record| record.outcome.clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn first_attempt_success_keeps_the_session() {
    let config = sample_config();
    let notifier = RecordingNotifier::default();
    let factory = Arc::new(BookingSite::new(&config).factory());

    let result = controller(&config, factory.clone(), &notifier).run().await;

    assert_eq!(result.report.status, RunStatus::Success);
    assert_eq!(outcomes(&result), vec![Outcome::Success]);
    assert_eq!(result.report.attempts[0].delay_after, None);
    assert_eq!(factory.created(), 1);
    assert!(!factory.probes()[0].closed());
    assert!(matches!(result.termination, Termination::Success(_)));
    assert!(notifier
        .messages()
        .contains(&("success".to_string(), 30)));
}

#[tokio::test(start_paused = true)]
async fn rate_limits_back_off_then_succeed() {
    let config = sample_config();
    let notifier = RecordingNotifier::default();
    let limited = BookingSite::new(&config).after_region(rate_limited_page());
    let healthy = BookingSite::new(&config);
    let factory = Arc::new(
        ScriptedSessionFactory::new((0..3).map(|_| limited.session()))
            .then_repeating(move || healthy.session()),
    );

    let started = tokio::time::Instant::now();
    let result = controller(&config, factory.clone(), &notifier).run().await;

    assert!(result.report.succeeded());
    assert_eq!(
        outcomes(&result),
        vec![
            Outcome::RateLimited,
            Outcome::RateLimited,
            Outcome::RateLimited,
            Outcome::Success
        ]
    );
    let delays: Vec<f64> = result.report.attempts[..3]
        .iter()
        .map(|record| record.delay_after.unwrap().as_secs_f64())
        .collect();
    let (base, cap) = (config.backoff.base_seconds, config.backoff.cap_seconds);
    assert!(delays[0] >= base && delays[0] <= 2.0 * base, "{delays:?}");
    for pair in delays.windows(2) {
        assert!(pair[1] >= base && pair[1] <= (3.0 * pair[0]).min(cap) + 1e-9, "{delays:?}");
    }
    assert!(started.elapsed() >= Duration::from_secs_f64(delays.iter().sum::<f64>()));
    assert_eq!(result.report.metrics.rate_limited, 3);
    let probes = factory.probes();
    assert!(probes[..3].iter().all(|probe| probe.closed()));
    assert!(!probes[3].closed());
}

#[tokio::test(start_paused = true)]
async fn budget_is_never_exceeded() {
    let mut config = sample_config();
    config.timing.max_retries = 3;
    let notifier = RecordingNotifier::default();
    let factory = Arc::new(
        BookingSite::new(&config)
            .hop(Duration::from_secs(30))
            .factory(),
    );

    let result = controller(&config, factory.clone(), &notifier).run().await;

    assert_eq!(result.report.status, RunStatus::Exhausted);
    assert_eq!(outcomes(&result), vec![Outcome::NoTransition; 3]);
    assert_eq!(factory.created(), 3);
    assert!(factory.probes().iter().all(|probe| probe.closed()));
    assert!(result.into_session().is_none());
    assert_eq!(notifier.messages(), vec![("failure".to_string(), 30)]);
}

#[tokio::test(start_paused = true)]
async fn other_outcomes_cool_off_inside_the_window() {
    let mut config = sample_config();
    config.timing.max_retries = 4;
    let notifier = RecordingNotifier::default();
    let factory = Arc::new(
        BookingSite::new(&config)
            .hop(Duration::from_secs(30))
            .factory(),
    );

    let result = controller(&config, factory, &notifier).run().await;

    let [low, high] = config.backoff.cooloff_seconds;
    for record in &result.report.attempts[..3] {
        let delay = record.delay_after.unwrap().as_secs_f64();
        assert!(delay >= low && delay <= high, "{delay}");
    }
    assert_eq!(result.report.attempts[3].delay_after, None);
    assert_eq!(result.report.metrics.backoff_millis, 0);
}

#[tokio::test(start_paused = true)]
async fn transport_faults_release_the_session_and_retry() {
    let config = sample_config();
    let notifier = RecordingNotifier::default();
    let site = BookingSite::new(&config);
    let mut faulty = site.session();
    faulty.fail_location_times(1);
    let factory = Arc::new(
        ScriptedSessionFactory::new([faulty]).then_repeating(move || site.session()),
    );

    let result = controller(&config, factory.clone(), &notifier).run().await;

    let outcomes = outcomes(&result);
    assert!(matches!(outcomes[0], Outcome::TransportError(_)));
    assert_eq!(outcomes[1], Outcome::Success);
    assert!(factory.probes()[0].closed());
    assert_eq!(result.report.metrics.transport_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn launch_failures_consume_attempts() {
    let config = sample_config();
    let notifier = RecordingNotifier::default();
    let factory = Arc::new(BookingSite::new(&config).factory().failing_first(2));

    let result = controller(&config, factory.clone(), &notifier).run().await;

    assert_eq!(result.report.attempts.len(), 3);
    assert!(result.report.succeeded());
    assert_eq!(factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn backoff_memory_survives_other_outcomes_unless_reset() {
    for reset in [false, true] {
        let mut config = sample_config();
        config.timing.max_retries = 3;
        config.backoff.reset_after_other_outcomes = reset;
        let notifier = RecordingNotifier::default();
        let limited = BookingSite::new(&config).after_region(rate_limited_page());
        let stalled = BookingSite::new(&config).hop(Duration::from_secs(30));
        let factory = Arc::new(
            ScriptedSessionFactory::new([limited.session()])
                .then_repeating(move || stalled.session()),
        );

        let mut controller = controller(&config, factory, &notifier);
        let result = controller.run().await;

        assert_eq!(outcomes(&result)[0], Outcome::RateLimited);
        assert_eq!(controller.backoff().previous().is_none(), reset);
    }
}

#[tokio::test(start_paused = true)]
async fn every_attempt_is_journaled() {
    let dir = tempdir().unwrap();
    let mut config = sample_config();
    config.timing.max_retries = 2;
    let notifier = RecordingNotifier::default();
    let factory = Arc::new(
        BookingSite::new(&config)
            .hop(Duration::from_secs(30))
            .factory(),
    );
    let log = dir.path().join("attempts.jsonl");
    let journal = AttemptJournal::new(&log, dir.path().join("attempts.sqlite")).unwrap();

    let result = controller(&config, factory, &notifier)
        .with_journal(Some(journal))
        .run()
        .await;

    assert_eq!(result.report.attempts.len(), 2);
    let lines = std::fs::read_to_string(&log).unwrap();
    assert_eq!(lines.lines().count(), 2);
    assert!(lines.contains("\"no_transition\""));
}
