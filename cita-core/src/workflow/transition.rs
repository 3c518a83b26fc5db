use std::fmt;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::browser::{BrowserResult, ElementHandle, Session};
use crate::config::TimingSection;

/// Snapshot of the remote state taken immediately before an interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionSignal {
    pub location: String,
    /// `None` when the size could not be sampled; the size signal is then skipped.
    pub dom_size: Option<i64>,
    pub reference: Option<ElementHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    LocationChanged,
    ReferenceDetached,
    DomResized,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransitionKind::LocationChanged => "location_changed",
            TransitionKind::ReferenceDetached => "reference_detached",
            TransitionKind::DomResized => "dom_resized",
        };
        f.write_str(label)
    }
}

/// Decides whether an interaction changed remote state by polling three
/// independent signals: location, reference-handle validity and DOM size.
#[derive(Debug, Clone)]
pub struct TransitionDetector {
    poll_interval: Duration,
    timeout: Duration,
    dom_delta: i64,
}

impl TransitionDetector {
    pub fn new(poll_interval: Duration, timeout: Duration, dom_delta: i64) -> Self {
        Self {
            poll_interval,
            timeout,
            dom_delta: dom_delta.max(1),
        }
    }

    pub fn from_timing(timing: &TimingSection) -> Self {
        Self::new(
            timing.poll_interval(),
            timing.transition_timeout(),
            timing.dom_signature_delta,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The location read is the only sample allowed to fail here: without it
    /// there is nothing to compare against.
    pub async fn capture(
        &self,
        session: &mut dyn Session,
        reference: Option<ElementHandle>,
    ) -> BrowserResult<TransitionSignal> {
        let location = session.current_location().await?;
        let dom_size = session.dom_size().await.ok();
        Ok(TransitionSignal {
            location,
            dom_size,
            reference,
        })
    }

    /// Polls until a signal fires or the timeout elapses. At least one sample is
    /// always taken.
    pub async fn detect(
        &self,
        session: &mut dyn Session,
        signal: &TransitionSignal,
    ) -> Option<TransitionKind> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(kind) = self.sample(session, signal).await {
                trace!(signal = %kind, "transition detected");
                return Some(kind);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(self.poll_interval).await;
        }
    }

    pub async fn transitioned(&self, session: &mut dyn Session, signal: &TransitionSignal) -> bool {
        self.detect(session, signal).await.is_some()
    }

    async fn sample(
        &self,
        session: &mut dyn Session,
        signal: &TransitionSignal,
    ) -> Option<TransitionKind> {
        if let Ok(location) = session.current_location().await {
            if location != signal.location {
                return Some(TransitionKind::LocationChanged);
            }
        }

        if let Some(reference) = signal.reference {
            if let Ok(false) = session.handle_still_valid(reference).await {
                return Some(TransitionKind::ReferenceDetached);
            }
        }

        if let Some(before) = signal.dom_size {
            if let Ok(now) = session.dom_size().await {
                if (now - before).abs() >= self.dom_delta {
                    return Some(TransitionKind::DomResized);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PageChange, PageFixture, ScriptedSession};

    const BUTTON: &str = "#btnAceptar";

    fn detector() -> TransitionDetector {
        TransitionDetector::new(Duration::from_millis(500), Duration::from_secs(20), 50)
    }

    fn page() -> PageFixture {
        PageFixture::at("https://example.test/index.html")
            .with_dom_size(1_000)
            .with_element(BUTTON)
    }

    async fn armed(session: &mut ScriptedSession) -> TransitionSignal {
        let handle = session.find_element(BUTTON).await.unwrap();
        detector().capture(session, handle).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn location_change_alone_is_a_transition() {
        let mut session = ScriptedSession::new(page());
        let signal = armed(&mut session).await;
        session.schedule(
            Duration::from_secs(2),
            PageChange::SetLocation("https://example.test/next".into()),
        );
        let kind = detector().detect(&mut session, &signal).await;
        assert_eq!(kind, Some(TransitionKind::LocationChanged));
    }

    #[tokio::test(start_paused = true)]
    async fn detached_reference_alone_is_a_transition() {
        let mut session = ScriptedSession::new(page());
        let signal = armed(&mut session).await;
        session.schedule(Duration::from_secs(1), PageChange::Remove(BUTTON.into()));
        let kind = detector().detect(&mut session, &signal).await;
        assert_eq!(kind, Some(TransitionKind::ReferenceDetached));
    }

    #[tokio::test(start_paused = true)]
    async fn dom_growth_past_delta_alone_is_a_transition() {
        let mut session = ScriptedSession::new(page());
        let signal = armed(&mut session).await;
        session.schedule(Duration::from_secs(3), PageChange::SetDomSize(1_050));
        let kind = detector().detect(&mut session, &signal).await;
        assert_eq!(kind, Some(TransitionKind::DomResized));
    }

    #[tokio::test(start_paused = true)]
    async fn cosmetic_churn_below_delta_times_out() {
        let mut session = ScriptedSession::new(page());
        let signal = armed(&mut session).await;
        session.schedule(Duration::from_secs(1), PageChange::SetDomSize(1_049));
        let started = Instant::now();
        assert!(!detector().transitioned(&mut session, &signal).await);
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_page_times_out_after_the_configured_window() {
        let mut session = ScriptedSession::new(page());
        let signal = armed(&mut session).await;
        let short = detector().with_timeout(Duration::from_secs(2));
        let started = Instant::now();
        assert_eq!(short.detect(&mut session, &signal).await, None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_faults_are_treated_as_not_yet_available() {
        let mut session = ScriptedSession::new(page());
        let signal = armed(&mut session).await;
        session.fail_dom_size_times(u32::MAX);
        session.fail_location_times(3);
        session.schedule(
            Duration::from_secs(4),
            PageChange::SetLocation("https://example.test/next".into()),
        );
        let kind = detector().detect(&mut session, &signal).await;
        assert_eq!(kind, Some(TransitionKind::LocationChanged));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_size_sample_disables_the_size_signal() {
        let mut session = ScriptedSession::new(page());
        session.fail_dom_size_times(1);
        let signal = detector().capture(&mut session, None).await.unwrap();
        assert_eq!(signal.dom_size, None);
        session.schedule(Duration::from_secs(1), PageChange::SetDomSize(9_000));
        let short = detector().with_timeout(Duration::from_secs(3));
        assert!(!short.transitioned(&mut session, &signal).await);
    }
}
