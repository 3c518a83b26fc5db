use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::browser::{BrowserResult, ElementHandle, HumanPacer, OptionChoice, SelectOption, Session};
use crate::captcha::CaptchaGate;
use crate::config::CitaConfig;
use crate::notify::Operator;

use super::classifier::{OutcomeClassifier, PageState, StepExpectation};
use super::outcome::{FailureReason, Outcome};
use super::transition::{TransitionDetector, TransitionKind, TransitionSignal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Proceed,
    Terminal(Outcome),
}

/// One unit of workflow progress. Steps are never retried individually.
#[async_trait(?Send)]
pub trait Step {
    fn name(&self) -> &'static str;

    /// Transport faults propagate as errors; everything the page says becomes
    /// a [`StepResult`].
    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult>;
}

/// Collaborators shared by every step of every attempt.
#[derive(Clone)]
pub struct StepServices {
    pub config: Arc<CitaConfig>,
    pub detector: TransitionDetector,
    pub classifier: OutcomeClassifier,
    pub pacer: HumanPacer,
    pub gate: CaptchaGate,
    pub operator: Arc<dyn Operator>,
}

impl StepServices {
    pub fn new(config: Arc<CitaConfig>, gate: CaptchaGate, operator: Arc<dyn Operator>) -> Self {
        Self {
            detector: TransitionDetector::from_timing(&config.timing),
            classifier: OutcomeClassifier::new(&config.markers),
            pacer: HumanPacer::new(config.human.clone()),
            config,
            gate,
            operator,
        }
    }
}

/// What happened after an interaction was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub from: String,
    pub transition: Option<TransitionKind>,
}

impl Commit {
    pub fn transitioned(&self) -> bool {
        self.transition.is_some()
    }
}

pub struct StepContext<'a> {
    session: &'a mut dyn Session,
    services: &'a StepServices,
    step: &'static str,
}

impl<'a> StepContext<'a> {
    pub fn new(session: &'a mut dyn Session, services: &'a StepServices, step: &'static str) -> Self {
        Self {
            session,
            services,
            step,
        }
    }

    pub fn session(&mut self) -> &mut dyn Session {
        &mut *self.session
    }

    pub fn config(&self) -> &'a CitaConfig {
        &self.services.config
    }

    pub fn services(&self) -> &'a StepServices {
        self.services
    }

    pub fn step(&self) -> &'static str {
        self.step
    }

    pub fn wait(&self) -> Duration {
        self.services.config.timing.wait()
    }

    pub fn fail(&self, reason: FailureReason) -> StepResult {
        StepResult::Terminal(Outcome::step_failed(self.step, reason))
    }

    pub fn missing(&self, probe: &str) -> StepResult {
        self.fail(FailureReason::PreconditionMissing(probe.to_string()))
    }

    /// Polls for `selector` until it resolves or `timeout` elapses.
    pub async fn wait_for(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> BrowserResult<Option<ElementHandle>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(handle) = self.session.find_element(selector).await? {
                return Ok(Some(handle));
            }
            if Instant::now() >= deadline {
                debug!(step = self.step, selector, "element never appeared");
                return Ok(None);
            }
            sleep(self.services.detector.poll_interval()).await;
        }
    }

    pub async fn wait_for_location(
        &mut self,
        fragment: &str,
        timeout: Duration,
    ) -> BrowserResult<bool> {
        self.wait_until(timeout, |location, _| location.contains(fragment), None)
            .await
    }

    /// Either the location contains `fragment` or `selector` resolves.
    pub async fn wait_for_location_or(
        &mut self,
        fragment: &str,
        selector: &str,
        timeout: Duration,
    ) -> BrowserResult<bool> {
        self.wait_until(
            timeout,
            |location, found| location.contains(fragment) || found,
            Some(selector),
        )
        .await
    }

    async fn wait_until(
        &mut self,
        timeout: Duration,
        done: impl Fn(&str, bool) -> bool,
        selector: Option<&str>,
    ) -> BrowserResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let location = self.session.current_location().await?;
            let found = match selector {
                Some(selector) => self.session.find_element(selector).await?.is_some(),
                None => false,
            };
            if done(&location, found) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(self.services.detector.poll_interval()).await;
        }
    }

    /// Waits for `document.readyState == "complete"`; a page that never settles
    /// is left for the classifier to judge.
    pub async fn wait_ready(&mut self) -> BrowserResult<()> {
        let deadline = Instant::now() + self.wait();
        loop {
            let state = self.session.evaluate_script("document.readyState").await?;
            if state == Value::String("complete".to_string()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!(step = self.step, ?state, "document never reached readyState complete");
                return Ok(());
            }
            sleep(self.services.detector.poll_interval()).await;
        }
    }

    pub async fn pause(&self) {
        self.services.pacer.pause().await;
    }

    pub async fn fill(&mut self, handle: ElementHandle, text: &str) -> BrowserResult<()> {
        self.session.clear_text(handle).await?;
        self.services.pacer.keystroke_pause().await;
        self.session.type_text(handle, text).await
    }

    pub async fn select(
        &mut self,
        handle: ElementHandle,
        choice: &OptionChoice,
    ) -> BrowserResult<Option<SelectOption>> {
        self.session.select_option(handle, choice).await
    }

    /// Captures the pre-interaction snapshot.
    pub async fn arm(&mut self, reference: Option<ElementHandle>) -> BrowserResult<TransitionSignal> {
        self.services.detector.capture(&mut *self.session, reference).await
    }

    pub async fn await_transition(&mut self, signal: &TransitionSignal) -> Commit {
        let transition = self.services.detector.detect(&mut *self.session, signal).await;
        if transition.is_none() {
            debug!(step = self.step, "no transition observed");
        }
        Commit {
            from: signal.location.clone(),
            transition,
        }
    }

    /// Hovers, clicks and waits for the page to react.
    pub async fn commit_click(&mut self, handle: ElementHandle) -> BrowserResult<Commit> {
        let signal = self.arm(Some(handle)).await?;
        self.services.pacer.hover().await;
        self.session.click(handle).await?;
        Ok(self.await_transition(&signal).await)
    }

    /// Runs a page script and waits for the page to react.
    pub async fn commit_script(&mut self, code: &str) -> BrowserResult<Commit> {
        let signal = self.arm(None).await?;
        self.session.evaluate_script(code).await?;
        Ok(self.await_transition(&signal).await)
    }

    /// Classifies the current page against the shared guards plus `expectation`.
    pub async fn classify(&mut self, expectation: &StepExpectation) -> BrowserResult<StepResult> {
        let page = PageState::observe(&mut *self.session).await?;
        let verdict = self.services.classifier.classify(&page, expectation);
        debug!(
            step = self.step,
            rule = verdict.rule,
            tag = ?verdict.tag,
            location = %page.location,
            "page classified"
        );
        Ok(match verdict.tag.into_outcome() {
            Some(outcome) => StepResult::Terminal(outcome),
            None => StepResult::Proceed,
        })
    }

    /// Guard-only classification after a committed interaction.
    pub async fn conclude(&mut self, commit: &Commit) -> BrowserResult<StepResult> {
        if !commit.transitioned() {
            return Ok(StepResult::Terminal(Outcome::NoTransition));
        }
        self.wait_ready().await?;
        self.classify(&StepExpectation::guards_only()).await
    }
}
