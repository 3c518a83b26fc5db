use tracing::{debug, info};

use crate::browser::{BrowserResult, Session};

use super::outcome::Outcome;
use super::step::{Step, StepContext, StepResult, StepServices};
use super::steps::default_steps;

/// Runs the ordered steps of one attempt against one session.
pub struct StepSequencer {
    services: StepServices,
    steps: Vec<Box<dyn Step>>,
}

impl StepSequencer {
    pub fn new(services: StepServices) -> Self {
        Self::with_steps(services, default_steps())
    }

    pub fn with_steps(services: StepServices, steps: Vec<Box<dyn Step>>) -> Self {
        Self { services, steps }
    }

    /// Executes every step in order and stops at the first terminal outcome.
    /// Errors are transport faults; the caller reports them as such.
    pub async fn run(&self, session: &mut dyn Session) -> BrowserResult<Outcome> {
        for (index, step) in self.steps.iter().enumerate() {
            debug!(step = step.name(), index, "step started");
            let mut ctx = StepContext::new(&mut *session, &self.services, step.name());
            match step.run(&mut ctx).await? {
                StepResult::Proceed => debug!(step = step.name(), "step completed"),
                StepResult::Terminal(outcome) => {
                    info!(step = step.name(), outcome = outcome.label(), "attempt ended early");
                    return Ok(outcome);
                }
            }
        }
        Ok(Outcome::Success)
    }
}
