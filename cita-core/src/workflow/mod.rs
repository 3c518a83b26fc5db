mod classifier;
mod outcome;
mod sequencer;
mod step;
mod steps;
mod transition;

pub use classifier::{
    Classification, OutcomeClassifier, OutcomeTag, PageState, Predicate, Rule, StepExpectation,
};
pub use outcome::{CaptchaFailure, FailureKind, FailureReason, Outcome, StepFailure};
pub use sequencer::StepSequencer;
pub use step::{Commit, Step, StepContext, StepResult, StepServices};
pub use steps::{
    choose_office, default_steps, slot_cells_selector, ActivateQueryControl, AwaitQueryControl,
    ConfirmAppointment, EnterSection, SelectOffice, SelectProcedure, SelectRegion, SelectSlot,
    SubmitContact, SubmitPersonalInfo,
};
pub use transition::{TransitionDetector, TransitionKind, TransitionSignal};
