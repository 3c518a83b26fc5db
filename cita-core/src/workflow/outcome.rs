use std::fmt;

use serde::Serialize;

/// Terminal classification of one attempt (or of the step that ended it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Rejected,
    RateLimited,
    SessionTimeout,
    NoTransition,
    ValidationFailed,
    StepFailed(StepFailure),
    TransportError(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn step_failed(step: &str, reason: FailureReason) -> Self {
        Outcome::StepFailed(StepFailure {
            step: step.to_string(),
            reason,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Rejected => "rejected",
            Outcome::RateLimited => "rate_limited",
            Outcome::SessionTimeout => "session_timeout",
            Outcome::NoTransition => "no_transition",
            Outcome::ValidationFailed => "validation_failed",
            Outcome::StepFailed(_) => "step_failed",
            Outcome::TransportError(_) => "transport_error",
        }
    }

    /// Error taxonomy entry for a non-success outcome.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        let kind = match self {
            Outcome::Success => return None,
            Outcome::Rejected => FailureKind::BlockedByAntiBot,
            Outcome::RateLimited => FailureKind::RateLimited,
            Outcome::SessionTimeout => FailureKind::SessionTimeout,
            Outcome::NoTransition => FailureKind::NoTransitionDetected,
            Outcome::ValidationFailed => FailureKind::ValidationRejected,
            Outcome::TransportError(_) => FailureKind::TransportFault,
            Outcome::StepFailed(failure) => match &failure.reason {
                FailureReason::PreconditionMissing(_) | FailureReason::NotOnConfirmation => {
                    FailureKind::PreconditionMissing
                }
                FailureReason::Captcha(CaptchaFailure::Unavailable) => {
                    FailureKind::CaptchaUnavailable
                }
                FailureReason::Captcha(CaptchaFailure::Failed) => FailureKind::CaptchaFailed,
                FailureReason::NoProceduresOffered
                | FailureReason::NoOfficesOffered
                | FailureReason::NoSlotsOffered => FailureKind::NothingOffered,
                FailureReason::NotConfirmed => FailureKind::ValidationRejected,
            },
        };
        Some(kind)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::StepFailed(failure) => write!(f, "step_failed({failure})"),
            Outcome::TransportError(detail) => write!(f, "transport_error({detail})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: String,
    pub reason: FailureReason,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// An expected element or location never appeared.
    PreconditionMissing(String),
    Captcha(CaptchaFailure),
    NoProceduresOffered,
    NoOfficesOffered,
    NoSlotsOffered,
    NotOnConfirmation,
    NotConfirmed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PreconditionMissing(probe) => write!(f, "precondition missing: {probe}"),
            FailureReason::Captcha(_) => f.write_str("captcha"),
            FailureReason::NoProceduresOffered => f.write_str("no procedures offered"),
            FailureReason::NoOfficesOffered => f.write_str("no offices offered"),
            FailureReason::NoSlotsOffered => f.write_str("no slots offered"),
            FailureReason::NotOnConfirmation => f.write_str("not on confirmation page"),
            FailureReason::NotConfirmed => f.write_str("appointment not confirmed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaFailure {
    Unavailable,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BlockedByAntiBot,
    RateLimited,
    SessionTimeout,
    ValidationRejected,
    NoTransitionDetected,
    CaptchaUnavailable,
    CaptchaFailed,
    TransportFault,
    PreconditionMissing,
    NothingOffered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captcha_failures_display_as_captcha() {
        let outcome = Outcome::step_failed("select_slot", FailureReason::Captcha(CaptchaFailure::Failed));
        assert_eq!(outcome.to_string(), "step_failed(select_slot: captcha)");
        assert_eq!(outcome.failure_kind(), Some(FailureKind::CaptchaFailed));
    }

    #[test]
    fn success_has_no_failure_kind() {
        assert_eq!(Outcome::Success.failure_kind(), None);
        assert_eq!(
            Outcome::TransportError("socket closed".into()).failure_kind(),
            Some(FailureKind::TransportFault)
        );
    }

    #[test]
    fn outcomes_serialize_with_kind_tag() {
        let json = serde_json::to_value(Outcome::RateLimited).unwrap();
        assert_eq!(json["kind"], "rate_limited");
        let json = serde_json::to_value(Outcome::step_failed(
            "await_query_control",
            FailureReason::PreconditionMissing("#btnConsultar".into()),
        ))
        .unwrap();
        assert_eq!(json["detail"]["step"], "await_query_control");
        assert_eq!(json["detail"]["reason"]["precondition_missing"], "#btnConsultar");
    }
}
