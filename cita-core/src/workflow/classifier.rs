use crate::browser::{BrowserResult, Session};
use crate::config::{Marker, OutcomeMarkers};

use super::outcome::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeTag {
    /// The step made progress; the sequencer moves on.
    Advanced,
    Rejected,
    RateLimited,
    SessionTimeout,
    ValidationFailed,
    NoTransition,
}

impl OutcomeTag {
    pub fn into_outcome(self) -> Option<Outcome> {
        match self {
            OutcomeTag::Advanced => None,
            OutcomeTag::Rejected => Some(Outcome::Rejected),
            OutcomeTag::RateLimited => Some(Outcome::RateLimited),
            OutcomeTag::SessionTimeout => Some(Outcome::SessionTimeout),
            OutcomeTag::ValidationFailed => Some(Outcome::ValidationFailed),
            OutcomeTag::NoTransition => Some(Outcome::NoTransition),
        }
    }
}

/// What the page looked like after an interaction.
#[derive(Debug, Clone, Default)]
pub struct PageState {
    pub location: String,
    pub title: String,
    pub content: String,
}

impl PageState {
    pub fn new(
        location: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            title: title.into(),
            content: content.into(),
        }
    }

    pub async fn observe(session: &mut dyn Session) -> BrowserResult<Self> {
        let location = session.current_location().await?;
        let title = session.title().await?;
        let content = session.content_snapshot().await?;
        Ok(Self::new(location, title, content))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    ContentMatches(Vec<Marker>),
    TitleOrContentMatches {
        title: Vec<Marker>,
        content: Vec<Marker>,
    },
    LocationMatches(Vec<Marker>),
    LocationContains(String),
    StillAt(String),
    StillAtWithControls {
        location: String,
        controls_present: bool,
    },
}

impl Predicate {
    fn holds(&self, page: &LoweredPage<'_>) -> bool {
        match self {
            Predicate::ContentMatches(markers) => any_match(markers, &page.content),
            Predicate::TitleOrContentMatches { title, content } => {
                any_match(title, &page.title) || any_match(content, &page.content)
            }
            Predicate::LocationMatches(markers) => any_match(markers, &page.location),
            Predicate::LocationContains(marker) => page.raw.location.contains(marker.as_str()),
            Predicate::StillAt(location) => page.raw.location == *location,
            Predicate::StillAtWithControls {
                location,
                controls_present,
            } => *controls_present && page.raw.location == *location,
        }
    }
}

fn any_match(markers: &[Marker], haystack_lower: &str) -> bool {
    markers.iter().any(|marker| marker.matches(haystack_lower))
}

struct LoweredPage<'a> {
    raw: &'a PageState,
    location: String,
    title: String,
    content: String,
}

impl<'a> LoweredPage<'a> {
    fn new(raw: &'a PageState) -> Self {
        Self {
            raw,
            location: raw.location.to_lowercase(),
            title: raw.title.trim().to_lowercase(),
            content: raw.content.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: &'static str,
    pub predicate: Predicate,
    pub tag: OutcomeTag,
}

/// Step-specific rules appended after the shared guards.
#[derive(Debug, Clone, Default)]
pub struct StepExpectation {
    location_rules: Vec<(String, OutcomeTag)>,
    stay: Option<(String, bool)>,
}

impl StepExpectation {
    /// Guards only: blocked, rate limited, timed out, otherwise advanced.
    pub fn guards_only() -> Self {
        Self::default()
    }

    pub fn location(mut self, marker: impl Into<String>, tag: OutcomeTag) -> Self {
        self.location_rules.push((marker.into(), tag));
        self
    }

    /// Staying on `previous_location` is a failure; with the step's controls still
    /// rendered it reads as a rejected submission.
    pub fn stay_guard(mut self, previous_location: impl Into<String>, controls_present: bool) -> Self {
        self.stay = Some((previous_location.into(), controls_present));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub tag: OutcomeTag,
    pub rule: &'static str,
}

/// Ordered `(predicate, tag)` table; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct OutcomeClassifier {
    guards: Vec<Rule>,
}

impl OutcomeClassifier {
    pub fn new(markers: &OutcomeMarkers) -> Self {
        let guards = vec![
            Rule {
                name: "bot_block",
                predicate: Predicate::ContentMatches(markers.rejected_content.clone()),
                tag: OutcomeTag::Rejected,
            },
            Rule {
                name: "rate_limit",
                predicate: Predicate::TitleOrContentMatches {
                    title: markers.rate_limited_title.clone(),
                    content: markers.rate_limited_content.clone(),
                },
                tag: OutcomeTag::RateLimited,
            },
            Rule {
                name: "session_timeout",
                predicate: Predicate::LocationMatches(markers.session_timeout_location.clone()),
                tag: OutcomeTag::SessionTimeout,
            },
        ];
        Self { guards }
    }

    pub fn rules(&self, expectation: &StepExpectation) -> Vec<Rule> {
        let mut rules = self.guards.clone();
        for (marker, tag) in &expectation.location_rules {
            rules.push(Rule {
                name: "step_location",
                predicate: Predicate::LocationContains(marker.clone()),
                tag: *tag,
            });
        }
        if let Some((location, controls_present)) = &expectation.stay {
            rules.push(Rule {
                name: "stayed_with_controls",
                predicate: Predicate::StillAtWithControls {
                    location: location.clone(),
                    controls_present: *controls_present,
                },
                tag: OutcomeTag::ValidationFailed,
            });
            rules.push(Rule {
                name: "stayed",
                predicate: Predicate::StillAt(location.clone()),
                tag: OutcomeTag::NoTransition,
            });
        }
        rules
    }

    pub fn classify(&self, page: &PageState, expectation: &StepExpectation) -> Classification {
        let lowered = LoweredPage::new(page);
        self.rules(expectation)
            .into_iter()
            .find(|rule| rule.predicate.holds(&lowered))
            .map(|rule| Classification {
                tag: rule.tag,
                rule: rule.name,
            })
            .unwrap_or(Classification {
                tag: OutcomeTag::Advanced,
                rule: "default",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: &str = "https://sede.test/icpplustieb/acEntrada";

    fn classifier() -> OutcomeClassifier {
        OutcomeClassifier::new(&OutcomeMarkers::default())
    }

    fn personal_info_expectation(controls_present: bool) -> StepExpectation {
        StepExpectation::guards_only()
            .location("/icpplustieb/acValidarEntrada", OutcomeTag::ValidationFailed)
            .location("/icpplustieb/acCitar", OutcomeTag::Advanced)
            .stay_guard(ENTRY, controls_present)
    }

    #[test]
    fn block_marker_dominates_next_step_location() {
        let page = PageState::new(
            "https://sede.test/icpplustieb/acCitar",
            "Cita previa",
            "<h1>The requested URL was rejected</h1> Request Rejected. Your support ID is 123",
        );
        let verdict = classifier().classify(&page, &personal_info_expectation(false));
        assert_eq!(verdict.tag, OutcomeTag::Rejected);
        assert_eq!(verdict.rule, "bot_block");
    }

    #[test]
    fn grouped_block_marker_needs_every_phrase() {
        let page = PageState::new(ENTRY, "", "Support ID: 42. Please go back and retry");
        assert_eq!(
            classifier().classify(&page, &StepExpectation::guards_only()).tag,
            OutcomeTag::Rejected
        );
        let page = PageState::new(ENTRY, "", "Support ID: 42");
        assert_eq!(
            classifier().classify(&page, &StepExpectation::guards_only()).tag,
            OutcomeTag::Advanced
        );
    }

    #[test]
    fn rate_limit_is_read_from_title_or_content() {
        let by_title = PageState::new(ENTRY, " 429 Too Many Requests ", "<html></html>");
        let by_content = PageState::new(ENTRY, "", "Too Many Requests, slow down");
        for page in [by_title, by_content] {
            let verdict = classifier().classify(&page, &personal_info_expectation(true));
            assert_eq!(verdict.tag, OutcomeTag::RateLimited);
        }
    }

    #[test]
    fn rate_limit_outranks_session_timeout() {
        let page = PageState::new(
            "https://sede.test/icpplustieb/infogenerica",
            "429 Too Many Requests",
            "",
        );
        assert_eq!(
            classifier().classify(&page, &StepExpectation::guards_only()).tag,
            OutcomeTag::RateLimited
        );
    }

    #[test]
    fn timeout_location_outranks_step_markers() {
        let page = PageState::new("https://sede.test/icpplustieb/infogenerica?acCitar", "", "");
        let verdict = classifier().classify(&page, &personal_info_expectation(false));
        assert_eq!(verdict.tag, OutcomeTag::SessionTimeout);
    }

    #[test]
    fn validation_location_maps_to_validation_failed() {
        let page = PageState::new("https://sede.test/icpplustieb/acValidarEntrada", "", "");
        let verdict = classifier().classify(&page, &personal_info_expectation(false));
        assert_eq!(verdict.tag, OutcomeTag::ValidationFailed);
        assert_eq!(verdict.rule, "step_location");
    }

    #[test]
    fn staying_put_depends_on_controls_probe() {
        let page = PageState::new(ENTRY, "", "<form></form>");
        assert_eq!(
            classifier().classify(&page, &personal_info_expectation(true)).tag,
            OutcomeTag::ValidationFailed
        );
        assert_eq!(
            classifier().classify(&page, &personal_info_expectation(false)).tag,
            OutcomeTag::NoTransition
        );
    }

    #[test]
    fn anything_else_advances() {
        let page = PageState::new("https://sede.test/icpplustieb/acOpciones", "", "");
        let verdict = classifier().classify(&page, &personal_info_expectation(true));
        assert_eq!(verdict.tag, OutcomeTag::Advanced);
        assert_eq!(verdict.rule, "default");
    }

    #[test]
    fn rule_table_keeps_documented_order() {
        let names: Vec<_> = classifier()
            .rules(&personal_info_expectation(true))
            .into_iter()
            .map(|rule| rule.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "bot_block",
                "rate_limit",
                "session_timeout",
                "step_location",
                "step_location",
                "stayed_with_controls",
                "stayed",
            ]
        );
    }
}
