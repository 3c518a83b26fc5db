use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{info, warn};

use crate::browser::{BrowserResult, Session};
use crate::config::{CaptchaMode, CitaConfig};
use crate::notify::{Notifier, Operator};
use crate::workflow::CaptchaFailure;

use super::{CaptchaError, CaptchaSolver, ScoredChallenge};

const ALARM_PHRASE: &str = "ALARM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    /// No challenge on the page.
    NotPresent,
    Cleared,
    Failed(CaptchaFailure),
}

/// Selectors the gate uses to find and answer challenges.
#[derive(Debug, Clone)]
pub struct ChallengeProbes {
    pub site_key_input: String,
    pub action_input: String,
    pub response_field_id: String,
    pub image: String,
    pub image_answer_input: String,
}

impl ChallengeProbes {
    pub fn from_config(config: &CitaConfig) -> Self {
        let site = &config.site;
        Self {
            site_key_input: site.recaptcha_key_input.clone(),
            action_input: site.recaptcha_action_input.clone(),
            response_field_id: site.recaptcha_response_id.clone(),
            image: site.image_captcha.clone(),
            image_answer_input: site.image_captcha_input.clone(),
        }
    }
}

/// Resolves a blocking challenge, either through a solving backend or by
/// handing control to the operator.
#[derive(Clone)]
pub struct CaptchaGate {
    mode: CaptchaMode,
    solver: Option<Arc<dyn CaptchaSolver>>,
    probes: ChallengeProbes,
    website_url: String,
    min_score: f64,
    alarm_seconds: Option<u64>,
    notifier: Arc<dyn Notifier>,
    operator: Arc<dyn Operator>,
}

impl CaptchaGate {
    pub fn new(
        config: &CitaConfig,
        solver: Option<Arc<dyn CaptchaSolver>>,
        notifier: Arc<dyn Notifier>,
        operator: Arc<dyn Operator>,
    ) -> Self {
        let notifications = &config.notifications;
        Self {
            mode: config.captcha.mode,
            solver,
            probes: ChallengeProbes::from_config(config),
            website_url: config.captcha.website_url.clone(),
            min_score: config.captcha.min_score,
            alarm_seconds: notifications
                .enabled
                .then_some(u64::from(notifications.captcha_alarm_repeats)),
            notifier,
            operator,
        }
    }

    pub async fn resolve(&self, session: &mut dyn Session) -> BrowserResult<GateVerdict> {
        match self.mode {
            CaptchaMode::Manual => Ok(self.hand_to_operator().await),
            CaptchaMode::Auto => {
                let Some(solver) = self.solver.as_deref() else {
                    warn!("automatic captcha mode without a solver");
                    return Ok(GateVerdict::Failed(CaptchaFailure::Unavailable));
                };
                if session.find_element(&self.probes.site_key_input).await?.is_some() {
                    return self.solve_scored(session, solver).await;
                }
                if !session.find_elements(&self.probes.image).await?.is_empty() {
                    return self.solve_image(session, solver).await;
                }
                Ok(GateVerdict::NotPresent)
            }
        }
    }

    /// Blocks until the operator confirms; there is deliberately no timeout.
    async fn hand_to_operator(&self) -> GateVerdict {
        if let Some(seconds) = self.alarm_seconds {
            self.notifier.emit(ALARM_PHRASE, seconds);
        }
        match self
            .operator
            .wait_for_enter("Manual captcha solving required. Solve the captcha and press ENTER...")
            .await
        {
            Ok(()) => GateVerdict::Cleared,
            Err(err) => {
                warn!(error = %err, "operator console unavailable");
                GateVerdict::Failed(CaptchaFailure::Unavailable)
            }
        }
    }

    async fn solve_scored(
        &self,
        session: &mut dyn Session,
        solver: &dyn CaptchaSolver,
    ) -> BrowserResult<GateVerdict> {
        let site_key = match session.find_element(&self.probes.site_key_input).await? {
            Some(input) => session.attribute(input, "value").await?.unwrap_or_default(),
            None => String::new(),
        };
        let action = match session.find_element(&self.probes.action_input).await? {
            Some(input) => session.attribute(input, "value").await?.unwrap_or_default(),
            None => String::new(),
        };
        info!(%site_key, %action, "solving scored challenge");
        let challenge = ScoredChallenge {
            website_url: self.website_url.clone(),
            site_key,
            action,
            min_score: self.min_score,
        };
        let token = match solver.solve_scored(&challenge).await {
            Ok(token) => token,
            Err(err) => return Ok(failed(err)),
        };
        let script = format!(
            "document.getElementById({}).value = {};",
            js_string(&self.probes.response_field_id),
            js_string(&token)
        );
        session.evaluate_script(&script).await?;
        Ok(GateVerdict::Cleared)
    }

    async fn solve_image(
        &self,
        session: &mut dyn Session,
        solver: &dyn CaptchaSolver,
    ) -> BrowserResult<GateVerdict> {
        let Some(image) = session.find_elements(&self.probes.image).await?.into_iter().next()
        else {
            return Ok(GateVerdict::NotPresent);
        };
        let source = session.attribute(image, "src").await?.unwrap_or_default();
        let Some(bytes) = decode_data_url(&source) else {
            warn!("challenge image is not a base64 data url");
            return Ok(GateVerdict::Failed(CaptchaFailure::Failed));
        };
        let text = match solver.solve_image(&bytes).await {
            Ok(text) => text,
            Err(err) => return Ok(failed(err)),
        };
        let Some(answer) = session.find_element(&self.probes.image_answer_input).await? else {
            warn!(input = %self.probes.image_answer_input, "challenge answer input missing");
            return Ok(GateVerdict::Failed(CaptchaFailure::Failed));
        };
        info!("image challenge solved");
        session.type_text(answer, &text).await?;
        Ok(GateVerdict::Cleared)
    }
}

fn failed(err: CaptchaError) -> GateVerdict {
    warn!(error = %err, "captcha backend failed");
    match err {
        CaptchaError::Unavailable(_) => GateVerdict::Failed(CaptchaFailure::Unavailable),
        _ => GateVerdict::Failed(CaptchaFailure::Failed),
    }
}

fn decode_data_url(source: &str) -> Option<Vec<u8>> {
    let (_, payload) = source.split_once(',')?;
    STANDARD.decode(payload.trim()).ok()
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FixedSolver, PageFixture, RecordingNotifier, RecordingOperator, ScriptedSession,
    };

    fn config(mode: CaptchaMode) -> CitaConfig {
        let mut config = CitaConfig::default();
        config.captcha.mode = mode;
        config
    }

    fn gate(mode: CaptchaMode, solver: Option<FixedSolver>) -> (CaptchaGate, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        let gate = CaptchaGate::new(
            &config(mode),
            solver.map(|solver| Arc::new(solver) as Arc<dyn CaptchaSolver>),
            Arc::new(notifier.clone()),
            Arc::new(RecordingOperator::default()),
        );
        (gate, notifier)
    }

    fn scored_page() -> PageFixture {
        PageFixture::at("https://icp.test/icpplustieb/acOfertarCita")
            .with_attribute("#reCAPTCHA_site_key", "value", "6Lc-site")
            .with_attribute("#action", "value", "submit")
    }

    #[tokio::test]
    async fn scored_token_is_injected_into_the_response_field() {
        let (gate, _) = gate(CaptchaMode::Auto, Some(FixedSolver::answering("tok'en")));
        let mut session = ScriptedSession::new(scored_page());
        let probe = session.probe();
        assert_eq!(gate.resolve(&mut session).await.unwrap(), GateVerdict::Cleared);
        let scripts = probe.snapshot().scripts;
        assert_eq!(
            scripts,
            vec!["document.getElementById(\"g-recaptcha-response\").value = \"tok'en\";".to_string()]
        );
    }

    #[tokio::test]
    async fn image_answer_is_typed_into_the_input() {
        let (gate, _) = gate(CaptchaMode::Auto, Some(FixedSolver::answering("x7k2p")));
        let page = PageFixture::at("https://icp.test/icpplustieb/acOfertarCita")
            .with_attribute("img.img-thumbnail", "src", "data:image/png;base64,iVBORw==")
            .with_element("#captcha");
        let mut session = ScriptedSession::new(page);
        let probe = session.probe();
        assert_eq!(gate.resolve(&mut session).await.unwrap(), GateVerdict::Cleared);
        assert_eq!(probe.snapshot().typed_into("#captcha"), Some("x7k2p"));
    }

    #[tokio::test]
    async fn page_without_challenge_passes_through() {
        let (gate, _) = gate(CaptchaMode::Auto, Some(FixedSolver::answering("unused")));
        let mut session = ScriptedSession::new(PageFixture::at("https://icp.test/"));
        assert_eq!(gate.resolve(&mut session).await.unwrap(), GateVerdict::NotPresent);
    }

    #[tokio::test]
    async fn backend_failure_fails_the_gate() {
        let (gate, _) = gate(CaptchaMode::Auto, Some(FixedSolver::failing()));
        let mut session = ScriptedSession::new(scored_page());
        assert_eq!(
            gate.resolve(&mut session).await.unwrap(),
            GateVerdict::Failed(CaptchaFailure::Failed)
        );
    }

    #[tokio::test]
    async fn missing_solver_is_unavailable() {
        let (gate, _) = gate(CaptchaMode::Auto, None);
        let mut session = ScriptedSession::new(scored_page());
        assert_eq!(
            gate.resolve(&mut session).await.unwrap(),
            GateVerdict::Failed(CaptchaFailure::Unavailable)
        );
    }

    #[tokio::test]
    async fn manual_mode_sounds_alarm_then_waits_for_operator() {
        let (gate, notifier) = gate(CaptchaMode::Manual, None);
        let mut session = ScriptedSession::new(PageFixture::at("https://icp.test/"));
        assert_eq!(gate.resolve(&mut session).await.unwrap(), GateVerdict::Cleared);
        assert_eq!(notifier.messages(), vec![("ALARM".to_string(), 10)]);
    }

    #[test]
    fn data_urls_decode_their_payload() {
        assert_eq!(
            decode_data_url("data:image/png;base64, iVBORw=="),
            Some(vec![0x89, 0x50, 0x4e, 0x47])
        );
        assert_eq!(decode_data_url("https://icp.test/captcha.png"), None);
    }
}
