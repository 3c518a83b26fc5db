use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Placeholder shipped in sample configs; never a usable key.
const PLACEHOLDER_API_KEY: &str = "your_api_key_here";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CitaConfig {
    pub identity: IdentitySection,
    pub workflow: WorkflowSection,
    pub timing: TimingSection,
    pub backoff: BackoffSection,
    pub captcha: CaptchaSection,
    pub notifications: NotificationSection,
    pub chromium: ChromiumSection,
    pub human: HumanSection,
    pub journal: JournalSection,
    pub site: SiteProbes,
    pub markers: OutcomeMarkers,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub applicant_id: String,
    pub full_name: String,
    pub country_code: String,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub start_url: String,
    pub province: String,
    /// Visible text of the procedure to pick; the last option when unset.
    pub procedure: Option<String>,
    pub preferred_offices: Vec<String>,
    pub excluded_offices: Vec<String>,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            start_url: "https://icp.administracionelectronica.gob.es/icpplustiem/index.html"
                .to_string(),
            province: "Barcelona".to_string(),
            procedure: None,
            preferred_offices: Vec::new(),
            excluded_offices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub max_retries: u32,
    pub wait_seconds: u64,
    pub transition_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub dom_signature_delta: i64,
    pub query_control_timeout_seconds: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            max_retries: 500,
            wait_seconds: 30,
            transition_timeout_seconds: 20,
            poll_interval_ms: 500,
            dom_signature_delta: 50,
            query_control_timeout_seconds: 10,
        }
    }
}

impl TimingSection {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn query_control_timeout(&self) -> Duration {
        Duration::from_secs(self.query_control_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub base_seconds: f64,
    pub cap_seconds: f64,
    pub cooloff_seconds: [f64; 2],
    /// Clears the rate-limit memory after any non-rate-limited attempt.
    pub reset_after_other_outcomes: bool,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_seconds: 5.0,
            cap_seconds: 600.0,
            cooloff_seconds: [1.0, 2.5],
            reset_after_other_outcomes: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptchaMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaSection {
    pub mode: CaptchaMode,
    pub api_key: Option<String>,
    pub api_url: String,
    pub website_url: String,
    pub min_score: f64,
    pub poll_interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for CaptchaSection {
    fn default() -> Self {
        Self {
            mode: CaptchaMode::Auto,
            api_key: None,
            api_url: "https://api.anti-captcha.com".to_string(),
            website_url: "https://icp.administracionelectronica.gob.es".to_string(),
            min_score: 0.9,
            poll_interval_seconds: 3,
            timeout_seconds: 300,
        }
    }
}

impl CaptchaSection {
    /// The configured key, unless it is missing, blank or the sample placeholder.
    pub fn usable_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty() && *key != PLACEHOLDER_API_KEY)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    pub enabled: bool,
    pub success_phrase: String,
    pub success_seconds: u64,
    pub failure_phrase: String,
    pub failure_seconds: u64,
    pub captcha_alarm_repeats: u32,
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            success_phrase: "success".to_string(),
            success_seconds: 30,
            failure_phrase: "failure".to_string(),
            failure_seconds: 30,
            captcha_alarm_repeats: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub user_data_dir: Option<String>,
    pub user_agent: Option<String>,
    pub accept_language: String,
    pub disable_blink_features: Vec<String>,
    pub request_timeout_seconds: Option<u64>,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: false,
            sandbox: true,
            user_data_dir: Some("~/.selenium-icp-profile".to_string()),
            user_agent: None,
            accept_language: "es-ES,es;q=0.9,en;q=0.8".to_string(),
            disable_blink_features: vec!["AutomationControlled".to_string()],
            request_timeout_seconds: None,
        }
    }
}

impl ChromiumSection {
    pub fn profile_dir(&self) -> Option<PathBuf> {
        self.user_data_dir.as_deref().map(expand_home)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HumanSection {
    pub pause_ms: [u64; 2],
    pub keystroke_pause_ms: [u64; 2],
    pub hover_ms: u64,
}

impl Default for HumanSection {
    fn default() -> Self {
        Self {
            pause_ms: [300, 1200],
            keystroke_pause_ms: [100, 250],
            hover_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JournalSection {
    pub enabled: bool,
    pub attempt_log: String,
    pub database: String,
}

impl Default for JournalSection {
    fn default() -> Self {
        Self {
            enabled: false,
            attempt_log: "logs/attempts.jsonl".to_string(),
            database: "logs/attempts.sqlite".to_string(),
        }
    }
}

/// Selector and text probes for the target site. Opaque to the sequencer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteProbes {
    pub region_select: String,
    pub accept_button: String,
    pub procedure_select: String,
    pub info_location: String,
    pub enter_button: String,
    pub entry_location: String,
    pub applicant_id_input: String,
    pub applicant_name_input: String,
    pub country_select: String,
    pub personal_submit_button: String,
    pub validation_location: String,
    pub appointment_location: String,
    pub query_button: String,
    pub office_select: String,
    pub office_next_button: String,
    pub phone_input: String,
    pub email_inputs: Vec<String>,
    pub contact_submit_script: String,
    pub timer_slots_marker: String,
    pub timer_slot_radios: String,
    pub timer_submit_script: String,
    pub table_slots_marker: String,
    pub slot_table: String,
    pub recaptcha_key_input: String,
    pub recaptcha_action_input: String,
    pub recaptcha_response_id: String,
    pub image_captcha: String,
    pub image_captcha_input: String,
    pub confirmation_marker: String,
    pub sms_code_input: String,
    pub consent_checkboxes: Vec<String>,
    pub confirm_button: String,
    pub confirmed_marker: String,
}

impl Default for SiteProbes {
    fn default() -> Self {
        Self {
            region_select: "#form".to_string(),
            accept_button: "#btnAceptar".to_string(),
            procedure_select: "select[name='tramiteGrupo[0]']".to_string(),
            info_location: "/icpplustieb/acInfo".to_string(),
            enter_button: "#btnEntrar".to_string(),
            entry_location: "/icpplustieb/acEntrada".to_string(),
            applicant_id_input: "#txtIdCitado".to_string(),
            applicant_name_input: "#txtDesCitado".to_string(),
            country_select: "#txtPaisNac".to_string(),
            personal_submit_button: "#btnEnviar".to_string(),
            validation_location: "/icpplustieb/acValidarEntrada".to_string(),
            appointment_location: "/icpplustieb/acCitar".to_string(),
            query_button: "#btnConsultar".to_string(),
            office_select: "#idSede".to_string(),
            office_next_button: "#btnSiguiente".to_string(),
            phone_input: "#txtTelefonoCitado".to_string(),
            email_inputs: vec!["#emailUNO".to_string(), "#emailDOS".to_string()],
            contact_submit_script: "enviar();".to_string(),
            timer_slots_marker: "DISPONE DE 5 MINUTOS".to_string(),
            timer_slot_radios: "input[type='radio'][name='rdbCita']".to_string(),
            timer_submit_script: "envia();".to_string(),
            table_slots_marker: "Seleccione una de las siguientes citas disponibles".to_string(),
            slot_table: "#CitaMAP_HORAS".to_string(),
            recaptcha_key_input: "#reCAPTCHA_site_key".to_string(),
            recaptcha_action_input: "#action".to_string(),
            recaptcha_response_id: "g-recaptcha-response".to_string(),
            image_captcha: "img.img-thumbnail".to_string(),
            image_captcha_input: "#captcha".to_string(),
            confirmation_marker: "Debe confirmar los datos de la cita asignada".to_string(),
            sms_code_input: "#txtCodigoVerificacion".to_string(),
            consent_checkboxes: vec!["#chkTotal".to_string(), "#enviarCorreo".to_string()],
            confirm_button: "#btnConfirmar".to_string(),
            confirmed_marker: "CITA CONFIRMADA Y GRABADA".to_string(),
        }
    }
}

/// A page marker: a single phrase, or a group of phrases that must all be present.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Marker {
    Phrase(String),
    AllOf(Vec<String>),
}

impl Marker {
    /// Case-insensitive match against an already lowercased haystack.
    pub fn matches(&self, haystack_lower: &str) -> bool {
        match self {
            Marker::Phrase(phrase) => haystack_lower.contains(&phrase.to_lowercase()),
            Marker::AllOf(phrases) => {
                !phrases.is_empty()
                    && phrases
                        .iter()
                        .all(|phrase| haystack_lower.contains(&phrase.to_lowercase()))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutcomeMarkers {
    pub rejected_content: Vec<Marker>,
    pub rate_limited_title: Vec<Marker>,
    pub rate_limited_content: Vec<Marker>,
    pub session_timeout_location: Vec<Marker>,
}

impl Default for OutcomeMarkers {
    fn default() -> Self {
        Self {
            rejected_content: vec![
                Marker::Phrase("request rejected".to_string()),
                Marker::AllOf(vec!["support id".to_string(), "go back".to_string()]),
            ],
            rate_limited_title: vec![Marker::Phrase("429 too many requests".to_string())],
            rate_limited_content: vec![Marker::Phrase("too many requests".to_string())],
            session_timeout_location: vec![Marker::Phrase("infogenerica".to_string())],
        }
    }
}

impl CitaConfig {
    /// File values (defaults without a path) overridden by `lookup`. Callers
    /// layer their own overrides on top and call [`CitaConfig::validate`].
    pub fn from_sources<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => load_cita_config(path)?,
            None => CitaConfig::default(),
        };
        config.apply_env_overrides(lookup)?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = text("NIE") {
            self.identity.applicant_id = value;
        }
        if let Some(value) = text("FULL_NAME") {
            self.identity.full_name = value;
        }
        if let Some(value) = text("PAIS_VALUE") {
            self.identity.country_code = value;
        }
        if let Some(value) = text("PHONE") {
            self.identity.phone = value;
        }
        if let Some(value) = text("EMAIL") {
            self.identity.email = value;
        }
        if let Some(value) = text("PROVINCE") {
            self.workflow.province = value;
        }
        if let Some(value) = text("MAX_RETRIES") {
            self.timing.max_retries = parse_env("MAX_RETRIES", &value)?;
        }
        if let Some(value) = text("WAIT_SECS") {
            self.timing.wait_seconds = parse_env("WAIT_SECS", &value)?;
        }
        if let Some(value) = text("TRANSITION_TIMEOUT") {
            self.timing.transition_timeout_seconds = parse_env("TRANSITION_TIMEOUT", &value)?;
        }
        if let Some(value) = text("DOM_SIG_DELTA") {
            self.timing.dom_signature_delta = parse_env("DOM_SIG_DELTA", &value)?;
        }
        if let Some(value) = text("ANTICAPTCHA_API_KEY") {
            self.captcha.api_key = Some(value);
        }
        if let Some(value) = text("AUTO_CAPTCHA") {
            self.captcha.mode = if value.trim().eq_ignore_ascii_case("true") {
                CaptchaMode::Auto
            } else {
                CaptchaMode::Manual
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let identity = [
            ("identity.applicant_id", &self.identity.applicant_id),
            ("identity.full_name", &self.identity.full_name),
            ("identity.country_code", &self.identity.country_code),
            ("identity.phone", &self.identity.phone),
            ("identity.email", &self.identity.email),
            ("workflow.province", &self.workflow.province),
            ("workflow.start_url", &self.workflow.start_url),
        ];
        for (field, value) in identity {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{field} must not be empty")));
            }
        }
        let start = url::Url::parse(&self.workflow.start_url).map_err(|err| {
            ConfigError::Invalid(format!("workflow.start_url is not a valid URL: {err}"))
        })?;
        if !matches!(start.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "workflow.start_url must be http(s), got {}",
                start.scheme()
            )));
        }
        if self.timing.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "timing.max_retries must be at least 1".to_string(),
            ));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timing.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.timing.dom_signature_delta <= 0 {
            return Err(ConfigError::Invalid(
                "timing.dom_signature_delta must be positive".to_string(),
            ));
        }
        let backoff = &self.backoff;
        if !(backoff.base_seconds > 0.0 && backoff.base_seconds <= backoff.cap_seconds) {
            return Err(ConfigError::Invalid(format!(
                "backoff requires 0 < base_seconds ({}) <= cap_seconds ({})",
                backoff.base_seconds, backoff.cap_seconds
            )));
        }
        let [low, high] = backoff.cooloff_seconds;
        if !(low >= 0.0 && low <= high) {
            return Err(ConfigError::Invalid(format!(
                "backoff.cooloff_seconds must be an ordered non-negative window, got [{low}, {high}]"
            )));
        }
        if self.captcha.mode == CaptchaMode::Auto && self.captcha.usable_api_key().is_none() {
            return Err(ConfigError::Invalid(
                "captcha.mode = \"auto\" requires ANTICAPTCHA_API_KEY (or captcha.api_key); \
                 use manual mode to solve challenges by hand"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads `KEY=value` pairs into the process environment without overriding
/// variables that are already set. Without an explicit path a missing `./.env`
/// is not an error.
pub fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>> {
    match path {
        Some(path) => dotenvy::from_path(path)
            .map(|()| Some(path.to_path_buf()))
            .map_err(|source| ConfigError::EnvFile {
                source,
                path: path.to_path_buf(),
            }),
        None => match dotenvy::dotenv() {
            Ok(found) => Ok(Some(found)),
            Err(err) if err.not_found() => Ok(None),
            Err(source) => Err(ConfigError::EnvFile {
                source,
                path: PathBuf::from(".env"),
            }),
        },
    }
}

pub fn load_cita_config<P: AsRef<Path>>(path: P) -> Result<CitaConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

fn parse_env<T: FromStr>(var: &'static str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    }
}
