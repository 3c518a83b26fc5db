mod anticaptcha;
mod gate;

use async_trait::async_trait;
use thiserror::Error;

pub use anticaptcha::AntiCaptchaClient;
pub use gate::{CaptchaGate, ChallengeProbes, GateVerdict};

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha solving unavailable: {0}")]
    Unavailable(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("captcha service error {code}: {description}")]
    Service { code: String, description: String },
    #[error("captcha task {task_id} not ready after {waited_seconds}s")]
    Timeout { task_id: i64, waited_seconds: u64 },
    #[error("malformed captcha payload: {0}")]
    Decode(String),
}

/// A scored interactive challenge as advertised by the page.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChallenge {
    pub website_url: String,
    pub site_key: String,
    pub action: String,
    pub min_score: f64,
}

/// External challenge-solving backend.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Returns the opaque response token to inject into the page.
    async fn solve_scored(&self, challenge: &ScoredChallenge) -> Result<String, CaptchaError>;
    /// Returns the text recognised in the image.
    async fn solve_image(&self, image: &[u8]) -> Result<String, CaptchaError>;
}
