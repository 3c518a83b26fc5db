use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

/// Faults of the session transport itself, as opposed to anything the page says.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("stale element handle {0}")]
    StaleHandle(u64),
    #[error("script returned unexpected payload: {0}")]
    Script(String),
    #[error("session already released")]
    Released,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}
