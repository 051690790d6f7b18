use jiff::Timestamp;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Release listing rate limited (limit {limit}), resets at {reset_at}")]
    RateLimited { reset_at: Timestamp, limit: u32 },

    #[error("Cannot derive a new version from '{current}' for target '{target}'")]
    PatchSynthesis { current: String, target: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Deployment command failed: {0}")]
    Deployment(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::Http(err.to_string())
    }
}

impl UpdateError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, UpdateError::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
