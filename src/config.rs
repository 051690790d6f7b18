use crate::error::{Result, UpdateError};
use crate::repository::github::DEFAULT_API_URL;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_GITHUB_TOKEN: &str = "STACKBUMP_GITHUB_TOKEN";
const ENV_AI_API_KEY: &str = "STACKBUMP_AI_API_KEY";

/// Settings read from `stackbump.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub state_path: PathBuf,
    pub github: GithubSettings,
    pub ai: AiSettings,
    pub scan: ScanSettings,
    pub sweep: SweepSettings,
    pub notify: NotifySettings,
    pub compose: ComposeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("stackbump-state.json"),
            github: GithubSettings::default(),
            ai: AiSettings::default(),
            scan: ScanSettings::default(),
            sweep: SweepSettings::default(),
            notify: NotifySettings::default(),
            compose: ComposeSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GithubSettings {
    pub api_url: String,
    pub token: Option<String>,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Attempts per AI request before the result is dropped.
    pub max_attempts: u32,
    /// Largest piece of text sent in one request.
    pub chunk_chars: usize,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            model: None,
            api_key: None,
            max_attempts: 3,
            chunk_chars: 12_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub security: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self { security: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    pub interval_secs: u64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 60 * 60,
        }
    }
}

impl SweepSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(60))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComposeSettings {
    pub program: String,
}

impl Default for ComposeSettings {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `path`. A missing file yields defaults; environment
    /// variables override secrets either way.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                UpdateError::Config(format!("Failed to read '{}': {e}", path.display()))
            })?;
            Self::parse(&content)?
        } else {
            Self::default()
        };

        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) {
        if let Ok(token) = env::var(ENV_GITHUB_TOKEN) {
            self.github.token = Some(token);
        }
        if let Ok(key) = env::var(ENV_AI_API_KEY) {
            self.ai.api_key = Some(key);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ai.max_attempts == 0 {
            return Err(UpdateError::Config("ai.max_attempts must be at least 1".into()));
        }
        if self.ai.chunk_chars < 256 {
            return Err(UpdateError::Config("ai.chunk_chars must be at least 256".into()));
        }
        if self.compose.program.trim().is_empty() {
            return Err(UpdateError::Config("compose.program must not be empty".into()));
        }
        Ok(())
    }
}
