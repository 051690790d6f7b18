use crate::config::AiSettings;
use crate::error::{Result, UpdateError};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CASE_INSENSITIVE_MARKERS: [&str; 5] = [
    "breaking",
    "critical",
    "review before",
    "before upgrad",
    "important",
];
const CASE_SENSITIVE_MARKER: &str = "Warning";

const SUMMARY_PROMPT: &str = "You summarise release notes for self-hosters. Reply with JSON \
{\"summary\": string, \"breaking\": bool}. Mark breaking when the release requires manual \
action, config changes or data migration.";
const DIFF_PROMPT: &str = "You review source diffs between two releases for supply-chain \
attacks. Reply with JSON {\"analysis\": string, \"suspected_malicious\": bool}. Flag \
obfuscated code, credential exfiltration, unexpected network calls or install hooks.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    pub breaking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffVerdict {
    pub analysis: String,
    pub suspected_malicious: bool,
}

/// AI collaborator. Inputs arrive pre-chunked.
pub trait AiBackend: Send + Sync {
    fn is_ready(&self) -> bool;
    fn summarize(&self, text: &str) -> Result<Summary>;
    fn analyze_diff(&self, text: &str) -> Result<DiffVerdict>;
}

/// Backend used when no model is configured.
pub struct DisabledAi;

impl AiBackend for DisabledAi {
    fn is_ready(&self) -> bool {
        false
    }

    fn summarize(&self, _text: &str) -> Result<Summary> {
        Err(UpdateError::Analysis("AI backend is not configured".into()))
    }

    fn analyze_diff(&self, _text: &str) -> Result<DiffVerdict> {
        Err(UpdateError::Analysis("AI backend is not configured".into()))
    }
}

/// Client for any OpenAI-compatible `chat/completions` endpoint.
pub struct OpenAiBackend {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiBackend {
    pub fn from_settings(settings: &AiSettings) -> Result<Option<Self>> {
        let (Some(base_url), Some(model)) = (&settings.base_url, &settings.model) else {
            return Ok(None);
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Some(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.clone(),
            api_key: settings.api_key.clone(),
        }))
    }

    fn complete<T: DeserializeOwned>(&self, system: &str, user: &str) -> Result<T> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(UpdateError::Analysis(format!(
                "AI endpoint returned HTTP {}",
                response.status()
            )));
        }

        let completion: ChatCompletion = response.json()?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| UpdateError::Analysis("AI response had no choices".into()))?;

        parse_json_reply(&content)
    }
}

impl AiBackend for OpenAiBackend {
    fn is_ready(&self) -> bool {
        true
    }

    fn summarize(&self, text: &str) -> Result<Summary> {
        self.complete(SUMMARY_PROMPT, text)
    }

    fn analyze_diff(&self, text: &str) -> Result<DiffVerdict> {
        self.complete(DIFF_PROMPT, text)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Models like to wrap JSON in prose or code fences; take the outermost object.
fn parse_json_reply<T: DeserializeOwned>(content: &str) -> Result<T> {
    let start = content.find('{');
    let end = content.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(serde_json::from_str(&content[start..=end])?),
        _ => Err(UpdateError::Analysis(format!(
            "AI reply is not JSON: {}",
            content.chars().take(80).collect::<String>()
        ))),
    }
}

/// Local keyword check for release notes that ask for attention before upgrading.
pub fn is_locally_breaking(body: &str) -> bool {
    let lower = body.to_lowercase();
    CASE_INSENSITIVE_MARKERS.iter().any(|m| lower.contains(m)) || body.contains(CASE_SENSITIVE_MARKER)
}

/// Split `text` into pieces of at most `max_chars` characters, on line boundaries
/// where possible.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();

        if current_len + line_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        current.push_str(line);
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Run `f` up to `attempts` times without backoff; `None` once the ceiling is hit.
pub fn with_retries<T>(label: &str, attempts: u32, mut f: impl FnMut() -> Result<T>) -> Option<T> {
    for attempt in 1..=attempts.max(1) {
        match f() {
            Ok(value) => return Some(value),
            Err(err) => {
                warn!(label, attempt, attempts, error = %err, "analysis attempt failed");
            }
        }
    }
    None
}

/// Chunking and bounded-retry policy around an [`AiBackend`].
pub struct ReleaseAnalyzer {
    backend: Arc<dyn AiBackend>,
    max_attempts: u32,
    chunk_chars: usize,
}

impl ReleaseAnalyzer {
    pub fn new(backend: Arc<dyn AiBackend>, max_attempts: u32, chunk_chars: usize) -> Self {
        Self {
            backend,
            max_attempts,
            chunk_chars,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_ready()
    }

    /// Summarise release notes chunk by chunk. Any chunk exhausting its retries
    /// drops the whole summary.
    pub fn summarize(&self, notes: &str) -> Option<Summary> {
        let chunks = chunk_text(notes, self.chunk_chars);
        if chunks.is_empty() {
            return None;
        }

        let mut parts = Vec::with_capacity(chunks.len());
        let mut breaking = false;
        for chunk in &chunks {
            let summary = with_retries("summarize", self.max_attempts, || self.backend.summarize(chunk))?;
            breaking |= summary.breaking;
            parts.push(summary.summary);
        }

        debug!(chunks = chunks.len(), breaking, "release notes summarised");
        Some(Summary {
            summary: parts.join("\n"),
            breaking,
        })
    }

    /// Classify a diff; a single suspicious chunk flags the whole diff.
    pub fn analyze_diff(&self, diff: &str) -> Option<DiffVerdict> {
        let chunks = chunk_text(diff, self.chunk_chars);
        if chunks.is_empty() {
            return None;
        }

        let mut parts = Vec::with_capacity(chunks.len());
        let mut suspected = false;
        for chunk in &chunks {
            let verdict = with_retries("analyze_diff", self.max_attempts, || {
                self.backend.analyze_diff(chunk)
            })?;
            suspected |= verdict.suspected_malicious;
            parts.push(verdict.analysis);
        }

        Some(DiffVerdict {
            analysis: parts.join("\n"),
            suspected_malicious: suspected,
        })
    }
}
