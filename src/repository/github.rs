use crate::error::{Result, UpdateError};
use crate::model::RepoId;
use crate::repository::{Release, ReleaseLister};
use jiff::Timestamp;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 3;
const MAX_DIFF_BYTES: usize = 5 * 1024 * 1024;

/// GitHub REST client for release listings and tag comparisons.
pub struct GithubClient {
    client: Client,
    api_url: Url,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let api_url = Self::validate_api_url(api_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("stackbump/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url,
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn validate_api_url(raw: &str) -> Result<Url> {
        let parsed = Url::parse(raw)
            .map_err(|_| UpdateError::Config(format!("Invalid GitHub API URL: {raw}")))?;

        match parsed.scheme() {
            "https" | "http" => Ok(parsed),
            scheme => Err(UpdateError::Config(format!(
                "Unsupported GitHub API scheme: {scheme}"
            ))),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| UpdateError::Config(format!("GitHub API URL cannot be a base: {}", self.api_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn get(&self, url: Url) -> Result<Response> {
        debug!(%url, "github request");
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(request.send()?)
    }

    /// Quota exhaustion is reported as 403 or 429 with `x-ratelimit-remaining: 0`.
    fn rate_limit(status: StatusCode, headers: &HeaderMap) -> Option<UpdateError> {
        if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
            return None;
        }

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let remaining = header("x-ratelimit-remaining");
        if status == StatusCode::FORBIDDEN && remaining.as_deref() != Some("0") {
            return None;
        }

        let reset_at = header("x-ratelimit-reset")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Timestamp::from_second(secs).ok())
            .or_else(|| {
                header("retry-after")
                    .and_then(|v| v.parse::<i64>().ok())
                    .and_then(|secs| Timestamp::now().checked_add(jiff::SignedDuration::from_secs(secs)).ok())
            })
            .unwrap_or_else(Timestamp::now);
        let limit = header("x-ratelimit-limit")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);

        Some(UpdateError::RateLimited { reset_at, limit })
    }

    fn check(response: Response, what: &str) -> Result<Option<Response>> {
        let status = response.status();
        if let Some(err) = Self::rate_limit(status, response.headers()) {
            return Err(err);
        }
        if status == StatusCode::NOT_FOUND {
            debug!(what, "not found");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(UpdateError::Http(format!("{what}: HTTP {status}")));
        }
        Ok(Some(response))
    }
}

impl ReleaseLister for GithubClient {
    fn list_releases(&self, repo: &RepoId) -> Result<Vec<Release>> {
        let mut releases = Vec::new();

        for page in 1..=MAX_PAGES {
            let mut url = self.endpoint(&["repos", &repo.owner, &repo.name, "releases"])?;
            url.query_pairs_mut()
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());

            let Some(response) = Self::check(self.get(url)?, &format!("releases of {repo}"))? else {
                break;
            };
            let batch: Vec<GithubRelease> = response.json()?;
            let last_page = batch.len() < PAGE_SIZE;
            releases.extend(batch.into_iter().filter(|r| !r.draft).map(Release::from));

            if last_page {
                break;
            }
        }

        debug!(%repo, count = releases.len(), "listed releases");
        Ok(releases)
    }

    fn compare_commits(&self, repo: &RepoId, base_tag: &str, head_tag: &str) -> Result<String> {
        let range = format!("{base_tag}...{head_tag}");
        let url = self.endpoint(&["repos", &repo.owner, &repo.name, "compare", &range])?;

        let Some(response) = Self::check(self.get(url)?, &format!("compare {repo} {range}"))? else {
            return Ok(String::new());
        };
        let comparison: GithubComparison = response.json()?;

        let mut diff = String::new();
        for file in comparison.files {
            let Some(patch) = file.patch else { continue };
            if diff.len() + patch.len() > MAX_DIFF_BYTES {
                debug!(%repo, %range, "diff truncated");
                break;
            }
            diff.push_str(&format!("--- {}\n{}\n", file.filename, patch));
        }

        Ok(diff)
    }
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    name: Option<String>,
    body: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    published_at: Option<Timestamp>,
}

impl From<GithubRelease> for Release {
    fn from(release: GithubRelease) -> Self {
        Release {
            tag: release.tag_name,
            name: release.name.filter(|n| !n.trim().is_empty()),
            body: release.body,
            prerelease: release.prerelease,
            published_at: release.published_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GithubComparison {
    #[serde(default)]
    files: Vec<GithubFile>,
}

#[derive(Debug, Deserialize)]
struct GithubFile {
    filename: String,
    patch: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn rejects_invalid_scheme() {
        let err = GithubClient::validate_api_url("ftp://example.com").unwrap_err();
        assert!(matches!(err, UpdateError::Config(_)));
    }

    #[test]
    fn builds_release_endpoint() {
        let client = GithubClient::new(DEFAULT_API_URL, None).unwrap();
        let url = client
            .endpoint(&["repos", "immich-app", "immich", "releases"])
            .unwrap();
        assert_eq!(url.as_str(), "https://api.github.com/repos/immich-app/immich/releases");
    }

    #[test]
    fn detects_exhausted_quota() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000"));
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("60"));

        let err = GithubClient::rate_limit(StatusCode::FORBIDDEN, &headers).unwrap();
        match err {
            UpdateError::RateLimited { reset_at, limit } => {
                assert_eq!(limit, 60);
                assert_eq!(reset_at.as_second(), 1_700_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn plain_forbidden_is_not_rate_limited() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("42"));
        assert!(GithubClient::rate_limit(StatusCode::FORBIDDEN, &headers).is_none());
        assert!(GithubClient::rate_limit(StatusCode::OK, &HeaderMap::new()).is_none());
    }

    #[test]
    fn release_json_maps_to_release() {
        let json = r#"{"tag_name":"v2.3.0","name":"","body":"notes","prerelease":false,"draft":false,"published_at":"2025-01-02T03:04:05Z"}"#;
        let release: Release = serde_json::from_str::<GithubRelease>(json).unwrap().into();
        assert_eq!(release.tag, "v2.3.0");
        assert_eq!(release.name, None);
        assert!(release.published_at.is_some());
    }
}
