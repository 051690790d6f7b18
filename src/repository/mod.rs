use crate::error::Result;
use crate::model::RepoId;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

pub mod github;
pub mod resolver;

pub use github::GithubClient;
pub use resolver::{RepositoryResolution, RepositoryResolver};

/// One upstream release as reported by the source host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag: String,
    pub name: Option<String>,
    pub body: Option<String>,
    pub prerelease: bool,
    pub published_at: Option<Timestamp>,
}

impl Release {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            name: None,
            body: None,
            prerelease: false,
            published_at: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn published(mut self, at: Timestamp) -> Self {
        self.published_at = Some(at);
        self
    }

    /// What makes two release streams the same stream.
    pub fn identity(&self) -> (&str, Option<Timestamp>) {
        (self.tag.as_str(), self.published_at)
    }
}

/// Source-hosting collaborator used for listing releases and diffs.
///
/// Implementations must report quota exhaustion as `UpdateError::RateLimited` and an
/// unknown repository as an empty list.
pub trait ReleaseLister: Send + Sync {
    /// Releases, most recent first.
    fn list_releases(&self, repo: &RepoId) -> Result<Vec<Release>>;

    /// Per-file diff text between two tags.
    fn compare_commits(&self, repo: &RepoId, base_tag: &str, head_tag: &str) -> Result<String>;
}
