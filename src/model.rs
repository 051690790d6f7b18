use crate::error::{Result, UpdateError};
use crate::version::VersionPattern;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub type StackId = u64;
pub type UnitId = u64;
pub type CandidateId = u64;

/// `owner/name` identity of an upstream source repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim().trim_end_matches('/');
        match raw.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(owner, name.trim_end_matches(".git")))
            }
            _ => Err(UpdateError::InvalidInput(format!(
                "Repository '{raw}' is not in owner/name form"
            ))),
        }
    }

    /// Packaging repositories (`docker-<app>`) are the ones that actually get tagged
    /// for the image.
    pub fn is_packaging_mirror(&self) -> bool {
        self.name.starts_with("docker-")
    }

    pub fn same_as(&self, other: &RepoId) -> bool {
        self.owner.eq_ignore_ascii_case(&other.owner) && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A container image reference split into repository and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
}

impl ImageRef {
    pub fn parse(image: &str) -> Self {
        let without_digest = image.split('@').next().unwrap_or(image).trim();

        match without_digest.rfind(':') {
            // A colon before the last slash is a registry port, not a tag.
            Some(idx) if !without_digest[idx..].contains('/') => Self {
                repository: without_digest[..idx].to_string(),
                tag: Some(without_digest[idx + 1..].to_string()).filter(|t| !t.is_empty()),
            },
            _ => Self {
                repository: without_digest.to_string(),
                tag: None,
            },
        }
    }

    pub fn with_tag(&self, tag: &str) -> String {
        format!("{}:{}", self.repository, tag)
    }
}

/// Where a stack's compose configuration lives. One mode per stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackAddress {
    File(PathBuf),
    Remote(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    pub id: StackId,
    pub name: String,
    #[serde(default)]
    pub address: Option<StackAddress>,
}

impl Stack {
    pub fn file(id: StackId, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            address: Some(StackAddress::File(path.into())),
        }
    }

    pub fn remote(id: StackId, name: impl Into<String>, remote_name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: Some(StackAddress::Remote(remote_name.into())),
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        match &self.address {
            Some(StackAddress::File(path)) => Some(path.as_path()),
            _ => None,
        }
    }

    pub fn is_file_addressed(&self) -> bool {
        self.config_path().is_some()
    }
}

/// One deployed service instance tracked for updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedUnit {
    pub id: UnitId,
    pub name: String,
    pub version: Option<String>,
    pub image: String,
    pub version_pattern: Option<String>,
    pub upstream_pattern: Option<String>,
    pub repo: Option<RepoId>,
    pub override_repo: Option<RepoId>,
    #[serde(default)]
    pub secondary_repos: Vec<RepoId>,
    #[serde(default)]
    pub is_secondary: bool,
    pub stack_id: StackId,
    #[serde(default)]
    pub app: Option<String>,
    pub last_checked: Option<Timestamp>,
    /// Raw inventory text (labels, environment) used to sniff the source repository.
    #[serde(default)]
    pub metadata: String,
}

impl ManagedUnit {
    /// A unit whose version is the image tag and whose shape pattern is derived from it.
    pub fn new(id: UnitId, stack_id: StackId, name: impl Into<String>, image: impl Into<String>) -> Self {
        let image = image.into();
        let version = ImageRef::parse(&image).tag;
        let version_pattern = version
            .as_deref()
            .and_then(|v| VersionPattern::build(v).ok())
            .map(|p| p.as_str().to_string());

        Self {
            id,
            name: name.into(),
            version,
            image,
            version_pattern,
            upstream_pattern: None,
            repo: None,
            override_repo: None,
            secondary_repos: Vec::new(),
            is_secondary: false,
            stack_id,
            app: None,
            last_checked: None,
            metadata: String::new(),
        }
    }

    pub fn with_repo(mut self, repo: RepoId) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn with_override_repo(mut self, repo: RepoId) -> Self {
        self.override_repo = Some(repo);
        self
    }

    pub fn with_secondary_repo(mut self, repo: RepoId) -> Self {
        self.secondary_repos.push(repo);
        self
    }

    pub fn with_upstream_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.upstream_pattern = Some(pattern.into());
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn secondary(mut self) -> Self {
        self.is_secondary = true;
        self
    }

    /// The manual override wins over the discovered repository.
    pub fn effective_repo(&self) -> Option<&RepoId> {
        self.override_repo.as_ref().or(self.repo.as_ref())
    }

    pub fn image_ref(&self) -> ImageRef {
        ImageRef::parse(&self.image)
    }

    pub fn version_pattern(&self) -> Result<Option<VersionPattern>> {
        match (&self.version_pattern, &self.version) {
            (Some(source), _) => VersionPattern::compile(source).map(Some),
            (None, Some(version)) => VersionPattern::build(version).map(Some),
            (None, None) => Ok(None),
        }
    }

    pub fn upstream_pattern(&self) -> Result<Option<VersionPattern>> {
        self.upstream_pattern
            .as_deref()
            .map(VersionPattern::compile)
            .transpose()
    }

    /// Record a newly deployed version and image.
    pub fn commit_version(&mut self, version: &str, image: &str) -> Result<()> {
        self.version = Some(version.to_string());
        self.image = image.to_string();
        self.version_pattern = Some(VersionPattern::build(version)?.as_str().to_string());
        Ok(())
    }
}

/// An upstream release not yet applied to the units it is linked to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateVersion {
    pub id: CandidateId,
    pub version: String,
    pub prerelease: bool,
    pub breaking: bool,
    pub ai_breaking: Option<bool>,
    pub ai_summary: Option<String>,
    pub security_analysis: Option<String>,
    pub suspected_malicious: Option<bool>,
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub notified: bool,
    pub discovered_at: Timestamp,
    pub unit_ids: Vec<UnitId>,
}

impl CandidateVersion {
    /// A fresh candidate; the store assigns the id on insert.
    pub fn new(version: impl Into<String>, unit_ids: Vec<UnitId>) -> Self {
        Self {
            id: 0,
            version: version.into(),
            prerelease: false,
            breaking: false,
            ai_breaking: None,
            ai_summary: None,
            security_analysis: None,
            suspected_malicious: None,
            ignored: false,
            notified: false,
            discovered_at: Timestamp::now(),
            unit_ids,
        }
    }

    pub fn applies_to(&self, unit_id: UnitId) -> bool {
        self.unit_ids.contains(&unit_id)
    }

    /// Breaking either by keyword detection or by the AI verdict.
    pub fn is_breaking(&self) -> bool {
        self.breaking || self.ai_breaking.unwrap_or(false)
    }
}

/// Derived grouping of sibling units inside one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositeApp {
    pub name: String,
    pub stack_id: StackId,
    pub unit_ids: Vec<UnitId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_handles_registry_ports_and_digests() {
        let image = ImageRef::parse("registry.local:5000/team/app:1.2.3");
        assert_eq!(image.repository, "registry.local:5000/team/app");
        assert_eq!(image.tag.as_deref(), Some("1.2.3"));

        let image = ImageRef::parse("registry.local:5000/team/app");
        assert_eq!(image.repository, "registry.local:5000/team/app");
        assert_eq!(image.tag, None);

        let image = ImageRef::parse("adguard/adguardhome:v0.107.69@sha256:abc");
        assert_eq!(image.with_tag("v0.108.0"), "adguard/adguardhome:v0.108.0");
    }

    #[test]
    fn unit_derives_version_from_image() {
        let unit = ManagedUnit::new(1, 1, "adguard", "adguard/adguardhome:v0.107.69");
        assert_eq!(unit.version.as_deref(), Some("v0.107.69"));
        let pattern = unit.version_pattern().unwrap().unwrap();
        assert!(pattern.matches("v0.107.69"));
    }

    #[test]
    fn override_repo_wins() {
        let unit = ManagedUnit::new(1, 1, "app", "owner/app:1.0")
            .with_repo(RepoId::new("owner", "app"))
            .with_override_repo(RepoId::new("other", "app"));
        assert_eq!(unit.effective_repo().unwrap().owner, "other");
    }

    #[test]
    fn repo_id_parsing() {
        let repo = RepoId::parse("linuxserver/docker-sonarr.git").unwrap();
        assert_eq!(repo.name, "docker-sonarr");
        assert!(repo.is_packaging_mirror());
        assert!(RepoId::parse("justaname").is_err());
    }
}
