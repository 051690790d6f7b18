use crate::error::Result;
use crate::model::{ImageRef, ManagedUnit, RepoId};
use crate::repository::ReleaseLister;
use jiff::Timestamp;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};
use url::Url;

static URL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>,;)\]]+"#).expect("valid url regex"));
static SSH_REMOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"git@github\.com:([A-Za-z0-9][A-Za-z0-9-]*)/([A-Za-z0-9_.-]+)")
        .expect("valid ssh remote regex")
});

const LINUXSERVER: &str = "linuxserver";

/// Outcome of repository discovery for one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryResolution {
    pub primary: Option<RepoId>,
    pub secondary: Option<RepoId>,
}

/// Newest release tag and publish time; equal heads mean an identical release stream.
pub type ReleaseHead = (String, Option<Timestamp>);

struct Attached {
    repo: RepoId,
    head: ReleaseHead,
}

/// Discovers the upstream repository that publishes the releases of an image.
pub struct RepositoryResolver {
    lister: Arc<dyn ReleaseLister>,
}

impl RepositoryResolver {
    pub fn new(lister: Arc<dyn ReleaseLister>) -> Self {
        Self { lister }
    }

    /// Ordered, de-duplicated repository candidates sniffed from free-text container
    /// metadata and the image reference.
    ///
    /// Links found in the text come first, then names derived from the image. Every
    /// candidate also contributes its `docker-` packaging counterpart, after all
    /// direct candidates.
    pub fn resolve(raw_text: &str, image: Option<&str>) -> Vec<RepoId> {
        let mut direct = Self::repos_in_text(raw_text);
        if let Some(image) = image {
            direct.extend(Self::repos_from_image(image));
        }

        let counterparts: Vec<RepoId> = direct.iter().map(Self::counterpart).collect();

        let mut ordered: Vec<RepoId> = Vec::new();
        for repo in direct.into_iter().chain(counterparts) {
            if !ordered.iter().any(|seen| seen.same_as(&repo)) {
                ordered.push(repo);
            }
        }
        ordered
    }

    fn repos_in_text(raw_text: &str) -> Vec<RepoId> {
        let mut repos = Vec::new();

        for token in URL_TOKEN.find_iter(raw_text) {
            let Ok(url) = Url::parse(token.as_str()) else {
                continue;
            };
            let is_github = url
                .host_str()
                .is_some_and(|h| h.eq_ignore_ascii_case("github.com") || h.eq_ignore_ascii_case("www.github.com"));
            if !is_github {
                continue;
            }
            let mut segments = url.path_segments().into_iter().flatten().filter(|s| !s.is_empty());
            if let (Some(owner), Some(name)) = (segments.next(), segments.next()) {
                repos.push(RepoId::new(owner, name.trim_end_matches(".git")));
            }
        }

        for caps in SSH_REMOTE.captures_iter(raw_text) {
            repos.push(RepoId::new(&caps[1], caps[2].trim_end_matches(".git")));
        }

        repos
    }

    fn repos_from_image(image: &str) -> Vec<RepoId> {
        let repository = ImageRef::parse(image).repository;
        let mut parts: Vec<&str> = repository.split('/').collect();

        let registry = match parts.first() {
            Some(first) if parts.len() > 1 && (first.contains('.') || first.contains(':') || *first == "localhost") => {
                Some(parts.remove(0).to_ascii_lowercase())
            }
            _ => None,
        };

        let (owner, name) = match parts.as_slice() {
            [name] => (*name, *name),
            ["library", name] => (*name, *name),
            [owner, name, ..] => (*owner, *name),
            [] => return Vec::new(),
        };

        if owner.eq_ignore_ascii_case(LINUXSERVER) || registry.as_deref() == Some("lscr.io") {
            return vec![RepoId::new(LINUXSERVER, format!("docker-{name}"))];
        }

        vec![RepoId::new(owner, name)]
    }

    fn counterpart(repo: &RepoId) -> RepoId {
        match repo.name.strip_prefix("docker-") {
            Some(bare) => RepoId::new(&repo.owner, bare),
            None => RepoId::new(&repo.owner, format!("docker-{}", repo.name)),
        }
    }

    /// Succeeds iff the repository has at least one release, yielding the newest
    /// one's identity.
    pub fn try_attach(&self, candidate: &RepoId) -> Result<Option<ReleaseHead>> {
        let releases = self.lister.list_releases(candidate)?;
        Ok(releases.first().map(|head| {
            let (tag, published_at) = head.identity();
            (tag.to_string(), published_at)
        }))
    }

    /// Walk the candidates in order until a primary and one distinct secondary have
    /// been found.
    ///
    /// Candidates exposing the same release stream collapse into one; the packaging
    /// mirror (`docker-` prefix) is kept as the canonical name since it is the one
    /// actually tagged for the image.
    pub fn attach(&self, candidates: &[RepoId]) -> Result<RepositoryResolution> {
        let mut attached: Vec<Attached> = Vec::new();

        for candidate in candidates {
            let Some(head) = self.try_attach(candidate)? else {
                debug!(repo = %candidate, "no releases");
                continue;
            };

            if let Some(existing) = attached.iter_mut().find(|a| a.head == head) {
                if candidate.is_packaging_mirror() && !existing.repo.is_packaging_mirror() {
                    debug!(mirror = %candidate, upstream = %existing.repo, "identical release stream, preferring mirror");
                    existing.repo = candidate.clone();
                }
                continue;
            }

            attached.push(Attached {
                repo: candidate.clone(),
                head,
            });
            if attached.len() == 2 {
                break;
            }
        }

        let mut found = attached.into_iter().map(|a| a.repo);
        Ok(RepositoryResolution {
            primary: found.next(),
            secondary: found.next(),
        })
    }

    /// Discover and record the repositories of `unit`. Units with a manual override
    /// are left untouched. Returns whether a primary repository is known afterwards.
    pub fn resolve_unit(&self, unit: &mut ManagedUnit) -> Result<bool> {
        if unit.override_repo.is_some() {
            return Ok(true);
        }

        let candidates = Self::resolve(&unit.metadata, Some(&unit.image));
        let resolution = self.attach(&candidates)?;

        match resolution.primary {
            Some(primary) => {
                info!(unit = %unit.name, repo = %primary, "attached repository");
                if let Some(secondary) = resolution.secondary {
                    if !unit.secondary_repos.iter().any(|r| r.same_as(&secondary)) {
                        unit.secondary_repos.push(secondary);
                    }
                }
                unit.repo = Some(primary);
                Ok(true)
            }
            None => {
                debug!(unit = %unit.name, tried = candidates.len(), "no repository found");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Release;
    use crate::error::UpdateError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLister {
        releases: HashMap<String, Vec<Release>>,
        calls: Mutex<Vec<String>>,
        rate_limited: bool,
    }

    impl FakeLister {
        fn with(mut self, repo: &str, releases: Vec<Release>) -> Self {
            self.releases.insert(repo.to_string(), releases);
            self
        }
    }

    impl ReleaseLister for FakeLister {
        fn list_releases(&self, repo: &RepoId) -> Result<Vec<Release>> {
            self.calls.lock().unwrap().push(repo.to_string());
            if self.rate_limited {
                return Err(UpdateError::RateLimited {
                    reset_at: Timestamp::UNIX_EPOCH,
                    limit: 60,
                });
            }
            Ok(self.releases.get(&repo.to_string()).cloned().unwrap_or_default())
        }

        fn compare_commits(&self, _: &RepoId, _: &str, _: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn stream(tag: &str) -> Vec<Release> {
        vec![Release::new(tag).published(Timestamp::from_second(1_700_000_000).unwrap())]
    }

    #[test]
    fn sniffs_labels_before_image_names() {
        let raw = "org.opencontainers.image.source=https://github.com/AdguardTeam/AdGuardHome\nother=x";
        let candidates = RepositoryResolver::resolve(raw, Some("adguard/adguardhome:v0.107.69"));
        assert_eq!(candidates[0], RepoId::new("AdguardTeam", "AdGuardHome"));
        assert_eq!(candidates[1], RepoId::new("adguard", "adguardhome"));
        assert!(candidates.contains(&RepoId::new("AdguardTeam", "docker-AdGuardHome")));
    }

    #[test]
    fn linuxserver_images_map_to_packaging_repo() {
        let candidates = RepositoryResolver::resolve("", Some("lscr.io/linuxserver/sonarr:4.0.0"));
        assert_eq!(
            candidates,
            vec![
                RepoId::new("linuxserver", "docker-sonarr"),
                RepoId::new("linuxserver", "sonarr"),
            ]
        );
    }

    #[test]
    fn ghcr_images_use_owner_and_name() {
        let candidates =
            RepositoryResolver::resolve("", Some("ghcr.io/immich-app/immich-server:v2.2.3"));
        assert_eq!(candidates[0], RepoId::new("immich-app", "immich-server"));
    }

    #[test]
    fn identical_streams_collapse_to_mirror() {
        let lister = FakeLister::default()
            .with("linuxserver/sonarr", stream("4.0.1.929-ls220"))
            .with("linuxserver/docker-sonarr", stream("4.0.1.929-ls220"));
        let resolver = RepositoryResolver::new(Arc::new(lister));

        let resolution = resolver
            .attach(&[
                RepoId::new("linuxserver", "sonarr"),
                RepoId::new("linuxserver", "docker-sonarr"),
            ])
            .unwrap();

        assert_eq!(resolution.primary, Some(RepoId::new("linuxserver", "docker-sonarr")));
        assert_eq!(resolution.secondary, None);
    }

    #[test]
    fn distinct_second_success_becomes_secondary() {
        let lister = FakeLister::default()
            .with("linuxserver/docker-sonarr", stream("4.0.1.929-ls220"))
            .with("Sonarr/Sonarr", stream("v4.0.1.929"))
            .with("other/unused", stream("v9"));
        let lister = Arc::new(lister);
        let resolver = RepositoryResolver::new(lister.clone());

        let resolution = resolver
            .attach(&[
                RepoId::new("nobody", "missing"),
                RepoId::new("linuxserver", "docker-sonarr"),
                RepoId::new("Sonarr", "Sonarr"),
                RepoId::new("other", "unused"),
            ])
            .unwrap();

        assert_eq!(resolution.primary, Some(RepoId::new("linuxserver", "docker-sonarr")));
        assert_eq!(resolution.secondary, Some(RepoId::new("Sonarr", "Sonarr")));
        assert!(!lister.calls.lock().unwrap().contains(&"other/unused".to_string()));
    }

    #[test]
    fn rate_limit_propagates() {
        let lister = FakeLister {
            rate_limited: true,
            ..FakeLister::default()
        };
        let resolver = RepositoryResolver::new(Arc::new(lister));
        let err = resolver.try_attach(&RepoId::new("a", "b")).unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn try_attach_needs_a_release() {
        let lister = FakeLister::default().with("AdguardTeam/AdGuardHome", stream("v0.107.69"));
        let resolver = RepositoryResolver::new(Arc::new(lister));
        let (tag, published_at) = resolver
            .try_attach(&RepoId::new("AdguardTeam", "AdGuardHome"))
            .unwrap()
            .unwrap();
        assert_eq!(tag, "v0.107.69");
        assert!(published_at.is_some());
        assert!(resolver.try_attach(&RepoId::new("adguard", "adguardhome")).unwrap().is_none());
    }

    #[test]
    fn resolve_unit_keeps_override() {
        let resolver = RepositoryResolver::new(Arc::new(FakeLister::default()));
        let mut unit = ManagedUnit::new(1, 1, "app", "owner/app:1.0")
            .with_override_repo(RepoId::new("manual", "app"));
        assert!(resolver.resolve_unit(&mut unit).unwrap());
        assert_eq!(unit.repo, None);
    }
}
