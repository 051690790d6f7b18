use crate::agents::analysis::{ReleaseAnalyzer, is_locally_breaking};
use crate::error::Result;
use crate::model::{CandidateVersion, ManagedUnit, RepoId, UnitId};
use crate::repository::{Release, ReleaseLister};
use crate::store::Store;
use crate::version::{Version, VersionComparator, VersionPattern};
use jiff::Timestamp;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A newer release on its way to becoming a persisted candidate.
struct Pending<'a> {
    release: &'a Release,
    version: String,
    notes: String,
}

/// Finds, classifies and stores upstream releases newer than a unit's version.
pub struct VersionResolver {
    lister: Arc<dyn ReleaseLister>,
    store: Arc<dyn Store>,
    analyzer: ReleaseAnalyzer,
    security_scan: bool,
}

impl VersionResolver {
    pub fn new(
        lister: Arc<dyn ReleaseLister>,
        store: Arc<dyn Store>,
        analyzer: ReleaseAnalyzer,
        security_scan: bool,
    ) -> Self {
        Self {
            lister,
            store,
            analyzer,
            security_scan,
        }
    }

    /// Resolve new candidates for `unit` and every sibling sharing its current
    /// version, with a single release listing.
    ///
    /// A rate-limited listing is returned as an error untouched; nothing is retried.
    pub fn get_newer_versions(
        &self,
        unit: &ManagedUnit,
        siblings: &[ManagedUnit],
    ) -> Result<Vec<CandidateVersion>> {
        let group: Vec<UnitId> = std::iter::once(unit.id)
            .chain(
                siblings
                    .iter()
                    .filter(|s| s.id != unit.id && s.version == unit.version)
                    .map(|s| s.id),
            )
            .collect();

        let (Some(repo), Some(current)) = (unit.effective_repo().cloned(), unit.version.clone()) else {
            debug!(unit = %unit.name, "no repository or version, skipping");
            return Ok(Vec::new());
        };

        let releases = self.lister.list_releases(&repo)?;

        let pattern = match unit.upstream_pattern()? {
            Some(pattern) => pattern,
            None => match derive_upstream_pattern(&releases, &current)? {
                Some(pattern) => pattern,
                None => {
                    self.stamp_group(&group, None)?;
                    return Ok(Vec::new());
                }
            },
        };

        let known: HashSet<String> = self
            .store
            .candidates_for(unit.id)?
            .into_iter()
            .map(|c| c.version)
            .collect();

        let mut pending: Vec<Pending<'_>> = releases
            .iter()
            .filter_map(|release| {
                let version = release_version(release, &pattern)?;
                if !VersionComparator::is_newer(version, &current) || known.contains(version) {
                    return None;
                }
                Some(Pending {
                    release,
                    version: version.to_string(),
                    notes: release.body.clone().unwrap_or_default(),
                })
            })
            .collect();
        pending.sort_by(|a, b| VersionComparator::compare(&a.version, &b.version).unwrap_or(Ordering::Equal));

        for secondary in unit.secondary_repos.iter().filter(|r| !r.same_as(&repo)) {
            self.merge_secondary_notes(secondary, &current, &mut pending)?;
        }

        let base_tag = releases
            .iter()
            .find(|r| VersionComparator::same_version(&r.tag, &current))
            .map(|r| r.tag.clone());

        let mut candidates = Vec::with_capacity(pending.len());
        for item in &pending {
            candidates.push(self.classify(&repo, base_tag.as_deref(), item, &group)?);
        }

        let stored = self.store.insert_candidates(candidates)?;
        self.stamp_group(&group, Some(pattern.as_str()))?;

        if !stored.is_empty() {
            info!(
                unit = %unit.name,
                repo = %repo,
                count = stored.len(),
                newest = stored.last().map(|c| c.version.as_str()).unwrap_or_default(),
                "new versions found"
            );
        }
        Ok(stored)
    }

    /// Attach release notes from a secondary repository to the new candidates.
    ///
    /// A secondary release is eligible only when it is newer than the secondary
    /// version embedded in the unit's current version; it goes to the lowest
    /// candidate whose embedded secondary version is at or above it, so later
    /// secondary releases never end up in an earlier candidate's notes.
    fn merge_secondary_notes(
        &self,
        secondary: &RepoId,
        current: &str,
        pending: &mut [Pending<'_>],
    ) -> Result<()> {
        let releases = self.lister.list_releases(secondary)?;
        let Some(latest) = releases.first() else {
            return Ok(());
        };

        let line = VersionPattern::build(latest.tag.strip_prefix('v').unwrap_or(&latest.tag))?;
        let embedded = |text: &str| line.find(text).map(|m| m.as_str().to_string());
        let baseline = embedded(current);

        for release in releases.iter().rev() {
            if let Some(baseline) = &baseline {
                if !VersionComparator::is_newer(&release.tag, baseline) {
                    continue;
                }
            }

            let target = pending.iter_mut().find(|p| {
                embedded(&p.version).is_some_and(|e| {
                    matches!(
                        VersionComparator::compare(&release.tag, &e),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                })
            });

            if let (Some(target), Some(body)) = (target, release.body.as_deref()) {
                debug!(secondary = %secondary, tag = %release.tag, candidate = %target.version, "merged secondary notes");
                target
                    .notes
                    .push_str(&format!("\n\n## {secondary} {}\n{body}", release.tag));
            }
        }

        Ok(())
    }

    fn classify(
        &self,
        repo: &RepoId,
        base_tag: Option<&str>,
        item: &Pending<'_>,
        group: &[UnitId],
    ) -> Result<CandidateVersion> {
        let mut candidate = CandidateVersion::new(&item.version, group.to_vec());
        candidate.prerelease = item.release.prerelease || Version::parse(&item.version).looks_prerelease();
        candidate.breaking = is_locally_breaking(&item.notes);

        if !self.security_scan || !self.analyzer.is_ready() {
            return Ok(candidate);
        }

        if let Some(base) = base_tag {
            match self.lister.compare_commits(repo, base, &item.release.tag) {
                Ok(diff) if !diff.trim().is_empty() => {
                    if let Some(verdict) = self.analyzer.analyze_diff(&diff) {
                        if verdict.suspected_malicious {
                            warn!(repo = %repo, version = %item.version, "release flagged as suspicious");
                        }
                        candidate.security_analysis = Some(verdict.analysis);
                        candidate.suspected_malicious = Some(verdict.suspected_malicious);
                    }
                }
                Ok(_) => {}
                Err(err) if err.is_rate_limited() => return Err(err),
                Err(err) => warn!(repo = %repo, version = %item.version, error = %err, "diff unavailable"),
            }
        }

        if let Some(summary) = self.analyzer.summarize(&item.notes) {
            candidate.ai_summary = Some(summary.summary);
            candidate.ai_breaking = Some(summary.breaking);
        }

        Ok(candidate)
    }

    fn stamp_group(&self, group: &[UnitId], upstream_pattern: Option<&str>) -> Result<()> {
        let now = Timestamp::now();
        for id in group {
            let Some(mut unit) = self.store.unit(*id)? else {
                continue;
            };
            unit.last_checked = Some(now);
            if unit.upstream_pattern.is_none() {
                unit.upstream_pattern = upstream_pattern.map(str::to_string);
            }
            self.store.save_unit(&unit)?;
        }
        Ok(())
    }
}

/// The upstream tag convention: taken from the release matching the current
/// version, otherwise from the most recent stable release.
pub fn derive_upstream_pattern(releases: &[Release], current: &str) -> Result<Option<VersionPattern>> {
    let source = releases
        .iter()
        .find(|r| VersionComparator::same_version(&r.tag, current))
        .or_else(|| {
            releases
                .iter()
                .find(|r| !r.prerelease && !Version::parse(&r.tag).looks_prerelease())
        })
        .or_else(|| releases.first());

    source.map(|r| VersionPattern::build(&r.tag)).transpose()
}

/// Version string a release contributes under `pattern`: its tag, else its display
/// name.
fn release_version<'r>(release: &'r Release, pattern: &VersionPattern) -> Option<&'r str> {
    if pattern.matches(&release.tag) {
        return Some(&release.tag);
    }
    release.name.as_deref().filter(|name| pattern.matches(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::analysis::{AiBackend, DiffVerdict, DisabledAi, Summary};
    use crate::error::UpdateError;
    use crate::model::Stack;
    use crate::store::StateStore;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeLister {
        releases: HashMap<String, Vec<Release>>,
        diff: String,
        rate_limited: bool,
    }

    impl ReleaseLister for FakeLister {
        fn list_releases(&self, repo: &RepoId) -> Result<Vec<Release>> {
            if self.rate_limited {
                return Err(UpdateError::RateLimited {
                    reset_at: Timestamp::UNIX_EPOCH,
                    limit: 5000,
                });
            }
            Ok(self.releases.get(&repo.to_string()).cloned().unwrap_or_default())
        }

        fn compare_commits(&self, _: &RepoId, _: &str, _: &str) -> Result<String> {
            Ok(self.diff.clone())
        }
    }

    struct EchoAi;

    impl AiBackend for EchoAi {
        fn is_ready(&self) -> bool {
            true
        }

        fn summarize(&self, text: &str) -> Result<Summary> {
            Ok(Summary {
                summary: format!("summary of {} chars", text.len()),
                breaking: false,
            })
        }

        fn analyze_diff(&self, text: &str) -> Result<DiffVerdict> {
            Ok(DiffVerdict {
                analysis: "reviewed".into(),
                suspected_malicious: text.contains("eval("),
            })
        }
    }

    struct BrokenAi;

    impl AiBackend for BrokenAi {
        fn is_ready(&self) -> bool {
            true
        }

        fn summarize(&self, _text: &str) -> Result<Summary> {
            Err(UpdateError::Analysis("model unavailable".into()))
        }

        fn analyze_diff(&self, _text: &str) -> Result<DiffVerdict> {
            Err(UpdateError::Analysis("model unavailable".into()))
        }
    }

    /// Newest first, like the source host.
    fn releases(tags: &[(&str, &str)]) -> Vec<Release> {
        tags.iter()
            .map(|(tag, body)| Release::new(*tag).with_body(*body))
            .collect()
    }

    fn setup(lister: FakeLister, ai: Arc<dyn AiBackend>, units: Vec<ManagedUnit>) -> (Arc<StateStore>, VersionResolver) {
        let store = Arc::new(StateStore::in_memory());
        store
            .import(vec![Stack::file(1, "s", "/srv/s/compose.yml")], units)
            .unwrap();
        let analyzer = ReleaseAnalyzer::new(ai, 2, 4096);
        let resolver = VersionResolver::new(Arc::new(lister), store.clone(), analyzer, true);
        (store, resolver)
    }

    fn adguard_unit(id: UnitId) -> ManagedUnit {
        ManagedUnit::new(id, 1, format!("adguard-{id}"), "adguard/adguardhome:v0.107.69")
            .with_repo(RepoId::new("AdguardTeam", "AdGuardHome"))
    }

    #[test]
    fn finds_newer_releases_in_ascending_order() {
        let mut lister = FakeLister::default();
        lister.releases.insert(
            "AdguardTeam/AdGuardHome".into(),
            releases(&[
                ("v0.108.0-b.1", "beta"),
                ("v0.107.71", "BREAKING: new config schema"),
                ("v0.107.70", "fixes"),
                ("v0.107.69", "current"),
                ("v0.107.68", "old"),
            ]),
        );
        let unit = adguard_unit(1);
        let (store, resolver) = setup(lister, Arc::new(DisabledAi), vec![unit.clone()]);

        let found = resolver.get_newer_versions(&unit, &[]).unwrap();
        let versions: Vec<&str> = found.iter().map(|c| c.version.as_str()).collect();
        assert_eq!(versions, vec!["v0.107.70", "v0.107.71"]);
        assert!(!found[0].breaking);
        assert!(found[1].breaking);
        assert!(found[0].ai_summary.is_none());

        let stored = store.unit(1).unwrap().unwrap();
        assert!(stored.last_checked.is_some());
        assert_eq!(stored.upstream_pattern.as_deref(), Some(r"v\d+\.\d+\.\d+"));
    }

    #[test]
    fn already_persisted_versions_are_skipped() {
        let mut lister = FakeLister::default();
        lister.releases.insert(
            "AdguardTeam/AdGuardHome".into(),
            releases(&[("v0.107.70", "fixes")]),
        );
        let unit = adguard_unit(1);
        let (_, resolver) = setup(lister, Arc::new(DisabledAi), vec![unit.clone()]);

        assert_eq!(resolver.get_newer_versions(&unit, &[]).unwrap().len(), 1);
        assert!(resolver.get_newer_versions(&unit, &[]).unwrap().is_empty());
    }

    #[test]
    fn siblings_with_same_version_share_candidates() {
        let mut lister = FakeLister::default();
        lister.releases.insert(
            "AdguardTeam/AdGuardHome".into(),
            releases(&[("v0.107.70", "fixes"), ("v0.107.69", "")]),
        );
        let a = adguard_unit(1);
        let b = adguard_unit(2);
        let (store, resolver) = setup(lister, Arc::new(DisabledAi), vec![a.clone(), b.clone()]);

        let found = resolver.get_newer_versions(&a, &[b]).unwrap();
        assert_eq!(found[0].unit_ids, vec![1, 2]);
        assert!(store.unit(2).unwrap().unwrap().last_checked.is_some());
    }

    #[test]
    fn rate_limit_is_propagated() {
        let lister = FakeLister {
            rate_limited: true,
            ..FakeLister::default()
        };
        let unit = adguard_unit(1);
        let (_, resolver) = setup(lister, Arc::new(DisabledAi), vec![unit.clone()]);
        let err = resolver.get_newer_versions(&unit, &[]).unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn ai_analysis_fills_summary_and_verdict() {
        let mut lister = FakeLister {
            diff: "--- src/main.go\n+ eval(payload)\n".into(),
            ..FakeLister::default()
        };
        lister.releases.insert(
            "AdguardTeam/AdGuardHome".into(),
            releases(&[("v0.107.70", "fixes"), ("v0.107.69", "")]),
        );
        let unit = adguard_unit(1);
        let (_, resolver) = setup(lister, Arc::new(EchoAi), vec![unit.clone()]);

        let found = resolver.get_newer_versions(&unit, &[]).unwrap();
        assert_eq!(found[0].suspected_malicious, Some(true));
        assert_eq!(found[0].security_analysis.as_deref(), Some("reviewed"));
        assert_eq!(found[0].ai_breaking, Some(false));
        assert!(found[0].ai_summary.is_some());
    }

    #[test]
    fn failed_analysis_still_stores_candidates() {
        let mut lister = FakeLister {
            diff: "+ fix\n".into(),
            ..FakeLister::default()
        };
        lister.releases.insert(
            "AdguardTeam/AdGuardHome".into(),
            releases(&[("v0.107.70", "fixes"), ("v0.107.69", "")]),
        );
        let unit = adguard_unit(1);
        let (store, resolver) = setup(lister, Arc::new(BrokenAi), vec![unit.clone()]);

        let found = resolver.get_newer_versions(&unit, &[]).unwrap();
        assert_eq!(found.len(), 1);

        let stored = store.candidates_for(1).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].version, "v0.107.70");
        assert!(stored[0].ai_summary.is_none());
        assert!(stored[0].ai_breaking.is_none());
        assert!(stored[0].security_analysis.is_none());
        assert!(stored[0].suspected_malicious.is_none());
        assert!(store.unit(1).unwrap().unwrap().last_checked.is_some());
    }

    #[test]
    fn ai_is_not_consulted_without_security_scan() {
        let mut lister = FakeLister {
            diff: "+ eval(payload)\n".into(),
            ..FakeLister::default()
        };
        lister.releases.insert(
            "AdguardTeam/AdGuardHome".into(),
            releases(&[("v0.107.70", "fixes"), ("v0.107.69", "")]),
        );
        let unit = adguard_unit(1);
        let store = Arc::new(StateStore::in_memory());
        store
            .import(vec![Stack::file(1, "s", "/srv/s/compose.yml")], vec![unit.clone()])
            .unwrap();
        let analyzer = ReleaseAnalyzer::new(Arc::new(EchoAi), 2, 4096);
        let resolver = VersionResolver::new(Arc::new(lister), store, analyzer, false);

        let found = resolver.get_newer_versions(&unit, &[]).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ai_summary.is_none());
        assert!(found[0].suspected_malicious.is_none());
    }

    #[test]
    fn secondary_notes_stay_with_their_candidate() {
        let mut lister = FakeLister::default();
        lister.releases.insert(
            "linuxserver/docker-sonarr".into(),
            releases(&[
                ("4.0.2.100-ls220", "packaging 220"),
                ("4.0.1.929-ls219", "packaging 219"),
                ("4.0.0.700-ls218", "packaging 218"),
            ]),
        );
        lister.releases.insert(
            "Sonarr/Sonarr".into(),
            releases(&[
                ("v4.0.3.0", "future upstream"),
                ("v4.0.2.100", "upstream 2.100"),
                ("v4.0.1.929", "upstream 1.929"),
                ("v4.0.1.500", "upstream 1.500"),
                ("v4.0.0.700", "upstream current"),
            ]),
        );
        let unit = ManagedUnit::new(1, 1, "sonarr", "lscr.io/linuxserver/sonarr:4.0.0.700-ls218")
            .with_repo(RepoId::new("linuxserver", "docker-sonarr"))
            .with_secondary_repo(RepoId::new("Sonarr", "Sonarr"));
        let (_, resolver) = setup(lister, Arc::new(EchoAi), vec![unit.clone()]);

        let found = resolver.get_newer_versions(&unit, &[]).unwrap();
        assert_eq!(found.len(), 2);

        let first = found[0].ai_summary.as_deref().unwrap();
        let second = found[1].ai_summary.as_deref().unwrap();
        // Summary length grows with the merged notes; the future release is nowhere.
        let first_len: usize = first.trim_start_matches("summary of ").trim_end_matches(" chars").parse().unwrap();
        let expected_first = "packaging 219".len()
            + "\n\n## Sonarr/Sonarr v4.0.1.500\nupstream 1.500".len()
            + "\n\n## Sonarr/Sonarr v4.0.1.929\nupstream 1.929".len();
        assert_eq!(first_len, expected_first);

        let second_len: usize = second.trim_start_matches("summary of ").trim_end_matches(" chars").parse().unwrap();
        let expected_second = "packaging 220".len() + "\n\n## Sonarr/Sonarr v4.0.2.100\nupstream 2.100".len();
        assert_eq!(second_len, expected_second);
    }

    #[test]
    fn derives_pattern_from_matching_release() {
        let list = releases(&[("v2.0.0-rc.1", ""), ("v1.9.0", ""), ("v1.8.0", "")]);
        let pattern = derive_upstream_pattern(&list, "1.8.0").unwrap().unwrap();
        assert_eq!(pattern.as_str(), r"v\d+\.\d+\.\d+");

        let list = releases(&[("v2.0.0-rc.1", ""), ("v1.9.0", "")]);
        let pattern = derive_upstream_pattern(&list, "0.1").unwrap().unwrap();
        assert!(pattern.matches("v1.9.0"));
        assert!(derive_upstream_pattern(&[], "1.0").unwrap().is_none());
    }
}
