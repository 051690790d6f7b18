use crate::error::Result;
use crate::version::pattern::VersionPattern;
use std::cmp::Ordering;

/// Numeric skeleton of a version string: every maximal run of digits, in order.
///
/// Anything that is not a digit is ignored, which lets `immich@1.119.2` and
/// `1.118.1` be compared as `[1, 119, 2]` against `[1, 118, 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub original: String,
    segments: Vec<String>,
}

impl Version {
    pub fn parse(version: &str) -> Self {
        let body = version.strip_prefix('v').unwrap_or(version);
        Version {
            original: version.to_string(),
            segments: Self::digit_runs(body),
        }
    }

    fn digit_runs(text: &str) -> Vec<String> {
        let mut runs = Vec::new();
        let mut current = String::new();

        for ch in text.chars() {
            if ch.is_ascii_digit() {
                current.push(ch);
            } else if !current.is_empty() {
                runs.push(Self::normalize(&current));
                current.clear();
            }
        }
        if !current.is_empty() {
            runs.push(Self::normalize(&current));
        }

        runs
    }

    // Leading zeros are dropped so runs compare numerically by length then text,
    // without parsing into a fixed-width integer.
    fn normalize(run: &str) -> String {
        let trimmed = run.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Ordering against another version, or `None` when the two strings carry a
    /// different number of numeric runs.
    pub fn compare(&self, other: &Version) -> Option<Ordering> {
        if self.segments.len() != other.segments.len() {
            return None;
        }

        for (a, b) in self.segments.iter().zip(other.segments.iter()) {
            let ord = a.len().cmp(&b.len()).then_with(|| a.cmp(b));
            if ord != Ordering::Equal {
                return Some(ord);
            }
        }

        Some(Ordering::Equal)
    }

    /// Whether the tag reads as a pre-release (semver pre-release identifier or a
    /// well-known unstable marker). Build counters such as `-ls12` or `-r3` are not
    /// pre-releases.
    pub fn looks_prerelease(&self) -> bool {
        let body = self.original.strip_prefix('v').unwrap_or(&self.original);

        if let Ok(parsed) = semver::Version::parse(body) {
            if !parsed.pre.is_empty() && !is_build_counter(parsed.pre.as_str()) {
                return true;
            }
        }

        let unstable_markers = [
            "alpha", "beta", "rc", "dev", "preview", "nightly", "canary", "snapshot", "eap",
        ];

        body.to_lowercase()
            .split(|c: char| matches!(c, '-' | '.' | '_' | '+'))
            .map(|token| token.trim_end_matches(|c: char| c.is_ascii_digit()))
            .any(|token| unstable_markers.contains(&token))
    }
}

/// `r<digits>` and `ls<digits>` are packaging build counters, not release channels.
pub(crate) fn is_build_counter(suffix: &str) -> bool {
    let digits = suffix
        .strip_prefix("ls")
        .or_else(|| suffix.strip_prefix('r'));

    matches!(digits, Some(d) if !d.is_empty() && d.chars().all(|c| c.is_ascii_digit()))
}

pub struct VersionComparator;

impl VersionComparator {
    /// Compare two version strings; `None` means the two are not comparable.
    pub fn compare(a: &str, b: &str) -> Option<Ordering> {
        Version::parse(a).compare(&Version::parse(b))
    }

    /// Check if version `a` is newer than version `b`.
    ///
    /// Versions with a different number of numeric runs are never newer than each
    /// other, in either direction.
    pub fn is_newer(a: &str, b: &str) -> bool {
        Self::compare(a, b) == Some(Ordering::Greater)
    }

    pub fn same_version(a: &str, b: &str) -> bool {
        Self::compare(a, b) == Some(Ordering::Equal)
    }

    /// Regular expression recognising the shape of `version`.
    pub fn build_pattern(version: &str) -> Result<VersionPattern> {
        VersionPattern::build(version)
    }

    /// Newest version among `versions`, keeping the first seen on ties or when
    /// versions are not comparable.
    pub fn newest<'a, I>(versions: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        versions.into_iter().fold(None, |best, candidate| match best {
            Some(current) if !Self::is_newer(candidate, current) => Some(current),
            _ => Some(candidate),
        })
    }

    /// Ascending sort; incomparable pairs keep their relative order.
    pub fn sort_ascending(versions: &mut [String]) {
        versions.sort_by(|a, b| Self::compare(a, b).unwrap_or(Ordering::Equal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v_prefix_is_ignored() {
        assert!(VersionComparator::same_version("v1.2.3", "1.2.3"));
        assert!(VersionComparator::same_version("v1.2.3.0", "1.2.3.0"));
        assert!(!VersionComparator::same_version("v1.2.3.0", "1.2.3.1"));
    }

    #[test]
    fn newer_detection() {
        assert!(VersionComparator::is_newer("v1.1.2", "v1.1.0"));
        assert!(VersionComparator::is_newer("v1.5.3-ls325", "v1.5.3-ls324"));
        assert!(VersionComparator::is_newer("name@1.119.2", "1.118.1"));
        assert!(!VersionComparator::is_newer("v1.2.3.4", "v1.2.4.0"));
        assert!(VersionComparator::is_newer("v1.2.4.0", "v1.2.3.4"));
    }

    #[test]
    fn mismatched_segment_counts_are_never_newer() {
        assert!(!VersionComparator::is_newer("1.2.3", "1.2"));
        assert!(!VersionComparator::is_newer("1.2", "1.2.3"));
        assert_eq!(VersionComparator::compare("2.0", "1.9.9"), None);
    }

    #[test]
    fn compare_is_antisymmetric_and_reflexive() {
        let samples = [
            "v1.0.0", "1.0.1", "v2.10.0", "2.9.99", "0.107.69", "v0.108.0", "10.0.0", "1.2.3-ls7",
        ];
        for a in samples {
            assert_eq!(VersionComparator::compare(a, a), Some(Ordering::Equal));
            for b in samples {
                let ab = VersionComparator::compare(a, b);
                let ba = VersionComparator::compare(b, a);
                assert_eq!(ab.map(Ordering::reverse), ba, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn long_numeric_runs_do_not_overflow() {
        assert!(VersionComparator::is_newer(
            "2024.123456789012345678901",
            "2024.123456789012345678900"
        ));
        assert!(VersionComparator::same_version("1.007", "1.7"));
    }

    #[test]
    fn newest_picks_maximum() {
        let versions = ["v1.0.0", "v1.2.0", "v1.1.9"];
        assert_eq!(VersionComparator::newest(versions), Some("v1.2.0"));
        assert_eq!(VersionComparator::newest(Vec::<&str>::new()), None);
    }

    #[test]
    fn sorts_ascending() {
        let mut versions = vec![
            "v1.10.0".to_string(),
            "v1.2.0".to_string(),
            "v1.9.1".to_string(),
        ];
        VersionComparator::sort_ascending(&mut versions);
        assert_eq!(versions, vec!["v1.2.0", "v1.9.1", "v1.10.0"]);
    }

    #[test]
    fn prerelease_detection() {
        assert!(Version::parse("v2.0.0-rc.1").looks_prerelease());
        assert!(Version::parse("1.4.0-beta2").looks_prerelease());
        assert!(!Version::parse("v1.5.3-ls325").looks_prerelease());
        assert!(!Version::parse("3.19.1-r0").looks_prerelease());
        assert!(!Version::parse("v0.108.0").looks_prerelease());
    }
}
