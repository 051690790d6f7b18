use crate::error::Result;
use crate::version::comparator::is_build_counter;
use regex::{Match, Regex};
use std::fmt;

const DIGITS: &str = r"\d+";

/// Regular expression describing the tagging convention of a version string.
///
/// `exact` anchors the expression and classifies whole tags; `search` is used to
/// locate the versioned part inside a longer string during patch synthesis.
#[derive(Debug, Clone)]
pub struct VersionPattern {
    source: String,
    exact: Regex,
    search: Regex,
}

impl VersionPattern {
    /// Synthesise a pattern from a literal version.
    ///
    /// - a leading `v` is kept only when present,
    /// - each dot-separated segment becomes `\d+` (literal text inside a segment is
    ///   escaped, its digit runs templated),
    /// - `-r<n>` and `-ls<n>` build counters become `-r\d+` / `-ls\d+`,
    /// - any other dash suffix is kept as a literal channel tag.
    pub fn build(version: &str) -> Result<Self> {
        let (prefix, body) = match version.strip_prefix('v') {
            Some(rest) => ("v", rest),
            None => ("", version),
        };

        let mut parts = body.split('-');
        let head = parts.next().unwrap_or_default();

        let mut source = String::from(prefix);
        source.push_str(
            &head
                .split('.')
                .map(template_segment)
                .collect::<Vec<_>>()
                .join(r"\."),
        );

        for suffix in parts {
            source.push('-');
            source.push_str(&template_suffix(suffix));
        }

        Self::compile(&source)
    }

    /// Compile a previously synthesised (or stored) pattern source.
    pub fn compile(source: &str) -> Result<Self> {
        Ok(Self {
            source: source.to_string(),
            exact: Regex::new(&format!("^(?:{source})$"))?,
            search: Regex::new(source)?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whole-string match.
    pub fn matches(&self, text: &str) -> bool {
        self.exact.is_match(text)
    }

    /// First substring of `text` following this convention.
    pub fn find<'t>(&self, text: &'t str) -> Option<Match<'t>> {
        self.search.find(text)
    }

    /// The same convention without its literal `v` prefix, if it has one.
    pub fn without_v_prefix(&self) -> Option<Self> {
        let rest = self.source.strip_prefix('v')?;
        if rest.is_empty() {
            return None;
        }
        Self::compile(rest).ok()
    }
}

impl fmt::Display for VersionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn template_segment(segment: &str) -> String {
    if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()) {
        return DIGITS.to_string();
    }

    let mut out = String::new();
    let mut literal = String::new();
    let mut in_digits = false;

    for ch in segment.chars() {
        if ch.is_ascii_digit() {
            if !in_digits {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(DIGITS);
                in_digits = true;
            }
        } else {
            in_digits = false;
            literal.push(ch);
        }
    }
    out.push_str(&regex::escape(&literal));
    out
}

fn template_suffix(suffix: &str) -> String {
    if is_build_counter(suffix) {
        let label = suffix.trim_end_matches(|c: char| c.is_ascii_digit());
        format!("{label}{DIGITS}")
    } else {
        regex::escape(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_edge_cases() {
        for version in [
            "v1.2.3",
            "1.2.3",
            "v1.2.3.0",
            "v1.5.3-ls325",
            "3.19.1-r0",
            "2.10.4-alpine",
            "immich@1.119.2",
            "release-2024.05",
            "latest",
        ] {
            let pattern = VersionPattern::build(version).unwrap();
            assert!(pattern.matches(version), "{version} vs {pattern}");
        }
    }

    #[test]
    fn synthesised_sources() {
        assert_eq!(VersionPattern::build("v1.2.3").unwrap().as_str(), r"v\d+\.\d+\.\d+");
        assert_eq!(
            VersionPattern::build("v1.5.3-ls325").unwrap().as_str(),
            r"v\d+\.\d+\.\d+-ls\d+"
        );
        assert_eq!(
            VersionPattern::build("2.10.4-alpine").unwrap().as_str(),
            r"\d+\.\d+\.\d+-alpine"
        );
    }

    #[test]
    fn build_counters_match_future_counters() {
        let pattern = VersionPattern::build("v1.5.3-ls325").unwrap();
        assert!(pattern.matches("v1.6.0-ls1000"));
        let pattern = VersionPattern::build("3.19.1-r0").unwrap();
        assert!(pattern.matches("3.20.0-r12"));
    }

    #[test]
    fn channel_tags_stay_literal() {
        let pattern = VersionPattern::build("2.10.4-alpine").unwrap();
        assert!(pattern.matches("2.11.0-alpine"));
        assert!(!pattern.matches("2.11.0-bookworm"));
        assert!(!pattern.matches("2.11.0"));
    }

    #[test]
    fn v_prefix_is_only_emitted_when_present() {
        let with_v = VersionPattern::build("v1.2.3").unwrap();
        assert!(!with_v.matches("1.2.3"));
        let stripped = with_v.without_v_prefix().unwrap();
        assert!(stripped.matches("1.2.3"));
        assert!(VersionPattern::build("1.2.3").unwrap().without_v_prefix().is_none());
    }

    #[test]
    fn search_locates_embedded_version() {
        let pattern = VersionPattern::build("1.2.3").unwrap();
        let found = pattern.find("1.2.3-alpine").unwrap();
        assert_eq!(found.as_str(), "1.2.3");
    }
}
