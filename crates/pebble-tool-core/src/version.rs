//! SDK version ordering.
//!
//! SDK versions look like `major[.minor[.patch]][-(dp|beta|rc)N]`. Releases
//! outrank release candidates, which outrank betas, which outrank developer
//! previews. Strings that don't parse at all sort below every parsable
//! version and fall back to raw string comparison among themselves, so the
//! order is total and deterministic for arbitrary input.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9]+)(?:\.([0-9]+))?(?:\.([0-9]+))?(?:-(beta|rc|dp)([0-9]+))?")
            .expect("version regex is valid")
    })
}

/// Pre-release stage, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PreRelease {
    DeveloperPreview = -3,
    Beta = -2,
    ReleaseCandidate = -1,
    Release = 0,
}

/// A parsed-or-raw SDK version, ordered per the scheme above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkVersion {
    Parsed {
        major: u32,
        minor: u32,
        patch: u32,
        pre: PreReleaseTag,
    },
    Raw(String),
}

/// Pre-release stage plus its counter (`rc2` is stage Rc, counter 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PreReleaseTag {
    stage: PreRelease,
    counter: u32,
}

impl SdkVersion {
    pub fn parse(version: &str) -> Self {
        let Some(caps) = version_re().captures(version) else {
            return SdkVersion::Raw(version.to_string());
        };
        let number = |i: usize| {
            caps.get(i)
                .map(|m| m.as_str().parse::<u32>().unwrap_or(0))
                .unwrap_or(0)
        };
        let stage = match caps.get(4).map(|m| m.as_str()) {
            Some("dp") => PreRelease::DeveloperPreview,
            Some("beta") => PreRelease::Beta,
            Some("rc") => PreRelease::ReleaseCandidate,
            _ => PreRelease::Release,
        };
        SdkVersion::Parsed {
            major: number(1),
            minor: number(2),
            patch: number(3),
            pre: PreReleaseTag {
                stage,
                counter: number(5),
            },
        }
    }
}

impl Ord for SdkVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (
                SdkVersion::Parsed {
                    major: a0,
                    minor: a1,
                    patch: a2,
                    pre: a3,
                },
                SdkVersion::Parsed {
                    major: b0,
                    minor: b1,
                    patch: b2,
                    pre: b3,
                },
            ) => (a0, a1, a2, a3).cmp(&(b0, b1, b2, b3)),
            // Anything parsable ranks above anything that isn't.
            (SdkVersion::Parsed { .. }, SdkVersion::Raw(_)) => Ordering::Greater,
            (SdkVersion::Raw(_), SdkVersion::Parsed { .. }) => Ordering::Less,
            (SdkVersion::Raw(a), SdkVersion::Raw(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for SdkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort key for version strings; use with `sort_by_key` or `max_by_key`.
pub fn version_key(version: &str) -> SdkVersion {
    SdkVersion::parse(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_order(greater: &str, lesser: &str) {
        assert!(
            version_key(greater) > version_key(lesser),
            "{} should outrank {}",
            greater,
            lesser
        );
    }

    #[test]
    fn test_release_outranks_prereleases() {
        assert_order("4.5.0", "4.5.0-rc1");
        assert_order("4.5.0-rc1", "4.5.0-beta2");
        assert_order("4.5.0-beta2", "4.5.0-dp1");
    }

    #[test]
    fn test_numeric_components() {
        assert_order("4.6.0", "4.5.9");
        assert_order("10.0", "9.9.9");
        assert_order("4.5.1", "4.5");
        assert_order("4.5.0-rc2", "4.5.0-rc1");
    }

    #[test]
    fn test_missing_components_default_to_zero() {
        assert_eq!(version_key("4.5"), version_key("4.5.0"));
        assert_eq!(version_key("4"), version_key("4.0.0"));
    }

    #[test]
    fn test_unparsable_sorts_below_parsable() {
        assert_order("0.0.0", "tintin");
        assert_order("1", "not-a-version");
        // Raw strings still order deterministically among themselves.
        assert_order("zebra", "aardvark");
    }

    #[test]
    fn test_total_order_on_mixed_list() {
        let mut versions = vec!["4.5.0-beta2", "tintin", "4.6.0", "4.5.0", "4.5.0-rc1"];
        versions.sort_by_key(|v| version_key(v));
        assert_eq!(
            versions,
            vec!["tintin", "4.5.0-beta2", "4.5.0-rc1", "4.5.0", "4.6.0"]
        );
    }
}
