//! Release version parsing and comparison

use std::fmt;
use std::str::FromStr;

use crate::update::error::UpdateError;

/// A strict `major.minor.patch` release version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parse a release version string.
///
/// Accepts a single leading `v` as used by release tags. Partial versions
/// ("1.2") and pre-release or build suffixes are rejected rather than
/// padded or ignored.
///
/// Examples:
/// - "1.2.3" -> Version(1, 2, 3)
/// - "v1.2.3" -> Version(1, 2, 3)
/// - "1.2" -> error
impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let normalized = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let parsed = semver::Version::parse(normalized)
            .map_err(|e| UpdateError::Parse(format!("invalid version {:?}: {}", s, e)))?;

        if !parsed.pre.is_empty() || !parsed.build.is_empty() {
            return Err(UpdateError::Parse(format!(
                "invalid version {:?}: expected exactly major.minor.patch",
                s
            )));
        }

        Ok(Version::new(parsed.major, parsed.minor, parsed.patch))
    }
}

/// Returns true if `candidate` is strictly newer than `current`
pub fn is_newer(candidate: &Version, current: &Version) -> bool {
    candidate > current
}

/// Parse both strings and compare them
pub fn is_newer_str(candidate: &str, current: &str) -> Result<bool, UpdateError> {
    let candidate: Version = candidate.parse()?;
    let current: Version = current.parse()?;
    Ok(is_newer(&candidate, &current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1.0.1", "1.0.0", true)]
    #[case("1.1.9", "1.2.0", false)]
    #[case("2.0.0", "1.99.99", true)]
    #[case("1.10.0", "1.9.0", true)] // numeric, not lexicographic
    #[case("1.0.0", "1.0.0", false)]
    #[case("0.0.1", "0.0.0", true)]
    #[case("v3.0.0", "2.5.1", true)]
    fn is_newer_str_compares_components_in_order(
        #[case] candidate: &str,
        #[case] current: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(is_newer_str(candidate, current).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("1")]
    #[case("1.2")]
    #[case("1.2.3.4")]
    #[case("1.x.3")]
    #[case("-1.0.0")]
    #[case("1.0.0-beta.1")]
    #[case("1.0.0+build5")]
    #[case("latest")]
    fn parse_rejects_malformed_versions(#[case] input: &str) {
        assert!(matches!(
            input.parse::<Version>(),
            Err(UpdateError::Parse(_))
        ));
    }

    #[test]
    fn is_newer_str_fails_when_either_side_is_malformed() {
        assert!(is_newer_str("1.0", "1.0.0").is_err());
        assert!(is_newer_str("1.0.0", "garbage").is_err());
    }

    #[test]
    fn is_newer_matches_first_differing_component() {
        let versions = [
            Version::new(0, 0, 0),
            Version::new(0, 0, 9),
            Version::new(0, 1, 0),
            Version::new(1, 0, 0),
            Version::new(1, 0, 1),
            Version::new(1, 2, 0),
            Version::new(2, 0, 0),
        ];

        for a in &versions {
            for b in &versions {
                let expected = [(a.major, b.major), (a.minor, b.minor), (a.patch, b.patch)]
                    .into_iter()
                    .find(|(x, y)| x != y)
                    .is_some_and(|(x, y)| x > y);
                assert_eq!(is_newer(a, b), expected, "{} vs {}", a, b);
            }
            assert!(!is_newer(a, a));
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        let version: Version = "v4.12.0".parse().unwrap();
        assert_eq!(version.to_string(), "4.12.0");
    }
}
