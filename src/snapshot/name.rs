// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot naming scheme.
//!
//! Every snapshot pacsnap creates is named after the transaction that
//! triggered it:
//!
//! ```text
//! pacman-<phase>-u<timestamp>-<fingerprint>
//! ```
//!
//! - __phase__ is `pre` or `post`, relative to the pacman transaction.
//! - __timestamp__ is UTC time in `YYYYMMDDTHHMMSSZ` form.
//! - __fingerprint__ is the first eight hex digits of the SHA-256 digest of
//!   the transaction's target list, or `no-targets` if pacman passed none.
//!
//! The whole name is normalized to the ZFS snapshot name grammar and
//! lowercased, so a name created at noon on new year's day reads
//! `pacman-pre-u20250101t120000z-3f2a9c1d`.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Prefix shared by every snapshot pacsnap manages.
///
/// Retention only ever touches snapshots carrying this prefix.
pub const SNAPSHOT_PREFIX: &str = "pacman";

/// Position of snapshot relative to pacman transaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before packages are touched.
    #[default]
    Pre,

    /// After packages are touched.
    Post,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = NameError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.trim().to_ascii_lowercase().as_str() {
            "pre" => Ok(Self::Pre),
            "post" => Ok(Self::Post),
            _ => Err(NameError::UnknownPhase(data.into())),
        }
    }
}

/// Short digest of a transaction's target list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Token used when the target list is empty.
    pub const PLACEHOLDER: &'static str = "no-targets";

    /// Number of hex digits kept from the digest.
    pub const LEN: usize = 8;

    /// Compute fingerprint of ordered target list.
    ///
    /// Targets are joined with newlines in the order given. Reordering the
    /// list produces a different fingerprint.
    pub fn from_targets(targets: &[impl AsRef<str>]) -> Self {
        if targets.is_empty() {
            return Self(Self::PLACEHOLDER.into());
        }

        let joined = targets
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("\n");
        let digest = hex::encode(Sha256::digest(joined.as_bytes()));

        Self(digest[..Self::LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for Fingerprint {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Name of a pacsnap snapshot, without the `dataset@` part.
///
/// # Invariant
///
/// - Only contains lowercase alphanumerics, `_`, `-`, `.`, and `:`.
/// - Always starts with [`SNAPSHOT_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName(String);

impl SnapshotName {
    /// Construct snapshot name for a transaction phase at a point in time.
    pub fn new(phase: Phase, timestamp: DateTime<Utc>, fingerprint: &Fingerprint) -> Self {
        let raw = format!(
            "{SNAPSHOT_PREFIX}-{phase}-u{}-{fingerprint}",
            timestamp.format("%Y%m%dT%H%M%SZ")
        );

        Self(normalize(&raw))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Full snapshot identifier for a dataset, i.e., `dataset@name`.
    pub fn for_dataset(&self, dataset: impl AsRef<str>) -> String {
        format!("{}@{}", dataset.as_ref(), self.0)
    }
}

impl Display for SnapshotName {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Check if a snapshot name belongs to pacsnap.
pub fn is_managed(name: impl AsRef<str>) -> bool {
    name.as_ref()
        .strip_prefix(SNAPSHOT_PREFIX)
        .is_some_and(|rest| rest.starts_with('-'))
}

/// Normalize raw text to the ZFS snapshot name grammar.
///
/// Lowercases everything, and strips any character that is not
/// alphanumeric, `_`, `-`, `.`, or `:`.
pub fn normalize(raw: impl AsRef<str>) -> String {
    raw.as_ref()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':'))
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

/// Snapshot naming error types.
#[derive(Debug, thiserror::Error)]
pub enum NameError {
    /// Phase argument is neither "pre" nor "post".
    #[error("unknown transaction phase {0:?}, expected \"pre\" or \"post\"")]
    UnknownPhase(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use simple_test_case::test_case;

    fn new_years_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let first = Fingerprint::from_targets(&["pkgA", "pkgB"]);
        let second = Fingerprint::from_targets(&["pkgA".to_string(), "pkgB".to_string()]);
        pretty_assertions::assert_eq!(first, second);
        pretty_assertions::assert_eq!(first.as_str().len(), Fingerprint::LEN);
        assert!(first.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_matches_sha256_of_joined_targets() {
        // sha256("linux\nzfs-linux") truncated to eight digits.
        let expect = hex::encode(Sha256::digest(b"linux\nzfs-linux"))[..8].to_string();
        let result = Fingerprint::from_targets(&["linux", "zfs-linux"]);
        pretty_assertions::assert_eq!(result.as_str(), expect);
    }

    #[test]
    fn fingerprint_depends_on_order() {
        let forward = Fingerprint::from_targets(&["pkgA", "pkgB"]);
        let backward = Fingerprint::from_targets(&["pkgB", "pkgA"]);
        assert_ne!(forward, backward);
    }

    #[test]
    fn fingerprint_of_empty_list_is_placeholder() {
        let empty: [&str; 0] = [];
        let result = Fingerprint::from_targets(&empty);
        pretty_assertions::assert_eq!(result.as_str(), Fingerprint::PLACEHOLDER);
    }

    #[test]
    fn snapshot_name_layout() {
        let fingerprint = Fingerprint::from_targets(&["pkgA", "pkgB"]);
        let result = SnapshotName::new(Phase::Pre, new_years_noon(), &fingerprint);
        let expect = format!("pacman-pre-u20250101t120000z-{fingerprint}");
        pretty_assertions::assert_eq!(result.as_str(), expect);
        pretty_assertions::assert_eq!(
            result.for_dataset("zroot/ROOT/default"),
            format!("zroot/ROOT/default@{expect}")
        );
    }

    #[test]
    fn snapshot_name_without_targets() {
        let empty: [&str; 0] = [];
        let fingerprint = Fingerprint::from_targets(&empty);
        let result = SnapshotName::new(Phase::Post, new_years_noon(), &fingerprint);
        pretty_assertions::assert_eq!(result.as_str(), "pacman-post-u20250101t120000z-no-targets");
        assert!(is_managed(result.as_str()));
    }

    #[test_case("Hello World!", "helloworld"; "spaces and punctuation")]
    #[test_case("a@b/c", "abc"; "snapshot separators")]
    #[test_case("v1.2:rc_3-x", "v1.2:rc_3-x"; "allowed punctuation")]
    #[test_case("ÄÖÜ-ok", "-ok"; "non ascii")]
    #[test]
    fn normalize_strips_invalid_characters(input: &str, expect: &str) {
        pretty_assertions::assert_eq!(normalize(input), expect);
    }

    #[test_case("pacman-pre-u20250101t120000z-no-targets", true; "pre")]
    #[test_case("pacman-20-01-25-120000-abcde", true; "other variant")]
    #[test_case("pacmanual", false; "longer word")]
    #[test_case("autosnap_2025", false; "foreign")]
    #[test]
    fn managed_snapshot_detection(name: &str, expect: bool) {
        pretty_assertions::assert_eq!(is_managed(name), expect);
    }

    #[test]
    fn parse_phase() {
        pretty_assertions::assert_eq!("pre".parse::<Phase>().unwrap(), Phase::Pre);
        pretty_assertions::assert_eq!(" POST ".parse::<Phase>().unwrap(), Phase::Post);
        assert!("during".parse::<Phase>().is_err());
    }
}
