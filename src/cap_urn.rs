//! Minimal capability-URN matching (spec.md §6, "External collaborators").
//!
//! The full URN / tagged-URN parsing library is out of scope for this
//! crate; this module implements only the interface §6 requires so the
//! router (§4.6) and runtime (§4.7) are runnable standalone:
//! `from_str`/`accepts`/`in_spec`/`out_spec`/`specificity` against the
//! `cap:in="<media-urn>";op=<name>;out="<media-urn>"` tag syntax used in
//! every worked example in spec.md.

use std::collections::BTreeMap;
use std::str::FromStr;

/// A parsed capability URN: an `op` tag plus an ordered set of other tags
/// (typically `in`/`out` media URNs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapUrn {
    raw: String,
    tags: BTreeMap<String, String>,
}

/// Error returned when a string isn't a well-formed `cap:...` URN.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid capability urn: {0:?}")]
pub struct ParseCapUrnError(String);

impl CapUrn {
    /// The `op` tag, if present.
    #[must_use]
    pub fn op(&self) -> Option<&str> {
        self.tags.get("op").map(String::as_str)
    }

    /// The `in` tag (input media URN), if present.
    #[must_use]
    pub fn in_spec(&self) -> Option<&str> {
        self.tags.get("in").map(String::as_str)
    }

    /// The `out` tag (output media URN), if present.
    #[must_use]
    pub fn out_spec(&self) -> Option<&str> {
        self.tags.get("out").map(String::as_str)
    }

    /// Number of tags this URN constrains. A URN with more tags is more
    /// specific than one with fewer, all else equal.
    #[must_use]
    pub fn specificity(&self) -> u32 {
        self.tags.len() as u32
    }

    /// The original string this URN was parsed from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Does `self` (the request's URN) accept `registered` (a capability
    /// a plugin advertised)? A request accepts a registered capability when
    /// every tag the request constrains is also present, with an equal or
    /// wildcard (`*`) value, on the registered URN — so a more specific
    /// request can still match a more general registration and vice versa
    /// so long as no tag actively conflicts.
    #[must_use]
    pub fn accepts(&self, registered: &CapUrn) -> bool {
        for (key, value) in &self.tags {
            match registered.tags.get(key) {
                Some(other) if other == "*" || value == "*" || other == value => {}
                Some(_) => return false,
                None => return false,
            }
        }
        true
    }

    /// Absolute distance in specificity between two URNs, used to break
    /// ties among multiple handlers a request `Accepts` (spec.md §4.7:
    /// "smallest absolute specificity distance").
    #[must_use]
    pub fn specificity_distance(&self, other: &CapUrn) -> u32 {
        self.specificity().abs_diff(other.specificity())
    }
}

impl FromStr for CapUrn {
    type Err = ParseCapUrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("cap:")
            .ok_or_else(|| ParseCapUrnError(s.to_string()))?;
        let mut tags = BTreeMap::new();
        for segment in body.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ParseCapUrnError(s.to_string()))?;
            let value = value.trim().trim_matches('"');
            tags.insert(key.trim().to_string(), value.to_string());
        }
        if tags.is_empty() {
            return Err(ParseCapUrnError(s.to_string()));
        }
        Ok(Self {
            raw: s.to_string(),
            tags,
        })
    }
}

impl std::fmt::Display for CapUrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
