//! Capability manifest parsing (spec.md §6, "Manifest interface").
//!
//! This is the minimal parsing the host's `attach` (§4.6) needs to extract
//! a plugin's advertised capability URNs; it is not the "capability
//! manifest schema loader" named as out of scope in §1 — it doesn't
//! validate manifest semantics, and passes unknown fields through opaquely.

use serde::{Deserialize, Serialize};

/// One entry of a manifest's `caps` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapEntry {
    /// The capability URN this plugin advertises.
    pub urn: String,
    /// Any other fields the manifest carries for this cap, preserved
    /// opaquely (this layer does not interpret them).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `{ "caps": [ { "urn": "<cap URN>" }, ... ] }`, plus whatever else the
/// manifest's author chose to include.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDoc {
    /// The advertised capabilities.
    pub caps: Vec<CapEntry>,
    /// Any other top-level fields, preserved opaquely.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ManifestDoc {
    /// Parse a manifest's opaque JSON bytes, extracting the cap URN list.
    pub fn parse(bytes: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::error::Error::MalformedFrame(format!("invalid manifest: {e}")))
    }

    /// The list of capability URN strings this manifest advertises.
    #[must_use]
    pub fn cap_urns(&self) -> Vec<String> {
        self.caps.iter().map(|c| c.urn.clone()).collect()
    }

    /// Build the `{"caps":[...]}` aggregate document the host exposes from
    /// a flat list of URN strings (spec.md §4.6, "Aggregate capabilities").
    #[must_use]
    pub fn build(urns: &[String]) -> serde_json::Value {
        serde_json::json!({
            "caps": urns.iter().map(|urn| serde_json::json!({ "urn": urn })).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_manifest() {
        let doc = ManifestDoc::parse(br#"{"caps":[{"urn":"cap:op=echo"}]}"#).unwrap();
        assert_eq!(doc.cap_urns(), vec!["cap:op=echo".to_string()]);
    }

    #[test]
    fn preserves_unknown_fields() {
        let doc =
            ManifestDoc::parse(br#"{"caps":[{"urn":"cap:op=echo","extra_field":1}],"name":"p"}"#)
                .unwrap();
        assert_eq!(doc.extra.get("name").unwrap(), "p");
        assert_eq!(doc.caps[0].extra.get("extra_field").unwrap(), 1);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(ManifestDoc::parse(b"not json").is_err());
    }

    #[test]
    fn builds_aggregate_json() {
        let value = ManifestDoc::build(&["cap:op=a".into(), "cap:op=b".into()]);
        assert_eq!(value["caps"][0]["urn"], "cap:op=a");
        assert_eq!(value["caps"][1]["urn"], "cap:op=b");
    }
}
