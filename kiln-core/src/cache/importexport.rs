//! The cache import/export manifest, per the external-interfaces contract:
//! a JSON document listing `(key, size, checksum, metadata)` entries
//! alongside their blob contents. `registry`/`local dir`/`cloud object
//! store`/`github-actions-cache` exporters all read and write this same
//! manifest shape; only the blob transport differs, which is why it's
//! modeled as a `Backend` enum rather than separate manifest types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Registry,
    LocalDir,
    CloudObjectStore,
    Inline,
    GithubActionsCache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    pub key: String,
    pub size: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheManifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub source: Backend,
    pub entries: Vec<ManifestEntry>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CacheManifest {
    #[must_use]
    pub fn new(source: Backend, created_at: DateTime<Utc>) -> Self {
        Self { version: 1, created_at, source, entries: Vec::new(), metadata: serde_json::Map::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Fail if any entry in the manifest already exists locally.
    Refuse,
    /// Replace any locally existing entry with the imported one.
    Overwrite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_json() {
        let mut m = CacheManifest::new(Backend::LocalDir, DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().into());
        m.entries.push(ManifestEntry {
            key: "sha256:abc".into(),
            size: 42,
            checksum: "sha256:def".into(),
            created_at: m.created_at,
            metadata: serde_json::Map::new(),
        });
        let json = serde_json::to_string(&m).unwrap();
        let back: CacheManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].key, "sha256:abc");
    }
}
