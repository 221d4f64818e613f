//! A durable, bounded fingerprint → artifact store with eviction,
//! single-flight leasing, and manifest import/export.
//!
//! Entries live on disk under `<root>/blobs/sha256/<fingerprint>`; writes
//! are staged to a temp path and atomically renamed into place so a crash
//! mid-write never leaves a corrupt entry visible under its final name.

pub mod importexport;
pub mod lease;
pub mod prune;

use std::collections::HashMap;
use std::sync::RwLock;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{BuildError, ErrorKind, Result};
use crate::llb::Fingerprint;

pub use importexport::{Backend, CacheManifest, ImportMode, ManifestEntry};
pub use lease::{LeaseGuard, LeaseTable};
pub use prune::{PrunePolicy, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Gzip,
    Zstd,
    Lz4,
    Bzip2,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub key: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expiry: Option<DateTime<Utc>>,
    pub content_type: String,
    pub compression: CompressionKind,
    pub platform: Option<String>,
    pub layer_digest: Option<String>,
    /// sha256 of the stored blob's bytes, checked on every `get` since the
    /// blob is keyed by the node's fingerprint, not by its own content hash.
    pub content_checksum: String,
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub entry_count: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}

pub struct Cache {
    root: Utf8PathBuf,
    index: RwLock<HashMap<String, Entry>>,
    access_counts: RwLock<HashMap<String, u64>>,
    stats: RwLock<Stats>,
    leases: LeaseTable,
}

impl Cache {
    pub async fn open(root: impl Into<Utf8PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("blobs/sha256")).await.map_err(io_err)?;
        tokio::fs::create_dir_all(root.join("locks")).await.map_err(io_err)?;
        Ok(Self {
            leases: LeaseTable::new(Some(root.join("locks"))),
            root,
            index: RwLock::new(HashMap::new()),
            access_counts: RwLock::new(HashMap::new()),
            stats: RwLock::new(Stats::default()),
        })
    }

    fn blob_path(&self, key: &str) -> Utf8PathBuf {
        self.root.join("blobs/sha256").join(key)
    }

    pub async fn get(&self, fp: Fingerprint) -> Result<Option<(Entry, Vec<u8>)>> {
        let key = fp.to_hex();
        let entry = self.index.read().expect("lock poisoned").get(&key).cloned();
        let Some(mut entry) = entry else {
            self.stats.write().expect("lock poisoned").misses += 1;
            return Ok(None);
        };

        let bytes = match tokio::fs::read(self.blob_path(&key)).await {
            Ok(b) => b,
            Err(_) => {
                // Corruption / missing blob is surfaced as a miss, not an error.
                self.index.write().expect("lock poisoned").remove(&key);
                self.stats.write().expect("lock poisoned").misses += 1;
                return Ok(None);
            }
        };

        if checksum(&bytes) != entry.content_checksum {
            self.index.write().expect("lock poisoned").remove(&key);
            self.stats.write().expect("lock poisoned").misses += 1;
            return Ok(None);
        }

        entry.last_access = Utc::now();
        self.index.write().expect("lock poisoned").insert(key.clone(), entry.clone());
        *self.access_counts.write().expect("lock poisoned").entry(key).or_insert(0) += 1;
        self.stats.write().expect("lock poisoned").hits += 1;
        Ok(Some((entry, bytes)))
    }

    pub async fn put(&self, fp: Fingerprint, bytes: &[u8], mut metadata: Entry) -> Result<()> {
        let key = fp.to_hex();
        let path = self.blob_path(&key);
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));

        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        metadata.key = key.clone();
        metadata.size = bytes.len() as u64;
        metadata.content_checksum = checksum(bytes);
        self.index.write().expect("lock poisoned").insert(key, metadata);
        Ok(())
    }

    pub async fn delete(&self, fp: Fingerprint) -> Result<()> {
        let key = fp.to_hex();
        self.index.write().expect("lock poisoned").remove(&key);
        let _ = tokio::fs::remove_file(self.blob_path(&key)).await;
        Ok(())
    }

    #[must_use]
    pub fn list(&self, prefix: &str) -> Vec<String> {
        self.index.read().expect("lock poisoned").keys().filter(|k| k.starts_with(prefix)).cloned().collect()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.index.read().expect("lock poisoned").values().map(|e| e.size).sum()
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut s = self.stats.read().expect("lock poisoned").clone();
        s.entry_count = self.index.read().expect("lock poisoned").len();
        s.total_size = self.size();
        s
    }

    pub async fn lease(&self, fp: Fingerprint) -> Result<LeaseGuard> {
        self.leases.acquire(fp).await
    }

    /// Returns the keys that would be (or were) evicted. With
    /// `policy.dry_run` set, nothing is actually removed.
    pub async fn prune(&self, policy: &PrunePolicy) -> Result<Vec<String>> {
        let entries: Vec<Entry> = self.index.read().expect("lock poisoned").values().cloned().collect();
        let counts = self.access_counts.read().expect("lock poisoned").clone();
        let victims = prune::select_for_eviction(&entries, policy, Utc::now(), &counts);

        if !policy.dry_run {
            for key in &victims {
                self.index.write().expect("lock poisoned").remove(key);
                let _ = tokio::fs::remove_file(self.blob_path(key)).await;
            }
        }
        Ok(victims)
    }

    /// Writes every entry's blob plus a manifest describing them to
    /// `dest_dir`. Export is idempotent: re-exporting the same entries
    /// overwrites identical bytes in place.
    pub async fn export(&self, dest_dir: &Utf8Path, backend: Backend) -> Result<CacheManifest> {
        tokio::fs::create_dir_all(dest_dir).await.map_err(io_err)?;
        let mut manifest = CacheManifest::new(backend, Utc::now());

        let entries: Vec<Entry> = self.index.read().expect("lock poisoned").values().cloned().collect();
        for entry in entries {
            let bytes = tokio::fs::read(self.blob_path(&entry.key)).await.map_err(io_err)?;
            tokio::fs::write(dest_dir.join(&entry.key), &bytes).await.map_err(io_err)?;
            manifest.entries.push(ManifestEntry {
                key: entry.key.clone(),
                size: entry.size,
                checksum: format!("sha256:{}", checksum(&bytes)),
                created_at: entry.created_at,
                metadata: serde_json::Map::new(),
            });
        }

        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| BuildError::new(ErrorKind::Cache, format!("failed to serialize manifest: {e}")))?;
        tokio::fs::write(dest_dir.join("manifest.json"), manifest_json).await.map_err(io_err)?;
        Ok(manifest)
    }

    pub async fn import(&self, src_dir: &Utf8Path, mode: ImportMode) -> Result<usize> {
        let manifest_bytes = tokio::fs::read(src_dir.join("manifest.json")).await.map_err(io_err)?;
        let manifest: CacheManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| BuildError::new(ErrorKind::Cache, format!("failed to parse manifest: {e}")))?;

        let mut imported = 0;
        for entry in manifest.entries {
            let exists = self.index.read().expect("lock poisoned").contains_key(&entry.key);
            if exists && mode == ImportMode::Refuse {
                return Err(BuildError::new(ErrorKind::Cache, format!("entry {} already exists", entry.key)));
            }
            let bytes = tokio::fs::read(src_dir.join(&entry.key)).await.map_err(io_err)?;
            if checksum(&bytes) != entry.key && format!("sha256:{}", checksum(&bytes)) != entry.checksum {
                return Err(BuildError::new(ErrorKind::Cache, format!("checksum mismatch for {}", entry.key)));
            }
            let now = Utc::now();
            self.put(
                parse_fp(&entry.key)?,
                &bytes,
                Entry {
                    key: entry.key.clone(),
                    size: entry.size,
                    created_at: entry.created_at,
                    last_access: now,
                    expiry: None,
                    content_type: "application/octet-stream".to_owned(),
                    compression: CompressionKind::None,
                    platform: None,
                    layer_digest: None,
                    content_checksum: checksum(&bytes),
                },
            )
            .await?;
            imported += 1;
        }
        Ok(imported)
    }
}

fn parse_fp(hex: &str) -> Result<Fingerprint> {
    Fingerprint::from_hex(hex).ok_or_else(|| BuildError::new(ErrorKind::Cache, format!("invalid fingerprint {hex:?}")))
}

#[must_use]
fn checksum(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

fn io_err(e: std::io::Error) -> BuildError {
    BuildError::new(ErrorKind::Cache, format!("cache I/O failed: {e}")).with_cause(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(seed: &str) -> Fingerprint {
        let mut g = crate::llb::Graph::new();
        let id = g.push(crate::llb::LlbNode::Source { image_ref: seed.into(), platform: None }, None);
        crate::llb::Fingerprinter::new(&g).fingerprint(id)
    }

    fn blank_entry() -> Entry {
        let now = Utc::now();
        Entry {
            key: String::new(),
            size: 0,
            created_at: now,
            last_access: now,
            expiry: None,
            content_type: "application/octet-stream".to_owned(),
            compression: CompressionKind::None,
            platform: None,
            layer_digest: None,
            content_checksum: String::new(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()).await.unwrap();
        let f = fp("alpine:3.18");
        cache.put(f, b"hello", blank_entry()).await.unwrap();
        let (entry, bytes) = cache.get(f).await.unwrap().unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(entry.size, 5);
    }

    #[tokio::test]
    async fn miss_on_unknown_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()).await.unwrap();
        assert!(cache.get(fp("nothing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_blob_is_treated_as_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()).await.unwrap();
        let f = fp("alpine:3.18");
        cache.put(f, b"hello", blank_entry()).await.unwrap();
        tokio::fs::write(cache.blob_path(&f.to_hex()), b"corrupted").await.unwrap();

        assert!(cache.get(f).await.unwrap().is_none());
        assert!(cache.list(&f.to_hex()).is_empty());
    }

    #[tokio::test]
    async fn export_then_import_round_trips_into_a_fresh_cache() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = Cache::open(Utf8PathBuf::from_path_buf(src_dir.path().to_path_buf()).unwrap()).await.unwrap();
        let f = fp("alpine:3.18");
        src.put(f, b"hello", blank_entry()).await.unwrap();

        let export_dir = tempfile::tempdir().unwrap();
        let export_path = Utf8PathBuf::from_path_buf(export_dir.path().to_path_buf()).unwrap();
        src.export(&export_path, Backend::LocalDir).await.unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dst = Cache::open(Utf8PathBuf::from_path_buf(dst_dir.path().to_path_buf()).unwrap()).await.unwrap();
        let imported = dst.import(&export_path, ImportMode::Refuse).await.unwrap();
        assert_eq!(imported, 1);
        assert_eq!(dst.get(f).await.unwrap().unwrap().1, b"hello");
    }
}
