//! Build context acquisition: turns one of several input shapes (a local
//! directory, an uploaded tarball, a downloaded archive, piped Dockerfile
//! content, or a git checkout) into a single rooted file tree that the
//! Parser and FileOp execution read from.
//!
//! Network and VCS transport are external collaborators — this module
//! defines the `HttpFetcher`/`GitFetcher` contracts Http/Git variants
//! consume, the same way `executor` defines `Executor` without implementing
//! it, since neither an HTTP client nor a git binary wrapper is part of
//! this crate's dependency stack.

pub mod ignore;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{BuildError, ErrorKind, Result};

pub use ignore::ExcludeFilter;

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetches `url`, returning its content-type header (if any) and body.
    async fn fetch(&self, url: &str) -> Result<(Option<String>, Vec<u8>)>;
}

#[async_trait]
pub trait GitFetcher: Send + Sync {
    async fn clone_to(&self, url: &str, reference: Option<&str>, dest: &Utf8Path) -> Result<()>;
}

pub enum ContextSource<'a> {
    Local { root: Utf8PathBuf },
    Tar { bytes: Vec<u8> },
    Http { url: String, fetcher: &'a dyn HttpFetcher },
    Stdin { dockerfile: String },
    Git { url: String, reference: Option<String>, subdir: Option<Utf8PathBuf>, fetcher: &'a dyn GitFetcher },
}

/// An on-disk build context: a root directory plus, when the content was
/// materialized rather than pointed-to, the temp directory owning it.
#[derive(Debug)]
pub struct ContextProvider {
    root: Utf8PathBuf,
    _temp: Option<TempRoot>,
}

impl ContextProvider {
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// A lazy, ignore-filtered walk of the context tree, yielding paths
    /// relative to the root.
    pub fn files(&self, excludes: &ExcludeFilter) -> FileIter {
        FileIter { root: self.root.clone(), pending: vec![self.root.clone()], excludes: excludes.clone() }
    }
}

pub async fn prepare(source: ContextSource<'_>) -> Result<ContextProvider> {
    match source {
        ContextSource::Local { root } => Ok(ContextProvider { root, _temp: None }),
        ContextSource::Tar { bytes } => {
            let temp = TempRoot::create().await?;
            extract_tar(&bytes, &temp.path)?;
            Ok(ContextProvider { root: temp.path.clone(), _temp: Some(temp) })
        }
        ContextSource::Http { url, fetcher } => {
            let (content_type, bytes) = fetcher.fetch(&url).await?;
            let temp = TempRoot::create().await?;
            let looks_like_tar = content_type.as_deref().is_some_and(|ct| ct.contains("tar"))
                || url.ends_with(".tar")
                || url.ends_with(".tar.gz")
                || url.ends_with(".tgz");
            if looks_like_tar {
                extract_tar(&bytes, &temp.path)?;
            } else {
                tokio::fs::write(temp.path.join("Dockerfile"), &bytes).await.map_err(io_err)?;
            }
            Ok(ContextProvider { root: temp.path.clone(), _temp: Some(temp) })
        }
        ContextSource::Stdin { dockerfile } => {
            let temp = TempRoot::create().await?;
            tokio::fs::write(temp.path.join("Dockerfile"), dockerfile).await.map_err(io_err)?;
            Ok(ContextProvider { root: temp.path.clone(), _temp: Some(temp) })
        }
        ContextSource::Git { url, reference, subdir, fetcher } => {
            let temp = TempRoot::create().await?;
            fetcher.clone_to(&url, reference.as_deref(), &temp.path).await?;
            let root = match subdir {
                Some(sub) => temp.path.join(sub),
                None => temp.path.clone(),
            };
            Ok(ContextProvider { root, _temp: Some(temp) })
        }
    }
}

fn extract_tar(bytes: &[u8], dest: &Utf8Path) -> Result<()> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));
    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        let path = entry.path().map_err(io_err)?.into_owned();
        if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(BuildError::new(ErrorKind::Context, format!("tar entry escapes context root: {}", path.display())));
        }
        let target = dest.as_std_path().join(&path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        entry.unpack(&target).map_err(io_err)?;
    }
    Ok(())
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct TempRoot {
    path: Utf8PathBuf,
}

impl TempRoot {
    async fn create() -> Result<Self> {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .map_err(|p| BuildError::new(ErrorKind::Context, format!("non-UTF-8 temp dir: {}", p.display())))?
            .join(format!("kiln-ctx-{}-{n}", std::process::id()));
        tokio::fs::create_dir_all(&path).await.map_err(io_err)?;
        Ok(Self { path })
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

fn io_err(e: std::io::Error) -> BuildError {
    BuildError::new(ErrorKind::Context, format!("context I/O failed: {e}")).with_cause(e)
}

#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub relative_path: String,
    pub absolute_path: Utf8PathBuf,
    pub is_dir: bool,
}

/// A depth-first, lazily-expanded walk of the context tree honoring
/// `excludes`: directories that match an exclude are never descended into.
pub struct FileIter {
    root: Utf8PathBuf,
    pending: Vec<Utf8PathBuf>,
    excludes: ExcludeFilter,
}

impl Iterator for FileIter {
    type Item = ContextEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current = self.pending.pop()?;
            let read_dir = std::fs::read_dir(&current).ok()?;
            let mut children: Vec<_> = read_dir.filter_map(|e| e.ok()).collect();
            children.sort_by_key(std::fs::DirEntry::file_name);

            for child in children {
                let Ok(path) = Utf8PathBuf::from_path_buf(child.path()) else { continue };
                let relative = path.strip_prefix(&self.root).unwrap_or(&path).to_string();
                if self.excludes.is_excluded(&relative) {
                    continue;
                }
                let is_dir = child.file_type().is_ok_and(|t| t.is_dir());
                if is_dir {
                    self.pending.push(path.clone());
                }
                return Some(ContextEntry { relative_path: relative, absolute_path: path, is_dir });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_context_lists_files_honoring_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), b"FROM alpine").unwrap();
        std::fs::write(dir.path().join("secret.env"), b"x").unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let provider = prepare(ContextSource::Local { root }).await.unwrap();
        let excludes = ExcludeFilter::new(&["*.env".to_owned()], None);
        let names: Vec<String> = provider.files(&excludes).map(|e| e.relative_path).collect();
        assert!(names.contains(&"Dockerfile".to_owned()));
        assert!(!names.contains(&"secret.env".to_owned()));
    }

    #[tokio::test]
    async fn stdin_context_materializes_a_dockerfile() {
        let provider = prepare(ContextSource::Stdin { dockerfile: "FROM alpine\n".to_owned() }).await.unwrap();
        let content = tokio::fs::read_to_string(provider.root().join("Dockerfile")).await.unwrap();
        assert_eq!(content, "FROM alpine\n");
    }

    #[tokio::test]
    async fn tar_context_rejects_path_traversal() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "../escape", &b"x"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let err = prepare(ContextSource::Tar { bytes }).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Context);
    }
}
