//! The crate's top-level entry point: wires the Dockerfile front end, the
//! LLB lowerer, the solver, and the layer assembler into a single
//! `build()` call, and owns the resources a build needs — a `Cache`, an
//! `Executor` handle, and the per-build temp roots `ContextProvider`
//! allocates.
//!
//! Per the design notes' call to drop process-wide controller state: there
//! is no global registry here. A `Builder` is a value a caller constructs,
//! uses for one or many builds, and drops; dropping flushes nothing beyond
//! what the OS already guarantees (the `Cache`'s writes are durable as of
//! `put()` returning) and removes nothing the `Cache` itself doesn't own —
//! temp roots are scoped to each build's `ContextProvider`, not to the
//! `Builder`, since a long-lived `Builder` must outlive any single build's
//! scratch directory.

use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};

use crate::cache::{Cache, CompressionKind};
use crate::cancel::CancelToken;
use crate::context::{ContextProvider, ContextSource, HttpFetcher};
use crate::dockerfile::{parse_dockerfile, BuildArgs};
use crate::error::{BuildError, BuildFailure, ErrorKind, Result};
use crate::executor::Executor;
use crate::layer::{build_config, build_manifest, ImageConfigFile, ImageManifest};
use crate::llb::{lower, LowerOptions};
use crate::options::BuildOptions;
use crate::progress::Bus;
use crate::reference::Digest;
use crate::retry::RetryPolicy;
use crate::solver::{solve, SolveOptions};

use sha2::{Digest as _, Sha256};

/// Everything a finished build hands back: the two digests downstream
/// consumers key off of (image id = config digest, image digest = manifest
/// digest), the rendered bytes for both, cache hit/miss counters for this
/// build, and the platform the manifest was built for.
pub struct BuildResult {
    pub image_id: Digest,
    pub image_digest: Digest,
    pub manifest: ImageManifest,
    pub manifest_bytes: Vec<u8>,
    pub config: ImageConfigFile,
    pub config_bytes: Vec<u8>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Owns a `Cache` and an `Executor` handle; constructed once and reused
/// across builds so the cache's in-memory index and lease table persist
/// between them.
pub struct Builder {
    cache: Cache,
    executor: Arc<dyn Executor>,
    bus: Bus,
    worker_count: usize,
    compression: CompressionKind,
    epoch: DateTime<Utc>,
    retry: RetryPolicy,
    default_platform: (String, String),
}

impl Builder {
    /// Opens (or creates) the on-disk cache rooted at `cache_root` and
    /// binds it to `executor`. `HOME`-relative default cache roots are the
    /// embedding CLI's concern (§6); this constructor takes an already
    /// resolved root.
    pub async fn open(cache_root: impl Into<Utf8PathBuf>, executor: Arc<dyn Executor>) -> Result<Self> {
        let cache = Cache::open(cache_root).await?;
        Ok(Self {
            cache,
            executor,
            bus: Bus::new(),
            worker_count: std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(4),
            compression: CompressionKind::Gzip,
            epoch: DateTime::<Utc>::from_timestamp(0, 0).expect("epoch zero is valid"),
            retry: RetryPolicy::default(),
            default_platform: ("linux".to_owned(), "amd64".to_owned()),
        })
    }

    #[must_use]
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: CompressionKind) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_default_platform(mut self, os: impl Into<String>, arch: impl Into<String>) -> Self {
        self.default_platform = (os.into(), arch.into());
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[must_use]
    pub fn progress(&self) -> &Bus {
        &self.bus
    }

    /// Runs the whole pipeline: parse, lower, solve, assemble. `dockerfile`
    /// is the raw Dockerfile text; `context` is already-prepared build
    /// context (`None` is valid only when every instruction the target
    /// stage reaches is context-free). Returns `BuildFailure` aggregating
    /// every independent leaf error per the propagation policy.
    pub async fn build(
        &self,
        dockerfile: &str,
        opts: &BuildOptions,
        context: Option<&ContextProvider>,
        http_fetcher: Option<&dyn HttpFetcher>,
        cancel: CancelToken,
    ) -> std::result::Result<BuildResult, BuildFailure> {
        let build_args = opts.build_args.clone();
        let parser_build_args: BuildArgs = build_args.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let ast = parse_dockerfile(dockerfile, &parser_build_args).map_err(single)?;

        let lower_opts = LowerOptions {
            target: opts.target.clone(),
            build_args,
            labels: opts.labels.clone(),
            platforms: opts.platforms.clone(),
            no_cache: opts.no_cache,
            context_id: "context".to_owned(),
            default_shell: vec!["/bin/sh".to_owned(), "-c".to_owned()],
        };
        let lowered = lower(&ast, &lower_opts).map_err(single)?;

        let solve_opts = SolveOptions {
            worker_count: self.worker_count,
            compression: self.compression,
            epoch: self.epoch,
            no_cache: opts.no_cache,
            retry: self.retry.clone(),
        };

        let before = self.cache.stats();
        let output = solve(
            &lowered.graph,
            lowered.export_node,
            &self.cache,
            self.executor.as_ref(),
            context,
            http_fetcher,
            &self.bus,
            &solve_opts,
            cancel,
        )
        .await?;
        let after = self.cache.stats();

        let platform = opts
            .platforms
            .first()
            .and_then(|p| p.split_once('/'))
            .map_or_else(|| self.default_platform.clone(), |(os, arch)| (os.to_owned(), arch.to_owned()));

        let layers: Vec<crate::layer::LayerDescriptor> =
            output.layers.iter().map(|l| clone_layer(l)).collect();
        let created = Utc::now();
        let config = build_config(&lowered.config, &layers, (platform.0.as_str(), platform.1.as_str()), created);
        let config_bytes = serde_json::to_vec_pretty(&config)
            .map_err(|e| single_err(BuildError::new(ErrorKind::Configuration, format!("failed to serialize image config: {e}"))))?;
        let config_digest = format!("sha256:{}", hex_sha256(&config_bytes));

        let manifest = build_manifest(&config_digest, config_bytes.len() as u64, &layers);
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| single_err(BuildError::new(ErrorKind::Configuration, format!("failed to serialize manifest: {e}"))))?;
        let manifest_digest = format!("sha256:{}", hex_sha256(&manifest_bytes));

        Ok(BuildResult {
            image_id: Digest::from_bytes(config_digest).expect("sha256 digest is well-formed"),
            image_digest: Digest::from_bytes(manifest_digest).expect("sha256 digest is well-formed"),
            manifest,
            manifest_bytes,
            config,
            config_bytes,
            cache_hits: after.hits.saturating_sub(before.hits),
            cache_misses: after.misses.saturating_sub(before.misses),
        })
    }

    /// Prepares a build context from `source`, scoping any temp directory
    /// it allocates to the returned `ContextProvider`'s lifetime.
    pub async fn prepare_context(&self, source: ContextSource<'_>) -> Result<ContextProvider> {
        crate::context::prepare(source).await
    }
}

fn clone_layer(l: &crate::layer::LayerDescriptor) -> crate::layer::LayerDescriptor {
    crate::layer::LayerDescriptor {
        diff_id: l.diff_id.clone(),
        digest: l.digest.clone(),
        size: l.size,
        media_type: l.media_type.clone(),
        compression: l.compression,
    }
}

fn single(err: BuildError) -> BuildFailure {
    BuildFailure::from_many(vec![err]).expect("one element never empties the vec")
}

fn single_err(err: BuildError) -> BuildFailure {
    single(err)
}

fn hex_sha256(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::executor::{ProducedDiff, Step, StepResult};

    use super::*;

    struct EchoExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn run(&self, step: Step, _cancel: CancelToken) -> Result<StepResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut builder = tar::Builder::new(Vec::new());
            let data = step.command.join(" ").into_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "f", &data[..]).unwrap();
            let tar_bytes = builder.into_inner().unwrap();
            Ok(StepResult { exit_code: 0, stdout: vec![], stderr: vec![], duration: Duration::from_millis(1), produced_diff: ProducedDiff { tar_bytes } })
        }
    }

    #[tokio::test]
    async fn end_to_end_single_stage_build_is_a_full_hit_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let executor = Arc::new(EchoExecutor { calls: AtomicU32::new(0) });
        let builder = Builder::open(root, executor.clone()).await.unwrap();
        let opts = BuildOptions::default();

        let result1 = builder
            .build("FROM alpine:3.18\nRUN echo hello > /f\n", &opts, None, None, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result1.manifest.layers.len(), 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let result2 = builder
            .build("FROM alpine:3.18\nRUN echo hello > /f\n", &opts, None, None, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result2.image_digest, result1.image_digest);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1, "second build must be served entirely from cache");
        assert_eq!(result2.cache_hits, 2, "Source and Exec nodes both hit");
    }

    #[tokio::test]
    async fn multi_stage_target_excludes_unreached_stage_effects() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let executor = Arc::new(EchoExecutor { calls: AtomicU32::new(0) });
        let builder = Builder::open(root, executor).await.unwrap();
        let src = "FROM alpine:3.18 AS a\nRUN touch /a\nFROM alpine:3.18 AS b\nCOPY --from=a /a /a\n";
        let opts = BuildOptions::builder().target("a").build();

        let result = builder.build(src, &opts, None, None, CancelToken::new()).await.unwrap();
        assert_eq!(result.manifest.layers.len(), 1);
    }

    #[tokio::test]
    async fn build_arg_affects_only_consuming_node() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let executor = Arc::new(EchoExecutor { calls: AtomicU32::new(0) });
        let builder = Builder::open(root, executor.clone()).await.unwrap();
        let src = "FROM alpine:3.18\nARG V=1\nRUN echo $V > /v\nRUN echo x > /x\n";

        let opts_a = BuildOptions::builder().build_arg("V", "1").build();
        builder.build(src, &opts_a, None, None, CancelToken::new()).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);

        let opts_b = BuildOptions::builder().build_arg("V", "2").build();
        builder.build(src, &opts_b, None, None, CancelToken::new()).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3, "only the /v Exec should miss and re-execute");
    }
}
