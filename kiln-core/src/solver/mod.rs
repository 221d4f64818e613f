//! The scheduler: walks the lowered graph in dependency order, probing the
//! cache before leasing and executing, applying `FileOp`s in-process, and
//! fanning progress out over the [`Bus`]. Independent branches run
//! concurrently bounded by a worker semaphore; a node's failure only fails
//! its dependents, while unrelated siblings run to completion so every
//! independent error surfaces in one [`BuildFailure`].
//!
//! State machine per node, matching the component design: `Pending → Ready
//! → (Probing → Hit | Missing → Leased → Executing → Produced) | Failed`.
//! `Source`/`Local`/`Merge` nodes carry no cacheable artifact of their own
//! and resolve directly to `Produced` once their inputs are ready.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use sha2::{Digest as _, Sha256};
use tokio::sync::Semaphore;

use crate::cache::{Cache, CompressionKind, Entry};
use crate::cancel::CancelToken;
use crate::context::{ContextProvider, HttpFetcher};
use crate::dockerfile::Mount;
use crate::error::{BuildError, BuildFailure, ErrorKind, Result};
use crate::executor::{Executor, Step};
use crate::layer::{assemble, LayerDescriptor};
use crate::llb::{FileOpAction, FileOpSource, Fingerprint, Fingerprinter, Graph, LlbNode, NodeId};
use crate::progress::{Bus, Event, Status};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone)]
pub struct SolveOptions {
    pub worker_count: usize,
    pub compression: CompressionKind,
    pub epoch: DateTime<Utc>,
    pub no_cache: bool,
    pub retry: RetryPolicy,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            compression: CompressionKind::Gzip,
            epoch: DateTime::<Utc>::from_timestamp(0, 0).expect("epoch zero is valid"),
            no_cache: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// One node's settled artifact. Bytes are empty for structural nodes
/// (`Source`/`Local`/`Merge`) that don't themselves produce a layer.
#[derive(Clone, Default)]
struct NodeOutcome {
    bytes: Arc<Vec<u8>>,
    layer: Option<Arc<LayerDescriptor>>,
}

#[derive(Debug)]
pub struct SolveOutput {
    /// Layers in topological (bottom-up) order, ready to write as OCI blobs.
    pub layers: Vec<Arc<LayerDescriptor>>,
    /// The export node's own artifact bytes.
    pub export_bytes: Arc<Vec<u8>>,
}

struct SolverCtx<'a> {
    graph: &'a Graph,
    cache: &'a Cache,
    executor: &'a dyn Executor,
    context: Option<&'a ContextProvider>,
    http_fetcher: Option<&'a dyn HttpFetcher>,
    bus: &'a Bus,
    opts: &'a SolveOptions,
    cancel: CancelToken,
    fingerprinter: Mutex<Fingerprinter<'a>>,
    semaphore: Semaphore,
}

/// Solves `graph` down to `export`, invoking `executor` for `Exec` nodes and
/// resolving `FileOp` nodes in-process. `context` is required when any
/// `FileOp` copies from the build context; `http_fetcher` is required when
/// any `ADD` names a URL.
#[allow(clippy::too_many_arguments)]
pub async fn solve<'a>(
    graph: &'a Graph,
    export: NodeId,
    cache: &'a Cache,
    executor: &'a dyn Executor,
    context: Option<&'a ContextProvider>,
    http_fetcher: Option<&'a dyn HttpFetcher>,
    bus: &'a Bus,
    opts: &'a SolveOptions,
    cancel: CancelToken,
) -> std::result::Result<SolveOutput, BuildFailure> {
    let ctx = SolverCtx {
        graph,
        cache,
        executor,
        context,
        http_fetcher,
        bus,
        opts,
        cancel,
        fingerprinter: Mutex::new(match context {
            Some(provider) => Fingerprinter::with_context(graph, provider),
            None => Fingerprinter::new(graph),
        }),
        semaphore: Semaphore::new(opts.worker_count.max(1)),
    };

    let order = graph.topo_order_from(export);
    let dependents = build_dependents(graph, &order);
    let mut pending_inputs: HashMap<NodeId, usize> =
        order.iter().map(|id| (*id, graph.get(*id).inputs().len())).collect();

    let mut completed: HashMap<NodeId, NodeOutcome> = HashMap::new();
    let mut failed: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
    let mut errors: Vec<BuildError> = Vec::new();

    let mut in_flight = FuturesUnordered::new();
    for &id in order.iter().filter(|id| pending_inputs[*id] == 0) {
        in_flight.push(attempt(&ctx, id, Vec::new()));
    }

    while let Some((id, result)) = in_flight.next().await {
        match result {
            Ok(outcome) => {
                completed.insert(id, outcome);
            }
            Err(e) => {
                errors.push(e);
                failed.insert(id);
            }
        }

        for &dep in dependents.get(&id).into_iter().flatten() {
            if failed.contains(&dep) || completed.contains_key(&dep) {
                continue;
            }
            *pending_inputs.get_mut(&dep).expect("every node is tracked") -= 1;

            let any_input_failed = graph.get(dep).inputs().iter().any(|i| failed.contains(i));
            if any_input_failed {
                failed.insert(dep);
                propagate_failure(&dependents, dep, &mut failed);
                continue;
            }
            if pending_inputs[&dep] == 0 {
                let dep_inputs: Vec<NodeOutcome> =
                    graph.get(dep).inputs().iter().map(|i| completed[i].clone()).collect();
                in_flight.push(attempt(&ctx, dep, dep_inputs));
            }
        }
    }

    if let Some(failure) = BuildFailure::from_many(errors) {
        return Err(failure);
    }

    let layers = order
        .iter()
        .filter_map(|id| completed.get(id))
        .filter_map(|outcome| outcome.layer.clone())
        .collect();
    let export_bytes = completed.get(&export).expect("export always completes when there are no errors").bytes.clone();
    Ok(SolveOutput { layers, export_bytes })
}

fn build_dependents(graph: &Graph, order: &[NodeId]) -> HashMap<NodeId, Vec<NodeId>> {
    let mut map: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for &id in order {
        for input in graph.get(id).inputs() {
            map.entry(input).or_default().push(id);
        }
    }
    map
}

/// Marks every transitive dependent of an already-failed node as failed,
/// without scheduling them — they can never succeed once an ancestor has.
fn propagate_failure(dependents: &HashMap<NodeId, Vec<NodeId>>, id: NodeId, failed: &mut std::collections::HashSet<NodeId>) {
    let mut stack = vec![id];
    while let Some(cur) = stack.pop() {
        for &dep in dependents.get(&cur).into_iter().flatten() {
            if failed.insert(dep) {
                stack.push(dep);
            }
        }
    }
}

async fn attempt(ctx: &SolverCtx<'_>, id: NodeId, inputs: Vec<NodeOutcome>) -> (NodeId, Result<NodeOutcome>) {
    let result = run_node(ctx, id, &inputs).await;
    (id, result)
}

async fn run_node(ctx: &SolverCtx<'_>, id: NodeId, inputs: &[NodeOutcome]) -> Result<NodeOutcome> {
    if ctx.cancel.is_cancelled() {
        return Err(BuildError::cancelled());
    }
    match ctx.graph.get(id) {
        LlbNode::Source { .. } | LlbNode::Local { .. } => Ok(NodeOutcome::default()),
        LlbNode::Merge { .. } => {
            let bytes = inputs.last().map_or_else(Arc::default, |o| Arc::clone(&o.bytes));
            Ok(NodeOutcome { bytes, layer: None })
        }
        node @ LlbNode::Exec { .. } => exec_node(ctx, id, node).await,
        node @ LlbNode::FileOp { .. } => file_op_node(ctx, id, node, inputs).await,
    }
}

async fn exec_node(ctx: &SolverCtx<'_>, id: NodeId, node: &LlbNode) -> Result<NodeOutcome> {
    let LlbNode::Exec { command, env, cwd, user, network, security, mounts, .. } = node else {
        unreachable!("exec_node called on a non-Exec node")
    };
    let command = command.clone();
    let env = env.clone();
    let cwd = cwd.clone();
    let user = user.clone();
    let network = network.clone();
    let security = security.clone();
    let step_mounts: Vec<Mount> = mounts.iter().map(|m| m.kind.clone()).collect();
    let platform = ctx.graph.platform(id).map(str::to_owned);

    cached_or_compute(ctx, id, move || async move {
        let step = Step { command, env, cwd, user, mounts: step_mounts, platform, network_mode: network, security_mode: security };
        let cancel = ctx.cancel.clone();
        with_retry(&ctx.opts.retry, move || {
            let step = step.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = ctx
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| BuildError::new(ErrorKind::Execution, "worker pool is closed"))?;
                let result = ctx.executor.run(step, cancel).await?;
                Ok(result.produced_diff.tar_bytes)
            }
        })
        .await
    })
    .await
}

async fn file_op_node(ctx: &SolverCtx<'_>, id: NodeId, node: &LlbNode, inputs: &[NodeOutcome]) -> Result<NodeOutcome> {
    let LlbNode::FileOp { action, source, dst_path, chown, chmod, .. } = node else {
        unreachable!("file_op_node called on a non-FileOp node")
    };
    let action = action.clone();
    let source = source.clone();
    let dst_path = dst_path.clone();
    let chown = chown.clone();
    let chmod = chmod.clone();
    let node_source_bytes = inputs.get(1).map(|o| Arc::clone(&o.bytes));
    let context = ctx.context;
    let http_fetcher = ctx.http_fetcher;

    cached_or_compute(ctx, id, move || async move {
        build_file_op_tar(&action, &source, &dst_path, chown.as_deref(), chmod.as_deref(), node_source_bytes, context, http_fetcher).await
    })
    .await
}

/// Probes the cache, leasing and computing on a miss (double-checking the
/// cache after the lease, since a peer may have populated it while we
/// waited), then assembles and stores the result.
async fn cached_or_compute<F, Fut>(ctx: &SolverCtx<'_>, id: NodeId, compute: F) -> Result<NodeOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
{
    let fp = ctx.fingerprinter.lock().expect("lock poisoned").fingerprint(id);
    emit(ctx, id, Status::Started);

    if !ctx.opts.no_cache {
        if let Some(outcome) = try_cache_hit(ctx, id, fp).await? {
            return Ok(outcome);
        }
    }

    let guard = ctx.cache.lease(fp).await?;
    if !ctx.opts.no_cache {
        if let Some(outcome) = try_cache_hit(ctx, id, fp).await? {
            drop(guard);
            return Ok(outcome);
        }
    }
    if ctx.cancel.is_cancelled() {
        return Err(BuildError::cancelled());
    }

    let raw = match compute().await {
        Ok(bytes) => bytes,
        Err(e) => {
            emit_error(ctx, id, &e);
            return Err(e);
        }
    };

    let (descriptor, compressed) = assemble(&raw, ctx.opts.compression, ctx.opts.epoch)?;
    let now = Utc::now();
    let entry = Entry {
        key: String::new(),
        size: 0,
        created_at: now,
        last_access: now,
        expiry: None,
        content_type: descriptor.media_type.clone(),
        compression: descriptor.compression,
        platform: ctx.graph.platform(id).map(str::to_owned),
        layer_digest: Some(descriptor.diff_id.clone()),
        content_checksum: String::new(),
    };
    ctx.cache.put(fp, &compressed, entry).await?;
    drop(guard);
    emit(ctx, id, Status::Completed);
    Ok(NodeOutcome { bytes: Arc::new(compressed), layer: Some(Arc::new(descriptor)) })
}

async fn try_cache_hit(ctx: &SolverCtx<'_>, id: NodeId, fp: Fingerprint) -> Result<Option<NodeOutcome>> {
    let Some((entry, bytes)) = ctx.cache.get(fp).await? else { return Ok(None) };
    emit(ctx, id, Status::Completed);
    let digest = format!("sha256:{}", hex_sha256(&bytes));
    let layer = LayerDescriptor {
        diff_id: entry.layer_digest.clone().unwrap_or_else(|| digest.clone()),
        digest,
        size: entry.size,
        media_type: entry.content_type.clone(),
        compression: entry.compression,
    };
    Ok(Some(NodeOutcome { bytes: Arc::new(bytes), layer: Some(Arc::new(layer)) }))
}

fn emit(ctx: &SolverCtx<'_>, id: NodeId, status: Status) {
    let name = ctx.graph.get(id).kind_tag().to_owned();
    ctx.bus.publish(Event::new(format!("node-{}", id.0), name, status, Utc::now()));
}

fn emit_error(ctx: &SolverCtx<'_>, id: NodeId, err: &BuildError) {
    let name = ctx.graph.get(id).kind_tag().to_owned();
    let mut event = Event::new(format!("node-{}", id.0), name, Status::Error, Utc::now());
    event.error = Some(err.to_string());
    ctx.bus.publish(event);
}

fn hex_sha256(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

/// Builds one `FileOp`'s raw (pre-canonicalization) tar diff, in-process.
/// Copying out of another stage's already-produced diff can't re-target a
/// single path without filesystem emulation this crate leaves to the
/// concrete executor/snapshotter, so a `Node` source is passed through
/// whole rather than re-packaged under `dst_path`.
async fn build_file_op_tar(
    action: &FileOpAction,
    source: &FileOpSource,
    dst_path: &str,
    chown: Option<&str>,
    chmod: Option<&str>,
    node_source_bytes: Option<Arc<Vec<u8>>>,
    context: Option<&ContextProvider>,
    http_fetcher: Option<&dyn HttpFetcher>,
) -> Result<Vec<u8>> {
    let _ = chown; // ownership mapping applies once a real rootfs exists to chown within
    let mode = chmod.and_then(|m| u32::from_str_radix(m, 8).ok()).unwrap_or(0o644);
    let mut builder = tar::Builder::new(Vec::new());

    match action {
        FileOpAction::Mkdir => append_dir(&mut builder, dst_path, mode)?,
        FileOpAction::Rm => append_whiteout(&mut builder, dst_path)?,
        FileOpAction::Copy => match source {
            FileOpSource::Context { path, .. } => {
                let provider = context
                    .ok_or_else(|| BuildError::new(ErrorKind::Context, "COPY from context requires a prepared build context"))?;
                append_context_path(&mut builder, provider, path, dst_path, mode)?;
            }
            FileOpSource::Node(_) => {
                let bytes = node_source_bytes
                    .ok_or_else(|| BuildError::new(ErrorKind::Execution, "COPY --from stage produced no diff to copy"))?;
                return Ok((*bytes).clone());
            }
            FileOpSource::Url(_) => return Err(BuildError::new(ErrorKind::Validation, "COPY does not support URL sources")),
        },
        FileOpAction::Add => match source {
            FileOpSource::Context { path, .. } => {
                let provider = context
                    .ok_or_else(|| BuildError::new(ErrorKind::Context, "ADD from context requires a prepared build context"))?;
                append_context_path(&mut builder, provider, path, dst_path, mode)?;
            }
            FileOpSource::Url(url) => {
                let fetcher = http_fetcher.ok_or_else(|| BuildError::new(ErrorKind::Configuration, "ADD <url> requires an HttpFetcher"))?;
                let (_content_type, bytes) = fetcher.fetch(url).await?;
                append_bytes(&mut builder, dst_path, &bytes, mode)?;
            }
            FileOpSource::Node(_) => return Err(BuildError::new(ErrorKind::Validation, "ADD does not support stage sources")),
        },
    }

    builder.into_inner().map_err(tar_io_err)
}

fn append_context_path(builder: &mut tar::Builder<Vec<u8>>, provider: &ContextProvider, src_path: &str, dst_path: &str, mode: u32) -> Result<()> {
    let abs = provider.root().join(src_path.trim_start_matches('/'));
    let meta = std::fs::metadata(abs.as_std_path())
        .map_err(|e| BuildError::new(ErrorKind::Context, format!("source {src_path:?} not found in build context: {e}")))?;
    if meta.is_dir() {
        append_dir_recursive(builder, abs.as_std_path(), dst_path, mode)
    } else {
        let bytes = std::fs::read(abs.as_std_path()).map_err(tar_io_err)?;
        append_bytes(builder, dst_path, &bytes, mode)
    }
}

fn append_dir_recursive(builder: &mut tar::Builder<Vec<u8>>, dir: &std::path::Path, dst_prefix: &str, mode: u32) -> Result<()> {
    append_dir(builder, dst_prefix, mode)?;
    let mut entries: Vec<_> = std::fs::read_dir(dir).map_err(tar_io_err)?.filter_map(std::result::Result::ok).collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let child_dst = format!("{}/{name}", dst_prefix.trim_end_matches('/'));
        let path = entry.path();
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            append_dir_recursive(builder, &path, &child_dst, mode)?;
        } else {
            let bytes = std::fs::read(&path).map_err(tar_io_err)?;
            append_bytes(builder, &child_dst, &bytes, mode)?;
        }
    }
    Ok(())
}

fn append_bytes(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8], mode: u32) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder.append_data(&mut header, path.trim_start_matches('/'), data).map_err(tar_io_err)
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, path: &str, mode: u32) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(mode | 0o111);
    header.set_cksum();
    builder.append_data(&mut header, format!("{}/", path.trim_matches('/')), &b""[..]).map_err(tar_io_err)
}

/// An OCI whiteout entry (`.wh.<name>`) recording a deletion relative to
/// the parent layer, rather than touching it.
fn append_whiteout(builder: &mut tar::Builder<Vec<u8>>, path: &str) -> Result<()> {
    let trimmed = path.trim_matches('/');
    let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
    let whiteout_path = if parent.is_empty() { format!(".wh.{name}") } else { format!("{parent}/.wh.{name}") };
    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, whiteout_path, &b""[..]).map_err(tar_io_err)
}

fn tar_io_err(e: std::io::Error) -> BuildError {
    BuildError::new(ErrorKind::Execution, format!("file-op tar assembly failed: {e}")).with_cause(e)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use camino::Utf8PathBuf;

    use crate::context::{prepare, ContextSource};
    use crate::dockerfile::{parse_dockerfile, BuildArgs};
    use crate::executor::{ProducedDiff, StepResult};
    use crate::llb::{lower, LowerOptions};

    use super::*;

    fn make_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, *path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    struct EchoExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn run(&self, step: Step, _cancel: CancelToken) -> Result<StepResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let tar_bytes = make_tar(&[("out", step.command.join(" ").as_bytes())]);
            Ok(StepResult { exit_code: 0, stdout: vec![], stderr: vec![], duration: Duration::from_millis(1), produced_diff: ProducedDiff { tar_bytes } })
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl Executor for FailingExecutor {
        async fn run(&self, step: Step, _cancel: CancelToken) -> Result<StepResult> {
            if step.command.iter().any(|s| s == "boom") {
                return Err(BuildError::new(ErrorKind::Execution, "boom failed"));
            }
            let tar_bytes = make_tar(&[("ok", b"")]);
            Ok(StepResult { exit_code: 0, stdout: vec![], stderr: vec![], duration: Duration::from_millis(1), produced_diff: ProducedDiff { tar_bytes } })
        }
    }

    async fn open_cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()).await.unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn single_exec_node_executes_then_hits_cache_on_rerun() {
        let ast = parse_dockerfile("FROM alpine:3.18\nRUN echo hi\n", &BuildArgs::new()).unwrap();
        let lowered = lower(&ast, &LowerOptions::default()).unwrap();
        let (_dir, cache) = open_cache().await;
        let executor = EchoExecutor { calls: AtomicU32::new(0) };
        let bus = Bus::new();
        let opts = SolveOptions::default();

        let out1 = solve(&lowered.graph, lowered.export_node, &cache, &executor, None, None, &bus, &opts, CancelToken::new()).await.unwrap();
        assert_eq!(out1.layers.len(), 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let out2 = solve(&lowered.graph, lowered.export_node, &cache, &executor, None, None, &bus, &opts, CancelToken::new()).await.unwrap();
        assert_eq!(out2.layers.len(), 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1, "second solve should be served entirely from cache");
    }

    #[tokio::test]
    async fn independent_stage_failure_does_not_block_siblings() {
        let src = "FROM alpine:3.18 AS a\nRUN boom\nFROM alpine:3.18 AS b\nRUN ok\nFROM alpine:3.18 AS c\nCOPY --from=a /x /x\nCOPY --from=b /y /y\n";
        let ast = parse_dockerfile(src, &BuildArgs::new()).unwrap();
        let lowered = lower(&ast, &LowerOptions::default()).unwrap();
        let (_dir, cache) = open_cache().await;
        let executor = FailingExecutor;
        let bus = Bus::new();
        let opts = SolveOptions::default();

        let err = solve(&lowered.graph, lowered.export_node, &cache, &executor, None, None, &bus, &opts, CancelToken::new()).await.unwrap_err();
        assert_eq!(err.primary.kind, ErrorKind::Execution);
    }

    #[tokio::test]
    async fn copy_from_context_embeds_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.txt"), b"payload").unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let provider = prepare(ContextSource::Local { root }).await.unwrap();

        let ast = parse_dockerfile("FROM alpine:3.18\nCOPY app.txt /app.txt\n", &BuildArgs::new()).unwrap();
        let lowered = lower(&ast, &LowerOptions::default()).unwrap();
        let (_dir2, cache) = open_cache().await;
        let executor = EchoExecutor { calls: AtomicU32::new(0) };
        let bus = Bus::new();
        let opts = SolveOptions::default();

        let out = solve(&lowered.graph, lowered.export_node, &cache, &executor, Some(&provider), None, &bus, &opts, CancelToken::new()).await.unwrap();
        assert_eq!(out.layers.len(), 1);
        assert!(!out.export_bytes.is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0, "COPY never calls the executor");
    }

    #[tokio::test]
    async fn no_cache_forces_reexecution() {
        let ast = parse_dockerfile("FROM alpine:3.18\nRUN echo hi\n", &BuildArgs::new()).unwrap();
        let lowered = lower(&ast, &LowerOptions::default()).unwrap();
        let (_dir, cache) = open_cache().await;
        let executor = EchoExecutor { calls: AtomicU32::new(0) };
        let bus = Bus::new();
        let opts = SolveOptions { no_cache: true, ..SolveOptions::default() };

        solve(&lowered.graph, lowered.export_node, &cache, &executor, None, None, &bus, &opts, CancelToken::new()).await.unwrap();
        solve(&lowered.graph, lowered.export_node, &cache, &executor, None, None, &bus, &opts, CancelToken::new()).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_fast() {
        let ast = parse_dockerfile("FROM alpine:3.18\nRUN echo hi\n", &BuildArgs::new()).unwrap();
        let lowered = lower(&ast, &LowerOptions::default()).unwrap();
        let (_dir, cache) = open_cache().await;
        let executor = EchoExecutor { calls: AtomicU32::new(0) };
        let bus = Bus::new();
        let opts = SolveOptions::default();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = solve(&lowered.graph, lowered.export_node, &cache, &executor, None, None, &bus, &opts, cancel).await.unwrap_err();
        assert_eq!(err.primary.kind, ErrorKind::Cancelled);
    }
}
