//! Content-addressed node fingerprints.
//!
//! `fp(N) = H(tag(N) || canonical(operands(N)) || fp(I1) || … || fp(Ik))`
//! with `H = SHA-256` and a canonical encoding: sorted map keys, fixed
//! integer width, length-prefixed UTF-8 strings. Build-arg substitution
//! already happened during parsing, so a node's operands are exactly the
//! text it would execute with — a node that never referenced a given
//! build arg has identical operands regardless of that arg's value, and
//! the fingerprint inherits that insensitivity for free.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest as _, Sha256};

use crate::context::{ContextProvider, ExcludeFilter};

use super::node::{ExecMount, FileOpSource, Graph, LlbNode, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    #[must_use]
    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

/// A little encoder implementing the canonical form: every string is
/// length-prefixed, every map is emitted in key-sorted order.
#[derive(Default)]
struct Canonical(Vec<u8>);

impl Canonical {
    fn str(&mut self, s: &str) -> &mut Self {
        self.0.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.0.extend_from_slice(s.as_bytes());
        self
    }

    fn opt_str(&mut self, s: Option<&str>) -> &mut Self {
        match s {
            Some(s) => self.str(s),
            None => self.str(""),
        }
    }

    fn bool(&mut self, b: bool) -> &mut Self {
        self.0.push(u8::from(b));
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn strs<'a>(&mut self, items: impl IntoIterator<Item = &'a str>) -> &mut Self {
        let items: Vec<&str> = items.into_iter().collect();
        self.u32(items.len() as u32);
        for item in items {
            self.str(item);
        }
        self
    }

    fn map(&mut self, map: &BTreeMap<String, String>) -> &mut Self {
        self.u32(map.len() as u32);
        for (k, v) in map {
            self.str(k).str(v);
        }
        self
    }
}

pub struct Fingerprinter<'g> {
    graph: &'g Graph,
    context: Option<&'g ContextProvider>,
    memo: HashMap<NodeId, Fingerprint>,
}

impl<'g> Fingerprinter<'g> {
    #[must_use]
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph, context: None, memo: HashMap::new() }
    }

    /// Like [`Self::new`], but with a build context available so `Local`
    /// and context-sourced `FileOp` nodes can fold the filtered tree's
    /// content into their operand encoding. Without a context, those nodes
    /// fingerprint on their path/filter operands alone — sufficient when no
    /// build context is in play, but a context change can then go
    /// undetected.
    #[must_use]
    pub fn with_context(graph: &'g Graph, context: &'g ContextProvider) -> Self {
        Self { graph, context: Some(context), memo: HashMap::new() }
    }

    pub fn fingerprint(&mut self, id: NodeId) -> Fingerprint {
        if let Some(fp) = self.memo.get(&id) {
            return *fp;
        }
        let inputs: Vec<Fingerprint> =
            self.graph.get(id).fingerprint_inputs(self.graph).iter().map(|i| self.fingerprint(*i)).collect();

        let mut enc = Canonical::default();
        enc.str(self.graph.get(id).kind_tag());
        enc.opt_str(self.graph.platform(id));
        encode_operands(self.graph.get(id), self.context, &mut enc);
        for input_fp in &inputs {
            enc.0.extend_from_slice(&input_fp.0);
        }

        let digest = Sha256::digest(&enc.0);
        let fp = Fingerprint(digest.into());
        self.memo.insert(id, fp);
        fp
    }
}

fn encode_operands(node: &LlbNode, context: Option<&ContextProvider>, enc: &mut Canonical) {
    match node {
        LlbNode::Source { image_ref, .. } => {
            enc.str(image_ref);
        }
        LlbNode::Local { context_id, include, exclude } => {
            enc.str(context_id);
            enc.strs(include.iter().map(String::as_str));
            enc.strs(exclude.iter().map(String::as_str));
            enc.0.extend_from_slice(&merkle_root_of_tree(context, include, exclude));
        }
        LlbNode::Exec { command, env, cwd, user, network, security, mounts, referenced_build_args, .. } => {
            enc.strs(command.iter().map(String::as_str));
            enc.map(env);
            enc.str(cwd);
            enc.opt_str(user.as_deref());
            enc.opt_str(network.as_deref());
            enc.opt_str(security.as_deref());
            encode_mounts(mounts, enc);
            enc.strs(referenced_build_args.iter().map(String::as_str));
        }
        LlbNode::FileOp { action, source, dst_path, chown, chmod, .. } => {
            enc.str(&format!("{action:?}"));
            encode_source(source, context, enc);
            enc.str(dst_path);
            enc.opt_str(chown.as_deref());
            enc.opt_str(chmod.as_deref());
        }
        LlbNode::Merge { inputs } => {
            enc.u32(inputs.len() as u32);
        }
    }
}

/// A Merkle root over the included files under a context path: per-file
/// `sha256(relative_path || content)` leaves, sorted by relative path, then
/// hashed together. Sorting makes the root independent of filesystem
/// iteration order; hashing the path into each leaf makes a rename (not
/// just a content edit) change the root too.
///
/// Returns 32 zero bytes when no context is available, so fingerprinting
/// without a prepared context stays deterministic rather than panicking —
/// callers that need content-sensitivity must supply one.
fn merkle_root_of_tree(context: Option<&ContextProvider>, include: &[String], exclude: &[String]) -> [u8; 32] {
    let Some(context) = context else { return [0u8; 32] };
    let include_filter = ExcludeFilter::new(include, None);
    let exclude_filter = ExcludeFilter::new(exclude, None);
    let is_included = |path: &str| (include.is_empty() || include_filter.is_excluded(path)) && !exclude_filter.is_excluded(path);

    let mut leaves: Vec<(String, [u8; 32])> = context
        .files(&ExcludeFilter::default())
        .filter(|entry| !entry.is_dir && is_included(&entry.relative_path))
        .filter_map(|entry| {
            let bytes = std::fs::read(entry.absolute_path.as_std_path()).ok()?;
            let mut hasher = Sha256::new();
            hasher.update(entry.relative_path.as_bytes());
            hasher.update(&bytes);
            Some((entry.relative_path, hasher.finalize().into()))
        })
        .collect();
    leaves.sort_by(|a, b| a.0.cmp(&b.0));

    let mut root = Sha256::new();
    root.update((leaves.len() as u32).to_le_bytes());
    for (path, leaf) in &leaves {
        root.update((path.len() as u32).to_le_bytes());
        root.update(path.as_bytes());
        root.update(leaf);
    }
    root.finalize().into()
}

/// A Merkle root over a single context path: the file's own content hash,
/// or [`merkle_root_of_tree`] over everything beneath it when it's a
/// directory.
fn merkle_root_of_path(context: Option<&ContextProvider>, path: &str) -> [u8; 32] {
    let Some(context) = context else { return [0u8; 32] };
    let abs = context.root().join(path.trim_start_matches('/'));
    match std::fs::metadata(abs.as_std_path()) {
        Ok(meta) if meta.is_dir() => {
            let include = vec![format!("/{}/**", path.trim_matches('/'))];
            merkle_root_of_tree(Some(context), &include, &[])
        }
        Ok(_) => match std::fs::read(abs.as_std_path()) {
            Ok(bytes) => Sha256::digest(&bytes).into(),
            Err(_) => [0u8; 32],
        },
        Err(_) => [0u8; 32],
    }
}

fn encode_mounts(mounts: &[ExecMount], enc: &mut Canonical) {
    enc.u32(mounts.len() as u32);
    for m in mounts {
        enc.str(&format!("{:?}", m.kind));
        enc.str(&m.kind.target);
        enc.opt_str(m.kind.source.as_deref());
        enc.opt_str(m.kind.from.as_deref());
        enc.bool(m.kind.readonly);
    }
}

fn encode_source(source: &FileOpSource, context: Option<&ContextProvider>, enc: &mut Canonical) {
    match source {
        FileOpSource::Context { id, path } => {
            enc.str("context").str(id).str(path);
            enc.0.extend_from_slice(&merkle_root_of_path(context, path));
        }
        FileOpSource::Node(_) => {
            enc.str("node");
        }
        FileOpSource::Url(url) => {
            enc.str("url").str(url);
        }
    }
}
