//! The low-level build graph: an arena of immutable [`LlbNode`]s addressed
//! by [`NodeId`], replacing the implicit pointer graph a garbage-collected
//! implementation would use. Arena indices make the DAG trivially
//! shareable across worker tasks and serializable for debugging.

use std::collections::BTreeMap;

use crate::dockerfile::ast::Mount as AstMount;

/// An index into a [`Graph`]'s node arena. Stable for the lifetime of the
/// graph that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecMount {
    pub kind: AstMount,
    /// The node supplying this mount's filesystem content, when it isn't
    /// drawn from the current rootfs (e.g. `--mount=from=<stage>`).
    pub source: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOpAction {
    Copy,
    Add,
    Mkdir,
    Rm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOpSource {
    /// A path within the local build context.
    Context { id: String, path: String },
    /// The filesystem produced by another node (another stage's terminal,
    /// or an external image used as a copy source).
    Node(NodeId),
    /// A remote URL fetched directly (`ADD <url>`).
    Url(String),
}

/// A DAG vertex. Every node has a deterministic operand list and explicit
/// input edges to other nodes; the graph is acyclic by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlbNode {
    /// Resolves a base image's root filesystem.
    Source { image_ref: String, platform: Option<String> },
    /// Materializes a filtered view of a context tree.
    Local { context_id: String, include: Vec<String>, exclude: Vec<String> },
    /// Runs a process over the composed rootfs of `input`.
    Exec {
        input: NodeId,
        command: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: String,
        user: Option<String>,
        network: Option<String>,
        security: Option<String>,
        mounts: Vec<ExecMount>,
        /// Build-arg names this step's pre-substitution command text
        /// referenced, sorted and deduplicated; carried straight from
        /// [`crate::dockerfile::Instruction::Run`].
        referenced_build_args: Vec<String>,
    },
    /// A pure filesystem transform applied to `input`.
    FileOp {
        input: NodeId,
        action: FileOpAction,
        source: FileOpSource,
        dst_path: String,
        chown: Option<String>,
        chmod: Option<String>,
    },
    /// Union of multiple predecessor filesystems, used for cross-stage
    /// assembly and COPY sources that merge into a running stage.
    Merge { inputs: Vec<NodeId> },
}

impl LlbNode {
    /// This node's input edges, in declaration order.
    #[must_use]
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            LlbNode::Source { .. } | LlbNode::Local { .. } => vec![],
            LlbNode::Exec { input, mounts, .. } => {
                let mut v = vec![*input];
                v.extend(mounts.iter().filter_map(|m| m.source));
                v
            }
            LlbNode::FileOp { input, source, .. } => {
                let mut v = vec![*input];
                if let FileOpSource::Node(n) = source {
                    v.push(*n);
                }
                v
            }
            LlbNode::Merge { inputs } => inputs.clone(),
        }
    }

    /// Build-arg names this node's operands actually depend on. Empty for
    /// every variant except `Exec`, where it mirrors the originating RUN's
    /// recorded references.
    #[must_use]
    pub fn referenced_build_args(&self) -> &[String] {
        match self {
            LlbNode::Exec { referenced_build_args, .. } => referenced_build_args,
            _ => &[],
        }
    }

    /// The input edges whose *content* this node's fingerprint actually
    /// depends on, per the data model's "two fingerprints collide iff
    /// observationally equivalent" contract. This is a strict subset of
    /// [`Self::inputs`]: the scheduling chain within a stage (one `RUN`'s
    /// rootfs handed to the next) only carries base-image/context
    /// identity forward, not every intermediate mutation, so it is
    /// significant here only where it resolves directly to a `Source` or
    /// `Local` node. Once a sibling `Exec`/`FileOp` sits between a node
    /// and the stage's base, that intermediate mutation is excluded — a
    /// `RUN` that writes an unrelated file is still cache-independent of
    /// an earlier sibling `RUN`'s build-arg-dependent output, matching the
    /// spec's build-arg-sensitivity scenario. Explicit data references
    /// (mount sources, `COPY --from`) are always significant.
    #[must_use]
    pub fn fingerprint_inputs(&self, graph: &Graph) -> Vec<NodeId> {
        let is_base = |id: NodeId| matches!(graph.get(id), LlbNode::Source { .. } | LlbNode::Local { .. });
        match self {
            LlbNode::Source { .. } | LlbNode::Local { .. } => vec![],
            LlbNode::Exec { input, mounts, .. } => {
                let mut v: Vec<NodeId> = if is_base(*input) { vec![*input] } else { vec![] };
                v.extend(mounts.iter().filter_map(|m| m.source));
                v
            }
            LlbNode::FileOp { input, source, .. } => {
                let mut v: Vec<NodeId> = if is_base(*input) { vec![*input] } else { vec![] };
                if let FileOpSource::Node(n) = source {
                    v.push(*n);
                }
                v
            }
            LlbNode::Merge { inputs } => inputs.clone(),
        }
    }

    #[must_use]
    pub fn kind_tag(&self) -> &'static str {
        match self {
            LlbNode::Source { .. } => "source",
            LlbNode::Local { .. } => "local",
            LlbNode::Exec { .. } => "exec",
            LlbNode::FileOp { .. } => "file_op",
            LlbNode::Merge { .. } => "merge",
        }
    }
}

/// Immutable arena of [`LlbNode`]s built by the lowerer and shared
/// read-only by the solver's worker tasks.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<LlbNode>,
    platforms: Vec<Option<String>>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: LlbNode, platform: Option<String>) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("graph fits in u32"));
        self.nodes.push(node);
        self.platforms.push(platform);
        id
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> &LlbNode {
        &self.nodes[id.0 as usize]
    }

    #[must_use]
    pub fn platform(&self, id: NodeId) -> Option<&str> {
        self.platforms[id.0 as usize].as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order, which for a graph built by the lowerer
    /// is already a valid topological order (every node's inputs have a
    /// strictly smaller [`NodeId`]).
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Topologically sorted node order reachable from `root`, ties broken
    /// by declaration (NodeId) order — the ordering guarantee the solver
    /// relies on for deterministic layer emission.
    #[must_use]
    pub fn topo_order_from(&self, root: NodeId) -> Vec<NodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        self.visit(root, &mut visited, &mut order);
        order
    }

    fn visit(&self, id: NodeId, visited: &mut [bool], order: &mut Vec<NodeId>) {
        if visited[id.0 as usize] {
            return;
        }
        visited[id.0 as usize] = true;
        let mut inputs = self.get(id).inputs();
        inputs.sort();
        for input in inputs {
            self.visit(input, visited, order);
        }
        order.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topo_order_respects_edges() {
        let mut g = Graph::new();
        let src = g.push(LlbNode::Source { image_ref: "alpine:3.18".into(), platform: None }, None);
        let exec = g.push(
            LlbNode::Exec {
                input: src,
                command: vec!["echo".into(), "hi".into()],
                env: BTreeMap::new(),
                cwd: "/".into(),
                user: None,
                network: None,
                security: None,
                mounts: vec![],
                referenced_build_args: vec![],
            },
            None,
        );
        let order = g.topo_order_from(exec);
        assert_eq!(order, vec![src, exec]);
    }

    #[test]
    fn merge_visits_all_inputs_before_itself() {
        let mut g = Graph::new();
        let a = g.push(LlbNode::Source { image_ref: "a:1".into(), platform: None }, None);
        let b = g.push(LlbNode::Source { image_ref: "b:1".into(), platform: None }, None);
        let merged = g.push(LlbNode::Merge { inputs: vec![a, b] }, None);
        let order = g.topo_order_from(merged);
        assert_eq!(order, vec![a, b, merged]);
    }
}
