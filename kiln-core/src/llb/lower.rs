//! Lowers a validated [`Ast`] into an immutable [`Graph`] plus the target
//! stage's accumulated image configuration, per the algorithm in the
//! component design: determine the reachable stage set, fold each stage's
//! instructions into a chain of filesystem/process nodes, and designate
//! the target stage's terminal node as the graph's export root.

use std::collections::{BTreeMap, BTreeSet};

use crate::dockerfile::{Ast, Command as AstCommand, FromSource, HealthcheckSpec, Instruction};
use crate::error::{BuildError, ErrorKind};

use super::node::{ExecMount, FileOpAction, FileOpSource, Graph, LlbNode, NodeId};

#[derive(Debug, Clone, Default)]
pub struct ImageConfig {
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub entrypoint: Option<AstCommand>,
    pub cmd: Option<AstCommand>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub stop_signal: Option<String>,
    pub healthcheck: Option<HealthcheckSpec>,
}

#[derive(Debug, Clone)]
pub struct LowerOptions {
    pub target: Option<String>,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub platforms: Vec<String>,
    pub no_cache: bool,
    pub context_id: String,
    pub default_shell: Vec<String>,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            target: None,
            build_args: BTreeMap::new(),
            labels: BTreeMap::new(),
            platforms: Vec::new(),
            no_cache: false,
            context_id: "context".to_owned(),
            default_shell: vec!["/bin/sh".to_owned(), "-c".to_owned()],
        }
    }
}

#[derive(Debug)]
pub struct Lowered {
    pub graph: Graph,
    pub export_node: NodeId,
    pub config: ImageConfig,
}

struct StageState {
    terminal: NodeId,
    config: ImageConfig,
    shell: Vec<String>,
}

pub fn lower(ast: &Ast, opts: &LowerOptions) -> Result<Lowered, BuildError> {
    let target_index = ast.target_index(opts.target.as_deref()).ok_or_else(|| {
        BuildError::new(ErrorKind::Resolve, format!("target stage {:?} not found", opts.target))
    })?;
    ast.require_stage(target_index)?;

    let required = reachable_stages(ast, target_index)?;

    let mut graph = Graph::new();
    let mut states: BTreeMap<usize, StageState> = BTreeMap::new();

    for &index in &required {
        let stage = &ast.stages[index];
        let platform = stage.from.platform.clone().or_else(|| opts.platforms.first().cloned());

        let terminal = match &stage.from.source {
            FromSource::Image(image_ref) => {
                graph.push(LlbNode::Source { image_ref: normalize_tag(image_ref), platform: platform.clone() }, platform.clone())
            }
            FromSource::Stage(name) => {
                let referenced = ast.stage_index_by_name(name).ok_or_else(|| {
                    BuildError::new(ErrorKind::Resolve, format!("FROM references unknown stage {name:?}"))
                })?;
                states
                    .get(&referenced)
                    .ok_or_else(|| BuildError::new(ErrorKind::Resolve, format!("stage {name:?} not lowered yet")))?
                    .terminal
            }
        };

        let mut state = StageState { terminal, config: ImageConfig::default(), shell: opts.default_shell.clone() };
        for labeled in &opts.labels {
            state.config.labels.insert(labeled.0.clone(), labeled.1.clone());
        }

        for instruction in &stage.instructions {
            fold_instruction(&mut graph, &mut state, &states, ast, instruction, &opts.context_id)?;
        }

        states.insert(index, state);
    }

    let target_state = states.remove(&target_index).expect("target is always in required set");
    Ok(Lowered { graph, export_node: target_state.terminal, config: target_state.config })
}

/// The transitive set of stages reachable from `target` by `FROM <name>`
/// and `COPY --from=<name|index>` edges; everything else is skipped.
fn reachable_stages(ast: &Ast, target: usize) -> Result<BTreeSet<usize>, BuildError> {
    let mut required = BTreeSet::new();
    let mut stack = vec![target];
    while let Some(index) = stack.pop() {
        if !required.insert(index) {
            continue;
        }
        let stage = ast.require_stage(index)?;
        if let FromSource::Stage(name) = &stage.from.source {
            if let Some(referenced) = ast.stage_index_by_name(name) {
                stack.push(referenced);
            }
        }
        for instruction in &stage.instructions {
            if let Instruction::Copy { from: Some(reference), .. } = instruction {
                if let Some(referenced) = resolve_stage_ref(ast, reference) {
                    stack.push(referenced);
                }
            }
        }
    }
    Ok(required)
}

fn resolve_stage_ref(ast: &Ast, reference: &str) -> Option<usize> {
    ast.stage_index_by_name(reference).or_else(|| reference.parse::<usize>().ok().filter(|i| *i < ast.stages.len()))
}

fn normalize_tag(image_ref: &str) -> String {
    if image_ref.contains(':') || image_ref.contains('@') {
        image_ref.to_owned()
    } else {
        format!("{image_ref}:latest")
    }
}

fn fold_instruction(
    graph: &mut Graph,
    state: &mut StageState,
    states: &BTreeMap<usize, StageState>,
    ast: &Ast,
    instruction: &Instruction,
    context_id: &str,
) -> Result<(), BuildError> {
    match instruction {
        Instruction::Env { pairs, .. } => {
            for (k, v) in pairs {
                state.config.env.insert(k.clone(), v.clone());
            }
        }
        Instruction::Arg { .. } => {}
        Instruction::Label { pairs, .. } => {
            for (k, v) in pairs {
                state.config.labels.insert(k.clone(), v.clone());
            }
        }
        Instruction::Workdir { path, .. } => state.config.workdir = Some(path.clone()),
        Instruction::User { user, .. } => state.config.user = Some(user.clone()),
        Instruction::Expose { port, .. } => state.config.exposed_ports.push(port.clone()),
        Instruction::Volume { paths, .. } => state.config.volumes.extend(paths.iter().cloned()),
        Instruction::Cmd { command, .. } => state.config.cmd = Some(command.clone()),
        Instruction::Entrypoint { command, .. } => state.config.entrypoint = Some(command.clone()),
        Instruction::Healthcheck { spec, .. } => state.config.healthcheck = spec.clone(),
        Instruction::Shell { command, .. } => state.shell = command.clone(),
        Instruction::Stopsignal { signal, .. } => state.config.stop_signal = Some(signal.clone()),
        Instruction::Onbuild { .. } => {}
        Instruction::Run { command, mounts, network, security, referenced_build_args, .. } => {
            let argv = match command {
                AstCommand::Exec(argv) => argv.clone(),
                AstCommand::Shell(s) => state.shell.iter().cloned().chain(std::iter::once(s.clone())).collect(),
            };
            let llb_mounts = mounts
                .iter()
                .map(|m| {
                    let source = m
                        .from
                        .as_deref()
                        .and_then(|f| resolve_stage_ref(ast, f))
                        .and_then(|idx| states.get(&idx))
                        .map(|s| s.terminal);
                    ExecMount { kind: m.clone(), source }
                })
                .collect();
            let node = LlbNode::Exec {
                input: state.terminal,
                command: argv,
                env: state.config.env.clone(),
                cwd: state.config.workdir.clone().unwrap_or_else(|| "/".to_owned()),
                user: state.config.user.clone(),
                network: network.clone(),
                security: security.clone(),
                mounts: llb_mounts,
                referenced_build_args: referenced_build_args.clone(),
            };
            state.terminal = graph.push(node, None);
        }
        Instruction::Copy { sources, destination, from, chown, chmod, .. } => {
            for src in sources {
                let source = match from {
                    Some(reference) => {
                        let referenced_index = resolve_stage_ref(ast, reference).ok_or_else(|| {
                            BuildError::new(ErrorKind::Resolve, format!("COPY --from={reference:?} is not a known stage"))
                        })?;
                        let terminal = states.get(&referenced_index).ok_or_else(|| {
                            BuildError::new(ErrorKind::Resolve, format!("COPY --from={reference:?} stage not lowered yet"))
                        })?.terminal;
                        FileOpSource::Node(terminal)
                    }
                    None => FileOpSource::Context { id: context_id.to_owned(), path: src.clone() },
                };
                let node = LlbNode::FileOp {
                    input: state.terminal,
                    action: FileOpAction::Copy,
                    source,
                    dst_path: destination.clone(),
                    chown: chown.clone(),
                    chmod: chmod.clone(),
                };
                state.terminal = graph.push(node, None);
            }
        }
        Instruction::Add { sources, destination, chown, chmod, .. } => {
            for src in sources {
                let source = if src.starts_with("http://") || src.starts_with("https://") {
                    FileOpSource::Url(src.clone())
                } else {
                    FileOpSource::Context { id: context_id.to_owned(), path: src.clone() }
                };
                let node = LlbNode::FileOp {
                    input: state.terminal,
                    action: FileOpAction::Add,
                    source,
                    dst_path: destination.clone(),
                    chown: chown.clone(),
                    chmod: chmod.clone(),
                };
                state.terminal = graph.push(node, None);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::dockerfile::{parse_dockerfile, BuildArgs};

    use super::*;

    fn lower_src(src: &str, opts: &LowerOptions) -> Lowered {
        let ast = parse_dockerfile(src, &BuildArgs::new()).unwrap();
        lower(&ast, opts).unwrap()
    }

    #[test]
    fn single_stage_produces_source_then_exec() {
        let lowered = lower_src("FROM alpine:3.18\nRUN echo hello > /f\n", &LowerOptions::default());
        let order = lowered.graph.topo_order_from(lowered.export_node);
        assert_eq!(order.len(), 2);
        assert!(matches!(lowered.graph.get(order[0]), LlbNode::Source { .. }));
        assert!(matches!(lowered.graph.get(order[1]), LlbNode::Exec { .. }));
    }

    #[test]
    fn unreferenced_stage_is_skipped() {
        let src = "FROM alpine:3.18 AS unused\nRUN touch /unused\nFROM alpine:3.18 AS used\nRUN touch /used\n";
        let mut opts = LowerOptions::default();
        opts.target = Some("used".to_owned());
        let lowered = lower_src(src, &opts);
        let order = lowered.graph.topo_order_from(lowered.export_node);
        // Only `used`'s own Source + Exec are reachable; `unused`'s nodes never got built.
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn target_not_found_is_resolve_error() {
        let ast = parse_dockerfile("FROM alpine:3.18\n", &BuildArgs::new()).unwrap();
        let mut opts = LowerOptions::default();
        opts.target = Some("nope".to_owned());
        let err = lower(&ast, &opts).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resolve);
    }

    #[test]
    fn copy_from_earlier_stage_references_its_terminal() {
        let src = "FROM alpine:3.18 AS a\nRUN touch /a\nFROM alpine:3.18 AS b\nCOPY --from=a /a /a\n";
        let lowered = lower_src(src, &LowerOptions::default());
        let order = lowered.graph.topo_order_from(lowered.export_node);
        // a's Source + Exec, b's Source, then the FileOp.
        assert_eq!(order.len(), 4);
        assert!(matches!(lowered.graph.get(*order.last().unwrap()), LlbNode::FileOp { .. }));
    }

    #[test]
    fn config_accumulates_across_instructions() {
        let src = "FROM alpine:3.18\nENV A=1\nWORKDIR /app\nUSER nobody\nCMD [\"/app/run\"]\n";
        let lowered = lower_src(src, &LowerOptions::default());
        assert_eq!(lowered.config.env.get("A"), Some(&"1".to_owned()));
        assert_eq!(lowered.config.workdir.as_deref(), Some("/app"));
        assert_eq!(lowered.config.user.as_deref(), Some("nobody"));
        assert!(lowered.config.cmd.is_some());
    }
}
