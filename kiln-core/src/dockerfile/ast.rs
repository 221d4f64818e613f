//! The typed Dockerfile AST produced by the parser and consumed by the
//! validator and lowerer.
//!
//! Mirrors the closed instruction set from the data model: a stage opens
//! with a [`From`] and carries zero or more [`Instruction`]s drawn from a
//! fixed set. Every instruction records its source [`Location`] so that
//! validation and lowering errors can point back at the originating line.

use std::fmt;

use crate::error::{BuildError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
}

impl Location {
    #[must_use]
    pub fn new(line: usize) -> Self {
        Self { line }
    }
}

/// A shell string (`RUN foo bar`) or an exec-form argv (`RUN ["foo", "bar"]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Shell(String),
    Exec(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Cache { id: Option<String>, sharing: Option<String> },
    Tmpfs,
    Secret { id: Option<String> },
    Ssh { id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    pub target: String,
    pub source: Option<String>,
    pub from: Option<String>,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthcheckSpec {
    pub command: Command,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub start_period: Option<String>,
    pub retries: Option<u32>,
}

/// The closed set of instructions a stage may contain, per the data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Run {
        command: Command,
        mounts: Vec<Mount>,
        network: Option<String>,
        security: Option<String>,
        /// Build-arg names this RUN's pre-substitution text actually referenced,
        /// sorted and deduplicated. Shared with the Fingerprinter and
        /// diagnostic tooling so both derive the same answer from one place.
        referenced_build_args: Vec<String>,
        location: Location,
    },
    Copy { sources: Vec<String>, destination: String, from: Option<String>, chown: Option<String>, chmod: Option<String>, location: Location },
    Add { sources: Vec<String>, destination: String, chown: Option<String>, chmod: Option<String>, checksum: Option<String>, location: Location },
    Env { pairs: Vec<(String, String)>, location: Location },
    Arg { name: String, default: Option<String>, location: Location },
    Workdir { path: String, location: Location },
    User { user: String, location: Location },
    Expose { port: String, location: Location },
    Volume { paths: Vec<String>, location: Location },
    Label { pairs: Vec<(String, String)>, location: Location },
    Cmd { command: Command, location: Location },
    Entrypoint { command: Command, location: Location },
    Healthcheck { spec: Option<HealthcheckSpec>, location: Location },
    Shell { command: Vec<String>, location: Location },
    Stopsignal { signal: String, location: Location },
    Onbuild { instruction: Box<Instruction>, location: Location },
}

impl Instruction {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Instruction::Run { location, .. }
            | Instruction::Copy { location, .. }
            | Instruction::Add { location, .. }
            | Instruction::Env { location, .. }
            | Instruction::Arg { location, .. }
            | Instruction::Workdir { location, .. }
            | Instruction::User { location, .. }
            | Instruction::Expose { location, .. }
            | Instruction::Volume { location, .. }
            | Instruction::Label { location, .. }
            | Instruction::Cmd { location, .. }
            | Instruction::Entrypoint { location, .. }
            | Instruction::Healthcheck { location, .. }
            | Instruction::Shell { location, .. }
            | Instruction::Stopsignal { location, .. }
            | Instruction::Onbuild { location, .. } => *location,
        }
    }

    #[must_use]
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Env { .. } => "ENV",
            Instruction::Arg { .. } => "ARG",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::User { .. } => "USER",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Volume { .. } => "VOLUME",
            Instruction::Label { .. } => "LABEL",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Healthcheck { .. } => "HEALTHCHECK",
            Instruction::Shell { .. } => "SHELL",
            Instruction::Stopsignal { .. } => "STOPSIGNAL",
            Instruction::Onbuild { .. } => "ONBUILD",
        }
    }

    /// Per-instruction format validation, the single contract every variant
    /// implements per the data model. Whole-AST checks live in `validate.rs`.
    pub fn validate(&self) -> Result<(), BuildError> {
        use super::format;

        let err = |msg: String| {
            Err(BuildError::validation(msg).with_step(format!("line {}", self.location().line)))
        };

        match self {
            Instruction::Env { pairs, .. } | Instruction::Label { pairs, .. } => {
                for (k, _) in pairs {
                    if !format::is_env_name(k) {
                        return err(format!("invalid name {k:?}"));
                    }
                }
            }
            Instruction::Arg { name, .. } => {
                if !format::is_env_name(name) {
                    return err(format!("invalid ARG name {name:?}"));
                }
            }
            Instruction::Copy { chown, chmod, .. } | Instruction::Add { chown, chmod, .. } => {
                if let Some(c) = chown {
                    if !format::is_chown(c) {
                        return err(format!("invalid chown {c:?}"));
                    }
                }
                if let Some(c) = chmod {
                    if !format::is_chmod(c) {
                        return err(format!("invalid chmod {c:?}"));
                    }
                }
                if let Instruction::Add { checksum: Some(sum), .. } = self {
                    if !format::is_checksum(sum) {
                        return err(format!("invalid checksum {sum:?}"));
                    }
                }
            }
            Instruction::Expose { port, .. } => {
                if !format::is_port(port) {
                    return err(format!("invalid port {port:?}"));
                }
            }
            Instruction::Stopsignal { signal, .. } => {
                if !format::is_signal(signal) {
                    return err(format!("invalid signal {signal:?}"));
                }
            }
            Instruction::Healthcheck { spec: Some(spec), .. } => {
                for (field, value) in [("interval", &spec.interval), ("timeout", &spec.timeout), ("start_period", &spec.start_period)] {
                    if let Some(v) = value {
                        if !format::is_duration(v) {
                            return err(format!("invalid {field} {v:?}"));
                        }
                    }
                }
            }
            Instruction::Onbuild { instruction, .. } => {
                if matches!(instruction.as_ref(), Instruction::Onbuild { .. }) {
                    return err("ONBUILD may not contain ONBUILD".to_owned());
                }
                instruction.validate()?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Either a base image reference or the name of an earlier stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromSource {
    Image(String),
    Stage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct From {
    pub source: FromSource,
    pub platform: Option<String>,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: Option<String>,
    pub index: usize,
    pub from: From,
    pub instructions: Vec<Instruction>,
    pub location: Location,
}

impl Stage {
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.index.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDecl {
    pub name: String,
    pub default: Option<String>,
    pub location: Location,
}

/// A fully parsed Dockerfile: global directives, global build args declared
/// before any `FROM`, and an ordered, non-empty stage list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ast {
    pub syntax: Option<String>,
    pub escape: Option<char>,
    pub comments: Vec<(Location, String)>,
    pub global_args: Vec<ArgDecl>,
    pub stages: Vec<Stage>,
}

impl Ast {
    #[must_use]
    pub fn stage_index_by_name(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name.as_deref() == Some(name))
    }

    #[must_use]
    pub fn target_index(&self, target: Option<&str>) -> Option<usize> {
        match target {
            Some(name) => self.stage_index_by_name(name).or_else(|| name.parse().ok()),
            None => self.stages.len().checked_sub(1),
        }
    }

    pub fn require_stage(&self, index: usize) -> Result<&Stage, BuildError> {
        self.stages.get(index).ok_or_else(|| {
            BuildError::new(ErrorKind::Resolve, format!("stage index {index} out of bounds"))
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Shell(s) => f.write_str(s),
            Command::Exec(argv) => write!(f, "{argv:?}"),
        }
    }
}

impl Ast {
    /// Best-effort unparse back to Dockerfile text, for diagnostics and
    /// snapshot output only — never fed back into the parser or lowerer.
    /// Comments and exact original formatting are not preserved; this
    /// reconstructs a structurally equivalent Dockerfile from the typed AST.
    #[must_use]
    pub fn to_dockerfile_text(&self) -> String {
        let mut out = String::new();
        if let Some(syntax) = &self.syntax {
            out.push_str(&format!("# syntax={syntax}\n"));
        }
        if let Some(escape) = &self.escape {
            out.push_str(&format!("# escape={escape}\n"));
        }
        for arg in &self.global_args {
            out.push_str(&render_arg(arg));
            out.push('\n');
        }
        for stage in &self.stages {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&render_from(&stage.from, stage.name.as_deref()));
            out.push('\n');
            for instruction in &stage.instructions {
                out.push_str(&render_instruction(instruction));
                out.push('\n');
            }
        }
        out
    }
}

fn render_arg(arg: &ArgDecl) -> String {
    match &arg.default {
        Some(default) => format!("ARG {}={default}", arg.name),
        None => format!("ARG {}", arg.name),
    }
}

fn render_from(from: &From, name: Option<&str>) -> String {
    let image = match &from.source {
        FromSource::Image(image) => image.clone(),
        FromSource::Stage(stage) => stage.clone(),
    };
    let platform = from.platform.as_ref().map(|p| format!("--platform={p} ")).unwrap_or_default();
    match name {
        Some(name) => format!("FROM {platform}{image} AS {name}"),
        None => format!("FROM {platform}{image}"),
    }
}

fn render_command(command: &Command) -> String {
    match command {
        Command::Shell(s) => s.clone(),
        Command::Exec(argv) => {
            let quoted: Vec<String> = argv.iter().map(|a| format!("{a:?}")).collect();
            format!("[{}]", quoted.join(", "))
        }
    }
}

fn render_pairs(pairs: &[(String, String)]) -> String {
    pairs.iter().map(|(k, v)| format!("{k}={}", quote_if_needed(v))).collect::<Vec<_>>().join(" ")
}

fn quote_if_needed(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) {
        format!("{value:?}")
    } else {
        value.to_owned()
    }
}

fn render_mount(mount: &Mount) -> String {
    let kind = match &mount.kind {
        MountKind::Bind => "bind".to_owned(),
        MountKind::Cache { id, sharing } => {
            let mut s = "cache".to_owned();
            if let Some(id) = id {
                s.push_str(&format!(",id={id}"));
            }
            if let Some(sharing) = sharing {
                s.push_str(&format!(",sharing={sharing}"));
            }
            s
        }
        MountKind::Tmpfs => "tmpfs".to_owned(),
        MountKind::Secret { id } => match id {
            Some(id) => format!("secret,id={id}"),
            None => "secret".to_owned(),
        },
        MountKind::Ssh { id } => match id {
            Some(id) => format!("ssh,id={id}"),
            None => "ssh".to_owned(),
        },
    };
    let mut s = format!("--mount=type={kind},target={}", mount.target);
    if let Some(source) = &mount.source {
        s.push_str(&format!(",source={source}"));
    }
    if let Some(from) = &mount.from {
        s.push_str(&format!(",from={from}"));
    }
    if mount.readonly {
        s.push_str(",readonly");
    }
    s
}

fn render_instruction(instruction: &Instruction) -> String {
    match instruction {
        Instruction::Run { command, mounts, network, security, .. } => {
            let mut flags = String::new();
            for mount in mounts {
                flags.push_str(&render_mount(mount));
                flags.push(' ');
            }
            if let Some(network) = network {
                flags.push_str(&format!("--network={network} "));
            }
            if let Some(security) = security {
                flags.push_str(&format!("--security={security} "));
            }
            format!("RUN {flags}{}", render_command(command))
        }
        Instruction::Copy { sources, destination, from, chown, chmod, .. } => {
            let mut flags = String::new();
            if let Some(from) = from {
                flags.push_str(&format!("--from={from} "));
            }
            if let Some(chown) = chown {
                flags.push_str(&format!("--chown={chown} "));
            }
            if let Some(chmod) = chmod {
                flags.push_str(&format!("--chmod={chmod} "));
            }
            format!("COPY {flags}{} {destination}", sources.join(" "))
        }
        Instruction::Add { sources, destination, chown, chmod, checksum, .. } => {
            let mut flags = String::new();
            if let Some(chown) = chown {
                flags.push_str(&format!("--chown={chown} "));
            }
            if let Some(chmod) = chmod {
                flags.push_str(&format!("--chmod={chmod} "));
            }
            if let Some(checksum) = checksum {
                flags.push_str(&format!("--checksum={checksum} "));
            }
            format!("ADD {flags}{} {destination}", sources.join(" "))
        }
        Instruction::Env { pairs, .. } => format!("ENV {}", render_pairs(pairs)),
        Instruction::Arg { name, default, .. } => match default {
            Some(default) => format!("ARG {name}={default}"),
            None => format!("ARG {name}"),
        },
        Instruction::Workdir { path, .. } => format!("WORKDIR {path}"),
        Instruction::User { user, .. } => format!("USER {user}"),
        Instruction::Expose { port, .. } => format!("EXPOSE {port}"),
        Instruction::Volume { paths, .. } => format!("VOLUME {}", paths.join(" ")),
        Instruction::Label { pairs, .. } => format!("LABEL {}", render_pairs(pairs)),
        Instruction::Cmd { command, .. } => format!("CMD {}", render_command(command)),
        Instruction::Entrypoint { command, .. } => format!("ENTRYPOINT {}", render_command(command)),
        Instruction::Healthcheck { spec: None, .. } => "HEALTHCHECK NONE".to_owned(),
        Instruction::Healthcheck { spec: Some(spec), .. } => {
            let mut flags = String::new();
            if let Some(interval) = &spec.interval {
                flags.push_str(&format!("--interval={interval} "));
            }
            if let Some(timeout) = &spec.timeout {
                flags.push_str(&format!("--timeout={timeout} "));
            }
            if let Some(start_period) = &spec.start_period {
                flags.push_str(&format!("--start-period={start_period} "));
            }
            if let Some(retries) = spec.retries {
                flags.push_str(&format!("--retries={retries} "));
            }
            format!("HEALTHCHECK {flags}CMD {}", render_command(&spec.command))
        }
        Instruction::Shell { command, .. } => {
            format!("SHELL [{}]", command.iter().map(|c| format!("{c:?}")).collect::<Vec<_>>().join(", "))
        }
        Instruction::Stopsignal { signal, .. } => format!("STOPSIGNAL {signal}"),
        Instruction::Onbuild { instruction, .. } => format!("ONBUILD {}", render_instruction(instruction)),
    }
}
