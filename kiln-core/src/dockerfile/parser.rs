//! Turns a lexer token stream into an [`Ast`](super::ast::Ast).
//!
//! Flag recognition is instruction-scoped: each keyword advertises its own
//! set of `--name` flags, and the first token that does not match stops the
//! flag phase — the token and anything after it become positional
//! arguments, which is how `apk add --no-cache` survives `RUN`'s flag
//! phase untouched.

use std::collections::HashMap;

use crate::error::BuildError;

use super::ast::{
    ArgDecl, Ast, Command, From, FromSource, HealthcheckSpec, Instruction, Location, Mount, MountKind, Stage,
};
use super::lexer::Lexer;
use super::token::{Token, TokenKind};

pub type BuildArgs = HashMap<String, String>;

/// Parses `src`, substituting `$VAR`/`${VAR}` references as they are
/// encountered using `overrides` (the build-time `--build-arg` map) where
/// present, falling back to each `ARG`'s own declared default otherwise.
/// Overrides for names the Dockerfile never declares are simply unused.
pub fn parse(src: &str, overrides: &BuildArgs) -> Result<Ast, BuildError> {
    let tokens = Lexer::new(src).tokenize()?;
    let lines = split_logical_lines(&tokens);

    let mut ast = Ast::default();
    let mut args = overrides.clone();
    let mut saw_from = false;

    for line in lines {
        match line.first() {
            Some(Token { kind: TokenKind::Directive { key, value }, .. }) => {
                match key.as_str() {
                    "syntax" => ast.syntax = Some(value.clone()),
                    "escape" => ast.escape = value.chars().next(),
                    _ => {}
                }
            }
            Some(Token { kind: TokenKind::Comment(text), line: l, .. }) => {
                ast.comments.push((Location::new(*l), text.clone()));
            }
            Some(Token { kind: TokenKind::Instruction(kw), line: line_no, .. }) => {
                let keyword = kw.to_uppercase();
                let raw_words = reconstruct_words(&line[1..]);

                if keyword == "FROM" {
                    saw_from = true;
                    let known_stage_names: Vec<&str> = ast.stages.iter().filter_map(|s| s.name.as_deref()).collect();
                    let stage = parse_from(&raw_words, *line_no, &args, ast.stages.len(), &known_stage_names)?;
                    ast.stages.push(stage);
                    continue;
                }

                if !saw_from {
                    if keyword != "ARG" {
                        return Err(BuildError::parse(
                            *line_no,
                            format!("instruction {keyword} before first FROM"),
                        ));
                    }
                    let decl = parse_global_arg(&raw_words, *line_no, &args)?;
                    if let Some(default) = &decl.default {
                        args.entry(decl.name.clone()).or_insert_with(|| default.clone());
                    }
                    ast.global_args.push(decl);
                    continue;
                }

                let instruction = dispatch(&keyword, &raw_words, *line_no, &args)?;
                if let Instruction::Arg { name, default, .. } = &instruction {
                    if let Some(default) = default {
                        args.entry(name.clone()).or_insert_with(|| default.clone());
                    }
                }
                let stage = ast.stages.last_mut().expect("saw_from implies a stage exists");
                stage.instructions.push(instruction);
            }
            _ => {}
        }
    }

    if ast.stages.is_empty() {
        return Err(BuildError::parse(0, "Dockerfile must contain at least one FROM"));
    }
    Ok(ast)
}

fn split_logical_lines(tokens: &[Token]) -> Vec<Vec<Token>> {
    let mut lines = Vec::new();
    let mut current = Vec::new();
    for tok in tokens {
        match tok.kind {
            TokenKind::Newline | TokenKind::Eof => {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(tok.clone()),
        }
    }
    lines
}

/// Re-renders the tail of a logical line as flat text words: `Flag` tokens
/// become `--name` / `--name=value`, everything else keeps its literal text.
fn reconstruct_words(tokens: &[Token]) -> Vec<String> {
    tokens
        .iter()
        .map(|t| match &t.kind {
            TokenKind::Flag { name, value: Some(v) } => format!("--{name}={v}"),
            TokenKind::Flag { name, value: None } => format!("--{name}"),
            TokenKind::Argument(s) | TokenKind::StringLiteral(s) => s.clone(),
            other => unreachable!("logical line cannot contain {other:?}"),
        })
        .collect()
}

fn substitute(text: &str, args: &BuildArgs) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
                out.push_str(args.get(&name).map_or("", String::as_str));
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while matches!(chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
                    name.push(chars.next().unwrap());
                }
                out.push_str(args.get(&name).map_or("", String::as_str));
            }
            _ => out.push('$'),
        }
    }
    out
}

fn expand_all(words: &[String], args: &BuildArgs) -> Vec<String> {
    words.iter().map(|w| substitute(w, args)).collect()
}

/// Names among `args`' keys that `words` actually references via `$NAME`
/// or `${NAME}`, sorted and deduplicated.
fn collect_referenced_args(words: &[String], args: &BuildArgs) -> Vec<String> {
    let mut found: Vec<String> = words.iter().flat_map(|w| referenced_names(w)).filter(|n| args.contains_key(n)).collect();
    found.sort();
    found.dedup();
    found
}

fn referenced_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                names.push(chars.by_ref().take_while(|c| *c != '}').collect());
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while matches!(chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
                    name.push(chars.next().unwrap());
                }
                names.push(name);
            }
            _ => {}
        }
    }
    names
}

/// Splits `words` into a recognized leading run of `--flag`/`--flag=value`
/// tokens (checked against `schema`) and the remaining positional words.
fn take_flags<'a>(words: &'a [String], schema: &[&str]) -> (Vec<(String, Option<String>)>, &'a [String]) {
    let mut flags = Vec::new();
    let mut i = 0;
    while let Some(word) = words.get(i) {
        let Some(rest) = word.strip_prefix("--") else { break };
        let (name, value) = match rest.split_once('=') {
            Some((n, v)) => (n.to_owned(), Some(v.to_owned())),
            None => (rest.to_owned(), None),
        };
        if !schema.contains(&name.as_str()) {
            break;
        }
        flags.push((name, value));
        i += 1;
    }
    (flags, &words[i..])
}

fn flag_value(flags: &[(String, Option<String>)], name: &str) -> Option<String> {
    flags.iter().find(|(n, _)| n == name).and_then(|(_, v)| v.clone())
}

fn parse_global_arg(words: &[String], line: usize, args: &BuildArgs) -> Result<ArgDecl, BuildError> {
    let words = expand_all(words, args);
    let word = words.first().ok_or_else(|| BuildError::parse(line, "ARG needs a name"))?;
    let (name, default) = match word.split_once('=') {
        Some((n, v)) => (n.to_owned(), Some(v.to_owned())),
        None => (word.clone(), None),
    };
    Ok(ArgDecl { name, default, location: Location::new(line) })
}

fn parse_from(
    words: &[String],
    line: usize,
    args: &BuildArgs,
    index: usize,
    known_stage_names: &[&str],
) -> Result<Stage, BuildError> {
    let (flags, rest) = take_flags(words, &["platform"]);
    let rest = expand_all(rest, args);
    let source_word = rest.first().ok_or_else(|| BuildError::parse(line, "FROM needs an image or stage"))?;
    let source = if known_stage_names.contains(&source_word.as_str()) {
        FromSource::Stage(source_word.clone())
    } else {
        FromSource::Image(source_word.clone())
    };
    let name = match rest.as_slice() {
        [_, as_kw, alias, ..] if as_kw.eq_ignore_ascii_case("AS") => Some(alias.clone()),
        _ => None,
    };
    let from = From { source, platform: flag_value(&flags, "platform"), location: Location::new(line) };
    Ok(Stage { name, index, from, instructions: Vec::new(), location: Location::new(line) })
}

fn parse_command(words: &[String]) -> Result<Command, BuildError> {
    if let [single] = words {
        if let Some(json) = single.strip_prefix('[') {
            if json.ends_with(']') {
                let argv: Vec<String> = serde_json::from_str(single)
                    .map_err(|e| BuildError::validation(format!("invalid exec-form array: {e}")))?;
                return Ok(Command::Exec(argv));
            }
        }
    }
    Ok(Command::Shell(words.join(" ")))
}

fn parse_pairs(words: &[String], line: usize, keyword: &str) -> Result<Vec<(String, String)>, BuildError> {
    if words.iter().all(|w| w.contains('=')) && !words.is_empty() {
        return Ok(words
            .iter()
            .map(|w| {
                let (k, v) = w.split_once('=').expect("checked above");
                (k.to_owned(), v.trim_matches('"').to_owned())
            })
            .collect());
    }
    match words {
        [k, v] => Ok(vec![(k.clone(), v.clone())]),
        _ => Err(BuildError::parse(line, format!("{keyword} needs KEY=VALUE pairs or a single KEY VALUE"))),
    }
}

fn parse_mount(spec: &str, line: usize) -> Result<Mount, BuildError> {
    let mut kind = None;
    let mut target = None;
    let mut source = None;
    let mut from = None;
    let mut readonly = false;
    let mut id = None;
    let mut sharing = None;

    for part in spec.split(',') {
        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        match k {
            "type" => kind = Some(v.to_owned()),
            "target" | "dst" | "destination" => target = Some(v.to_owned()),
            "source" | "src" => source = Some(v.to_owned()),
            "from" => from = Some(v.to_owned()),
            "id" => id = Some(v.to_owned()),
            "sharing" => sharing = Some(v.to_owned()),
            "readonly" | "ro" => readonly = true,
            _ => {}
        }
    }

    let target = target.ok_or_else(|| BuildError::parse(line, "mount needs a target"))?;
    let kind = match kind.as_deref().unwrap_or("bind") {
        "bind" => MountKind::Bind,
        "cache" => MountKind::Cache { id, sharing },
        "tmpfs" => MountKind::Tmpfs,
        "secret" => MountKind::Secret { id },
        "ssh" => MountKind::Ssh { id },
        other => return Err(BuildError::parse(line, format!("unknown mount type {other:?}"))),
    };
    Ok(Mount { kind, target, source, from, readonly })
}

fn dispatch(keyword: &str, raw_words: &[String], line: usize, args: &BuildArgs) -> Result<Instruction, BuildError> {
    let loc = Location::new(line);
    match keyword {
        "RUN" => {
            let (flags, rest) = take_flags(raw_words, &["mount", "network", "security"]);
            let referenced_build_args = collect_referenced_args(rest, args);
            let rest = expand_all(rest, args);
            let mounts = flags
                .iter()
                .filter(|(n, _)| n == "mount")
                .map(|(_, v)| parse_mount(v.as_deref().unwrap_or_default(), line))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Instruction::Run {
                command: parse_command(&rest)?,
                mounts,
                network: flag_value(&flags, "network"),
                security: flag_value(&flags, "security"),
                referenced_build_args,
                location: loc,
            })
        }
        "COPY" => {
            let (flags, rest) = take_flags(raw_words, &["from", "chown", "chmod"]);
            let mut rest = expand_all(rest, args);
            if rest.len() < 2 {
                return Err(BuildError::parse(line, "COPY needs at least one source and a destination"));
            }
            let destination = rest.pop().expect("checked len");
            Ok(Instruction::Copy {
                sources: rest,
                destination,
                from: flag_value(&flags, "from"),
                chown: flag_value(&flags, "chown"),
                chmod: flag_value(&flags, "chmod"),
                location: loc,
            })
        }
        "ADD" => {
            let (flags, rest) = take_flags(raw_words, &["chown", "chmod", "checksum"]);
            let mut rest = expand_all(rest, args);
            if rest.len() < 2 {
                return Err(BuildError::parse(line, "ADD needs at least one source and a destination"));
            }
            let destination = rest.pop().expect("checked len");
            Ok(Instruction::Add {
                sources: rest,
                destination,
                chown: flag_value(&flags, "chown"),
                chmod: flag_value(&flags, "chmod"),
                checksum: flag_value(&flags, "checksum"),
                location: loc,
            })
        }
        "ENV" => Ok(Instruction::Env { pairs: parse_pairs(&expand_all(raw_words, args), line, "ENV")?, location: loc }),
        "LABEL" => Ok(Instruction::Label { pairs: parse_pairs(&expand_all(raw_words, args), line, "LABEL")?, location: loc }),
        "ARG" => {
            let words = expand_all(raw_words, args);
            let word = words.first().ok_or_else(|| BuildError::parse(line, "ARG needs a name"))?;
            let (name, default) = match word.split_once('=') {
                Some((n, v)) => (n.to_owned(), Some(v.to_owned())),
                None => (word.clone(), None),
            };
            Ok(Instruction::Arg { name, default, location: loc })
        }
        "WORKDIR" => {
            let words = expand_all(raw_words, args);
            let path = words.first().ok_or_else(|| BuildError::parse(line, "WORKDIR needs a path"))?.clone();
            Ok(Instruction::Workdir { path, location: loc })
        }
        "USER" => {
            let words = expand_all(raw_words, args);
            let user = words.first().ok_or_else(|| BuildError::parse(line, "USER needs a value"))?.clone();
            Ok(Instruction::User { user, location: loc })
        }
        "EXPOSE" => {
            let words = expand_all(raw_words, args);
            let port = words.first().ok_or_else(|| BuildError::parse(line, "EXPOSE needs a port"))?.clone();
            Ok(Instruction::Expose { port, location: loc })
        }
        "VOLUME" => {
            let words = expand_all(raw_words, args);
            if words.is_empty() {
                return Err(BuildError::parse(line, "VOLUME needs at least one path"));
            }
            Ok(Instruction::Volume { paths: words, location: loc })
        }
        "CMD" => Ok(Instruction::Cmd { command: parse_command(&expand_all(raw_words, args))?, location: loc }),
        "ENTRYPOINT" => Ok(Instruction::Entrypoint { command: parse_command(&expand_all(raw_words, args))?, location: loc }),
        "SHELL" => {
            let words = expand_all(raw_words, args);
            match parse_command(&words)? {
                Command::Exec(argv) => Ok(Instruction::Shell { command: argv, location: loc }),
                Command::Shell(_) => Err(BuildError::parse(line, "SHELL requires exec form")),
            }
        }
        "STOPSIGNAL" => {
            let words = expand_all(raw_words, args);
            let signal = words.first().ok_or_else(|| BuildError::parse(line, "STOPSIGNAL needs a value"))?.clone();
            Ok(Instruction::Stopsignal { signal, location: loc })
        }
        "HEALTHCHECK" => {
            let (flags, rest) = take_flags(raw_words, &["interval", "timeout", "start-period", "retries"]);
            let rest = expand_all(rest, args);
            if rest.first().is_some_and(|w| w.eq_ignore_ascii_case("NONE")) {
                return Ok(Instruction::Healthcheck { spec: None, location: loc });
            }
            match rest.split_first() {
                Some((cmd_kw, tail)) if cmd_kw.eq_ignore_ascii_case("CMD") => {
                    let retries = flag_value(&flags, "retries").map(|r| r.parse()).transpose()
                        .map_err(|_| BuildError::parse(line, "HEALTHCHECK --retries must be numeric"))?;
                    Ok(Instruction::Healthcheck {
                        spec: Some(HealthcheckSpec {
                            command: parse_command(tail)?,
                            interval: flag_value(&flags, "interval"),
                            timeout: flag_value(&flags, "timeout"),
                            start_period: flag_value(&flags, "start-period"),
                            retries,
                        }),
                        location: loc,
                    })
                }
                _ => Err(BuildError::parse(line, "HEALTHCHECK needs CMD or NONE")),
            }
        }
        "ONBUILD" => {
            let (sub_kw, tail) = raw_words.split_first().ok_or_else(|| BuildError::parse(line, "ONBUILD needs an instruction"))?;
            let sub_kw = sub_kw.to_uppercase();
            if matches!(sub_kw.as_str(), "FROM" | "ONBUILD" | "MAINTAINER") {
                return Err(BuildError::validation(format!("ONBUILD may not contain {sub_kw}")).with_step(format!("line {line}")));
            }
            let inner = dispatch(&sub_kw, tail, line, args)?;
            Ok(Instruction::Onbuild { instruction: Box::new(inner), location: loc })
        }
        other => Err(BuildError::parse(line, format!("unknown instruction {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::ast::FromSource;

    fn parse(src: &str) -> Result<Ast, BuildError> {
        super::parse(src, &BuildArgs::new())
    }

    #[test]
    fn single_stage() {
        let ast = parse("FROM alpine:3.18\nRUN echo hello > /f\n").unwrap();
        assert_eq!(ast.stages.len(), 1);
        assert!(matches!(&ast.stages[0].from.source, FromSource::Image(s) if s == "alpine:3.18"));
        assert_eq!(ast.stages[0].instructions.len(), 1);
    }

    #[test]
    fn build_arg_default_substitution() {
        let ast = parse("FROM alpine:3.18\nARG V=1\nRUN echo $V > /v\n").unwrap();
        match &ast.stages[0].instructions[1] {
            Instruction::Run { command: Command::Shell(s), .. } => assert_eq!(s, "echo 1 > /v"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn build_arg_override_wins_over_default() {
        let mut overrides = BuildArgs::new();
        overrides.insert("V".to_owned(), "2".to_owned());
        let ast = super::parse("FROM alpine:3.18\nARG V=1\nRUN echo $V > /v\n", &overrides).unwrap();
        match &ast.stages[0].instructions[1] {
            Instruction::Run { command: Command::Shell(s), .. } => assert_eq!(s, "echo 2 > /v"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unreferenced_build_arg_does_not_affect_other_instructions() {
        let src = "FROM alpine:3.18\nARG V=1\nRUN echo $V > /v\nRUN echo x > /x\n";
        let mut overrides = BuildArgs::new();
        overrides.insert("V".to_owned(), "2".to_owned());
        let ast = super::parse(src, &overrides).unwrap();
        match &ast.stages[0].instructions[2] {
            Instruction::Run { command: Command::Shell(s), .. } => assert_eq!(s, "echo x > /x"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn run_records_referenced_build_args() {
        let src = "FROM alpine:3.18\nARG V=1\nARG UNUSED=2\nRUN echo $V > /v\n";
        let ast = parse(src).unwrap();
        match &ast.stages[0].instructions[2] {
            Instruction::Run { referenced_build_args, .. } => assert_eq!(referenced_build_args, &["V".to_owned()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn from_bare_stage_name_is_classified_as_stage_not_image() {
        let src = "FROM alpine:3.18 AS builder\nRUN touch /a\nFROM builder\nRUN touch /b\n";
        let ast = parse(src).unwrap();
        assert!(matches!(&ast.stages[1].from.source, FromSource::Stage(n) if n == "builder"));
    }

    #[test]
    fn multi_stage_with_alias_and_copy_from() {
        let src = "FROM alpine:3.18 AS a\nRUN touch /a\nFROM alpine:3.18 AS b\nCOPY --from=a /a /a\n";
        let ast = parse(src).unwrap();
        assert_eq!(ast.stages[0].name.as_deref(), Some("a"));
        match &ast.stages[1].instructions[0] {
            Instruction::Copy { from, sources, destination, .. } => {
                assert_eq!(from.as_deref(), Some("a"));
                assert_eq!(sources, &["/a".to_owned()]);
                assert_eq!(destination, "/a");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn instruction_before_from_is_rejected() {
        let err = parse("RUN echo hi\n").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Parse);
    }

    #[test]
    fn unknown_flag_falls_back_to_positional_argument() {
        let ast = parse("FROM alpine\nRUN apk add --no-cache curl\n").unwrap();
        match &ast.stages[0].instructions[0] {
            Instruction::Run { command: Command::Shell(s), mounts, .. } => {
                assert_eq!(s, "apk add --no-cache curl");
                assert!(mounts.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exec_form_cmd() {
        let ast = parse(r#"FROM alpine
ENTRYPOINT ["/bin/sh", "-c"]
"#).unwrap();
        match &ast.stages[0].instructions[0] {
            Instruction::Entrypoint { command: Command::Exec(argv), .. } => {
                assert_eq!(argv, &["/bin/sh".to_owned(), "-c".to_owned()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn onbuild_rejects_from() {
        let err = parse("FROM alpine\nONBUILD FROM alpine\n").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
