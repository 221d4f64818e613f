//! Whole-AST checks, additive to each [`Instruction::validate`]: stage-name
//! uniqueness, forward-reference rejection, ONBUILD body restrictions, and
//! the at-most-one-per-stage instructions.

use std::collections::HashSet;

use crate::error::BuildError;

use super::ast::{Ast, FromSource, Instruction};
use super::format;

pub fn validate(ast: &Ast) -> Result<(), BuildError> {
    let mut seen_names = HashSet::new();
    for stage in &ast.stages {
        if let Some(name) = &stage.name {
            if !seen_names.insert(name.clone()) {
                return Err(BuildError::validation(format!("duplicate stage name {name:?}"))
                    .with_step(format!("line {}", stage.location.line)));
            }
        }
    }

    for (i, stage) in ast.stages.iter().enumerate() {
        if let FromSource::Stage(name) = &stage.from.source {
            let referenced = ast.stages[..i].iter().position(|s| s.name.as_deref() == Some(name));
            if referenced.is_none() {
                return Err(BuildError::validation(format!("FROM references future stage {name:?}"))
                    .with_step(format!("line {}", stage.from.location.line)));
            }
        }
        if let Some(platform) = &stage.from.platform {
            if !format::is_platform(platform) {
                return Err(BuildError::validation(format!("invalid platform {platform:?}"))
                    .with_step(format!("line {}", stage.from.location.line)));
            }
        }

        let mut cmd_count = 0;
        let mut entrypoint_count = 0;
        let mut healthcheck_count = 0;

        for instruction in &stage.instructions {
            instruction.validate()?;

            match instruction {
                Instruction::Cmd { .. } => cmd_count += 1,
                Instruction::Entrypoint { .. } => entrypoint_count += 1,
                Instruction::Healthcheck { .. } => healthcheck_count += 1,
                Instruction::Copy { from: Some(reference), location, .. } => {
                    validate_copy_from(ast, i, reference, location.line)?;
                }
                _ => {}
            }
        }

        for (count, kind) in [(cmd_count, "CMD"), (entrypoint_count, "ENTRYPOINT"), (healthcheck_count, "HEALTHCHECK")] {
            if count > 1 {
                return Err(BuildError::validation(format!("at most one {kind} per stage"))
                    .with_step(format!("stage {}", stage.display_name())));
            }
        }
    }

    Ok(())
}

fn validate_copy_from(ast: &Ast, stage_index: usize, reference: &str, line: usize) -> Result<(), BuildError> {
    if let Ok(index) = reference.parse::<usize>() {
        if index >= stage_index {
            return Err(BuildError::validation(format!("COPY --from={index} is not a strictly earlier stage"))
                .with_step(format!("line {line}")));
        }
        if index >= ast.stages.len() {
            return Err(BuildError::validation(format!("COPY --from={index} is out of bounds"))
                .with_step(format!("line {line}")));
        }
        return Ok(());
    }

    let earlier = ast.stages[..stage_index].iter().any(|s| s.name.as_deref() == Some(reference));
    if earlier {
        return Ok(());
    }
    let later_or_self = ast.stages[stage_index..].iter().any(|s| s.name.as_deref() == Some(reference));
    if later_or_self {
        return Err(BuildError::validation(format!("COPY --from references future stage {reference:?}"))
            .with_step(format!("line {line}")));
    }
    // Not a known stage name: treated as an external image reference, validated at lowering.
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::dockerfile::{parse_dockerfile, BuildArgs};

    fn parse(src: &str) -> crate::error::Result<crate::dockerfile::Ast> {
        parse_dockerfile(src, &BuildArgs::new())
    }

    #[test]
    fn duplicate_stage_names_rejected() {
        let err = parse("FROM alpine AS s1\nFROM alpine AS s1\n").unwrap_err();
        assert!(err.message.contains("duplicate stage name"));
    }

    #[test]
    fn forward_reference_rejected() {
        let src = "FROM alpine AS base\nCOPY --from=future /x /x\nFROM alpine AS future\n";
        let err = parse(src).unwrap_err();
        assert!(err.message.contains("future stage"), "{}", err.message);
    }

    #[test]
    fn at_most_one_cmd() {
        let err = parse("FROM alpine\nCMD [\"a\"]\nCMD [\"b\"]\n").unwrap_err();
        assert!(err.message.contains("at most one CMD"));
    }

    #[test]
    fn copy_from_earlier_stage_ok() {
        let src = "FROM alpine AS a\nRUN touch /a\nFROM alpine AS b\nCOPY --from=a /a /a\n";
        assert!(parse(src).is_ok());
    }
}
