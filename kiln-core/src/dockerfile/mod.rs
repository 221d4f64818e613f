//! The Dockerfile front end: lexer, parser, AST, and whole-AST validator.

pub mod ast;
mod format;
mod lexer;
mod parser;
mod token;
mod validate;

pub use ast::{
    ArgDecl, Ast, Command, From, FromSource, HealthcheckSpec, Instruction, Location, Mount, MountKind, Stage,
};
pub use parser::BuildArgs;
pub use token::{Token, TokenKind};

use crate::error::Result;

/// Parses and validates a Dockerfile, substituting `build_args` (falling
/// back to each `ARG`'s declared default), and returning the finished AST.
pub fn parse_dockerfile(src: &str, build_args: &BuildArgs) -> Result<Ast> {
    let ast = parser::parse(src, build_args)?;
    validate::validate(&ast)?;
    Ok(ast)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_scenario_one() {
        let ast = parse_dockerfile("FROM alpine:3.18\nRUN echo hello > /f\n", &BuildArgs::new()).unwrap();
        assert_eq!(ast.stages.len(), 1);
        assert_eq!(ast.stages[0].instructions.len(), 1);
    }

    #[test]
    fn end_to_end_scenario_three() {
        let src = "FROM alpine:3.18 AS a\nRUN touch /a\nFROM alpine:3.18 AS b\nCOPY --from=a /a /a\n";
        let ast = parse_dockerfile(src, &BuildArgs::new()).unwrap();
        assert_eq!(ast.target_index(Some("a")), Some(0));
    }
}
