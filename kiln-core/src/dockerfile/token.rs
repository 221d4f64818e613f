//! Lexer token types.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// A `# key=value` parser directive, e.g. `# syntax=...` or `# escape=...`.
    Directive { key: String, value: String },
    /// An ordinary `#` comment line, preserved for round-tripping.
    Comment(String),
    /// The instruction keyword starting a logical line, e.g. `FROM`, `RUN`.
    Instruction(String),
    /// A bare word argument.
    Argument(String),
    /// A `--name=value` or `--name value` instruction flag.
    Flag { name: String, value: Option<String> },
    /// A quoted string or a JSON-array argument, taken as one balanced span.
    StringLiteral(String),
    /// An escape-character-terminated line continuation.
    LineContinuation,
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, line: usize, col: usize) -> Self {
        Self { kind, line, col }
    }
}
