//! Tokenizes Dockerfile bytes into a flat token stream.
//!
//! The escape character defaults to `\` and may be changed by a leading
//! `# escape=` directive; every subsequent continuation and string-escape
//! decision in this lexer consults the (possibly updated) character. JSON
//! array arguments are recognized as a single balanced-bracket span so the
//! parser never has to re-tokenize exec-form arguments.

use crate::error::BuildError;

use super::token::{Token, TokenKind};

pub struct Lexer<'a> {
    src: &'a str,
    escape: char,
    directives_closed: bool,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(src: &'a str) -> Self {
        Self { src, escape: '\\', directives_closed: false }
    }

    /// Tokenize the whole input, collapsing escape-terminated physical-line
    /// continuations into a single logical line before word-splitting it.
    pub fn tokenize(mut self) -> Result<Vec<Token>, BuildError> {
        let mut tokens = Vec::new();
        let lines: Vec<&str> = self.src.split('\n').collect();
        let mut i = 0;
        let mut line_no = 1;

        while i < lines.len() {
            let start_line = line_no;
            let mut logical = String::new();
            loop {
                let raw = lines[i].strip_suffix('\r').unwrap_or(lines[i]);
                i += 1;

                if let Some(rest) = continuation_prefix(raw, self.escape) {
                    logical.push_str(rest);
                    logical.push(' ');
                    line_no += 1;
                    if i >= lines.len() {
                        return Err(BuildError::lex(line_no, 0, "unterminated line continuation"));
                    }
                    continue;
                }
                logical.push_str(raw);
                line_no += 1;
                break;
            }

            self.lex_logical_line(&logical, start_line, &mut tokens)?;
            tokens.push(Token::new(TokenKind::Newline, start_line, 0));
        }

        tokens.push(Token::new(TokenKind::Eof, line_no, 0));
        Ok(tokens)
    }

    fn lex_logical_line(
        &mut self,
        line: &str,
        line_no: usize,
        out: &mut Vec<Token>,
    ) -> Result<(), BuildError> {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return Ok(());
        }

        if let Some(after_hash) = trimmed.strip_prefix('#') {
            if !self.directives_closed {
                if let Some((key, value)) = parse_directive(after_hash) {
                    if key == "escape" {
                        self.escape = value
                            .chars()
                            .next()
                            .filter(|c| *c == '\\' || *c == '`')
                            .ok_or_else(|| {
                                BuildError::lex(line_no, 0, format!("invalid escape directive: {value:?}"))
                            })?;
                    }
                    out.push(Token::new(
                        TokenKind::Directive { key, value },
                        line_no,
                        1,
                    ));
                    return Ok(());
                }
            }
            self.directives_closed = true;
            out.push(Token::new(TokenKind::Comment(after_hash.trim().to_owned()), line_no, 1));
            return Ok(());
        }
        self.directives_closed = true;

        let mut words = WordSplitter::new(trimmed, self.escape, line_no);
        let Some(first) = words.next() else { return Ok(()) };
        let (instr, col) = first?;
        out.push(Token::new(TokenKind::Instruction(instr), line_no, col));

        for word in words {
            let (text, col) = word?;
            out.push(classify_word(&text, line_no, col));
        }
        Ok(())
    }
}

/// If `line` ends (ignoring trailing whitespace) with an un-quoted, un-bracketed
/// escape character, returns the line with that trailing escape stripped —
/// the continuation prefix to prepend to the next physical line.
#[must_use]
fn continuation_prefix(line: &str, escape: char) -> Option<&str> {
    let trimmed_end = line.trim_end();
    let stripped = trimmed_end.strip_suffix(escape)?;
    if is_balanced(stripped) {
        Some(stripped)
    } else {
        None
    }
}

#[must_use]
fn is_balanced(s: &str) -> bool {
    let mut quote = None;
    let mut depth = 0i32;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '[' => depth += 1,
                ']' => depth -= 1,
                _ => {}
            },
        }
    }
    quote.is_none() && depth == 0
}

fn parse_directive(after_hash: &str) -> Option<(String, String)> {
    let s = after_hash.trim();
    let (key, value) = s.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((key.to_lowercase(), value.trim().to_owned()))
}

fn classify_word(text: &str, line: usize, col: usize) -> Token {
    if let Some(rest) = text.strip_prefix("--") {
        let (name, value) = match rest.split_once('=') {
            Some((n, v)) => (n.to_owned(), Some(v.to_owned())),
            None => (rest.to_owned(), None),
        };
        return Token::new(TokenKind::Flag { name, value }, line, col);
    }
    if text.starts_with('[') || text.starts_with('"') || text.starts_with('\'') {
        return Token::new(TokenKind::StringLiteral(unquote(text)), line, col);
    }
    Token::new(TokenKind::Argument(text.to_owned()), line, col)
}

#[must_use]
fn unquote(text: &str) -> String {
    if let Some(inner) = text.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return inner.to_owned();
    }
    if let Some(inner) = text.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return inner.to_owned();
    }
    text.to_owned()
}

/// Splits a logical line into whitespace-delimited words, treating quoted
/// strings and bracketed JSON arrays as single words regardless of
/// whitespace inside them.
struct WordSplitter<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
    escape: char,
    line: usize,
}

impl<'a> WordSplitter<'a> {
    fn new(src: &'a str, escape: char, line: usize) -> Self {
        Self { chars: src.char_indices().peekable(), src, escape, line }
    }
}

impl<'a> Iterator for WordSplitter<'a> {
    type Item = Result<(String, usize), BuildError>;

    fn next(&mut self) -> Option<Self::Item> {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
        let (start, first) = *self.chars.peek()?;
        let start_col = start + 1;

        let result = match first {
            '"' | '\'' => self.read_quoted(first),
            '[' => self.read_bracketed(),
            _ => Ok(self.read_plain()),
        };
        Some(result.map(|w| (w, start_col)))
    }
}

impl<'a> WordSplitter<'a> {
    fn read_plain(&mut self) -> String {
        let start = self.chars.peek().map_or(self.src.len(), |(i, _)| *i);
        let mut end = start;
        while let Some((i, c)) = self.chars.peek().copied() {
            if c.is_whitespace() {
                break;
            }
            if c == self.escape {
                self.chars.next();
                self.chars.next();
                end = self.chars.peek().map_or(self.src.len(), |(j, _)| *j);
                continue;
            }
            self.chars.next();
            end = i + c.len_utf8();
        }
        self.src[start..end].to_owned()
    }

    fn read_quoted(&mut self, quote: char) -> Result<String, BuildError> {
        let (start, _) = self.chars.next().expect("peeked");
        loop {
            match self.chars.next() {
                Some((_, c)) if c == self.escape => {
                    self.chars.next();
                }
                Some((i, c)) if c == quote => {
                    return Ok(self.src[start..=i].to_owned());
                }
                Some(_) => {}
                None => return Err(BuildError::lex(self.line, start, "unterminated quoted string")),
            }
        }
    }

    fn read_bracketed(&mut self) -> Result<String, BuildError> {
        let (start, _) = self.chars.next().expect("peeked");
        let mut depth = 1;
        let mut quote: Option<char> = None;
        loop {
            match self.chars.next() {
                Some((_, c)) if quote.is_some() => {
                    if Some(c) == quote {
                        quote = None;
                    }
                }
                Some((_, c)) if c == '"' || c == '\'' => quote = Some(c),
                Some((_, c)) if c == '[' => depth += 1,
                Some((i, c)) if c == ']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(self.src[start..=i].to_owned());
                    }
                }
                Some(_) => {}
                None => return Err(BuildError::lex(self.line, start, "unterminated JSON array")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn simple_from_run() {
        let k = kinds("FROM alpine:3.18\nRUN echo hi\n");
        assert_eq!(
            k,
            vec![
                TokenKind::Instruction("FROM".into()),
                TokenKind::Argument("alpine:3.18".into()),
                TokenKind::Newline,
                TokenKind::Instruction("RUN".into()),
                TokenKind::Argument("echo".into()),
                TokenKind::Argument("hi".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn escape_directive_changes_continuation_char() {
        let src = "# escape=`\nRUN echo a `\n  echo b\n";
        let k = kinds(src);
        assert!(matches!(k[0], TokenKind::Directive { .. }));
        assert_eq!(
            k[1..],
            [
                TokenKind::Instruction("RUN".into()),
                TokenKind::Argument("echo".into()),
                TokenKind::Argument("a".into()),
                TokenKind::Argument("echo".into()),
                TokenKind::Argument("b".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn json_array_is_single_token() {
        let k = kinds(r#"ENTRYPOINT ["/bin/sh", "-c"]"#);
        assert_eq!(
            k,
            vec![
                TokenKind::Instruction("ENTRYPOINT".into()),
                TokenKind::StringLiteral(r#"["/bin/sh", "-c"]"#.into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn flags_are_recognized() {
        let k = kinds("COPY --from=builder --chown=1000:1000 /a /b");
        assert_eq!(
            k,
            vec![
                TokenKind::Instruction("COPY".into()),
                TokenKind::Flag { name: "from".into(), value: Some("builder".into()) },
                TokenKind::Flag { name: "chown".into(), value: Some("1000:1000".into()) },
                TokenKind::Argument("/a".into()),
                TokenKind::Argument("/b".into()),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_quote_is_lex_error() {
        let err = Lexer::new("RUN echo \"unterminated").tokenize().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Lex);
    }

    #[test]
    fn comment_preserved() {
        let k = kinds("FROM alpine\n# a comment\nRUN x\n");
        assert!(k.contains(&TokenKind::Comment("a comment".into())));
    }
}
