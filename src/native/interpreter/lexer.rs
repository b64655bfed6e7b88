use super::error::{ErrorKind, Exception};

#[derive(Clone, Debug, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Body of an f-string with escapes already processed.
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=",
    "%=", "&=", "|=", "^=", "->", ":=", "<<", ">>", "+", "-", "*", "/", "%", "<", ">", "=",
    "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "&", "|", "^", "~",
];

pub fn tokenize(source: &str) -> Result<Vec<Token>, Exception> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            indents: vec![0],
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn run(mut self) -> Result<Vec<Token>, Exception> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                at_line_start = false;
                if self.handle_indentation()? {
                    at_line_start = true;
                    continue;
                }
            }

            let Some(c) = self.peek() else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push_newline();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek_at(1) == Some('\r') && self.peek_at(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.number()?,
                '"' | '\'' => self.string(false, false)?,
                c if c.is_alphabetic() || c == '_' => {
                    if !self.try_prefixed_string()? {
                        self.name();
                    }
                }
                _ => self.operator()?,
            }
        }

        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(self.tokens)
    }

    fn push_newline(&mut self) {
        let needs = self
            .tokens
            .last()
            .is_some_and(|t| !matches!(t.tok, Tok::Newline | Tok::Indent | Tok::Dedent));
        if needs {
            self.push(Tok::Newline);
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    /// Measures the indentation of a logical line and emits INDENT/DEDENT.
    /// Returns true when the line is blank or a comment and was skipped.
    fn handle_indentation(&mut self) -> Result<bool, Exception> {
        let mut width = 0;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' | '\r' => {}
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek() {
            None => return Ok(true),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                if self.peek() == Some('\n') {
                    self.pos += 1;
                    self.line += 1;
                }
                return Ok(true);
            }
            _ => {}
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            if self.tokens.is_empty() {
                return Err(Exception::syntax_kind(
                    ErrorKind::IndentationError,
                    self.line,
                    "unexpected indent",
                ));
            }
            self.indents.push(width);
            self.push(Tok::Indent);
        } else if width < current {
            while self.indents.last().is_some_and(|&level| level > width) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if self.indents.last() != Some(&width) {
                return Err(Exception::syntax_kind(
                    ErrorKind::IndentationError,
                    self.line,
                    "unindent does not match any outer indentation level",
                ));
            }
        }
        Ok(false)
    }

    fn name(&mut self) {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        self.push(Tok::Name(name));
    }

    fn try_prefixed_string(&mut self) -> Result<bool, Exception> {
        let mut raw = false;
        let mut fmt = false;
        let mut len = 0;
        while let Some(c) = self.peek_at(len) {
            match c.to_ascii_lowercase() {
                'r' if !raw => raw = true,
                'f' if !fmt => fmt = true,
                'b' | 'u' if len == 0 => {
                    if matches!(self.peek_at(1), Some('"' | '\'')) {
                        return Err(Exception::syntax(
                            self.line,
                            "byte and unicode string prefixes are not supported",
                        ));
                    }
                    return Ok(false);
                }
                '"' | '\'' if len > 0 => {
                    self.pos += len;
                    self.string(raw, fmt)?;
                    return Ok(true);
                }
                _ => return Ok(false),
            }
            len += 1;
            if len > 2 {
                return Ok(false);
            }
        }
        Ok(false)
    }

    fn string(&mut self, raw: bool, fmt: bool) -> Result<(), Exception> {
        let start_line = self.line;
        let Some(quote) = self.peek() else {
            return Err(Exception::syntax(self.line, "unexpected end of input"));
        };
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                let msg = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return Err(Exception::syntax(start_line, msg));
            };

            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }

            if c == '\n' {
                if !triple {
                    return Err(Exception::syntax(start_line, "unterminated string literal"));
                }
                self.line += 1;
            }

            if c == '\\' && !raw {
                self.pos += 1;
                self.escape(&mut value)?;
                continue;
            }
            if c == '\\' && raw && self.peek_at(1).is_some() {
                value.push('\\');
                self.pos += 1;
                if let Some(next) = self.peek() {
                    if next == '\n' {
                        self.line += 1;
                    }
                    value.push(next);
                    self.pos += 1;
                }
                continue;
            }

            value.push(c);
            self.pos += 1;
        }

        let tok = if fmt { Tok::FStr(value) } else { Tok::Str(value) };
        self.tokens.push(Token {
            tok,
            line: start_line,
        });
        Ok(())
    }

    fn escape(&mut self, value: &mut String) -> Result<(), Exception> {
        let Some(c) = self.peek() else {
            return Err(Exception::syntax(self.line, "unterminated string literal"));
        };
        self.pos += 1;
        match c {
            '\n' => self.line += 1,
            'n' => value.push('\n'),
            't' => value.push('\t'),
            'r' => value.push('\r'),
            '0' => value.push('\0'),
            'a' => value.push('\x07'),
            'b' => value.push('\x08'),
            'f' => value.push('\x0c'),
            'v' => value.push('\x0b'),
            '\\' => value.push('\\'),
            '\'' => value.push('\''),
            '"' => value.push('"'),
            'x' => value.push(self.hex_escape(2)?),
            'u' => value.push(self.hex_escape(4)?),
            'U' => value.push(self.hex_escape(8)?),
            other => {
                value.push('\\');
                value.push(other);
            }
        }
        Ok(())
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, Exception> {
        let end = self.pos + digits;
        if end > self.chars.len() {
            return Err(Exception::syntax(self.line, "truncated escape sequence"));
        }
        let hex: String = self.chars[self.pos..end].iter().collect();
        self.pos = end;
        u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| Exception::syntax(self.line, "invalid escape sequence"))
    }

    fn number(&mut self) -> Result<(), Exception> {
        let start = self.pos;

        if self.peek() == Some('0') {
            let radix = match self.peek_at(1).map(|c| c.to_ascii_lowercase()) {
                Some('x') => Some(16),
                Some('o') => Some(8),
                Some('b') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits_start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
                    self.pos += 1;
                }
                let digits: String = self.chars[digits_start..self.pos]
                    .iter()
                    .filter(|c| **c != '_')
                    .collect();
                let value = i64::from_str_radix(&digits, radix)
                    .map_err(|_| Exception::syntax(self.line, "invalid number literal"))?;
                self.push(Tok::Int(value));
                return Ok(());
            }
        }

        let mut is_float = false;
        self.digits();
        if self.peek() == Some('.') && !self.peek_at(1).is_some_and(|c| c.is_alphabetic() || c == '_') {
            is_float = true;
            self.pos += 1;
            self.digits();
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = matches!(self.peek_at(1), Some('+' | '-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += digit_at;
                self.digits();
            }
        }
        if self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            return Err(Exception::syntax(self.line, "invalid decimal literal"));
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| Exception::syntax(self.line, "invalid decimal literal"))?;
            self.push(Tok::Float(value));
        } else {
            let value = text.parse::<i64>().map_err(|_| {
                Exception::syntax(self.line, "integer literal is too large for the sandbox")
            })?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.pos += 1;
        }
    }

    fn operator(&mut self) -> Result<(), Exception> {
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c));
            if !matches {
                continue;
            }
            match *op {
                "(" | "[" | "{" => self.depth += 1,
                ")" | "]" | "}" => {
                    if self.depth == 0 {
                        return Err(Exception::syntax(
                            self.line,
                            format!("unmatched '{}'", op),
                        ));
                    }
                    self.depth -= 1;
                }
                _ => {}
            }
            self.pos += len;
            self.push(Tok::Op(*op));
            return Ok(());
        }

        let c = self.peek().unwrap_or(' ');
        Err(Exception::syntax(
            self.line,
            format!("invalid character '{}' (U+{:04X})", c, c as u32),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_indentation_tokens() {
        let tokens = toks("if x:\n    y = 1\n\n    # note\nz\n");
        assert_eq!(
            tokens,
            vec![
                Tok::Name("if".into()),
                Tok::Name("x".into()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_brackets_join_lines() {
        let tokens = toks("x = [1,\n     2]\n");
        assert!(!tokens[..tokens.len() - 2].contains(&Tok::Newline));
    }

    #[test]
    fn test_numbers_and_strings() {
        assert_eq!(
            toks("1_000 2.5 1e3 0xff 'a\\nb' r'a\\n' f\"{x}\""),
            vec![
                Tok::Int(1000),
                Tok::Float(2.5),
                Tok::Float(1000.0),
                Tok::Int(255),
                Tok::Str("a\nb".into()),
                Tok::Str("a\\n".into()),
                Tok::FStr("{x}".into()),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_triple_quoted_string_spans_lines() {
        let tokens = tokenize("s = \"\"\"a\nb\"\"\"\nprint(s)\n").unwrap();
        assert_eq!(tokens[2].tok, Tok::Str("a\nb".into()));
        let print = tokens.iter().find(|t| t.tok == Tok::Name("print".into())).unwrap();
        assert_eq!(print.line, 3);
    }

    #[test]
    fn test_errors() {
        let err = tokenize("x = 'abc\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert_eq!(err.line(), Some(1));

        let err = tokenize("if x:\n        a\n    b\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndentationError);

        let err = tokenize("x = 1)\n").unwrap_err();
        assert!(err.msg.contains("unmatched"));

        let err = tokenize("x = $\n").unwrap_err();
        assert!(err.msg.contains("invalid character"));
    }
}
