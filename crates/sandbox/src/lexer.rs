//! Tokenizer for orchestration scripts.

use std::fmt;

use crate::error::{Result, SyntaxError};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Num(f64),
    Str(String),
    Template(Vec<TemplatePiece>),
    Ident(String),
    Punct(&'static str),
    Eof,
}

/// A piece of a template literal; substitutions are pre-tokenized.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePiece {
    Text(String),
    Expr(Vec<Spanned>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Template(_) => f.write_str("template literal"),
            Token::Ident(name) => f.write_str(name),
            Token::Punct(p) => f.write_str(p),
            Token::Eof => f.write_str("end of input"),
        }
    }
}

// Longest first.
const PUNCTUATORS: &[&str] = &[
    "...", "===", "!==", "=>", "==", "!=", "<=", ">=", "&&", "||", "??", "?.", "+=", "-=", "*=",
    "/=", "%=", "++", "--", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*", "/",
    "%", "!", "=", ".", "?", ":",
];

pub fn tokenize(src: &str) -> Result<Vec<Spanned>> {
    Lexer::new(src, 1).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

impl Lexer {
    fn new(src: &str, line: usize) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line)
    }

    fn run(mut self) -> Result<Vec<Spanned>> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia()?;
            let line = self.line;
            let Some(c) = self.peek() else {
                out.push(Spanned {
                    token: Token::Eof,
                    line,
                });
                return Ok(out);
            };

            let token = if c.is_ascii_digit()
                || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
            {
                self.number()?
            } else if c == '"' || c == '\'' {
                self.string(c)?
            } else if c == '`' {
                self.template()?
            } else if is_ident_start(c) {
                self.ident()
            } else {
                self.punct()?
            };
            out.push(Spanned { token, line });
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '/' && self.peek_at(1) == Some('/') {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
            } else if c == '/' && self.peek_at(1) == Some('*') {
                self.pos += 2;
                loop {
                    match self.bump() {
                        Some('*') if self.peek() == Some('/') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => {}
                        None => return Err(self.error("unterminated comment")),
                    }
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn number(&mut self) -> Result<Token> {
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X')) {
            self.pos += 2;
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit() || c == '_') {
                self.pos += 1;
            }
            let digits: String = self.chars[start..self.pos]
                .iter()
                .filter(|c| **c != '_')
                .collect();
            return i64::from_str_radix(&digits, 16)
                .map(|n| Token::Num(n as f64))
                .map_err(|_| self.error("invalid hexadecimal literal"));
        }

        let mut text = String::new();
        let digits = |lexer: &mut Self, text: &mut String| {
            while let Some(c) = lexer.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                } else if c != '_' {
                    break;
                }
                lexer.pos += 1;
            }
        };

        digits(self, &mut text);
        if self.peek() == Some('.') {
            text.push('.');
            self.pos += 1;
            digits(self, &mut text);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            text.push('e');
            self.pos += 1;
            if let Some(sign @ ('+' | '-')) = self.peek() {
                text.push(sign);
                self.pos += 1;
            }
            digits(self, &mut text);
        }
        if self.peek().is_some_and(is_ident_start) {
            return Err(self.error("identifier starts immediately after numeric literal"));
        }

        text.parse::<f64>()
            .map(Token::Num)
            .map_err(|_| self.error(format!("invalid number '{text}'")))
    }

    fn escape(&mut self) -> Result<Option<char>> {
        let Some(c) = self.bump() else {
            return Err(self.error("unterminated string"));
        };
        let escaped = match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'v' => '\u{b}',
            '0' => '\0',
            // Line continuation.
            '\n' => return Ok(None),
            'x' => self.hex_escape(2)?,
            'u' if self.peek() == Some('{') => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| c != '}') {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                u32::from_str_radix(&digits, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.error("invalid unicode escape"))?
            }
            'u' => self.hex_escape(4)?,
            other => other,
        };
        Ok(Some(escaped))
    }

    fn hex_escape(&mut self, len: usize) -> Result<char> {
        if self.pos + len > self.chars.len() {
            return Err(self.error("invalid escape sequence"));
        }
        let digits: String = self.chars[self.pos..self.pos + len].iter().collect();
        self.pos += len;
        u32::from_str_radix(&digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error("invalid escape sequence"))
    }

    fn string(&mut self, quote: char) -> Result<Token> {
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(Token::Str(text)),
                Some('\\') => {
                    if let Some(c) = self.escape()? {
                        text.push(c);
                    }
                }
                Some('\n') | None => return Err(self.error("unterminated string")),
                Some(c) => text.push(c),
            }
        }
    }

    fn template(&mut self) -> Result<Token> {
        self.pos += 1;
        let mut pieces = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated template literal")),
                Some('`') => {
                    self.pos += 1;
                    break;
                }
                Some('\\') => {
                    self.pos += 1;
                    if let Some(c) = self.escape()? {
                        text.push(c);
                    }
                }
                Some('$') if self.peek_at(1) == Some('{') => {
                    self.pos += 2;
                    if !text.is_empty() {
                        pieces.push(TemplatePiece::Text(std::mem::take(&mut text)));
                    }
                    let line = self.line;
                    let source = self.substitution_source()?;
                    let tokens = Lexer::new(&source, line).run()?;
                    pieces.push(TemplatePiece::Expr(tokens));
                }
                Some(_) => {
                    if let Some(c) = self.bump() {
                        text.push(c);
                    }
                }
            }
        }
        if !text.is_empty() {
            pieces.push(TemplatePiece::Text(text));
        }
        Ok(Token::Template(pieces))
    }

    /// Source text of a `${ ... }` substitution, consuming the closing brace.
    fn substitution_source(&mut self) -> Result<String> {
        let start = self.pos;
        let mut depth = 1usize;
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated template substitution"));
            };
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(self.chars[start..self.pos - 1].iter().collect());
                    }
                }
                '"' | '\'' | '`' => {
                    while let Some(inner) = self.bump() {
                        if inner == '\\' {
                            self.bump();
                        } else if inner == c {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn ident(&mut self) -> Token {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_part) {
            self.pos += 1;
        }
        Token::Ident(self.chars[start..self.pos].iter().collect())
    }

    fn punct(&mut self) -> Result<Token> {
        for p in PUNCTUATORS {
            let len = p.len();
            if self.pos + len > self.chars.len() {
                continue;
            }
            if !self.chars[self.pos..self.pos + len]
                .iter()
                .copied()
                .eq(p.chars())
            {
                continue;
            }
            // `a ?.5 : b` is a conditional, not optional chaining.
            if *p == "?." && self.peek_at(2).is_some_and(|c| c.is_ascii_digit()) {
                continue;
            }
            self.pos += len;
            return Ok(Token::Punct(p));
        }
        let c = self.peek().unwrap_or_default();
        Err(self.error(format!("unexpected character '{c}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn punctuators_prefer_longest_match() {
        assert_eq!(
            tokens("a !== b ?? c"),
            vec![
                Token::Ident("a".into()),
                Token::Punct("!=="),
                Token::Ident("b".into()),
                Token::Punct("??"),
                Token::Ident("c".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn numbers_and_strings() {
        assert_eq!(
            tokens(r#"1.5e2 0x10 'it\'s' "a\nb""#),
            vec![
                Token::Num(150.0),
                Token::Num(16.0),
                Token::Str("it's".into()),
                Token::Str("a\nb".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn template_substitutions_are_tokenized() {
        let toks = tokens("`n=${ {a: 1}.a }!`");
        let Token::Template(pieces) = &toks[0] else {
            panic!("expected template, got {:?}", toks[0]);
        };
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], TemplatePiece::Text("n=".into()));
        assert!(matches!(&pieces[1], TemplatePiece::Expr(inner) if inner.len() == 8));
        assert_eq!(pieces[2], TemplatePiece::Text("!".into()));
    }

    #[test]
    fn comments_advance_line_numbers() {
        let spanned = tokenize("// first\n/* two\nlines */ x").unwrap();
        assert_eq!(spanned[0].token, Token::Ident("x".into()));
        assert_eq!(spanned[0].line, 3);
    }

    #[test]
    fn conditional_with_leading_decimal() {
        assert_eq!(
            tokens("a?.5:1"),
            vec![
                Token::Ident("a".into()),
                Token::Punct("?"),
                Token::Num(0.5),
                Token::Punct(":"),
                Token::Num(1.0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_string_reports_line() {
        let err = tokenize("\n'abc").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unterminated"));
    }
}
