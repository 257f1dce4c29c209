//! Recursive-descent parser producing [`crate::ast`] nodes.

use std::sync::Arc;

use crate::ast::{
    BinaryOp, Binding, Block, DeclKind, Element, Expr, FunctionBody, FunctionDef, Literal,
    LogicalOp, Pattern, Property, PropertyKey, Stmt, TemplatePart, UnaryOp,
};
use crate::error::{Result, SyntaxError};
use crate::lexer::{Spanned, TemplatePiece, Token, tokenize};

static EOF: Token = Token::Eof;

/// Guards the native stack against pathological nesting.
const MAX_NESTING: usize = 128;

const RESERVED: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "default", "delete", "do",
    "else", "export", "extends", "false", "finally", "for", "function", "if", "import", "in",
    "instanceof", "let", "new", "null", "return", "super", "switch", "this", "throw", "true",
    "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Parse a script as the body of an async function.
pub fn parse_script(src: &str) -> Result<Block> {
    let mut parser = Parser::new(tokenize(src)?);
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(body)
}

enum Infix {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn infix(token: &Token) -> Option<(Infix, u8)> {
    let Token::Punct(p) = token else {
        return None;
    };
    let op = match *p {
        "??" => (Infix::Logical(LogicalOp::Nullish), 1),
        "||" => (Infix::Logical(LogicalOp::Or), 2),
        "&&" => (Infix::Logical(LogicalOp::And), 3),
        "==" => (Infix::Binary(BinaryOp::Eq), 4),
        "!=" => (Infix::Binary(BinaryOp::NotEq), 4),
        "===" => (Infix::Binary(BinaryOp::StrictEq), 4),
        "!==" => (Infix::Binary(BinaryOp::StrictNotEq), 4),
        "<" => (Infix::Binary(BinaryOp::Lt), 5),
        ">" => (Infix::Binary(BinaryOp::Gt), 5),
        "<=" => (Infix::Binary(BinaryOp::LtEq), 5),
        ">=" => (Infix::Binary(BinaryOp::GtEq), 5),
        "+" => (Infix::Binary(BinaryOp::Add), 6),
        "-" => (Infix::Binary(BinaryOp::Sub), 6),
        "*" => (Infix::Binary(BinaryOp::Mul), 7),
        "/" => (Infix::Binary(BinaryOp::Div), 7),
        "%" => (Infix::Binary(BinaryOp::Rem), 7),
        _ => return None,
    };
    Some(op)
}

fn assign_op(token: &Token) -> Option<Option<BinaryOp>> {
    let Token::Punct(p) = token else {
        return None;
    };
    match *p {
        "=" => Some(None),
        "+=" => Some(Some(BinaryOp::Add)),
        "-=" => Some(Some(BinaryOp::Sub)),
        "*=" => Some(Some(BinaryOp::Mul)),
        "/=" => Some(Some(BinaryOp::Div)),
        "%=" => Some(Some(BinaryOp::Rem)),
        _ => None,
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    // --- Token helpers ---

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.pos + offset)
            .or_else(|| self.tokens.last())
            .map_or(&EOF, |s| &s.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |s| s.line)
    }

    fn prev_line(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(1, |s| s.line)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line())
    }

    fn unexpected(&self) -> SyntaxError {
        self.error(format!("unexpected token {}", self.peek()))
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Token::Punct(q) if *q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{p}' but found {}", self.peek())))
        }
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(w) if w == word)
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.is_word(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<()> {
        if self.eat_word(word) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{word}' but found {}", self.peek())))
        }
    }

    /// A non-reserved identifier.
    fn identifier(&mut self) -> Result<String> {
        match self.peek() {
            Token::Ident(name) if !RESERVED.contains(&name.as_str()) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(format!("expected identifier but found {}", self.peek()))),
        }
    }

    /// Any word, reserved or not (property names).
    fn property_name(&mut self) -> Result<String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(self.error(format!("expected property name but found {other}"))),
        }
    }

    fn consume_semicolon(&mut self) -> Result<()> {
        if self.eat_punct(";") || self.is_punct("}") || self.at_eof() {
            return Ok(());
        }
        if self.line() > self.prev_line() {
            return Ok(());
        }
        Err(self.error(format!("expected ';' but found {}", self.peek())))
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        let result = parse(self);
        self.depth -= 1;
        result
    }

    // --- Statements ---

    fn statement(&mut self) -> Result<Stmt> {
        self.nested(Self::statement_inner)
    }

    fn statement_inner(&mut self) -> Result<Stmt> {
        if self.is_punct("{") {
            return Ok(Stmt::Block(self.block()?));
        }
        if self.eat_punct(";") {
            return Ok(Stmt::Empty);
        }

        let Token::Ident(word) = self.peek() else {
            return self.expression_statement();
        };
        let word = word.clone();

        match word.as_str() {
            "const" | "let" | "var" => {
                let stmt = self.declaration()?;
                self.consume_semicolon()?;
                Ok(stmt)
            }
            "function" => Ok(Stmt::Function(self.function(false)?)),
            "async" if matches!(self.peek_at(1), Token::Ident(w) if w == "function") => {
                self.pos += 1;
                Ok(Stmt::Function(self.function(true)?))
            }
            "return" => {
                let line = self.line();
                self.pos += 1;
                let value = if self.is_punct(";")
                    || self.is_punct("}")
                    || self.at_eof()
                    || self.line() > line
                {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.consume_semicolon()?;
                Ok(Stmt::Return(value))
            }
            "throw" => {
                self.pos += 1;
                let value = self.expression()?;
                self.consume_semicolon()?;
                Ok(Stmt::Throw(value))
            }
            "if" => {
                self.pos += 1;
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                let consequent = Box::new(self.statement()?);
                let alternate = if self.eat_word("else") {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    test,
                    consequent,
                    alternate,
                })
            }
            "for" => self.for_statement(),
            "while" => {
                self.pos += 1;
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.statement()?);
                Ok(Stmt::While { test, body })
            }
            "break" => {
                self.pos += 1;
                self.consume_semicolon()?;
                Ok(Stmt::Break)
            }
            "continue" => {
                self.pos += 1;
                self.consume_semicolon()?;
                Ok(Stmt::Continue)
            }
            "try" => self.try_statement(),
            "class" | "switch" | "do" | "import" | "export" | "with" | "yield" => {
                Err(self.error(format!("'{word}' is not supported in scripts")))
            }
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> Result<Stmt> {
        let expr = self.expression()?;
        self.consume_semicolon()?;
        Ok(Stmt::Expr(expr))
    }

    fn block(&mut self) -> Result<Block> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.error("expected '}' but found end of input"));
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn decl_kind(&mut self) -> Result<DeclKind> {
        let kind = match self.peek() {
            Token::Ident(w) if w == "const" => DeclKind::Const,
            Token::Ident(w) if w == "let" => DeclKind::Let,
            Token::Ident(w) if w == "var" => DeclKind::Var,
            _ => return Err(self.unexpected()),
        };
        self.pos += 1;
        Ok(kind)
    }

    fn declaration(&mut self) -> Result<Stmt> {
        let kind = self.decl_kind()?;
        let first = self.binding_target()?;
        self.declarators(kind, first)
    }

    /// Remaining declarators once the first target has been read.
    fn declarators(&mut self, kind: DeclKind, first: Pattern) -> Result<Stmt> {
        let mut declarators = Vec::new();
        let mut pattern = first;
        loop {
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                if kind == DeclKind::Const {
                    return Err(self.error("missing initializer in const declaration"));
                }
                if !matches!(pattern, Pattern::Ident(_)) {
                    return Err(self.error("missing initializer in destructuring declaration"));
                }
                None
            };
            declarators.push((pattern, init));
            if !self.eat_punct(",") {
                break;
            }
            pattern = self.binding_target()?;
        }
        Ok(Stmt::Declare { kind, declarators })
    }

    fn for_statement(&mut self) -> Result<Stmt> {
        self.expect_word("for")?;
        self.expect_punct("(")?;

        let init = if self.eat_punct(";") {
            None
        } else if matches!(self.peek(), Token::Ident(w) if matches!(w.as_str(), "const" | "let" | "var"))
        {
            let kind = self.decl_kind()?;
            let pattern = self.binding_target()?;
            if self.eat_word("of") {
                let iterable = self.assignment()?;
                self.expect_punct(")")?;
                let body = Box::new(self.statement()?);
                return Ok(Stmt::ForOf {
                    kind,
                    pattern,
                    iterable,
                    body,
                });
            }
            let decl = self.declarators(kind, pattern)?;
            self.expect_punct(";")?;
            Some(Box::new(decl))
        } else {
            let expr = self.expression()?;
            self.expect_punct(";")?;
            Some(Box::new(Stmt::Expr(expr)))
        };

        let test = if self.is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn try_statement(&mut self) -> Result<Stmt> {
        self.expect_word("try")?;
        let block = self.block()?;
        let handler = if self.eat_word("catch") {
            let param = if self.eat_punct("(") {
                let pattern = self.binding_target()?;
                self.expect_punct(")")?;
                Some(pattern)
            } else {
                None
            };
            Some((param, self.block()?))
        } else {
            None
        };
        let finalizer = if self.eat_word("finally") {
            Some(self.block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error("missing catch or finally after try"));
        }
        Ok(Stmt::Try {
            block,
            handler,
            finalizer,
        })
    }

    // --- Patterns ---

    fn binding_target(&mut self) -> Result<Pattern> {
        if self.eat_punct("[") {
            let mut elements = Vec::new();
            let mut rest = None;
            while !self.eat_punct("]") {
                if self.eat_punct(",") {
                    elements.push(None);
                    continue;
                }
                if self.eat_punct("...") {
                    rest = Some(Box::new(self.binding_target()?));
                    self.expect_punct("]")?;
                    break;
                }
                elements.push(Some(self.binding()?));
                if !self.is_punct("]") {
                    self.expect_punct(",")?;
                }
            }
            return Ok(Pattern::Array { elements, rest });
        }

        if self.eat_punct("{") {
            let mut properties = Vec::new();
            let mut rest = None;
            while !self.eat_punct("}") {
                if self.eat_punct("...") {
                    rest = Some(Box::new(Pattern::Ident(self.identifier()?)));
                    self.expect_punct("}")?;
                    break;
                }
                let key = match self.peek().clone() {
                    Token::Str(s) => {
                        self.pos += 1;
                        s
                    }
                    _ => self.property_name()?,
                };
                let binding = if self.eat_punct(":") {
                    self.binding()?
                } else {
                    if RESERVED.contains(&key.as_str()) {
                        return Err(self.error(format!("unexpected reserved word '{key}'")));
                    }
                    let default = if self.eat_punct("=") {
                        Some(self.assignment()?)
                    } else {
                        None
                    };
                    Binding {
                        pattern: Pattern::Ident(key.clone()),
                        default,
                    }
                };
                properties.push((key, binding));
                if !self.is_punct("}") {
                    self.expect_punct(",")?;
                }
            }
            return Ok(Pattern::Object { properties, rest });
        }

        Ok(Pattern::Ident(self.identifier()?))
    }

    fn binding(&mut self) -> Result<Binding> {
        let pattern = self.binding_target()?;
        let default = if self.eat_punct("=") {
            Some(self.assignment()?)
        } else {
            None
        };
        Ok(Binding { pattern, default })
    }

    // --- Functions ---

    fn params(&mut self) -> Result<(Vec<Binding>, Option<Pattern>)> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        let mut rest = None;
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                rest = Some(self.binding_target()?);
                self.expect_punct(")")?;
                break;
            }
            params.push(self.binding()?);
            if !self.is_punct(")") {
                self.expect_punct(",")?;
            }
        }
        Ok((params, rest))
    }

    /// `function name(params) { body }`, positioned at `function`.
    fn function(&mut self, is_async: bool) -> Result<Arc<FunctionDef>> {
        self.expect_word("function")?;
        let name = match self.peek() {
            Token::Ident(_) => Some(self.identifier()?),
            _ => None,
        };
        let (params, rest) = self.params()?;
        let body = FunctionBody::Block(self.block()?);
        Ok(Arc::new(FunctionDef {
            name,
            params,
            rest,
            body,
            is_async,
        }))
    }

    /// Index of the token closing the bracket opened at `open`.
    fn matching_close(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (i, spanned) in self.tokens.iter().enumerate().skip(open) {
            match &spanned.token {
                Token::Punct("(" | "[" | "{") => depth += 1,
                Token::Punct(")" | "]" | "}") => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                Token::Eof => return None,
                _ => {}
            }
        }
        None
    }

    fn arrow_at(&self, offset: usize) -> bool {
        let idx = self.pos + offset;
        match self.tokens.get(idx).map(|s| &s.token) {
            Some(Token::Ident(name)) if !RESERVED.contains(&name.as_str()) => {
                matches!(self.tokens.get(idx + 1).map(|s| &s.token), Some(Token::Punct("=>")))
            }
            Some(Token::Punct("(")) => self
                .matching_close(idx)
                .and_then(|close| self.tokens.get(close + 1))
                .is_some_and(|s| s.token == Token::Punct("=>")),
            _ => false,
        }
    }

    fn is_arrow_start(&self) -> bool {
        if self.is_word("async") && self.arrow_at(1) {
            return true;
        }
        self.arrow_at(0)
    }

    fn arrow(&mut self) -> Result<Expr> {
        let is_async = if self.is_word("async") && !matches!(self.peek_at(1), Token::Punct("=>")) {
            self.pos += 1;
            true
        } else {
            false
        };

        let (params, rest) = if self.is_punct("(") {
            self.params()?
        } else {
            let name = self.identifier()?;
            (
                vec![Binding {
                    pattern: Pattern::Ident(name),
                    default: None,
                }],
                None,
            )
        };
        self.expect_punct("=>")?;
        let body = if self.is_punct("{") {
            FunctionBody::Block(self.block()?)
        } else {
            FunctionBody::Expr(self.assignment()?)
        };
        Ok(Expr::Function(Arc::new(FunctionDef {
            name: None,
            params,
            rest,
            body,
            is_async,
        })))
    }

    // --- Expressions ---

    fn expression(&mut self) -> Result<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr> {
        self.nested(Self::assignment_inner)
    }

    fn assignment_inner(&mut self) -> Result<Expr> {
        if self.is_arrow_start() {
            return self.arrow();
        }

        let left = self.conditional()?;
        if let Some(op) = assign_op(self.peek()) {
            if !left.is_assignable() {
                return Err(self.error("invalid assignment target"));
            }
            self.pos += 1;
            let value = self.assignment()?;
            return Ok(Expr::Assign {
                op,
                target: Box::new(left),
                value: Box::new(value),
            });
        }
        Ok(left)
    }

    fn conditional(&mut self) -> Result<Expr> {
        let test = self.binary(1)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let consequent = self.assignment()?;
        self.expect_punct(":")?;
        let alternate = self.assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn binary(&mut self, min: u8) -> Result<Expr> {
        let mut left = self.unary()?;
        while let Some((op, prec)) = infix(self.peek()) {
            if prec < min {
                break;
            }
            self.pos += 1;
            let right = self.binary(prec + 1)?;
            left = match op {
                Infix::Binary(op) => Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                Infix::Logical(op) => Expr::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        self.nested(Self::unary_inner)
    }

    fn unary_inner(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Token::Punct("!") => Some(UnaryOp::Not),
            Token::Punct("-") => Some(UnaryOp::Neg),
            Token::Punct("+") => Some(UnaryOp::Plus),
            Token::Ident(w) if w == "typeof" => Some(UnaryOp::TypeOf),
            Token::Ident(w) if w == "void" => Some(UnaryOp::Void),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let argument = Box::new(self.unary()?);
            return Ok(Expr::Unary { op, argument });
        }

        if self.eat_word("await") {
            return Ok(Expr::Await(Box::new(self.unary()?)));
        }

        if self.is_punct("++") || self.is_punct("--") {
            let increment = self.is_punct("++");
            self.pos += 1;
            let target = self.unary()?;
            if !target.is_assignable() {
                return Err(self.error("invalid update target"));
            }
            return Ok(Expr::Update {
                increment,
                prefix: true,
                target: Box::new(target),
            });
        }

        let expr = self.call_member()?;
        if (self.is_punct("++") || self.is_punct("--")) && self.line() == self.prev_line() {
            if !expr.is_assignable() {
                return Err(self.error("invalid update target"));
            }
            let increment = self.is_punct("++");
            self.pos += 1;
            return Ok(Expr::Update {
                increment,
                prefix: false,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn arguments(&mut self) -> Result<Vec<Element>> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                args.push(Element::Spread(self.assignment()?));
            } else {
                args.push(Element::Item(self.assignment()?));
            }
            if !self.is_punct(")") {
                self.expect_punct(",")?;
            }
        }
        Ok(args)
    }

    fn call_member(&mut self) -> Result<Expr> {
        let mut expr = if self.eat_word("new") {
            let mut callee = self.primary()?;
            while self.eat_punct(".") {
                callee = Expr::Member {
                    object: Box::new(callee),
                    property: PropertyKey::Static(self.property_name()?),
                    optional: false,
                };
            }
            let args = if self.is_punct("(") {
                self.arguments()?
            } else {
                Vec::new()
            };
            Expr::New {
                callee: Box::new(callee),
                args,
            }
        } else {
            self.primary()?
        };

        loop {
            if self.eat_punct(".") {
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: PropertyKey::Static(self.property_name()?),
                    optional: false,
                };
            } else if self.eat_punct("?.") {
                expr = if self.is_punct("(") {
                    Expr::Call {
                        callee: Box::new(expr),
                        args: self.arguments()?,
                        optional: true,
                    }
                } else if self.eat_punct("[") {
                    let key = self.expression()?;
                    self.expect_punct("]")?;
                    Expr::Member {
                        object: Box::new(expr),
                        property: PropertyKey::Computed(Box::new(key)),
                        optional: true,
                    }
                } else {
                    Expr::Member {
                        object: Box::new(expr),
                        property: PropertyKey::Static(self.property_name()?),
                        optional: true,
                    }
                };
            } else if self.eat_punct("[") {
                let key = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: PropertyKey::Computed(Box::new(key)),
                    optional: false,
                };
            } else if self.is_punct("(") {
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args: self.arguments()?,
                    optional: false,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.peek().clone();
        match token {
            Token::Num(n) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::Number(n)))
            }
            Token::Str(s) => {
                self.pos += 1;
                Ok(Expr::Literal(Literal::String(s)))
            }
            Token::Template(pieces) => {
                self.pos += 1;
                self.template(pieces)
            }
            Token::Punct("(") => {
                self.pos += 1;
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Token::Punct("[") => self.array_literal(),
            Token::Punct("{") => self.object_literal(),
            Token::Ident(word) => match word.as_str() {
                "true" | "false" => {
                    self.pos += 1;
                    Ok(Expr::Literal(Literal::Bool(word == "true")))
                }
                "null" => {
                    self.pos += 1;
                    Ok(Expr::Literal(Literal::Null))
                }
                "undefined" => {
                    self.pos += 1;
                    Ok(Expr::Literal(Literal::Undefined))
                }
                "function" => Ok(Expr::Function(self.function(false)?)),
                "async" if matches!(self.peek_at(1), Token::Ident(w) if w == "function") => {
                    self.pos += 1;
                    Ok(Expr::Function(self.function(true)?))
                }
                _ => Ok(Expr::Ident(self.identifier()?)),
            },
            _ => Err(self.unexpected()),
        }
    }

    fn template(&mut self, pieces: Vec<TemplatePiece>) -> Result<Expr> {
        let mut parts = Vec::with_capacity(pieces.len());
        for piece in pieces {
            match piece {
                TemplatePiece::Text(text) => parts.push(TemplatePart::Text(text)),
                TemplatePiece::Expr(tokens) => {
                    let mut inner = Parser::new(tokens);
                    inner.depth = self.depth;
                    let expr = inner.expression()?;
                    if !inner.at_eof() {
                        return Err(inner.unexpected());
                    }
                    parts.push(TemplatePart::Expr(expr));
                }
            }
        }
        Ok(Expr::Template(parts))
    }

    fn array_literal(&mut self) -> Result<Expr> {
        self.expect_punct("[")?;
        let mut elements = Vec::new();
        while !self.eat_punct("]") {
            if self.is_punct(",") {
                self.pos += 1;
                elements.push(Element::Item(Expr::Literal(Literal::Undefined)));
                continue;
            }
            if self.eat_punct("...") {
                elements.push(Element::Spread(self.assignment()?));
            } else {
                elements.push(Element::Item(self.assignment()?));
            }
            if !self.is_punct("]") {
                self.expect_punct(",")?;
            }
        }
        Ok(Expr::Array(elements))
    }

    fn object_literal(&mut self) -> Result<Expr> {
        self.expect_punct("{")?;
        let mut properties = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                properties.push(Property::Spread(self.assignment()?));
            } else {
                let (key, shorthand) = match self.advance() {
                    Token::Ident(name) => (PropertyKey::Static(name.clone()), Some(name)),
                    Token::Str(s) => (PropertyKey::Static(s), None),
                    Token::Num(n) => (PropertyKey::Static(crate::value::format_number(n)), None),
                    Token::Punct("[") => {
                        let key = self.expression()?;
                        self.expect_punct("]")?;
                        (PropertyKey::Computed(Box::new(key)), None)
                    }
                    other => return Err(self.error(format!("unexpected token {other} in object literal"))),
                };

                let value = if self.eat_punct(":") {
                    self.assignment()?
                } else if self.is_punct("(") {
                    let (params, rest) = self.params()?;
                    let body = FunctionBody::Block(self.block()?);
                    Expr::Function(Arc::new(FunctionDef {
                        name: shorthand,
                        params,
                        rest,
                        body,
                        is_async: false,
                    }))
                } else {
                    match shorthand {
                        Some(name) if !RESERVED.contains(&name.as_str()) => Expr::Ident(name),
                        _ => return Err(self.error("expected ':' in object literal")),
                    }
                };
                properties.push(Property::KeyValue(key, value));
            }
            if !self.is_punct("}") {
                self.expect_punct(",")?;
            }
        }
        Ok(Expr::Object(properties))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_expr(src: &str) -> Expr {
        let mut body = parse_script(src).unwrap();
        match body.remove(0) {
            Stmt::Expr(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let Expr::Binary { op, right, .. } = parse_expr("1 + 2 * 3") else {
            panic!("expected binary expression");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn arrow_functions_are_detected() {
        assert!(matches!(parse_expr("x => x + 1"), Expr::Function(def) if def.params.len() == 1));
        assert!(matches!(
            parse_expr("async (a, b = 2, ...rest) => { return a; }"),
            Expr::Function(def) if def.is_async && def.params.len() == 2 && def.rest.is_some()
        ));
        assert!(matches!(parse_expr("(1 + 2)"), Expr::Binary { .. }));
    }

    #[test]
    fn return_without_semicolon_uses_line_breaks() {
        let body = parse_script("return\n42").unwrap();
        assert!(matches!(body[0], Stmt::Return(None)));
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn destructuring_declarations() {
        let body = parse_script("const [a, , b = 1, ...rest] = xs; let { x, y: { z }, ...others } = o;")
            .unwrap();
        let Stmt::Declare { declarators, .. } = &body[0] else {
            panic!("expected declaration");
        };
        assert!(matches!(
            &declarators[0].0,
            Pattern::Array { elements, rest: Some(_) } if elements.len() == 3 && elements[1].is_none()
        ));
        assert!(matches!(&body[1], Stmt::Declare { kind: DeclKind::Let, .. }));
    }

    #[test]
    fn optional_chaining_and_calls() {
        let expr = parse_expr("a?.b.c(1, ...d)");
        let Expr::Call { callee, args, optional } = expr else {
            panic!("expected call");
        };
        assert!(!optional);
        assert_eq!(args.len(), 2);
        assert!(matches!(*callee, Expr::Member { optional: false, .. }));
    }

    #[test]
    fn for_of_and_classic_for() {
        let body =
            parse_script("for (const x of xs) total += x; for (let i = 0; i < 3; i++) {}").unwrap();
        assert!(matches!(body[0], Stmt::ForOf { kind: DeclKind::Const, .. }));
        assert!(matches!(body[1], Stmt::For { init: Some(_), test: Some(_), update: Some(_), .. }));
    }

    #[test]
    fn const_requires_initializer() {
        let err = parse_script("const x;").unwrap_err();
        assert!(err.message.contains("initializer"));
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = parse_script("const a = 1;\nconst b = ;").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.to_string().starts_with("SyntaxError:"));
    }

    #[test]
    fn invalid_assignment_target() {
        assert!(parse_script("1 = 2").is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let src = format!("{}1{}", "(".repeat(600), ")".repeat(600));
        let err = parse_script(&src).unwrap_err();
        assert!(err.message.contains("nesting"));
    }
}
