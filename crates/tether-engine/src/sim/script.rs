//! The sim engine's script language
//!
//! A deliberately tiny expression language, just enough to drive values,
//! property access and host call-ins through the bridge:
//!
//! ```text
//! program := stmt (';' stmt)*
//! stmt    := 'throw' expr | expr
//! expr    := unary ('=' expr)?
//! unary   := '-' unary | postfix
//! postfix := primary ('.' ident | '(' args ')')*
//! primary := number | string | true | false | null | undefined
//!          | ident | '{' (key ':' expr),* '}' | '(' expr ')'
//! ```
//!
//! A program evaluates to the value of its last statement.

use logos::Logos;
use std::fmt;

/// Source position, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Pos {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
enum Tok {
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Whitespace,

    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,

    #[token("throw")]
    Throw,

    #[token("true")]
    True,

    #[token("false")]
    False,

    #[token("null")]
    Null,

    #[token("undefined")]
    Undefined,

    #[regex(r"[a-zA-Z_$][a-zA-Z0-9_$]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""([^"\\]|\\.)*""#, parse_string)]
    #[regex(r"'([^'\\]|\\.)*'", parse_string)]
    Str(String),

    #[token("(")]
    LeftParen,

    #[token(")")]
    RightParen,

    #[token("{")]
    LeftBrace,

    #[token("}")]
    RightBrace,

    #[token(".")]
    Dot,

    #[token(",")]
    Comma,

    #[token(";")]
    Semicolon,

    #[token(":")]
    Colon,

    #[token("=")]
    Equal,

    #[token("-")]
    Minus,
}

fn parse_string(lex: &mut logos::Lexer<Tok>) -> Option<String> {
    let s = lex.slice();
    let inner = &s[1..s.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(c) => out.push(c),
            None => break,
        }
    }
    Some(out)
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(name) => write!(f, "identifier '{}'", name),
            Tok::Number(n) => write!(f, "number {}", format_number(*n)),
            Tok::Str(_) => write!(f, "string"),
            Tok::Throw => write!(f, "'throw'"),
            Tok::True => write!(f, "'true'"),
            Tok::False => write!(f, "'false'"),
            Tok::Null => write!(f, "'null'"),
            Tok::Undefined => write!(f, "'undefined'"),
            Tok::LeftParen => write!(f, "'('"),
            Tok::RightParen => write!(f, "')'"),
            Tok::LeftBrace => write!(f, "'{{'"),
            Tok::RightBrace => write!(f, "'}}'"),
            Tok::Dot => write!(f, "'.'"),
            Tok::Comma => write!(f, "','"),
            Tok::Semicolon => write!(f, "';'"),
            Tok::Colon => write!(f, "':'"),
            Tok::Equal => write!(f, "'='"),
            Tok::Minus => write!(f, "'-'"),
            Tok::Whitespace | Tok::LineComment => Ok(()),
        }
    }
}

/// A parse failure
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SyntaxError {
    pub message: String,
    pub pos: Pos,
}

impl SyntaxError {
    fn new(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            message: format!("SyntaxError: {}", message.into()),
            pos,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Ident {
        name: String,
        pos: Pos,
    },
    Object(Vec<(String, Expr)>),
    Member {
        object: Box<Expr>,
        name: String,
        pos: Pos,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        pos: Pos,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        pos: Pos,
    },
    Neg(Box<Expr>),
}

impl Expr {
    /// Source-like rendering used in error messages
    pub fn describe(&self) -> String {
        match self {
            Expr::Number(n) => format_number(*n),
            Expr::Str(s) => format!("\"{}\"", s),
            Expr::Bool(b) => b.to_string(),
            Expr::Null => "null".to_string(),
            Expr::Undefined => "undefined".to_string(),
            Expr::Ident { name, .. } => name.clone(),
            Expr::Object(_) => "{}".to_string(),
            Expr::Member { object, name, .. } => format!("{}.{}", object.describe(), name),
            Expr::Call { callee, .. } => format!("{}(...)", callee.describe()),
            Expr::Assign { target, .. } => target.describe(),
            Expr::Neg(inner) => format!("-{}", inner.describe()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Expr(Expr),
    Throw(Expr, Pos),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Program {
    pub stmts: Vec<Stmt>,
}

/// Parse a complete program
pub(crate) fn parse(source: &str) -> Result<Program, SyntaxError> {
    Parser::new(source)?.program()
}

/// Format a number the way script code prints it
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let s = if n > 0.0 { "Infinity" } else { "-Infinity" };
        s.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

fn tokenize(source: &str) -> Result<(Vec<(Tok, Pos)>, Pos), SyntaxError> {
    let mut lexer = Tok::lexer(source);
    let mut tokens = Vec::new();
    let mut pos = Pos { line: 1, col: 1 };
    let mut last_end = 0;

    let advance = |pos: &mut Pos, text: &str| {
        for c in text.chars() {
            if c == '\n' {
                pos.line += 1;
                pos.col = 1;
            } else {
                pos.col += 1;
            }
        }
    };

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        advance(&mut pos, &source[last_end..range.start]);
        match result {
            Ok(tok) => tokens.push((tok, pos)),
            Err(()) => return Err(SyntaxError::new("Invalid or unexpected token", pos)),
        }
        advance(&mut pos, &source[range.start..range.end]);
        last_end = range.end;
    }
    advance(&mut pos, &source[last_end..]);
    Ok((tokens, pos))
}

fn unexpected(tok: Option<&Tok>, pos: Pos) -> SyntaxError {
    match tok {
        Some(tok) => SyntaxError::new(format!("Unexpected {}", tok), pos),
        None => SyntaxError::new("Unexpected end of input", pos),
    }
}

struct Parser {
    tokens: Vec<(Tok, Pos)>,
    cursor: usize,
    eof: Pos,
}

impl Parser {
    fn new(source: &str) -> Result<Self, SyntaxError> {
        let (tokens, eof) = tokenize(source)?;
        Ok(Self {
            tokens,
            cursor: 0,
            eof,
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.cursor).map(|(tok, _)| tok)
    }

    fn pos(&self) -> Pos {
        self.tokens.get(self.cursor).map_or(self.eof, |(_, pos)| *pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.peek().cloned();
        if tok.is_some() {
            self.cursor += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<(), SyntaxError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn unexpected(&self) -> SyntaxError {
        unexpected(self.peek(), self.pos())
    }

    fn program(&mut self) -> Result<Program, SyntaxError> {
        let mut stmts = Vec::new();
        loop {
            while self.eat(&Tok::Semicolon) {}
            if self.peek().is_none() {
                break;
            }
            stmts.push(self.statement()?);
            match self.peek() {
                Some(Tok::Semicolon) | None => {}
                _ => return Err(self.unexpected()),
            }
        }
        Ok(Program { stmts })
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        if self.peek() == Some(&Tok::Throw) {
            let pos = self.pos();
            self.bump();
            return Ok(Stmt::Throw(self.expression()?, pos));
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        let target = self.unary()?;
        if self.peek() != Some(&Tok::Equal) {
            return Ok(target);
        }

        let pos = self.pos();
        if !matches!(target, Expr::Ident { .. } | Expr::Member { .. }) {
            return Err(SyntaxError::new("Invalid left-hand side in assignment", pos));
        }
        self.bump();
        let value = self.expression()?;
        Ok(Expr::Assign {
            target: Box::new(target),
            value: Box::new(value),
            pos,
        })
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat(&Tok::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        loop {
            let pos = self.pos();
            match self.peek() {
                Some(Tok::Dot) => {
                    self.bump();
                    let name = match self.bump() {
                        Some(Tok::Ident(name)) => name,
                        _ => return Err(SyntaxError::new("Unexpected token after '.'", pos)),
                    };
                    expr = Expr::Member {
                        object: Box::new(expr),
                        name,
                        pos,
                    };
                }
                Some(Tok::LeftParen) => {
                    self.bump();
                    let args = self.arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        pos,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut args = Vec::new();
        if self.eat(&Tok::RightParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Tok::RightParen) {
                return Ok(args);
            }
            self.expect(Tok::Comma)?;
        }
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let pos = self.pos();
        let expr = match self.bump() {
            Some(Tok::Number(n)) => Expr::Number(n),
            Some(Tok::Str(s)) => Expr::Str(s),
            Some(Tok::True) => Expr::Bool(true),
            Some(Tok::False) => Expr::Bool(false),
            Some(Tok::Null) => Expr::Null,
            Some(Tok::Undefined) => Expr::Undefined,
            Some(Tok::Ident(name)) => Expr::Ident { name, pos },
            Some(Tok::LeftBrace) => self.object_literal()?,
            Some(Tok::LeftParen) => {
                let inner = self.expression()?;
                self.expect(Tok::RightParen)?;
                inner
            }
            other => return Err(unexpected(other.as_ref(), pos)),
        };
        Ok(expr)
    }

    fn object_literal(&mut self) -> Result<Expr, SyntaxError> {
        let mut props = Vec::new();
        loop {
            if self.eat(&Tok::RightBrace) {
                return Ok(Expr::Object(props));
            }
            let key = match self.bump() {
                Some(Tok::Ident(name) | Tok::Str(name)) => name,
                _ => return Err(SyntaxError::new("Unexpected token in object literal", self.pos())),
            };
            self.expect(Tok::Colon)?;
            props.push((key, self.expression()?));
            if !self.eat(&Tok::Comma) {
                self.expect(Tok::RightBrace)?;
                return Ok(Expr::Object(props));
            }
        }
    }
}
