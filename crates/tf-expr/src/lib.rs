#![forbid(unsafe_code)]

pub mod rewrite;

use std::fmt;

use serde::{Deserialize, Serialize};
use tf_types::Literal;
use thiserror::Error;

pub use rewrite::{OPTIONS, expand, leaf_names, rename_series};

/// Operator naming a series leaf.
pub const SERIES: &str = "series";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Node {
    Atom(Literal),
    List(Vec<Node>),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected trailing input at {0}")]
    TrailingInput(usize),
    #[error("list at {0} must start with an operator symbol")]
    MalformedList(usize),
    #[error("keyword `{keyword}` of operator `{operator}` has no value")]
    DanglingKeyword { operator: String, keyword: String },
    #[error("formula reference cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("nesting exceeds the maximum depth of {0}")]
    TooDeep(usize),
}

/// Arguments of a call, with `#:keyword value` pairs separated out.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs<'a> {
    pub positional: Vec<&'a Node>,
    pub keywords: Vec<(&'a str, &'a Node)>,
}

impl CallArgs<'_> {
    #[must_use]
    pub fn keyword(&self, name: &str) -> Option<&Node> {
        self.keywords
            .iter()
            .find(|(keyword, _)| *keyword == name)
            .map(|(_, node)| *node)
    }
}

impl Node {
    #[must_use]
    pub fn str(value: impl Into<String>) -> Self {
        Self::Atom(Literal::Str(value.into()))
    }

    #[must_use]
    pub fn int(value: i64) -> Self {
        Self::Atom(Literal::Int(value))
    }

    #[must_use]
    pub fn float(value: f64) -> Self {
        Self::Atom(Literal::Float(value))
    }

    #[must_use]
    pub fn symbol(value: impl Into<String>) -> Self {
        Self::Atom(Literal::Symbol(value.into()))
    }

    #[must_use]
    pub fn keyword(name: &str) -> Self {
        Self::Atom(Literal::keyword(name))
    }

    /// `(operator args...)`
    #[must_use]
    pub fn call(operator: &str, args: impl IntoIterator<Item = Node>) -> Self {
        let mut items = vec![Self::symbol(operator)];
        items.extend(args);
        Self::List(items)
    }

    /// `(series "name")`
    #[must_use]
    pub fn series(name: &str) -> Self {
        Self::call(SERIES, [Self::str(name)])
    }

    #[must_use]
    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Self::Atom(literal) => Some(literal),
            Self::List(_) => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_literal().and_then(Literal::as_str)
    }

    /// Operator symbol heading a list.
    #[must_use]
    pub fn operator(&self) -> Option<&str> {
        match self {
            Self::List(items) => items.first().and_then(Node::as_literal)?.as_symbol(),
            Self::Atom(_) => None,
        }
    }

    /// Everything after the operator; empty for atoms.
    #[must_use]
    pub fn args(&self) -> &[Node] {
        match self {
            Self::List(items) if !items.is_empty() => &items[1..],
            _ => &[],
        }
    }

    pub fn call_args(&self) -> Result<CallArgs<'_>, ExprError> {
        let mut positional = Vec::new();
        let mut keywords = Vec::new();
        let mut args = self.args().iter();
        while let Some(arg) = args.next() {
            match arg.as_literal().and_then(Literal::keyword_name) {
                Some(keyword) => {
                    let value = args.next().ok_or_else(|| ExprError::DanglingKeyword {
                        operator: self.operator().unwrap_or_default().to_owned(),
                        keyword: keyword.to_owned(),
                    })?;
                    keywords.push((keyword, value));
                }
                None => positional.push(arg),
            }
        }
        Ok(CallArgs {
            positional,
            keywords,
        })
    }

    /// Name of a `(series "name" ...)` leaf.
    #[must_use]
    pub fn series_name(&self) -> Option<&str> {
        if self.operator() != Some(SERIES) {
            return None;
        }
        self.args().first().and_then(Node::as_str)
    }

    /// Nesting depth; atoms have depth 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::Atom(_) => 0,
            Self::List(items) => 1 + items.iter().map(Node::depth).max().unwrap_or(0),
        }
    }

    /// Pre-order visit of every node.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Node)) {
        visit(self);
        if let Self::List(items) = self {
            for item in items {
                item.walk(visit);
            }
        }
    }

    /// Every distinct operator symbol, in first-seen order.
    #[must_use]
    pub fn operators(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        self.walk(&mut |node| {
            if let Some(operator) = node.operator() {
                if !out.contains(&operator) {
                    out.push(operator);
                }
            }
        });
        out
    }

    /// Structural equality that treats NaN floats as equal.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Atom(a), Self::Atom(b)) => a.semantic_eq(b),
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.semantic_eq(y))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize(self))
    }
}

// ── Text codec ──────────────────────────────────────────────────────────
//
//   expr    → atom | "(" SYMBOL expr* ")"
//   atom    → STRING | INT | FLOAT | SYMBOL
//
// Keywords are symbols prefixed with `#:`. Strings are double quoted with
// `\"`, `\\`, `\n` and `\t` escapes.

/// Deepest list nesting `parse` accepts.
pub const MAX_PARSE_DEPTH: usize = 512;

/// Parses one expression; anything after it is an error.
pub fn parse(input: &str) -> Result<Node, ExprError> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let node = parse_node(&tokens, &mut pos, 0)?;
    if let Some(token) = tokens.get(pos) {
        return Err(ExprError::TrailingInput(token.offset));
    }
    Ok(node)
}

/// Canonical text: single spaces, no trailing whitespace.
#[must_use]
pub fn serialize(node: &Node) -> String {
    let mut out = String::new();
    write_node(node, &mut out);
    out
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Atom(Literal::Str(value)) => {
            out.push('"');
            for c in value.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    other => out.push(other),
                }
            }
            out.push('"');
        }
        Node::Atom(literal) => out.push_str(&literal.to_string()),
        Node::List(items) => {
            out.push('(');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(' ');
                }
                write_node(item, out);
            }
            out.push(')');
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    LParen,
    RParen,
    Str(String),
    Bare(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token {
                    kind: TokenKind::LParen,
                    offset: i,
                });
                i += 1;
            }
            ')' => {
                tokens.push(Token {
                    kind: TokenKind::RParen,
                    offset: i,
                });
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ExprError::Parse {
                                position: start,
                                message: "unterminated string literal".to_owned(),
                            });
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some(other) => *other,
                                None => {
                                    return Err(ExprError::Parse {
                                        position: i,
                                        message: "dangling escape".to_owned(),
                                    });
                                }
                            };
                            value.push(escaped);
                            i += 2;
                        }
                        Some(other) => {
                            value.push(*other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str(value),
                    offset: start,
                });
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | '"')
                {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Bare(chars[start..i].iter().collect()),
                    offset: start,
                });
            }
        }
    }
    Ok(tokens)
}

fn looks_numeric(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-' | '+' | '.') => chars.next().is_some_and(|c| c.is_ascii_digit() || c == '.'),
        _ => false,
    }
}

fn bare_literal(text: &str, offset: usize) -> Result<Literal, ExprError> {
    if !looks_numeric(text) {
        return Ok(Literal::Symbol(text.to_owned()));
    }
    if let Ok(value) = text.parse::<i64>() {
        return Ok(Literal::Int(value));
    }
    text.parse::<f64>()
        .map(Literal::Float)
        .map_err(|_| ExprError::Parse {
            position: offset,
            message: format!("invalid number: {text}"),
        })
}

fn parse_node(tokens: &[Token], pos: &mut usize, depth: usize) -> Result<Node, ExprError> {
    let token = tokens.get(*pos).ok_or(ExprError::UnexpectedEof)?;
    *pos += 1;
    match &token.kind {
        TokenKind::Str(value) => Ok(Node::Atom(Literal::Str(value.clone()))),
        TokenKind::Bare(text) => bare_literal(text, token.offset).map(Node::Atom),
        TokenKind::RParen => Err(ExprError::Parse {
            position: token.offset,
            message: "unexpected ')'".to_owned(),
        }),
        TokenKind::LParen => {
            if depth >= MAX_PARSE_DEPTH {
                return Err(ExprError::TooDeep(MAX_PARSE_DEPTH));
            }
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos) {
                    None => return Err(ExprError::UnexpectedEof),
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => items.push(parse_node(tokens, pos, depth + 1)?),
                }
            }
            let headed_by_symbol = items
                .first()
                .and_then(Node::as_literal)
                .and_then(Literal::as_symbol)
                .is_some_and(|symbol| !symbol.starts_with(tf_types::KEYWORD_PREFIX));
            if !headed_by_symbol {
                return Err(ExprError::MalformedList(token.offset));
            }
            Ok(Node::List(items))
        }
    }
}
