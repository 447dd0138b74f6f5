//! # Expression
//!
//! The boolean condition language used to gate script fragments.
//!
//! ```text
//! expression := term ( "||" term )*
//! term       := factor ( "&&" factor )*
//! factor     := "(" expression ")" | comparison
//! comparison := operand operator operand
//! operand    := identifier | quoted-string | number
//! operator   := "==" | "!=" | ">" | "<" | ">=" | "<="
//! ```
//!
//! Parsing produces an [`Expr`] tree which is then evaluated against an immutable
//! [`ExpressionContext`]. Evaluation never fails: unknown identifiers resolve to the
//! empty string and numeric coercions fall back to `0`. Every syntax problem is
//! reported as an [`ExpressionError`] at parse time.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

// --- VALUES & CONTEXT ---

/// A value an operand can resolve to.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
}

impl Value {
    /// Formats the value the way it is compared against a string operand.
    fn as_text(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
        }
    }

    /// Coerces the value to a number. Unparseable text becomes `0`.
    fn as_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::String(s) => s.parse().unwrap_or(0.0),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

/// A read-only snapshot of the identifiers visible to an expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionContext {
    values: HashMap<String, Value>,
}

impl ExpressionContext {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ExpressionContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

// --- ERRORS ---

/// A malformed condition. Positions are character offsets into the source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("unexpected character '{ch}' at position {position}")]
    UnexpectedCharacter { ch: char, position: usize },
    #[error("unterminated string literal starting at position {position}")]
    UnterminatedString { position: usize },
    #[error("expected {expected}, found {found} at position {position}")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
        position: usize,
    },
    #[error("unmatched '(' at position {position}")]
    UnmatchedParenthesis { position: usize },
    #[error("comparison is missing its {missing} (input ended at position {position})")]
    IncompleteComparison {
        missing: &'static str,
        position: usize,
    },
    #[error("unexpected {found} at position {position} after a complete expression")]
    TrailingInput { found: String, position: usize },
}

// --- TOKENIZER ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
        }
    }

    fn holds(self, ordering: Option<Ordering>) -> bool {
        // `None` only happens for NaN, where every comparison but `!=` is false.
        match (self, ordering) {
            (CompareOp::Ne, None) => true,
            (_, None) => false,
            (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
            (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
            (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
            (CompareOp::Lt, Some(o)) => o == Ordering::Less,
            (CompareOp::Ge, Some(o)) => o != Ordering::Less,
            (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Number(String),
    Op(CompareOp),
    And,
    Or,
    LParen,
    RParen,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier '{}'", name),
            TokenKind::Str(s) => write!(f, "string '{}'", s),
            TokenKind::Number(n) => write!(f, "number {}", n),
            TokenKind::Op(op) => write!(f, "operator '{}'", op.symbol()),
            TokenKind::And => f.write_str("'&&'"),
            TokenKind::Or => f.write_str("'||'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

/// Splits the source into tokens, always terminated by a single `Eof` token.
fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    let at = |i: usize| chars.get(i).copied();

    while let Some(ch) = at(pos) {
        if ch.is_whitespace() {
            pos += 1;
            continue;
        }
        let start = pos;

        // Identifiers.
        if ch.is_alphabetic() || ch == '_' {
            while at(pos).is_some_and(|c| c.is_alphanumeric() || c == '_') {
                pos += 1;
            }
            let word: String = chars.get(start..pos).unwrap_or_default().iter().collect();
            tokens.push(Token {
                kind: TokenKind::Ident(word),
                position: start,
            });
            continue;
        }

        // String literals, no escape processing.
        if ch == '\'' || ch == '"' {
            pos += 1;
            let body_start = pos;
            while at(pos).is_some_and(|c| c != ch) {
                pos += 1;
            }
            if at(pos).is_none() {
                return Err(ExpressionError::UnterminatedString { position: start });
            }
            let body: String = chars
                .get(body_start..pos)
                .unwrap_or_default()
                .iter()
                .collect();
            pos += 1;
            tokens.push(Token {
                kind: TokenKind::Str(body),
                position: start,
            });
            continue;
        }

        // Numbers: digits with at most one '.'.
        if ch.is_ascii_digit() {
            let mut seen_dot = false;
            while let Some(c) = at(pos) {
                if c.is_ascii_digit() {
                    pos += 1;
                } else if c == '.' && !seen_dot {
                    seen_dot = true;
                    pos += 1;
                } else {
                    break;
                }
            }
            let digits: String = chars.get(start..pos).unwrap_or_default().iter().collect();
            tokens.push(Token {
                kind: TokenKind::Number(digits),
                position: start,
            });
            continue;
        }

        // Two-character operators win over their one-character prefixes.
        let kind = match (ch, at(pos + 1)) {
            ('&', Some('&')) => Some((TokenKind::And, 2)),
            ('|', Some('|')) => Some((TokenKind::Or, 2)),
            ('=', Some('=')) => Some((TokenKind::Op(CompareOp::Eq), 2)),
            ('!', Some('=')) => Some((TokenKind::Op(CompareOp::Ne), 2)),
            ('>', Some('=')) => Some((TokenKind::Op(CompareOp::Ge), 2)),
            ('<', Some('=')) => Some((TokenKind::Op(CompareOp::Le), 2)),
            ('>', _) => Some((TokenKind::Op(CompareOp::Gt), 1)),
            ('<', _) => Some((TokenKind::Op(CompareOp::Lt), 1)),
            ('(', _) => Some((TokenKind::LParen, 1)),
            (')', _) => Some((TokenKind::RParen, 1)),
            _ => None,
        };
        match kind {
            Some((kind, width)) => {
                tokens.push(Token {
                    kind,
                    position: start,
                });
                pos += width;
            }
            None => {
                return Err(ExpressionError::UnexpectedCharacter {
                    ch,
                    position: start,
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: chars.len(),
    });
    Ok(tokens)
}

// --- SYNTAX TREE ---

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Identifier(String),
    Literal(Value),
}

impl Operand {
    fn resolve(&self, context: &ExpressionContext) -> Value {
        match self {
            Operand::Identifier(name) => context
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::String(String::new())),
            Operand::Literal(value) => value.clone(),
        }
    }
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
}

impl Expr {
    /// Evaluates the expression. Both sides of `&&` and `||` are always evaluated;
    /// operands are pure lookups so the result is the same either way.
    pub fn evaluate(&self, context: &ExpressionContext) -> bool {
        match self {
            Expr::Or(left, right) => {
                let l = left.evaluate(context);
                let r = right.evaluate(context);
                l || r
            }
            Expr::And(left, right) => {
                let l = left.evaluate(context);
                let r = right.evaluate(context);
                l && r
            }
            Expr::Compare { left, op, right } => {
                compare(&left.resolve(context), *op, &right.resolve(context))
            }
        }
    }
}

/// The left operand decides the comparison domain.
fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match left {
        Value::String(l) => op.holds(Some(l.as_str().cmp(right.as_text().as_str()))),
        Value::Number(l) => op.holds(l.partial_cmp(&right.as_number())),
    }
}

// --- PARSER ---

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // `tokenize` always ends with Eof, and `advance` never moves past it.
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .unwrap_or(&EOF_TOKEN)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_term()?;
        while self.peek().kind == TokenKind::Or {
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_factor()?;
        while self.peek().kind == TokenKind::And {
            self.advance();
            let right = self.parse_factor()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek().kind != TokenKind::LParen {
            return self.parse_comparison();
        }
        let open = self.advance();
        let inner = self.parse_expression()?;
        let close = self.advance();
        match close.kind {
            TokenKind::RParen => Ok(inner),
            TokenKind::Eof => Err(ExpressionError::UnmatchedParenthesis {
                position: open.position,
            }),
            other => Err(ExpressionError::UnexpectedToken {
                expected: "')'",
                found: other.to_string(),
                position: close.position,
            }),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_operand("left operand")?;

        let op_token = self.advance();
        let op = match op_token.kind {
            TokenKind::Op(op) => op,
            TokenKind::Eof => {
                return Err(ExpressionError::IncompleteComparison {
                    missing: "operator",
                    position: op_token.position,
                });
            }
            other => {
                return Err(ExpressionError::UnexpectedToken {
                    expected: "comparison operator",
                    found: other.to_string(),
                    position: op_token.position,
                });
            }
        };

        let right = self.parse_operand("right operand")?;
        Ok(Expr::Compare { left, op, right })
    }

    fn parse_operand(&mut self, role: &'static str) -> Result<Operand, ExpressionError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Ident(name) => Ok(Operand::Identifier(name)),
            TokenKind::Str(s) => Ok(Operand::Literal(Value::String(s))),
            TokenKind::Number(digits) => Ok(Operand::Literal(Value::Number(
                digits.parse().unwrap_or(0.0),
            ))),
            TokenKind::Eof => Err(ExpressionError::IncompleteComparison {
                missing: role,
                position: token.position,
            }),
            other => Err(ExpressionError::UnexpectedToken {
                expected: role,
                found: other.to_string(),
                position: token.position,
            }),
        }
    }
}

static EOF_TOKEN: Token = Token {
    kind: TokenKind::Eof,
    position: 0,
};

// --- PUBLIC API ---

/// Parses a condition into an [`Expr`]. The whole input must be consumed.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        pos: 0,
    };
    let expr = parser.parse_expression()?;
    let rest = parser.peek();
    if rest.kind != TokenKind::Eof {
        return Err(ExpressionError::TrailingInput {
            found: rest.kind.to_string(),
            position: rest.position,
        });
    }
    Ok(expr)
}

/// Parses and evaluates a condition in one step.
pub fn evaluate(source: &str, context: &ExpressionContext) -> Result<bool, ExpressionError> {
    parse(source).map(|expr| expr.evaluate(context))
}
