//! Phase-transition condition language.
//!
//! A small JSONPath-like grammar evaluated over an artifact's JSON value:
//!
//! ```text
//! condition  := path op literal
//! path       := '$' segment*
//! segment    := '.' ident | '[' number ']' | '[' '?(' '@' ('.' ident)+ eqop literal ')' ']'
//! op         := '==' | '!=' | '<' | '<=' | '>' | '>='
//! eqop       := '==' | '!='
//! literal    := 'true' | 'false' | 'null' | number | 'string' | "string"
//! ```
//!
//! A trailing `.length` on an array (or filtered array) yields its element
//! count. Evaluation is total: parse errors, missing paths and type
//! mismatches all evaluate to `false`.

use serde_json::Value;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("expected {expected}, found {found}")]
    Expected { expected: &'static str, found: String },
    #[error("trailing input after condition: {0}")]
    Trailing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Number(f64),
    Str(String),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(usize),
    /// `[?(@.a.b == lit)]`: keep array elements whose field matches.
    Filter {
        field: Vec<String>,
        op: CompareOp,
        value: Literal,
    },
    /// Trailing `.length`
    Length,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub path: Vec<Segment>,
    pub op: CompareOp,
    pub value: Literal,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dollar,
    At,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Question,
    Op(CompareOp),
    Ident(String),
    Number(f64),
    Str(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Dollar => f.write_str("'$'"),
            Token::At => f.write_str("'@'"),
            Token::Dot => f.write_str("'.'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Question => f.write_str("'?'"),
            Token::Op(op) => write!(f, "'{}'", op),
            Token::Ident(s) => write!(f, "identifier '{}'", s),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Str(s) => write!(f, "string '{}'", s),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars: Peekable<Chars<'_>> = input.chars().peekable();
    let mut offset = 0usize;

    while let Some(&c) = chars.peek() {
        let start = offset;
        let mut bump = |chars: &mut Peekable<Chars<'_>>| {
            offset += 1;
            chars.next()
        };
        match c {
            c if c.is_whitespace() => {
                bump(&mut chars);
            }
            '$' => {
                bump(&mut chars);
                tokens.push(Token::Dollar);
            }
            '@' => {
                bump(&mut chars);
                tokens.push(Token::At);
            }
            '.' => {
                bump(&mut chars);
                tokens.push(Token::Dot);
            }
            '[' => {
                bump(&mut chars);
                tokens.push(Token::LBracket);
            }
            ']' => {
                bump(&mut chars);
                tokens.push(Token::RBracket);
            }
            '(' => {
                bump(&mut chars);
                tokens.push(Token::LParen);
            }
            ')' => {
                bump(&mut chars);
                tokens.push(Token::RParen);
            }
            '?' => {
                bump(&mut chars);
                tokens.push(Token::Question);
            }
            '=' | '!' | '<' | '>' => {
                bump(&mut chars);
                let followed_by_eq = chars.peek() == Some(&'=');
                if followed_by_eq {
                    bump(&mut chars);
                }
                let op = match (c, followed_by_eq) {
                    ('=', true) => CompareOp::Eq,
                    ('!', true) => CompareOp::Ne,
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    ('>', true) => CompareOp::Ge,
                    _ => return Err(ConditionError::UnexpectedChar(c, start)),
                };
                tokens.push(Token::Op(op));
            }
            '\'' | '"' => {
                let quote = c;
                bump(&mut chars);
                let mut text = String::new();
                loop {
                    match bump(&mut chars) {
                        Some(ch) if ch == quote => break,
                        Some(ch) => text.push(ch),
                        None => return Err(ConditionError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                bump(&mut chars);
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' {
                        text.push(d);
                        bump(&mut chars);
                    } else {
                        break;
                    }
                }
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::UnexpectedChar(c, start))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '-' {
                        text.push(d);
                        bump(&mut chars);
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(text));
            }
            other => return Err(ConditionError::UnexpectedChar(other, start)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn found(token: Option<&Token>) -> String {
        token
            .map(|t| t.to_string())
            .unwrap_or_else(|| "end of input".to_string())
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<(), ConditionError> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            other => Err(ConditionError::Expected {
                expected,
                found: Self::found(other.as_ref()),
            }),
        }
    }

    fn ident(&mut self) -> Result<String, ConditionError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(ConditionError::Expected {
                expected: "property name",
                found: Self::found(other.as_ref()),
            }),
        }
    }

    fn condition(&mut self) -> Result<Condition, ConditionError> {
        self.expect(Token::Dollar, "'$'")?;
        let path = self.segments()?;
        let op = self.op()?;
        let value = self.literal()?;
        if let Some(extra) = self.peek() {
            return Err(ConditionError::Trailing(extra.to_string()));
        }
        Ok(Condition { path, op, value })
    }

    fn segments(&mut self) -> Result<Vec<Segment>, ConditionError> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = self.ident()?;
                    let is_last = !matches!(self.peek(), Some(Token::Dot | Token::LBracket));
                    if name == "length" && is_last {
                        segments.push(Segment::Length);
                    } else {
                        segments.push(Segment::Field(name));
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    segments.push(self.bracket()?);
                    self.expect(Token::RBracket, "']'")?;
                }
                _ => return Ok(segments),
            }
        }
    }

    fn bracket(&mut self) -> Result<Segment, ConditionError> {
        match self.next() {
            Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => Ok(Segment::Index(n as usize)),
            Some(Token::Question) => {
                self.expect(Token::LParen, "'('")?;
                self.expect(Token::At, "'@'")?;
                let mut field = Vec::new();
                while matches!(self.peek(), Some(Token::Dot)) {
                    self.next();
                    field.push(self.ident()?);
                }
                if field.is_empty() {
                    return Err(ConditionError::Expected {
                        expected: "'.' after '@'",
                        found: Self::found(self.peek()),
                    });
                }
                let op = self.op()?;
                if !matches!(op, CompareOp::Eq | CompareOp::Ne) {
                    return Err(ConditionError::Expected {
                        expected: "'==' or '!=' in filter",
                        found: format!("'{}'", op),
                    });
                }
                let value = self.literal()?;
                self.expect(Token::RParen, "')'")?;
                Ok(Segment::Filter { field, op, value })
            }
            other => Err(ConditionError::Expected {
                expected: "array index or filter",
                found: Self::found(other.as_ref()),
            }),
        }
    }

    fn op(&mut self) -> Result<CompareOp, ConditionError> {
        match self.next() {
            Some(Token::Op(op)) => Ok(op),
            other => Err(ConditionError::Expected {
                expected: "comparison operator",
                found: Self::found(other.as_ref()),
            }),
        }
    }

    fn literal(&mut self) -> Result<Literal, ConditionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Literal::Number(n)),
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Literal::Bool(true)),
                "false" => Ok(Literal::Bool(false)),
                "null" => Ok(Literal::Null),
                _ => Err(ConditionError::Expected {
                    expected: "literal",
                    found: format!("identifier '{}'", word),
                }),
            },
            other => Err(ConditionError::Expected {
                expected: "literal",
                found: Self::found(other.as_ref()),
            }),
        }
    }
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        Parser { tokens, pos: 0 }.condition()
    }

    pub fn evaluate(&self, root: &Value) -> bool {
        match resolve(root, &self.path) {
            Some(actual) => compare(&actual, self.op, &self.value),
            None => false,
        }
    }
}

/// Parse and evaluate in one step. Never fails: anything unparseable is `false`.
pub fn evaluate(expression: &str, root: &Value) -> bool {
    match Condition::parse(expression) {
        Ok(condition) => condition.evaluate(root),
        Err(e) => {
            tracing::debug!(expression, error = %e, "condition did not parse, treating as false");
            false
        }
    }
}

fn resolve(root: &Value, path: &[Segment]) -> Option<Value> {
    let mut current = root.clone();
    for segment in path {
        current = match (segment, current) {
            (Segment::Field(name), Value::Object(mut map)) => map.remove(name)?,
            (Segment::Index(i), Value::Array(mut items)) => {
                if *i < items.len() {
                    items.swap_remove(*i)
                } else {
                    return None;
                }
            }
            (Segment::Filter { field, op, value }, Value::Array(items)) => Value::Array(
                items
                    .into_iter()
                    .filter(|item| match lookup(item, field) {
                        Some(v) => compare(v, *op, value),
                        // An absent field differs from every literal.
                        None => *op == CompareOp::Ne,
                    })
                    .collect(),
            ),
            (Segment::Length, Value::Array(items)) => Value::from(items.len()),
            (Segment::Length, Value::String(s)) => Value::from(s.chars().count()),
            (Segment::Length, Value::Object(mut map)) => map.remove("length")?,
            _ => return None,
        };
    }
    Some(current)
}

fn lookup<'a>(value: &'a Value, field: &[String]) -> Option<&'a Value> {
    field.iter().try_fold(value, |v, name| v.get(name))
}

fn compare(actual: &Value, op: CompareOp, expected: &Literal) -> bool {
    match (actual, expected) {
        (Value::Number(a), Literal::Number(b)) => {
            let Some(a) = a.as_f64() else {
                return false;
            };
            match op {
                CompareOp::Eq => a == *b,
                CompareOp::Ne => a != *b,
                CompareOp::Lt => a < *b,
                CompareOp::Le => a <= *b,
                CompareOp::Gt => a > *b,
                CompareOp::Ge => a >= *b,
            }
        }
        (Value::Bool(a), Literal::Bool(b)) => equality(op, a == b),
        (Value::String(a), Literal::Str(b)) => equality(op, a == b),
        (Value::Null, Literal::Null) => equality(op, true),
        _ => op == CompareOp::Ne,
    }
}

fn equality(op: CompareOp, equal: bool) -> bool {
    match op {
        CompareOp::Eq => equal,
        CompareOp::Ne => !equal,
        _ => false,
    }
}
