//! Boolean queries over sample metadata.
//!
//! A query is a comparison between a backquoted dotted path and a literal,
//! optionally combined with `and` / `or` / `not` and parentheses:
//!
//! ```text
//! `metadata.label` >= 5 and not (`metadata.split` == 'test')
//! ```
//!
//! The first path segment addresses a sample key; the remaining segments
//! walk the decoded metadata value. A missing path never matches.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{PipelimeError, Result};
use crate::sample::Sample;
use crate::value::lookup_value;

#[derive(Debug, Clone, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Compare {
        path: String,
        op: CompareOp,
        literal: Value,
    },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
}

/// Resolve a dotted path against a sample: key first, then inside the
/// metadata value. Paths may be written with or without backquotes.
pub fn lookup_sample(sample: &Sample, dotted: &str) -> Option<Value> {
    let dotted = dotted.trim_matches('`');
    let (key, rest) = match dotted.split_once('.') {
        Some((key, rest)) => (key, rest),
        None => (dotted, ""),
    };
    if !sample.contains(key) {
        return None;
    }
    let value = sample.get(key).ok()?;
    let meta = value.as_metadata()?;
    lookup_value(meta, rest).cloned()
}

/// Total order over the JSON values a comparison can meet. Cross-type
/// comparisons order by type rank so sorting stays stable.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

impl Expression {
    pub fn parse(query: &str) -> Result<Expression> {
        let tokens = tokenize(query)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(PipelimeError::config(
                "query",
                format!("unexpected trailing input in '{query}'"),
            ));
        }
        Ok(expr)
    }

    pub fn matches(&self, sample: &Sample) -> bool {
        match self {
            Expression::Compare { path, op, literal } => {
                let Some(value) = lookup_sample(sample, path) else {
                    return false;
                };
                match op {
                    CompareOp::Eq => value == *literal,
                    CompareOp::Ne => value != *literal,
                    CompareOp::Lt => compare_values(&value, literal) == Ordering::Less,
                    CompareOp::Le => compare_values(&value, literal) != Ordering::Greater,
                    CompareOp::Gt => compare_values(&value, literal) == Ordering::Greater,
                    CompareOp::Ge => compare_values(&value, literal) != Ordering::Less,
                    CompareOp::Contains => match (&value, literal) {
                        (Value::String(s), Value::String(needle)) => s.contains(needle),
                        (Value::Array(items), needle) => items.contains(needle),
                        _ => false,
                    },
                }
            }
            Expression::And(a, b) => a.matches(sample) && b.matches(sample),
            Expression::Or(a, b) => a.matches(sample) || b.matches(sample),
            Expression::Not(inner) => !inner.matches(sample),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Literal(Value),
    Op(CompareOp),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(query: &str) -> Result<Vec<Token>> {
    let bad = |reason: String| PipelimeError::config("query", reason);
    let mut tokens = Vec::new();
    let chars: Vec<char> = query.chars().collect();
    let mut pos = 0;
    while pos < chars.len() {
        let c = chars[pos];
        match c {
            ' ' | '\t' | '\n' => pos += 1,
            '(' => {
                tokens.push(Token::Open);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                pos += 1;
            }
            '`' => {
                let end = chars[pos + 1..]
                    .iter()
                    .position(|c| *c == '`')
                    .ok_or_else(|| bad("unterminated backquoted path".to_string()))?;
                tokens.push(Token::Path(chars[pos + 1..pos + 1 + end].iter().collect()));
                pos += end + 2;
            }
            '\'' | '"' => {
                let quote = c;
                let end = chars[pos + 1..]
                    .iter()
                    .position(|c| *c == quote)
                    .ok_or_else(|| bad("unterminated string literal".to_string()))?;
                tokens.push(Token::Literal(Value::String(
                    chars[pos + 1..pos + 1 + end].iter().collect(),
                )));
                pos += end + 2;
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[pos..(pos + 2).min(chars.len())].iter().collect();
                let (op, width) = match two.as_str() {
                    "==" => (CompareOp::Eq, 2),
                    "!=" => (CompareOp::Ne, 2),
                    "<=" => (CompareOp::Le, 2),
                    ">=" => (CompareOp::Ge, 2),
                    _ if c == '<' => (CompareOp::Lt, 1),
                    _ if c == '>' => (CompareOp::Gt, 1),
                    other => return Err(bad(format!("unknown operator '{other}'"))),
                };
                tokens.push(Token::Op(op));
                pos += width;
            }
            _ => {
                let end = chars[pos..]
                    .iter()
                    .position(|c| " \t\n()<>=!".contains(*c))
                    .map(|off| pos + off)
                    .unwrap_or(chars.len());
                let word: String = chars[pos..end].iter().collect();
                pos = end;
                match word.as_str() {
                    "and" | "AND" => tokens.push(Token::And),
                    "or" | "OR" => tokens.push(Token::Or),
                    "not" | "NOT" => tokens.push(Token::Not),
                    "contains" | "CONTAINS" => tokens.push(Token::Op(CompareOp::Contains)),
                    "true" | "True" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" | "False" => tokens.push(Token::Literal(Value::Bool(false))),
                    "null" | "None" => tokens.push(Token::Literal(Value::Null)),
                    other => {
                        if let Ok(num) = other.parse::<i64>() {
                            tokens.push(Token::Literal(Value::Number(num.into())));
                        } else if let Ok(num) = other.parse::<f64>() {
                            let n = serde_json::Number::from_f64(num)
                                .ok_or_else(|| bad(format!("bad number '{other}'")))?;
                            tokens.push(Token::Literal(Value::Number(n)));
                        } else if !other.is_empty() {
                            // Bare dotted path without backquotes.
                            tokens.push(Token::Path(other.to_string()));
                        } else {
                            return Err(bad(format!("unexpected character '{c}'")));
                        }
                    }
                }
            }
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
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expression> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression> {
        let mut left = self.parse_term()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_term()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expression> {
        let bad = |reason: String| PipelimeError::config("query", reason);
        match self.next() {
            Some(Token::Not) => Ok(Expression::Not(Box::new(self.parse_term()?))),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(bad("missing closing parenthesis".to_string())),
                }
            }
            Some(Token::Path(path)) => {
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    other => {
                        return Err(bad(format!(
                            "expected comparison operator after '{path}', found {other:?}"
                        )))
                    }
                };
                let literal = match self.next() {
                    Some(Token::Literal(value)) => value,
                    other => {
                        return Err(bad(format!(
                            "expected literal after operator, found {other:?}"
                        )))
                    }
                };
                Ok(Expression::Compare { path, op, literal })
            }
            other => Err(bad(format!("unexpected token {other:?}"))),
        }
    }
}
