//! Condition and template expression language.
//!
//! A small jq-flavoured query language evaluated against the request
//! document (see [`RequestContext::document`]):
//!
//! ```text
//! .params.id                          path parameter
//! .headers["x-env"] | lower == "test" pipe into a builtin
//! .method in ["GET", "POST"]          membership
//! .json.user.name // "anonymous"      alternative for null/false
//! has_header("Authorization") and header_eq("X-Env", "test")
//! ```
//!
//! Only `false` and `null` are falsy. An expression can also produce no
//! result at all (`empty`, a rejecting `select`), which callers treat as
//! falsy in conditions and as an empty string in templates.

use crate::context::RequestContext;
use base64::Engine;
use rand::Rng;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("{0}")]
    Type(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("{name} does not take {found} argument(s)")]
    Arity { name: String, found: usize },

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("invalid glob: {0}")]
    Glob(#[from] globset::Error),
}

/// Evaluates expressions against a request context.
///
/// `Ok(None)` means the expression produced no result.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &RequestContext)
        -> Result<Option<Value>, ExprError>;
}

/// The bundled jq-flavoured evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryEvaluator;

impl ExpressionEvaluator for QueryEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        context: &RequestContext,
    ) -> Result<Option<Value>, ExprError> {
        let ast = parse(expression)?;
        Interpreter { context }.eval(&ast, context.document())
    }
}

/// Whether a value counts as true.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// Canonical text for a value: strings unquoted, everything else as JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate a route's conditions in order, stopping at the first one that
/// is not truthy. Evaluation errors are logged and count as false.
pub fn conditions_hold(
    evaluator: &dyn ExpressionEvaluator,
    conditions: &[String],
    context: &RequestContext,
) -> bool {
    for condition in conditions {
        match evaluator.evaluate(condition, context) {
            Ok(Some(value)) if is_truthy(&value) => {}
            Ok(value) => {
                debug!(condition = %condition, result = ?value, "Condition not satisfied");
                return false;
            }
            Err(e) => {
                warn!(expression = %condition, error = %e, "Condition evaluation failed");
                return false;
            }
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dot,
    Field(String),
    Ident(String),
    Str(String),
    Num(f64),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Pipe,
    Alt,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    let parse_err = |offset: usize, message: String| ExprError::Parse { offset, message };

    while let Some((start, ch)) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '.' => match chars.peek() {
                Some(&(_, c)) if is_ident_start(c) => {
                    let mut name = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if !is_ident_char(c) {
                            break;
                        }
                        name.push(c);
                        chars.next();
                    }
                    Token::Field(name)
                }
                _ => Token::Dot,
            },
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '|' => Token::Pipe,
            '-' => Token::Minus,
            '/' => match chars.next() {
                Some((_, '/')) => Token::Alt,
                _ => return Err(parse_err(start, "expected '//'".into())),
            },
            '=' => match chars.next() {
                Some((_, '=')) => Token::Eq,
                _ => return Err(parse_err(start, "expected '=='".into())),
            },
            '!' => match chars.next() {
                Some((_, '=')) => Token::Ne,
                _ => return Err(parse_err(start, "expected '!='".into())),
            },
            '<' => {
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '"' | '\'' => {
                let quote = ch;
                let mut text = String::new();
                let mut closed = false;
                while let Some((offset, c)) = chars.next() {
                    match c {
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, 'n')) => text.push('\n'),
                            Some((_, 't')) => text.push('\t'),
                            Some((_, 'r')) => text.push('\r'),
                            Some((_, c @ ('"' | '\'' | '\\'))) => text.push(c),
                            _ => return Err(parse_err(offset, "invalid escape".into())),
                        },
                        c => text.push(c),
                    }
                }
                if !closed {
                    return Err(parse_err(start, "unterminated string".into()));
                }
                Token::Str(text)
            }
            c if c.is_ascii_digit() => {
                let mut text = String::from(c);
                while let Some((_, c)) = chars.next_if(|&(_, c)| c.is_ascii_digit() || c == '.') {
                    text.push(c);
                }
                let n = text
                    .parse::<f64>()
                    .map_err(|_| parse_err(start, format!("invalid number {text:?}")))?;
                Token::Num(n)
            }
            c if is_ident_start(c) || c == '@' => {
                let mut name = String::from(c);
                while let Some((_, c)) = chars.next_if(|&(_, c)| is_ident_char(c)) {
                    name.push(c);
                }
                Token::Ident(name)
            }
            other => return Err(parse_err(start, format!("unexpected character {other:?}"))),
        };
        tokens.push((token, start));
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Identity,
    Literal(Value),
    Array(Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Pipe(Box<Expr>, Box<Expr>),
    Alt(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(ExprError::Parse {
            offset: 0,
            message: "empty expression".into(),
        });
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        end: src.len(),
    };
    let expr = parser.pipe()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(parser.error(format!("unexpected {token:?}"))),
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(name)) if name == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    fn error(&self, message: String) -> ExprError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|(_, offset)| *offset)
            .unwrap_or(self.end);
        ExprError::Parse { offset, message }
    }

    fn pipe(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.alt()?;
        while self.eat(&Token::Pipe) {
            let rhs = self.alt()?;
            lhs = Expr::Pipe(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn alt(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.or()?;
        while self.eat(&Token::Alt) {
            let rhs = self.or()?;
            lhs = Expr::Alt(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.comparison()?;
        while self.eat_keyword("and") {
            let rhs = self.comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.postfix()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::Ident(name)) if name == "in" => CmpOp::In,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.postfix()?;
        Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Field(name)) => {
                    let key = Expr::Literal(Value::String(name.clone()));
                    self.pos += 1;
                    expr = Expr::Index(Box::new(expr), Box::new(key));
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let key = self.pipe()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(key));
                }
                Some(Token::Dot) => {
                    // `."quoted"` and `.[...]` after a path
                    match self.tokens.get(self.pos + 1).map(|(t, _)| t) {
                        Some(Token::Str(name)) => {
                            let key = Expr::Literal(Value::String(name.clone()));
                            self.pos += 2;
                            expr = Expr::Index(Box::new(expr), Box::new(key));
                        }
                        Some(Token::LBracket) => self.pos += 1,
                        _ => return Err(self.error("unexpected '.'".into())),
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let Some(token) = self.advance() else {
            return Err(self.error("unexpected end of expression".into()));
        };

        match token {
            Token::Field(name) => Ok(Expr::Index(
                Box::new(Expr::Identity),
                Box::new(Expr::Literal(Value::String(name))),
            )),
            Token::Dot => {
                if let Some(Token::Str(name)) = self.peek() {
                    let key = Expr::Literal(Value::String(name.clone()));
                    self.pos += 1;
                    return Ok(Expr::Index(Box::new(Expr::Identity), Box::new(key)));
                }
                Ok(Expr::Identity)
            }
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Num(n) => Ok(Expr::Literal(number(n))),
            Token::Minus => match self.advance() {
                Some(Token::Num(n)) => Ok(Expr::Literal(number(-n))),
                _ => {
                    self.pos -= 1;
                    Err(self.error("expected number after '-'".into()))
                }
            },
            Token::LParen => {
                let inner = self.pipe()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.pipe()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "in" => {
                    self.pos -= 1;
                    Err(self.error(format!("unexpected keyword {name:?}")))
                }
                _ => {
                    let mut args = Vec::new();
                    if self.eat(&Token::LParen) && !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.pipe()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            if !self.eat(&Token::Comma) && !self.eat(&Token::Semicolon) {
                                return Err(self.error("expected ',' or ')'".into()));
                            }
                        }
                    }
                    Ok(Expr::Call(name, args))
                }
            },
            other => {
                self.pos -= 1;
                Err(self.error(format!("unexpected {other:?}")))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter

const BUILTINS: &[&str] = &[
    "empty",
    "not",
    "lower",
    "ascii_downcase",
    "upper",
    "ascii_upcase",
    "length",
    "tostring",
    "tonumber",
    "keys",
    "has",
    "startswith",
    "endswith",
    "contains",
    "test",
    "glob",
    "select",
    "has_header",
    "header_eq",
    "header",
    "method",
    "param",
    "@base64",
    "@base64d",
    "uuid",
    "now",
    "random",
];

struct Interpreter<'a> {
    context: &'a RequestContext,
}

/// Evaluate `$expr` or return "no result" from the enclosing function.
macro_rules! value {
    ($self:ident, $expr:expr, $input:expr) => {
        match $self.eval($expr, $input)? {
            Some(value) => value,
            None => return Ok(None),
        }
    };
}

impl Interpreter<'_> {
    fn eval(&self, expr: &Expr, input: &Value) -> Result<Option<Value>, ExprError> {
        match expr {
            Expr::Identity => Ok(Some(input.clone())),
            Expr::Literal(value) => Ok(Some(value.clone())),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(value) = self.eval(item, input)? {
                        values.push(value);
                    }
                }
                Ok(Some(Value::Array(values)))
            }
            Expr::Index(target, key) => {
                let target = value!(self, target, input);
                let key = value!(self, key, input);
                index(&target, &key).map(Some)
            }
            Expr::Pipe(lhs, rhs) => {
                let lhs = value!(self, lhs, input);
                self.eval(rhs, &lhs)
            }
            Expr::Alt(lhs, rhs) => match self.eval(lhs, input) {
                Ok(Some(value)) if is_truthy(&value) => Ok(Some(value)),
                _ => self.eval(rhs, input),
            },
            Expr::And(lhs, rhs) => {
                let lhs = value!(self, lhs, input);
                if !is_truthy(&lhs) {
                    return Ok(Some(Value::Bool(false)));
                }
                let rhs = value!(self, rhs, input);
                Ok(Some(Value::Bool(is_truthy(&rhs))))
            }
            Expr::Or(lhs, rhs) => {
                let lhs = value!(self, lhs, input);
                if is_truthy(&lhs) {
                    return Ok(Some(Value::Bool(true)));
                }
                let rhs = value!(self, rhs, input);
                Ok(Some(Value::Bool(is_truthy(&rhs))))
            }
            Expr::Compare(op, lhs, rhs) => {
                let lhs = value!(self, lhs, input);
                let rhs = value!(self, rhs, input);
                compare(*op, &lhs, &rhs).map(|b| Some(Value::Bool(b)))
            }
            Expr::Call(name, args) => self.call(name, args, input),
        }
    }

    fn call(&self, name: &str, args: &[Expr], input: &Value) -> Result<Option<Value>, ExprError> {
        let result = match (name, args) {
            ("empty", []) => return Ok(None),
            ("not", []) => Value::Bool(!is_truthy(input)),
            ("not", [arg]) => Value::Bool(!is_truthy(&value!(self, arg, input))),

            ("lower" | "ascii_downcase", []) => Value::String(as_str(name, input)?.to_lowercase()),
            ("lower" | "ascii_downcase", [arg]) => {
                let value = value!(self, arg, input);
                Value::String(as_str(name, &value)?.to_lowercase())
            }
            ("upper" | "ascii_upcase", []) => Value::String(as_str(name, input)?.to_uppercase()),
            ("upper" | "ascii_upcase", [arg]) => {
                let value = value!(self, arg, input);
                Value::String(as_str(name, &value)?.to_uppercase())
            }

            ("length", []) => length(input)?,
            ("tostring", []) => Value::String(to_text(input)),
            ("tonumber", []) => match input {
                Value::Number(_) => input.clone(),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(number)
                    .map_err(|_| ExprError::Type(format!("cannot parse {s:?} as a number")))?,
                other => {
                    return Err(ExprError::Type(format!(
                        "{} cannot be parsed as a number",
                        type_name(other)
                    )))
                }
            },
            ("keys", []) => match input {
                Value::Object(map) => {
                    let mut keys: Vec<&String> = map.keys().collect();
                    keys.sort();
                    Value::Array(keys.into_iter().map(|k| Value::String(k.clone())).collect())
                }
                Value::Array(items) => Value::Array((0..items.len()).map(Value::from).collect()),
                other => return Err(ExprError::Type(format!("{} has no keys", type_name(other)))),
            },
            ("has", [arg]) => {
                let key = value!(self, arg, input);
                Value::Bool(match (input, &key) {
                    (Value::Object(map), Value::String(k)) => map.contains_key(k),
                    (Value::Array(items), Value::Number(n)) => n
                        .as_f64()
                        .map_or(false, |i| i >= 0.0 && (i as usize) < items.len()),
                    _ => {
                        return Err(ExprError::Type(format!(
                            "cannot check whether {} has a {} key",
                            type_name(input),
                            type_name(&key)
                        )))
                    }
                })
            }
            ("startswith", [arg]) => {
                let prefix = value!(self, arg, input);
                Value::Bool(as_str(name, input)?.starts_with(as_str(name, &prefix)?))
            }
            ("endswith", [arg]) => {
                let suffix = value!(self, arg, input);
                Value::Bool(as_str(name, input)?.ends_with(as_str(name, &suffix)?))
            }
            ("contains", [arg]) => {
                let needle = value!(self, arg, input);
                Value::Bool(contains(input, &needle)?)
            }
            ("test", [arg]) => {
                let pattern = value!(self, arg, input);
                let regex = regex::Regex::new(as_str(name, &pattern)?)?;
                Value::Bool(regex.is_match(as_str(name, input)?))
            }
            ("glob", [arg]) => {
                let pattern = value!(self, arg, input);
                let glob = globset::Glob::new(as_str(name, &pattern)?)?.compile_matcher();
                Value::Bool(glob.is_match(as_str(name, input)?))
            }
            ("select", [arg]) => {
                let keep = value!(self, arg, input);
                if !is_truthy(&keep) {
                    return Ok(None);
                }
                input.clone()
            }

            ("has_header", [arg]) => {
                let header = value!(self, arg, input);
                Value::Bool(self.context.has_header(as_str(name, &header)?))
            }
            ("header_eq", [header, expected]) => {
                let header = value!(self, header, input);
                let expected = value!(self, expected, input);
                let expected = as_str(name, &expected)?;
                // any value of a repeated header may match
                Value::Bool(
                    self.context
                        .header_values(as_str(name, &header)?)
                        .iter()
                        .any(|actual| actual.eq_ignore_ascii_case(expected)),
                )
            }
            ("header", [arg]) => {
                let header = value!(self, arg, input);
                self.context
                    .header(as_str(name, &header)?)
                    .map_or(Value::Null, |v| Value::String(v.to_string()))
            }
            ("method", [arg]) => {
                let method = value!(self, arg, input);
                Value::Bool(self.context.method().eq_ignore_ascii_case(as_str(name, &method)?))
            }
            ("param", [arg]) => {
                let param = value!(self, arg, input);
                self.context
                    .params()
                    .get(as_str(name, &param)?)
                    .map_or(Value::Null, |v| Value::String(v.clone()))
            }

            ("@base64", []) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(to_text(input)))
            }
            ("@base64d", []) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(as_str(name, input)?)
                    .map_err(|e| ExprError::Type(format!("invalid base64: {e}")))?;
                Value::String(String::from_utf8_lossy(&decoded).into_owned())
            }
            ("uuid", []) => Value::String(uuid_v4()),
            ("now", []) => Value::String(now("%Y-%m-%dT%H:%M:%S%.3fZ")?),
            ("now", [arg]) => {
                let format = value!(self, arg, input);
                Value::String(now(as_str(name, &format)?)?)
            }
            ("random", [min, max]) => {
                let min = as_i64(name, &value!(self, min, input))?;
                let max = as_i64(name, &value!(self, max, input))?;
                if min > max {
                    return Err(ExprError::Type(format!("random: {min} is greater than {max}")));
                }
                Value::from(rand::thread_rng().gen_range(min..=max))
            }

            (name, args) if BUILTINS.contains(&name) => {
                return Err(ExprError::Arity {
                    name: name.to_string(),
                    found: args.len(),
                })
            }
            (name, _) => return Err(ExprError::UnknownFunction(name.to_string())),
        };
        Ok(Some(result))
    }
}

/// Convert an f64 to a JSON number, keeping integral values integral.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_str<'v>(function: &str, value: &'v Value) -> Result<&'v str, ExprError> {
    value.as_str().ok_or_else(|| {
        ExprError::Type(format!(
            "{function} expects a string, got {}",
            type_name(value)
        ))
    })
}

fn as_i64(function: &str, value: &Value) -> Result<i64, ExprError> {
    value
        .as_f64()
        .map(|n| n as i64)
        .ok_or_else(|| ExprError::Type(format!("{function} expects a number, got {}", type_name(value))))
}

fn index(target: &Value, key: &Value) -> Result<Value, ExprError> {
    match (target, key) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Object(map), Value::String(k)) => Ok(map.get(k).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), Value::Number(n)) => {
            let i = n.as_f64().unwrap_or(0.0) as i64;
            let i = if i < 0 { items.len() as i64 + i } else { i };
            Ok(usize::try_from(i)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::Null))
        }
        _ => Err(ExprError::Type(format!(
            "cannot index {} with {}",
            type_name(target),
            type_name(key)
        ))),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, ExprError> {
    let ordering = |lhs: &Value, rhs: &Value| -> Result<Ordering, ExprError> {
        let ordering = match (lhs, rhs) {
            (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        };
        ordering.ok_or_else(|| {
            ExprError::Type(format!(
                "cannot compare {} with {}",
                type_name(lhs),
                type_name(rhs)
            ))
        })
    };

    Ok(match op {
        CmpOp::Eq => values_equal(lhs, rhs),
        CmpOp::Ne => !values_equal(lhs, rhs),
        CmpOp::Lt => ordering(lhs, rhs)? == Ordering::Less,
        CmpOp::Le => ordering(lhs, rhs)? != Ordering::Greater,
        CmpOp::Gt => ordering(lhs, rhs)? == Ordering::Greater,
        CmpOp::Ge => ordering(lhs, rhs)? != Ordering::Less,
        CmpOp::In => match rhs {
            Value::Array(items) => items.iter().any(|item| values_equal(item, lhs)),
            Value::Object(map) => map.contains_key(as_str("in", lhs)?),
            Value::String(s) => s.contains(as_str("in", lhs)?),
            Value::Null => false,
            other => {
                return Err(ExprError::Type(format!(
                    "cannot test membership in {}",
                    type_name(other)
                )))
            }
        },
    })
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, ExprError> {
    Ok(match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(h), Value::Array(n)) => {
            let mut all = true;
            for wanted in n {
                let mut found = false;
                for item in h {
                    if contains(item, wanted).unwrap_or(false) {
                        found = true;
                        break;
                    }
                }
                all &= found;
            }
            all
        }
        (Value::Object(h), Value::Object(n)) => object_contains(h, n)?,
        (h, n) if type_name(h) == type_name(n) => values_equal(h, n),
        (h, n) => {
            return Err(ExprError::Type(format!(
                "{} cannot contain {}",
                type_name(h),
                type_name(n)
            )))
        }
    })
}

fn object_contains(haystack: &Map<String, Value>, needle: &Map<String, Value>) -> Result<bool, ExprError> {
    for (key, wanted) in needle {
        match haystack.get(key) {
            Some(value) if contains(value, wanted)? => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

fn length(value: &Value) -> Result<Value, ExprError> {
    Ok(match value {
        Value::Null => Value::from(0),
        Value::String(s) => Value::from(s.chars().count()),
        Value::Array(items) => Value::from(items.len()),
        Value::Object(map) => Value::from(map.len()),
        Value::Number(n) => number(n.as_f64().unwrap_or(0.0).abs()),
        Value::Bool(_) => return Err(ExprError::Type("boolean has no length".into())),
    })
}

/// Current UTC time in a strftime-style format.
fn now(format: &str) -> Result<String, ExprError> {
    use std::fmt::Write;

    let mut out = String::new();
    write!(out, "{}", chrono::Utc::now().format(format))
        .map_err(|_| ExprError::Type(format!("invalid time format {format:?}")))?;
    Ok(out)
}

/// Random version-4 UUID.
fn uuid_v4() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffff_ffff_ffff,
    )
}
