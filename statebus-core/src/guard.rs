//! Guard expressions.
//!
//! A guard string that does not name a bound guard is compiled into a
//! [`GuardExpr`]. Operands read either the machine context or the data of
//! the event being processed:
//!
//! - `ctx.path` / `event.path` - truthiness of the value at a dot path
//! - `== != > >= < <=` - comparison with a literal (string, number, bool, null)
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)`
//!
//! `&&` binds tighter than `||`. Ordering operators only hold for numbers;
//! a missing path reads as `null`.
//!
//! ```text
//! ctx.count >= 3 && !ctx.paused
//! event.kind == "retry" || (ctx.attempts < 5 && event.force)
//! ```

use crate::error::CoreError;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;

/// Where an operand path is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Context,
    Event,
}

impl Scope {
    fn prefix(self) -> &'static str {
        match self {
            Scope::Context => "ctx",
            Scope::Event => "event",
        }
    }
}

/// A scoped dot path such as `ctx.order.total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub scope: Scope,
    pub path: Vec<String>,
}

impl Operand {
    fn resolve<'a>(&self, ctx: &'a Value, event: &'a Value) -> &'a Value {
        let mut current = match self.scope {
            Scope::Context => ctx,
            Scope::Event => event,
        };
        for segment in &self.path {
            current = match current {
                Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
                _ => &Value::Null,
            };
        }
        current
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.scope.prefix(), self.path.join("."))
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A compiled guard expression.
#[derive(Debug, Clone)]
pub enum GuardExpr {
    Truthy(Operand),
    Compare(Operand, CompareOp, Value),
    And(Box<GuardExpr>, Box<GuardExpr>),
    Or(Box<GuardExpr>, Box<GuardExpr>),
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses an expression. The whole input must be consumed.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty guard expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_or()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(invalid(format!(
                "unexpected input at offset {}: '{}'",
                parser.pos,
                &s[parser.pos..]
            )));
        }
        Ok(expr)
    }

    /// Returns whether `s` looks like an expression rather than a binding name.
    pub fn is_expression(s: &str) -> bool {
        let s = s.trim_start();
        s.starts_with("ctx.") || s.starts_with("event.") || s.starts_with('!') || s.starts_with('(')
    }

    /// Evaluates against a context and the current event's data.
    pub fn evaluate(&self, ctx: &Value, event: &Value) -> bool {
        match self {
            GuardExpr::Truthy(operand) => is_truthy(operand.resolve(ctx, event)),
            GuardExpr::Compare(operand, op, literal) => {
                compare(operand.resolve(ctx, event), *op, literal)
            }
            GuardExpr::And(left, right) => left.evaluate(ctx, event) && right.evaluate(ctx, event),
            GuardExpr::Or(left, right) => left.evaluate(ctx, event) || right.evaluate(ctx, event),
            GuardExpr::Not(inner) => !inner.evaluate(ctx, event),
        }
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidGuard {
        reason: reason.into(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(value: &Value, op: CompareOp, literal: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(value, literal),
        CompareOp::Ne => !values_equal(value, literal),
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            let (Value::Number(a), Value::Number(b)) = (value, literal) else {
                return false;
            };
            let Some(ordering) = compare_numbers(a, b) else {
                return false;
            };
            match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
    }
}

/// Integers compare exactly; anything involving a float goes through f64.
fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    match (integer(a), integer(b)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (integer(a), integer(b)) {
            (Some(a), Some(b)) => a == b,
            _ => a
                .as_f64()
                .zip(b.as_f64())
                .map(|(a, b)| (a - b).abs() < f64::EPSILON)
                .unwrap_or(false),
        },
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

/// Recursive descent over the expression text.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_or(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();
        while self.eat("||") {
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();
        while self.eat("&&") {
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();
        // `!=` never starts a term, so a leading '!' is always negation
        if self.eat("!") {
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }
        if self.eat("(") {
            let expr = self.parse_or()?;
            self.skip_whitespace();
            if !self.eat(")") {
                return Err(invalid("expected ')'"));
            }
            return Ok(expr);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, CoreError> {
        let operand = self.parse_operand()?;
        self.skip_whitespace();

        // Two-character operators first so `>=` is not read as `>`
        let op = if self.eat("==") {
            CompareOp::Eq
        } else if self.eat("!=") {
            CompareOp::Ne
        } else if self.eat(">=") {
            CompareOp::Ge
        } else if self.eat("<=") {
            CompareOp::Le
        } else if self.eat(">") {
            CompareOp::Gt
        } else if self.eat("<") {
            CompareOp::Lt
        } else {
            return Ok(GuardExpr::Truthy(operand));
        };

        self.skip_whitespace();
        let literal = match op {
            CompareOp::Eq | CompareOp::Ne => self.parse_literal()?,
            _ => self.parse_number()?,
        };
        Ok(GuardExpr::Compare(operand, op, literal))
    }

    fn parse_operand(&mut self) -> Result<Operand, CoreError> {
        let scope = if self.eat("ctx.") {
            Scope::Context
        } else if self.eat("event.") {
            Scope::Event
        } else {
            return Err(invalid(format!(
                "operand must start with 'ctx.' or 'event.' at offset {}",
                self.pos
            )));
        };

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let raw = &self.input[start..self.pos];
        if raw.is_empty() {
            return Err(invalid("empty operand path"));
        }
        let path: Vec<String> = raw.split('.').map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Err(invalid(format!("malformed path '{}'", raw)));
        }
        Ok(Operand { scope, path })
    }

    fn parse_literal(&mut self) -> Result<Value, CoreError> {
        for (word, value) in [
            ("true", Value::Bool(true)),
            ("false", Value::Bool(false)),
            ("null", Value::Null),
        ] {
            if self.eat(word) {
                return Ok(value);
            }
        }
        if self.peek_char() == Some('"') {
            return self.parse_string();
        }
        self.parse_number()
    }

    fn parse_string(&mut self) -> Result<Value, CoreError> {
        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(Value::String(out));
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                _ => out.push(c),
            }
        }
        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, CoreError> {
        let start = self.pos;
        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        self.skip_digits();
        if self.peek_char() == Some('.') {
            self.pos += 1;
            self.skip_digits();
        }

        let text = &self.input[start..self.pos];
        let number = if let Ok(n) = text.parse::<i64>() {
            Some(Number::from(n))
        } else if let Ok(n) = text.parse::<u64>() {
            Some(Number::from(n))
        } else {
            text.parse::<f64>().ok().and_then(Number::from_f64)
        };
        number
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("invalid number: '{}'", text)))
    }

    fn skip_digits(&mut self) {
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.input[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }
}
