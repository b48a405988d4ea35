//! Guard expression evaluation.
//!
//! A transition guard is either a name resolved against the caller's guard
//! implementations, or an expression over the context and the triggering
//! event. The expression language supports:
//!
//! - `ctx.field` / `event.field` - field access (truthy check)
//! - `ctx.field.nested` - nested field access
//! - `event.type` - the event name
//! - `==`, `!=` against strings, numbers, booleans and null
//! - `>`, `>=`, `<`, `<=` against numbers
//! - `!expr`, `expr && expr`, `expr || expr` (AND binds tighter than OR)
//! - `(expr)` - grouping
//!
//! Examples:
//! - `ctx.count > 2 && event.force`
//! - `!(ctx.retries >= 3)`
//! - `event.status == "ok"`

use crate::error::CoreError;
use crate::event::Event;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Caller-supplied guard predicate.
pub type GuardFn = Arc<dyn Fn(&Value, &Event) -> Result<bool, String> + Send + Sync>;

/// Where a field reference is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Context,
    Event,
}

/// A `ctx.` or `event.` path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub scope: Scope,
    pub path: String,
}

impl FieldRef {
    fn resolve(&self, ctx: &Value, event: &Event) -> Value {
        match self.scope {
            Scope::Context => get_field(ctx, &self.path),
            Scope::Event => event_field(event, &self.path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardExpr {
    Truthy(FieldRef),
    Compare(FieldRef, CmpOp, Value),
    And(Box<GuardExpr>, Box<GuardExpr>),
    Or(Box<GuardExpr>, Box<GuardExpr>),
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidGuard {
                reason: "empty guard expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_or()?;
        parser.skip_whitespace();
        if parser.pos != s.len() {
            return Err(CoreError::InvalidGuard {
                reason: format!("unexpected input at offset {}: '{}'", parser.pos, &s[parser.pos..]),
            });
        }
        Ok(expr)
    }

    /// Evaluates the guard against a context and the triggering event.
    pub fn evaluate(&self, ctx: &Value, event: &Event) -> bool {
        match self {
            GuardExpr::Truthy(field) => is_truthy(&field.resolve(ctx, event)),
            GuardExpr::Compare(field, op, expected) => {
                let value = field.resolve(ctx, event);
                match op {
                    CmpOp::Eq => values_equal(&value, expected),
                    CmpOp::Ne => !values_equal(&value, expected),
                    CmpOp::Gt => compare_numbers(&value, expected, |a, b| a > b),
                    CmpOp::Ge => compare_numbers(&value, expected, |a, b| a >= b),
                    CmpOp::Lt => compare_numbers(&value, expected, |a, b| a < b),
                    CmpOp::Le => compare_numbers(&value, expected, |a, b| a <= b),
                }
            }
            GuardExpr::And(left, right) => left.evaluate(ctx, event) && right.evaluate(ctx, event),
            GuardExpr::Or(left, right) => left.evaluate(ctx, event) || right.evaluate(ctx, event),
            GuardExpr::Not(inner) => !inner.evaluate(ctx, event),
        }
    }
}

/// A transition guard as written in a definition.
#[derive(Clone, PartialEq)]
pub enum Guard {
    Expr(GuardExpr),
    Named(String),
}

impl Guard {
    /// A bare identifier names a caller-supplied predicate; anything else is
    /// parsed as an expression.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let trimmed = s.trim();
        let is_name = !trimmed.is_empty()
            && !trimmed.starts_with("ctx.")
            && !trimmed.starts_with("event.")
            && trimmed
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | ':'));
        if is_name {
            Ok(Guard::Named(trimmed.to_string()))
        } else {
            GuardExpr::parse(trimmed).map(Guard::Expr)
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Expr(expr) => write!(f, "Expr({:?})", expr),
            Guard::Named(name) => write!(f, "Named({})", name),
        }
    }
}

/// Evaluates guards against the caller's named predicates.
///
/// Evaluation failures never escape: an unknown name or an `Err` from a
/// predicate is logged and counts as `false`.
pub struct GuardEvaluator<'a> {
    named: &'a HashMap<String, GuardFn>,
}

impl<'a> GuardEvaluator<'a> {
    pub fn new(named: &'a HashMap<String, GuardFn>) -> Self {
        Self { named }
    }

    pub fn check(&self, guard: &Guard, ctx: &Value, event: &Event) -> bool {
        match guard {
            Guard::Expr(expr) => expr.evaluate(ctx, event),
            Guard::Named(name) => match self.named.get(name) {
                Some(predicate) => match predicate(ctx, event) {
                    Ok(pass) => pass,
                    Err(reason) => {
                        warn!(guard = %name, event = %event.name, %reason, "guard evaluation failed");
                        false
                    }
                },
                None => {
                    warn!(guard = %name, event = %event.name, "unknown guard");
                    false
                }
            },
        }
    }

    /// Evaluates an optional guard (None = always true).
    pub fn check_opt(&self, guard: Option<&Guard>, ctx: &Value, event: &Event) -> bool {
        guard.map(|g| self.check(g, ctx, event)).unwrap_or(true)
    }
}

/// Resolves a `ctx.`/`event.` path, or a bare `ctx`/`event`.
pub(crate) fn lookup(ctx: &Value, event: &Event, path: &str) -> Option<Value> {
    let path = path.trim();
    if path == "ctx" {
        return Some(ctx.clone());
    }
    if path == "event" {
        return serde_json::to_value(event).ok();
    }
    if let Some(rest) = path.strip_prefix("ctx.") {
        return Some(get_field(ctx, rest));
    }
    if let Some(rest) = path.strip_prefix("event.") {
        return Some(event_field(event, rest));
    }
    None
}

fn event_field(event: &Event, path: &str) -> Value {
    if path == "type" {
        return Value::String(event.name.clone());
    }
    match &event.data {
        Value::Object(_) => get_field(&event.data, path),
        other if path == "data" => other.clone(),
        _ => Value::Null,
    }
}

fn get_field(root: &Value, path: &str) -> Value {
    let mut current = root;
    for part in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(part).unwrap_or(&Value::Null),
            Value::Array(items) => match part.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(item) => current = item,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn compare_numbers(value: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (value.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Recursive descent parser for guard expressions.
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
        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
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
        let field = self.parse_field()?;
        self.skip_whitespace();

        // Two-character operators first so `>=` is not read as `>`.
        let ops = [
            ("==", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            (">=", CmpOp::Ge),
            ("<=", CmpOp::Le),
            (">", CmpOp::Gt),
            ("<", CmpOp::Lt),
        ];
        for (token, op) in ops {
            if self.eat(token) {
                let value = match op {
                    CmpOp::Eq | CmpOp::Ne => self.parse_literal()?,
                    _ => self.parse_number()?,
                };
                return Ok(GuardExpr::Compare(field, op, value));
            }
        }
        Ok(GuardExpr::Truthy(field))
    }

    fn parse_field(&mut self) -> Result<FieldRef, CoreError> {
        let scope = if self.eat("ctx.") {
            Scope::Context
        } else if self.eat("event.") {
            Scope::Event
        } else {
            return Err(invalid("field must start with 'ctx.' or 'event.'"));
        };

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        let path = &self.input[start..self.pos];
        if path.is_empty() || path.ends_with('.') {
            return Err(invalid("empty field name"));
        }
        Ok(FieldRef {
            scope,
            path: path.to_string(),
        })
    }

    fn parse_literal(&mut self) -> Result<Value, CoreError> {
        self.skip_whitespace();
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
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, CoreError> {
        self.skip_whitespace();
        let start = self.pos;
        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid(&format!("invalid number: '{}'", text)))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.peek_str(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

fn invalid(reason: &str) -> CoreError {
    CoreError::InvalidGuard {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, ctx: Value) -> bool {
        GuardExpr::parse(expr).unwrap().evaluate(&ctx, &Event::new("E"))
    }

    #[test]
    fn test_truthy_values() {
        for truthy in [json!(true), json!(1), json!("x"), json!([1]), json!({"k": 1})] {
            assert!(eval("ctx.value", json!({ "value": truthy })));
        }
        for falsy in [json!(false), json!(0), json!(""), json!([]), json!({}), json!(null)] {
            assert!(!eval("ctx.value", json!({ "value": falsy })));
        }
        assert!(!eval("ctx.value", json!({})));
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("ctx.status == \"active\"", json!({"status": "active"})));
        assert!(eval("ctx.status != \"active\"", json!({"status": "idle"})));
        assert!(eval("ctx.amount > 100", json!({"amount": 150})));
        assert!(!eval("ctx.amount > 100", json!({"amount": 100})));
        assert!(eval("ctx.amount >= 100", json!({"amount": 100})));
        assert!(eval("ctx.count < 10", json!({"count": 5})));
        assert!(eval("ctx.count <= 10", json!({"count": 10})));
        assert!(eval("ctx.temp > -10", json!({"temp": 0})));
        assert!(eval("ctx.rate >= 0.5", json!({"rate": 0.5})));
        assert!(eval("ctx.flag == false", json!({"flag": false})));
        assert!(eval("ctx.value == null", json!({})));
        assert!(!eval("ctx.value > 10", json!({"value": "not a number"})));
    }

    #[test]
    fn test_precedence_and_grouping() {
        let g = "ctx.a && ctx.b || ctx.c";
        assert!(eval(g, json!({"a": false, "b": false, "c": true})));
        assert!(!eval(g, json!({"a": true, "b": false, "c": false})));

        let g = "(ctx.a || ctx.b) && ctx.c";
        assert!(eval(g, json!({"a": false, "b": true, "c": true})));
        assert!(!eval(g, json!({"a": true, "b": true, "c": false})));

        assert!(eval("!(ctx.a && ctx.b)", json!({"a": true, "b": false})));
        assert!(eval("!!ctx.a", json!({"a": true})));
    }

    #[test]
    fn test_nested_field() {
        let g = "ctx.order.customer.verified";
        assert!(eval(g, json!({"order": {"customer": {"verified": true}}})));
        assert!(!eval(g, json!({"order": {}})));
        assert!(eval("ctx.items.1 == 7", json!({"items": [3, 7]})));
    }

    #[test]
    fn test_event_fields() {
        let guard = GuardExpr::parse("ctx.count > 2 && event.force").unwrap();
        let ev = Event::with_data("GO", json!({"force": true}));
        assert!(guard.evaluate(&json!({"count": 3}), &ev));
        assert!(!guard.evaluate(&json!({"count": 3}), &Event::new("GO")));

        let guard = GuardExpr::parse("event.type == \"GO\"").unwrap();
        assert!(guard.evaluate(&json!({}), &ev));

        let guard = GuardExpr::parse("event.data == 5").unwrap();
        assert!(guard.evaluate(&json!({}), &Event::with_data("N", json!(5))));
    }

    #[test]
    fn test_string_escape() {
        assert!(eval(r#"ctx.s == "a\"b""#, json!({"s": "a\"b"})));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "   ",
            "foo.bar > 1",
            "ctx.",
            "(ctx.a && ctx.b",
            "ctx.name == \"unclosed",
            "ctx.value > abc",
            "ctx.a ctx.b",
        ] {
            assert!(GuardExpr::parse(bad).is_err(), "expected error for {:?}", bad);
        }
    }

    #[test]
    fn test_guard_parse_names_and_expressions() {
        assert_eq!(Guard::parse("isValid").unwrap(), Guard::Named("isValid".into()));
        assert!(matches!(Guard::parse("ctx.ok").unwrap(), Guard::Expr(_)));
        assert!(Guard::parse("ctx.").is_err());
    }

    #[test]
    fn test_evaluator_named_and_failures() {
        let mut named: HashMap<String, GuardFn> = HashMap::new();
        named.insert(
            "big".into(),
            Arc::new(|ctx: &Value, _: &Event| {
                Ok::<bool, String>(ctx["n"].as_i64().unwrap_or(0) > 10)
            }),
        );
        named.insert(
            "broken".into(),
            Arc::new(|_: &Value, _: &Event| Err::<bool, String>("boom".to_string())),
        );
        let evaluator = GuardEvaluator::new(&named);
        let ev = Event::new("E");

        assert!(evaluator.check(&Guard::Named("big".into()), &json!({"n": 11}), &ev));
        assert!(!evaluator.check(&Guard::Named("big".into()), &json!({"n": 1}), &ev));
        assert!(!evaluator.check(&Guard::Named("broken".into()), &json!({}), &ev));
        assert!(!evaluator.check(&Guard::Named("missing".into()), &json!({}), &ev));
        assert!(evaluator.check_opt(None, &json!({}), &ev));
    }

    #[test]
    fn test_lookup_paths() {
        let ev = Event::with_data("E", json!({"n": 4}));
        let ctx = json!({"a": {"b": 1}});
        assert_eq!(lookup(&ctx, &ev, "ctx.a.b"), Some(json!(1)));
        assert_eq!(lookup(&ctx, &ev, "event.n"), Some(json!(4)));
        assert_eq!(lookup(&ctx, &ev, "event"), Some(json!({"type": "E", "n": 4})));
        assert_eq!(lookup(&ctx, &ev, "ctx"), Some(ctx.clone()));
        assert_eq!(lookup(&ctx, &ev, "other.x"), None);
    }
}
