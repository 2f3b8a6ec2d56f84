//! Expression and condition evaluation.
//!
//! The evaluator understands a deliberately small, non-Turing-complete
//! subset used by `cond`, `expr`, `array` and `location` attributes:
//!
//! - `'text'` / `"text"` - string literals
//! - `42`, `-1.5` - numbers
//! - `true` / `false` (any case), `null`
//! - `[1, 2]`, `{"a": 1}` - JSON literals
//! - `counter`, `order.items.0` - data model paths
//! - `_event.name`, `_event.data.field` - current event fields
//! - `counter + 1` - increment of a data model variable
//! - `In('state')` - active state test
//!
//! Conditions additionally support:
//!
//! - `a and b` / `a && b` - split at the first occurrence, before `or`
//! - `a or b` / `a || b`
//! - `!expr` / `not expr`
//! - `x == literal`, `x != literal` - the right-hand side is coerced
//! - `x > n`, `x >= n`, `x < n`, `x <= n` - numeric only
//!
//! Anything the grammar does not recognise evaluates to its own text.

use crate::events::Event;
use serde_json::{Map, Value};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Add,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Dotted path into the data model or `_event`.
    VarRef(String),
    /// Binary operation.
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    /// Logical negation.
    UnaryNot(Box<Expr>),
    /// `In('id')` predicate.
    InState(String),
    /// Unrecognised text, evaluated as itself.
    Raw(String),
}

/// Read-only view an expression is evaluated against.
pub trait Scope {
    /// The data model.
    fn data(&self) -> &Map<String, Value>;

    /// The event currently being processed, if any.
    fn event(&self) -> Option<&Event> {
        None
    }

    /// Whether the state with this id is active.
    fn is_active(&self, _state: &str) -> bool {
        false
    }
}

impl Scope for Map<String, Value> {
    fn data(&self) -> &Map<String, Value> {
        self
    }
}

impl Expr {
    /// Parses a value expression (`expr`, `array`, `<data expr>`).
    pub fn parse_value(s: &str) -> Expr {
        let s = s.trim();

        if let Some(inner) = strip_quotes(s) {
            return Expr::Literal(Value::String(inner.to_string()));
        }
        match s.to_ascii_lowercase().as_str() {
            "true" => return Expr::Literal(Value::Bool(true)),
            "false" => return Expr::Literal(Value::Bool(false)),
            "null" => return Expr::Literal(Value::Null),
            _ => {}
        }
        if let Some(num) = parse_number(s) {
            return Expr::Literal(num);
        }
        if s.starts_with('[') || s.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(s) {
                return Expr::Literal(value);
            }
        }
        if let Some(state) = parse_in_state(s) {
            return Expr::InState(state);
        }
        if is_path(s) {
            return Expr::VarRef(s.to_string());
        }
        if let Some((var, step)) = find_increment(s) {
            return Expr::BinOp(
                BinOp::Add,
                Box::new(Expr::VarRef(var)),
                Box::new(Expr::Literal(step)),
            );
        }

        Expr::Raw(s.to_string())
    }

    /// Parses a condition (`cond`). An empty condition is always true.
    pub fn parse_condition(s: &str) -> Expr {
        let s = s.trim();
        if s.is_empty() {
            return Expr::Literal(Value::Bool(true));
        }

        if let Some((left, right)) = split_first(s, &[" and ", "&&"]) {
            return Expr::BinOp(
                BinOp::And,
                Box::new(Expr::parse_condition(left)),
                Box::new(Expr::parse_condition(right)),
            );
        }
        if let Some((left, right)) = split_first(s, &[" or ", "||"]) {
            return Expr::BinOp(
                BinOp::Or,
                Box::new(Expr::parse_condition(left)),
                Box::new(Expr::parse_condition(right)),
            );
        }

        if let Some(rest) = s.strip_prefix('!') {
            if !rest.starts_with('=') {
                return Expr::UnaryNot(Box::new(Expr::parse_condition(rest)));
            }
        }
        if s.len() > 4 && s.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("not ")) {
            return Expr::UnaryNot(Box::new(Expr::parse_condition(&s[4..])));
        }

        if let Some(cmp) = parse_comparison(s) {
            return cmp;
        }

        Expr::parse_value(s)
    }

    /// Evaluates the expression to a value.
    pub fn evaluate(&self, scope: &dyn Scope) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::VarRef(path) => resolve_path(scope, path),
            Expr::Raw(text) => Value::String(text.clone()),
            Expr::InState(state) => Value::Bool(scope.is_active(state)),
            Expr::UnaryNot(inner) => Value::Bool(!inner.holds(scope)),
            Expr::BinOp(op, left, right) => match op {
                BinOp::And => Value::Bool(left.holds(scope) && right.holds(scope)),
                BinOp::Or => Value::Bool(left.holds(scope) || right.holds(scope)),
                BinOp::Eq => Value::Bool(values_equal(
                    &left.evaluate(scope),
                    &right.evaluate(scope),
                )),
                BinOp::Ne => Value::Bool(!values_equal(
                    &left.evaluate(scope),
                    &right.evaluate(scope),
                )),
                BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => {
                    let lhs = as_f64(&left.evaluate(scope));
                    let rhs = as_f64(&right.evaluate(scope));
                    let result = match (lhs, rhs) {
                        (Some(l), Some(r)) => match op {
                            BinOp::Gt => l > r,
                            BinOp::Ge => l >= r,
                            BinOp::Lt => l < r,
                            _ => l <= r,
                        },
                        _ => false,
                    };
                    Value::Bool(result)
                }
                BinOp::Add => add(&left.evaluate(scope), &right.evaluate(scope)),
            },
        }
    }

    /// Evaluates the expression as a condition.
    pub fn holds(&self, scope: &dyn Scope) -> bool {
        is_truthy(&self.evaluate(scope))
    }
}

/// Evaluates an optional condition; a missing condition always holds.
pub fn condition_holds(cond: Option<&str>, scope: &dyn Scope) -> bool {
    match cond {
        Some(text) => Expr::parse_condition(text).holds(scope),
        None => true,
    }
}

/// Returns whether a value counts as true in a condition.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn resolve_path(scope: &dyn Scope, path: &str) -> Value {
    let normalized = path.replace('[', ".").replace([']', '\'', '"'], "");
    let mut segments = normalized.split('.').filter(|s| !s.is_empty());

    let event_root;
    let mut current: &Value = match segments.next() {
        Some("_event") => {
            event_root = match scope.event() {
                Some(event) => event.to_value(),
                None => Value::Null,
            };
            &event_root
        }
        Some(first) => match scope.data().get(first) {
            Some(value) => value,
            None => return Value::Null,
        },
        None => return Value::Null,
    };

    for segment in segments {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(value) => value,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(value) => value,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }

    current.clone()
}

/// Writes `value` at a dotted location, creating intermediate objects.
/// Returns the top-level key that changed.
pub fn assign_path(data: &mut Map<String, Value>, location: &str, value: Value) -> Option<String> {
    let normalized = location.replace('[', ".").replace([']', '\'', '"'], "");
    let segments: Vec<&str> = normalized
        .split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let (last, parents) = segments.split_last()?;
    let root = parents.first().unwrap_or(last).to_string();

    if parents.is_empty() {
        data.insert(last.to_string(), value);
        return Some(root);
    }

    let mut current = data
        .entry(parents[0].to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    for segment in &parents[1..] {
        current = step_into(current, segment);
    }
    match current {
        Value::Array(items) => match last.parse::<usize>() {
            Ok(i) if i < items.len() => items[i] = value,
            Ok(i) if i == items.len() => items.push(value),
            _ => return None,
        },
        other => {
            if !other.is_object() {
                *other = Value::Object(Map::new());
            }
            if let Value::Object(map) = other {
                map.insert(last.to_string(), value);
            }
        }
    }
    Some(root)
}

fn step_into<'a>(current: &'a mut Value, segment: &str) -> &'a mut Value {
    let index = match current {
        Value::Array(items) => segment.parse::<usize>().ok().filter(|&i| i < items.len()),
        _ => None,
    };
    if let Some(i) = index {
        return &mut current[i];
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new())),
        other => other,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn add(base: &Value, step: &Value) -> Value {
    // Integers that overflow fall through to float addition
    if let Some(sum) = base
        .as_i64()
        .zip(step.as_i64())
        .and_then(|(b, s)| b.checked_add(s))
    {
        return Value::from(sum);
    }

    match (base, step) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            let sum = as_f64(base).unwrap_or(0.0) + as_f64(step).unwrap_or(0.0);
            let integral = sum.fract() == 0.0 && sum.abs() < i64::MAX as f64;
            if integral && !(base.is_f64() || step.is_f64()) {
                Value::from(sum as i64)
            } else {
                serde_json::Number::from_f64(sum)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        _ => Value::Null,
    }
}

fn strip_quotes(s: &str) -> Option<&str> {
    if s.len() < 2 {
        return None;
    }
    let first = s.chars().next()?;
    if (first == '"' || first == '\'') && s.ends_with(first) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let body = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (body, None),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match frac_part {
        None => s.parse::<i64>().ok().map(Value::from),
        Some(f) if !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()) => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        Some(_) => None,
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_path(s: &str) -> bool {
    let mut segments = s.split('.');
    let head = segments.next().unwrap_or("");
    let head = head.split('[').next().unwrap_or("");
    if !is_identifier(head) {
        return false;
    }
    let rest = &s[head.len()..];
    rest.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '[' | ']' | '\''))
        && !rest.ends_with('.')
}

fn parse_in_state(s: &str) -> Option<String> {
    let inner = s.strip_prefix("In(")?.strip_suffix(')')?;
    strip_quotes(inner.trim()).map(str::to_string)
}

/// Finds the `<var> ... + <int>` increment pattern.
fn find_increment(s: &str) -> Option<(String, Value)> {
    let start = s.find(|c: char| c.is_ascii_alphabetic() || c == '_')?;
    let ident_len = s[start..]
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(s.len() - start);
    let var = &s[start..start + ident_len];

    let after = &s[start + ident_len..];
    let plus = after.find('+')?;
    let operand = after[plus + 1..].trim_start();
    let digits_end = operand
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(operand.len());
    let step = operand[..digits_end].parse::<i64>().ok()?;

    Some((var.to_string(), Value::from(step)))
}

/// Splits at the earliest occurrence of any separator.
fn split_first<'a>(s: &'a str, separators: &[&str]) -> Option<(&'a str, &'a str)> {
    separators
        .iter()
        .filter_map(|sep| s.find(sep).map(|idx| (idx, sep.len())))
        .min_by_key(|&(idx, _)| idx)
        .map(|(idx, len)| (&s[..idx], &s[idx + len..]))
}

fn parse_comparison(s: &str) -> Option<Expr> {
    let bytes = s.as_bytes();
    let mut found = None;
    for i in 0..bytes.len() {
        let two = s.get(i..i + 2);
        let op = match two {
            Some("==") => Some((BinOp::Eq, 2)),
            Some("!=") => Some((BinOp::Ne, 2)),
            Some(">=") => Some((BinOp::Ge, 2)),
            Some("<=") => Some((BinOp::Le, 2)),
            _ => match bytes[i] {
                b'>' => Some((BinOp::Gt, 1)),
                b'<' => Some((BinOp::Lt, 1)),
                _ => None,
            },
        };
        if let Some(op) = op {
            found = Some((i, op));
            break;
        }
    }

    let (idx, (op, len)) = found?;
    let lhs = s[..idx].trim();
    let rhs = s[idx + len..].trim();
    if !is_path(lhs) || rhs.is_empty() {
        return None;
    }

    let rhs = match op {
        BinOp::Eq | BinOp::Ne => coerce_literal(rhs),
        _ => parse_number(rhs)?,
    };

    Some(Expr::BinOp(
        op,
        Box::new(Expr::VarRef(lhs.to_string())),
        Box::new(Expr::Literal(rhs)),
    ))
}

fn coerce_literal(raw: &str) -> Value {
    if let Some(inner) = strip_quotes(raw) {
        return Value::String(inner.to_string());
    }
    if let Some(num) = parse_number(raw) {
        return num;
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TestScope {
        data: Map<String, Value>,
        event: Option<Event>,
        active: Vec<&'static str>,
    }

    impl Scope for TestScope {
        fn data(&self) -> &Map<String, Value> {
            &self.data
        }

        fn event(&self) -> Option<&Event> {
            self.event.as_ref()
        }

        fn is_active(&self, state: &str) -> bool {
            self.active.contains(&state)
        }
    }

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn cond(s: &str, ctx: Value) -> bool {
        Expr::parse_condition(s).holds(&data(ctx))
    }

    #[test]
    fn test_literals() {
        let empty = Map::new();
        assert_eq!(Expr::parse_value("'hi'").evaluate(&empty), json!("hi"));
        assert_eq!(Expr::parse_value("\"hi\"").evaluate(&empty), json!("hi"));
        assert_eq!(Expr::parse_value("42").evaluate(&empty), json!(42));
        assert_eq!(Expr::parse_value("-1.5").evaluate(&empty), json!(-1.5));
        assert_eq!(Expr::parse_value("TRUE").evaluate(&empty), json!(true));
        assert_eq!(Expr::parse_value("null").evaluate(&empty), Value::Null);
        assert_eq!(Expr::parse_value("[1, 2]").evaluate(&empty), json!([1, 2]));
    }

    #[test]
    fn test_variable_paths() {
        let ctx = data(json!({"order": {"items": [{"sku": "a"}], "paid": true}}));
        assert_eq!(Expr::parse_value("order.paid").evaluate(&ctx), json!(true));
        assert_eq!(Expr::parse_value("order.items.0.sku").evaluate(&ctx), json!("a"));
        assert_eq!(Expr::parse_value("order.items[0].sku").evaluate(&ctx), json!("a"));
        assert_eq!(Expr::parse_value("order.missing.x").evaluate(&ctx), Value::Null);
        assert_eq!(Expr::parse_value("nothing").evaluate(&ctx), Value::Null);
    }

    #[test]
    fn test_event_fields() {
        let scope = TestScope {
            data: Map::new(),
            event: Some(Event::new("go").with_data(json!({"n": 3}))),
            active: vec![],
        };
        assert_eq!(Expr::parse_value("_event.name").evaluate(&scope), json!("go"));
        assert_eq!(Expr::parse_value("_event.data.n").evaluate(&scope), json!(3));
        assert!(Expr::parse_condition("_event.data.n > 2").holds(&scope));
    }

    #[test]
    fn test_increment() {
        let ctx = data(json!({"count": 4}));
        assert_eq!(Expr::parse_value("count + 1").evaluate(&ctx), json!(5));
        assert_eq!(Expr::parse_value("count+2").evaluate(&ctx), json!(6));
        // Non-numeric base counts as zero
        assert_eq!(Expr::parse_value("missing + 3").evaluate(&ctx), json!(3));
    }

    #[test]
    fn test_addition_overflow_widens_to_float() {
        let ctx = data(json!({"big": i64::MAX, "low": i64::MIN}));

        let sum = Expr::parse_value("big + 1").evaluate(&ctx);
        assert!(sum.is_f64());
        assert_eq!(sum.as_f64(), Some(i64::MAX as f64));

        let sum = Expr::parse_value("low + -1").evaluate(&ctx);
        assert!(sum.is_f64());

        assert_eq!(
            Expr::parse_value("big + -1").evaluate(&ctx),
            json!(i64::MAX - 1)
        );
    }

    #[test]
    fn test_raw_fallback() {
        let empty = Map::new();
        assert_eq!(
            Expr::parse_value("some words here").evaluate(&empty),
            json!("some words here")
        );
        assert_eq!(Expr::parse_value("").evaluate(&empty), json!(""));
    }

    #[test]
    fn test_equality_coercion() {
        assert!(cond("x == 1", json!({"x": 1})));
        assert!(cond("x == 1", json!({"x": 1.0})));
        assert!(!cond("x == 1", json!({"x": "1"})));
        assert!(cond("s == 'on'", json!({"s": "on"})));
        assert!(cond("s == on", json!({"s": "on"})));
        assert!(cond("flag == true", json!({"flag": true})));
        assert!(cond("s != 'off'", json!({"s": "on"})));
        assert!(!cond("s != 'on'", json!({"s": "on"})));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(cond("n > 5", json!({"n": 6})));
        assert!(!cond("n > 5", json!({"n": 5})));
        assert!(cond("n >= 5", json!({"n": 5})));
        assert!(cond("n < 0.5", json!({"n": 0.25})));
        assert!(cond("n <= -1", json!({"n": -1})));
        // Non-numeric lhs never satisfies a numeric comparison
        assert!(!cond("n > 5", json!({"n": "10"})));
        assert!(!cond("n < 5", json!({})));
    }

    #[test]
    fn test_logical_operators() {
        assert!(cond("a and b", json!({"a": true, "b": 1})));
        assert!(!cond("a and b", json!({"a": true, "b": 0})));
        assert!(cond("a or b", json!({"a": false, "b": "x"})));
        assert!(cond("a && b", json!({"a": 1, "b": 1})));
        assert!(cond("a || b", json!({"a": 0, "b": 1})));
        assert!(cond("!a", json!({"a": false})));
        assert!(cond("not a", json!({"a": ""})));
        assert!(!cond("not a", json!({"a": "x"})));
    }

    #[test]
    fn test_and_splits_before_or() {
        // Naive split: "a or b and c" is (a or b) and c
        let expr = Expr::parse_condition("a or b and c");
        assert!(matches!(expr, Expr::BinOp(BinOp::And, _, _)));
        assert!(!expr.holds(&data(json!({"a": true, "b": false, "c": false}))));
    }

    #[test]
    fn test_truthiness() {
        assert!(!cond("v", json!({"v": null})));
        assert!(!cond("v", json!({"v": 0})));
        assert!(!cond("v", json!({"v": ""})));
        assert!(!cond("v", json!({"v": false})));
        assert!(cond("v", json!({"v": []})));
        assert!(cond("v", json!({"v": "x"})));
        assert!(cond("", json!({})));
    }

    #[test]
    fn test_in_state() {
        let scope = TestScope {
            data: Map::new(),
            event: None,
            active: vec!["running"],
        };
        assert!(Expr::parse_condition("In('running')").holds(&scope));
        assert!(!Expr::parse_condition("In('idle')").holds(&scope));
        assert!(Expr::parse_condition("!In('idle')").holds(&scope));
    }

    #[test]
    fn test_assign_path() {
        let mut ctx = data(json!({"list": [1, 2], "n": 3}));

        assert_eq!(assign_path(&mut ctx, "n", json!(4)), Some("n".to_string()));
        assert_eq!(
            assign_path(&mut ctx, "order.total", json!(10)),
            Some("order".to_string())
        );
        assert_eq!(
            assign_path(&mut ctx, "list[1]", json!("b")),
            Some("list".to_string())
        );
        assert_eq!(assign_path(&mut ctx, "", json!(1)), None);

        assert_eq!(Value::Object(ctx), json!({
            "list": [1, "b"],
            "n": 4,
            "order": {"total": 10}
        }));
    }

    #[test]
    fn test_condition_holds_helper() {
        let ctx = data(json!({"ok": true}));
        assert!(condition_holds(None, &ctx));
        assert!(condition_holds(Some("ok"), &ctx));
        assert!(!condition_holds(Some("!ok"), &ctx));
    }
}
