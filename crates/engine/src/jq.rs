//! jq evaluation and `jq(...)` templates
//!
//! A template is any JSON value. Strings may embed `jq(<expr>)` segments:
//! a string that is exactly one segment evaluates to the query result as
//! JSON; otherwise each segment is rendered as text in place. Objects and
//! arrays are rendered member by member.

use direktiv_core::{codes, WorkflowError};
use jaq_core::load::{Arena, File, Loader};
use jaq_core::{Compiler, Ctx, FilterT, RcIter};
use jaq_json::Val;
use serde_json::Value;

const MARKER: &str = "jq(";

/// Run a jq program and collect every output
pub fn query(expr: &str, input: &Value) -> Result<Vec<Value>, WorkflowError> {
    let program = File {
        code: expr,
        path: (),
    };
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();
    let modules = loader
        .load(&arena, program)
        .map_err(|_| jq_error(expr, "syntax error"))?;
    let filter = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|_| jq_error(expr, "undefined function or variable"))?;

    let inputs = RcIter::new(core::iter::empty());
    let mut results = Vec::new();
    for item in filter.run((Ctx::new([], &inputs), Val::from(input.clone()))) {
        match item {
            Ok(v) => results.push(Value::from(v)),
            Err(e) => return Err(jq_error(expr, &e.to_string())),
        }
    }
    Ok(results)
}

/// Single-valued query: no output is null, several outputs become an array
pub fn query_one(expr: &str, input: &Value) -> Result<Value, WorkflowError> {
    let mut results = query(expr, input)?;
    Ok(match results.len() {
        0 => Value::Null,
        1 => results.remove(0),
        _ => Value::Array(results),
    })
}

fn jq_error(expr: &str, reason: &str) -> WorkflowError {
    WorkflowError::catchable(codes::JQ, format!("failed to evaluate jq '{expr}': {reason}"))
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

/// Split a string into text and `jq(...)` segments
fn segments(s: &str) -> Result<Vec<Segment<'_>>, WorkflowError> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find(MARKER) {
        if start > 0 {
            out.push(Segment::Text(&rest[..start]));
        }
        let body = &rest[start + MARKER.len()..];
        let end = closing_paren(body).ok_or_else(|| {
            WorkflowError::catchable(codes::JQ, format!("unterminated jq( in '{s}'"))
        })?;
        out.push(Segment::Expr(&body[..end]));
        rest = &body[end + 1..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    Ok(out)
}

/// Byte offset of the parenthesis closing an already opened one
fn closing_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' => depth += 1,
            ')' if depth == 0 => return Some(i),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Text form of a value embedded in a string
fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn has_template(s: &str) -> bool {
    s.contains(MARKER)
}

/// Render a template against a document
pub fn render(template: &Value, doc: &Value) -> Result<Value, WorkflowError> {
    match template {
        Value::String(s) if has_template(s) => render_str(s, doc),
        Value::Array(items) => items
            .iter()
            .map(|v| render(v, doc))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render(v, doc)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_str(s: &str, doc: &Value) -> Result<Value, WorkflowError> {
    let parts = segments(s.trim())?;
    if let [Segment::Expr(expr)] = parts.as_slice() {
        return query_one(expr, doc);
    }
    let mut out = String::new();
    for part in segments(s)? {
        match part {
            Segment::Text(t) => out.push_str(t),
            Segment::Expr(expr) => out.push_str(&as_text(&query_one(expr, doc)?)),
        }
    }
    Ok(Value::String(out))
}

/// Render to text, as used for log lines, keys and messages
pub fn render_text(template: &Value, doc: &Value) -> Result<String, WorkflowError> {
    Ok(as_text(&render(template, doc)?))
}

/// Evaluate an expression field: a bare string is a jq program, anything
/// else is a template
pub fn evaluate(expr: &Value, doc: &Value) -> Result<Value, WorkflowError> {
    match expr {
        Value::String(s) if !has_template(s) => query_one(s, doc),
        other => render(other, doc),
    }
}

/// jq truthiness: only `false` and `null` are false
pub fn truthy(v: &Value) -> bool {
    !matches!(v, Value::Null | Value::Bool(false))
}

/// Apply a state transform; the result must be an object
pub fn transform(expr: &Value, doc: &Value) -> Result<Value, WorkflowError> {
    match evaluate(expr, doc)? {
        v @ Value::Object(_) => Ok(v),
        other => Err(WorkflowError::catchable(
            codes::JQ_NOT_OBJECT,
            format!("transform produced {} instead of an object", type_name(&other)),
        )),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query() {
        let doc = json!({"a": [1, 2, 3]});
        assert_eq!(query(".a[]", &doc).unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(query_one(".a | length", &doc).unwrap(), json!(3));
        assert_eq!(query_one("empty", &doc).unwrap(), Value::Null);
        assert_eq!(query_one(".a[]", &doc).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_bad_program_is_catchable() {
        let err = query(".a[", &json!({})).unwrap_err();
        assert_eq!(err.code, codes::JQ);
        assert!(err.catchable);
    }

    #[test]
    fn test_whole_string_template_keeps_type() {
        let doc = json!({"n": 5, "o": {"x": true}});
        assert_eq!(render(&json!("jq(.n)"), &doc).unwrap(), json!(5));
        assert_eq!(render(&json!(" jq(.o) "), &doc).unwrap(), json!({"x": true}));
    }

    #[test]
    fn test_interpolation() {
        let doc = json!({"name": "Direktiv", "n": 2});
        assert_eq!(
            render(&json!("Hello, jq(.name)!"), &doc).unwrap(),
            json!("Hello, Direktiv!")
        );
        assert_eq!(
            render(&json!("jq(.n) times jq(.name)"), &doc).unwrap(),
            json!("2 times Direktiv")
        );
        // Parentheses and strings inside the expression
        assert_eq!(
            render(&json!("v=jq((.n + 1) | tostring + \")\")"), &doc).unwrap(),
            json!("v=3)")
        );
    }

    #[test]
    fn test_nested_templates() {
        let doc = json!({"x": 1});
        let out = render(&json!({"a": ["jq(.x)", "plain"], "b": {"c": "jq(.x + 1)"}}), &doc).unwrap();
        assert_eq!(out, json!({"a": [1, "plain"], "b": {"c": 2}}));
    }

    #[test]
    fn test_evaluate_and_transform() {
        let doc = json!({"count": 3});
        assert_eq!(evaluate(&json!(".count > 2"), &doc).unwrap(), json!(true));
        assert_eq!(evaluate(&json!("jq(.count)"), &doc).unwrap(), json!(3));
        assert_eq!(
            transform(&json!("jq({count: (.count - 1)})"), &doc).unwrap(),
            json!({"count": 2})
        );
        let err = transform(&json!(".count"), &doc).unwrap_err();
        assert_eq!(err.code, codes::JQ_NOT_OBJECT);
    }

    #[test]
    fn test_unterminated() {
        assert!(render(&json!("jq(.a"), &json!({})).is_err());
    }
}
