//! Reference expressions inside property values.
//!
//! Two forms are recognized anywhere in a property tree:
//!
//! - a reference object `{ "ref": "bucket" }` or `{ "ref": "bucket.arn" }`,
//!   replaced by the referenced value as-is;
//! - string interpolation `"arn:${bucket.arn}/*"`. A string consisting of a
//!   single interpolation is replaced by the raw value, otherwise the value
//!   is rendered into the string.
//!
//! `bucket` alone means the physical id; `bucket.arn` means a named output.
//! Write `$${` for a literal `${`, as in `"$${AWS::Region}"`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::check_logical_id;

/// Key of a reference object.
pub const REF_KEY: &str = "ref";

/// A parsed reference to another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Logical id of the referenced resource.
    pub target: String,
    /// Output name, or `None` for the physical id.
    pub output: Option<String>,
}

impl Reference {
    /// Parses `target` or `target.output`.
    #[must_use]
    pub fn parse(expression: &str) -> Option<Self> {
        let expression = expression.trim();
        let (target, output) = match expression.split_once('.') {
            Some((target, output)) => (target, Some(output)),
            None => (expression, None),
        };

        check_logical_id(target).ok()?;
        if let Some(output) = output {
            let valid = !output.is_empty()
                && output
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
            if !valid {
                return None;
            }
        }

        Some(Self {
            target: target.to_string(),
            output: output.map(str::to_string),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.output {
            Some(output) => write!(f, "{}.{output}", self.target),
            None => write!(f, "{}", self.target),
        }
    }
}

/// Returns the expression of a reference object, if `value` is one.
fn ref_object(value: &Value) -> Option<&Value> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(REF_KEY),
        _ => None,
    }
}

/// Byte span of one `${...}` occurrence or of an escaped `$${`.
struct Span<'a> {
    start: usize,
    end: usize,
    /// Expression between the braces; `None` for an escape.
    inner: Option<&'a str>,
}

/// Text an escape renders to.
const LITERAL_OPEN: &str = "${";

fn interpolations(text: &str) -> Result<Vec<Span<'_>>, String> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(pos) = text[cursor..].find("${") {
        let open = cursor + pos;
        if open > cursor && text.as_bytes()[open - 1] == b'$' {
            spans.push(Span {
                start: open - 1,
                end: open + 2,
                inner: None,
            });
            cursor = open + 2;
            continue;
        }
        let inner_start = open + 2;
        let Some(close_rel) = text[inner_start..].find('}') else {
            return Err(text.to_string());
        };
        let close = inner_start + close_rel;
        spans.push(Span {
            start: open,
            end: close + 1,
            inner: Some(&text[inner_start..close]),
        });
        cursor = close + 1;
    }
    Ok(spans)
}

/// Collects every reference in a value tree, in document order.
///
/// # Errors
///
/// Returns the offending expression when a reference is malformed.
pub fn collect(value: &Value) -> Result<Vec<Reference>, String> {
    let mut found = Vec::new();
    collect_into(value, &mut found)?;
    Ok(found)
}

fn collect_into(value: &Value, found: &mut Vec<Reference>) -> Result<(), String> {
    if let Some(expression) = ref_object(value) {
        let Value::String(expression) = expression else {
            return Err(expression.to_string());
        };
        let reference = Reference::parse(expression).ok_or_else(|| expression.clone())?;
        found.push(reference);
        return Ok(());
    }

    match value {
        Value::String(text) => {
            for inner in interpolations(text)?.into_iter().filter_map(|s| s.inner) {
                let reference =
                    Reference::parse(inner).ok_or_else(|| format!("${{{inner}}}"))?;
                found.push(reference);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_into(item, found)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Returns true if the value contains at least one reference.
#[must_use]
pub fn contains_reference(value: &Value) -> bool {
    collect(value).is_ok_and(|refs| !refs.is_empty())
}

/// Replaces every reference with the value produced by `lookup`.
///
/// # Errors
///
/// Returns the first reference `lookup` cannot answer.
pub fn resolve<F>(value: &Value, lookup: &F) -> Result<Value, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    if let Some(Value::String(expression)) = ref_object(value) {
        if let Some(reference) = Reference::parse(expression) {
            return lookup(&reference).ok_or(reference);
        }
    }

    match value {
        Value::String(text) => resolve_text(text, lookup),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve(item, lookup)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(value.clone()),
    }
}

fn resolve_text<F>(text: &str, lookup: &F) -> Result<Value, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    let Ok(spans) = interpolations(text) else {
        return Ok(Value::String(text.to_string()));
    };
    if spans.is_empty() {
        return Ok(Value::String(text.to_string()));
    }

    if spans.len() == 1 && spans[0].start == 0 && spans[0].end == text.len() {
        if let Some(reference) = spans[0].inner.and_then(Reference::parse) {
            return lookup(&reference).ok_or(reference);
        }
    }

    let mut rendered = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        rendered.push_str(&text[cursor..span.start]);
        let Some(inner) = span.inner else {
            rendered.push_str(LITERAL_OPEN);
            cursor = span.end;
            continue;
        };
        match Reference::parse(inner) {
            Some(reference) => {
                let value = lookup(&reference).ok_or(reference)?;
                match value {
                    Value::String(s) => rendered.push_str(&s),
                    other => rendered.push_str(&other.to_string()),
                }
            }
            None => rendered.push_str(&text[span.start..span.end]),
        }
        cursor = span.end;
    }
    rendered.push_str(&text[cursor..]);
    Ok(Value::String(rendered))
}

/// Resolves every property of a resource.
///
/// # Errors
///
/// Returns the first reference `lookup` cannot answer.
pub fn resolve_properties<F>(
    properties: &BTreeMap<String, Value>,
    lookup: &F,
) -> Result<BTreeMap<String, Value>, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    properties
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve(value, lookup)?)))
        .collect()
}
