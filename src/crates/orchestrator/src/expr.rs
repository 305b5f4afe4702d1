//! Template interpolation and the closed condition grammar.
//!
//! Conditions deliberately support only equality, inequality, substring
//! membership, and bare identifier truthiness. There are no function calls,
//! no indexing, and no arithmetic; anything unrecognized evaluates to false
//! and unknown identifiers resolve to null. Evaluation never fails.

use serde_json::{Map, Value};

/// Replace every `${NAME}` occurrence in string templates with the string
/// form of `scope[NAME]` (empty when unbound), recursing through maps and
/// sequences. Non-string scalars pass through untouched.
pub fn interpolate(template: &Value, scope: &Map<String, Value>) -> Value {
    match template {
        Value::String(text) => Value::String(interpolate_str(text, scope)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate(v, scope)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, scope)).collect()),
        other => other.clone(),
    }
}

/// Interpolate a bare string template.
pub fn interpolate_str(template: &str, scope: &Map<String, Value>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                output.push_str(&value_to_string(scope.get(name).unwrap_or(&Value::Null)));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder passes through literally.
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

/// Evaluate a condition expression against a scope.
pub fn evaluate(expression: &str, scope: &Map<String, Value>) -> bool {
    let expression = expression.trim();
    if expression.is_empty() {
        return false;
    }

    if let Some((left, right)) = expression.split_once("==") {
        return operand(left, scope) == operand(right, scope);
    }
    if let Some((left, right)) = expression.split_once("!=") {
        return operand(left, scope) != operand(right, scope);
    }
    if let Some((left, right)) = expression.split_once(" contains ") {
        let haystack = value_to_string(&operand(left, scope)).to_lowercase();
        // The needle is literal text, never a variable lookup.
        let needle = literal_text(right).to_lowercase();
        return haystack.contains(&needle);
    }

    truthy(&operand(expression, scope))
}

// The right-hand side of `contains`: quoted or bare literal text.
fn literal_text(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        if (bytes[0] == b'"' && bytes[raw.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[raw.len() - 1] == b'\'')
        {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    raw.to_string()
}

// An operand is a quoted string, a literal, a number, or an identifier
// resolved against the scope. Unknown identifiers resolve to null.
fn operand(raw: &str, scope: &Map<String, Value>) -> Value {
    let raw = raw.trim();
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        if (bytes[0] == b'"' && bytes[raw.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[raw.len() - 1] == b'\'')
        {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(float) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    scope.get(raw).cloned().unwrap_or(Value::Null)
}

/// String form used for interpolation and `contains`.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Boolean coercion for bare identifiers.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
