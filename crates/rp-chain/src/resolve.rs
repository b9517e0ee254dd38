// SPDX-License-Identifier: MIT OR Apache-2.0
//! Template resolution and condition evaluation.
//!
//! Parameters may reference prior step results with `{{ step.output.video }}`
//! expressions. Resolution substitutes the dotted path against the context,
//! recursing into maps and lists; a rendered string that is a pure number is
//! coerced to int or float, matching what a renderer expects for numeric
//! inputs.
//!
//! Conditions are deliberately small: after rendering, a condition must be a
//! bare boolean or a single `lhs op rhs` comparison over JSON scalars. No
//! attribute access, no calls, nothing to sandbox.

use crate::TemplateResolutionError;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("placeholder regex compiles"))
}

/// Build the resolution context from step results: step id →
/// `{output, parameters, status}`.
pub fn build_context(step_results: &BTreeMap<String, rp_core::StepResult>) -> Value {
    let mut context = Map::new();
    for (step_id, result) in step_results {
        let mut entry = Map::new();
        entry.insert(
            "output".to_string(),
            result
                .output
                .as_ref()
                .map(|o| serde_json::to_value(o).unwrap_or(Value::Null))
                .unwrap_or_else(|| Value::Object(Map::new())),
        );
        entry.insert(
            "parameters".to_string(),
            result.parameters.clone().unwrap_or_else(|| Value::Object(Map::new())),
        );
        entry.insert(
            "status".to_string(),
            serde_json::to_value(result.status).unwrap_or(Value::Null),
        );
        context.insert(step_id.clone(), Value::Object(entry));
    }
    Value::Object(context)
}

/// Resolve every parameter value against the context.
pub fn resolve_parameters(
    parameters: &Map<String, Value>,
    context: &Value,
) -> Result<Map<String, Value>, TemplateResolutionError> {
    let mut resolved = Map::new();
    for (key, value) in parameters {
        resolved.insert(key.clone(), resolve_value(value, context)?);
    }
    Ok(resolved)
}

fn resolve_value(value: &Value, context: &Value) -> Result<Value, TemplateResolutionError> {
    match value {
        Value::String(s) if s.contains("{{") && s.contains("}}") => render(s, context),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, context)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn render(expression: &str, context: &Value) -> Result<Value, TemplateResolutionError> {
    let mut out = String::new();
    let mut last = 0;
    for caps in placeholder_re().captures_iter(expression) {
        let whole = caps.get(0).expect("capture 0");
        let reference = caps[1].trim().to_string();
        let value = lookup(&reference, context).ok_or_else(|| {
            TemplateResolutionError::UnknownReference {
                reference: reference.clone(),
                expression: expression.to_string(),
            }
        })?;
        out.push_str(&expression[last..whole.start()]);
        out.push_str(&scalar_to_string(&value));
        last = whole.end();
    }
    out.push_str(&expression[last..]);
    Ok(coerce(&out))
}

fn lookup(reference: &str, context: &Value) -> Option<Value> {
    let mut current = context;
    for segment in reference.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pure-digit strings become ints, float-parseable strings become floats,
/// everything else stays a string.
fn coerce(rendered: &str) -> Value {
    if !rendered.is_empty() && rendered.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = rendered.parse::<i64>() {
            return Value::from(n);
        }
    }
    if let Ok(f) = rendered.parse::<f64>() {
        if rendered.contains('.') || rendered.contains('e') || rendered.contains('E') {
            return serde_json::Number::from_f64(f).map(Value::Number).unwrap_or_else(|| {
                Value::String(rendered.to_string())
            });
        }
    }
    Value::String(rendered.to_string())
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

const OPERATORS: &[&str] = &["==", "!=", ">=", "<=", ">", "<"];

/// Render and evaluate a condition expression.
pub fn evaluate_condition(
    condition: &str,
    context: &Value,
) -> Result<bool, TemplateResolutionError> {
    let rendered = render_condition(condition, context)?;
    let trimmed = rendered.trim();

    if let Some(b) = parse_bool(trimmed) {
        return Ok(b);
    }

    for op in OPERATORS {
        if let Some(idx) = find_operator(trimmed, op) {
            let lhs = parse_operand(trimmed[..idx].trim(), condition)?;
            let rhs = parse_operand(trimmed[idx + op.len()..].trim(), condition)?;
            return compare(&lhs, &rhs, op, condition);
        }
    }

    Err(TemplateResolutionError::InvalidCondition {
        expression: condition.to_string(),
        reason: format!("'{trimmed}' is not a boolean or comparison"),
    })
}

/// Render placeholders inside a condition to their string forms, quoting
/// string values so `{{ a.status }} == 'completed'` compares cleanly.
fn render_condition(condition: &str, context: &Value) -> Result<String, TemplateResolutionError> {
    let mut out = String::new();
    let mut last = 0;
    for caps in placeholder_re().captures_iter(condition) {
        let whole = caps.get(0).expect("capture 0");
        let reference = caps[1].trim().to_string();
        let value = lookup(&reference, context).ok_or_else(|| {
            TemplateResolutionError::UnknownReference {
                reference: reference.clone(),
                expression: condition.to_string(),
            }
        })?;
        out.push_str(&condition[last..whole.start()]);
        match &value {
            Value::String(s) => {
                out.push('\'');
                out.push_str(s);
                out.push('\'');
            }
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&condition[last..]);
    Ok(out)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" | "True" => Some(true),
        "false" | "False" => Some(false),
        _ => None,
    }
}

/// Find `op` outside of quoted strings. `>`/`<` only match when not part of
/// `>=`/`<=`.
fn find_operator(s: &str, op: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i + op.len() <= s.len() {
        let c = bytes[i] as char;
        if c == '\'' || c == '"' {
            in_quote = !in_quote;
            i += 1;
            continue;
        }
        if !in_quote && s[i..].starts_with(op) {
            if (op == ">" || op == "<") && s[i + 1..].starts_with('=') {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

#[derive(Debug, PartialEq)]
enum Operand {
    Number(f64),
    Text(String),
    Bool(bool),
}

fn parse_operand(raw: &str, condition: &str) -> Result<Operand, TemplateResolutionError> {
    if raw.is_empty() {
        return Err(TemplateResolutionError::InvalidCondition {
            expression: condition.to_string(),
            reason: "empty operand".to_string(),
        });
    }
    if let Some(b) = parse_bool(raw) {
        return Ok(Operand::Bool(b));
    }
    if (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
        || (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
    {
        return Ok(Operand::Text(raw[1..raw.len() - 1].to_string()));
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Ok(Operand::Number(n));
    }
    // Bare words compare as text.
    Ok(Operand::Text(raw.to_string()))
}

fn compare(
    lhs: &Operand,
    rhs: &Operand,
    op: &str,
    condition: &str,
) -> Result<bool, TemplateResolutionError> {
    use Operand::*;
    match (lhs, rhs) {
        (Number(a), Number(b)) => Ok(match op {
            "==" => a == b,
            "!=" => a != b,
            ">" => a > b,
            ">=" => a >= b,
            "<" => a < b,
            "<=" => a <= b,
            _ => unreachable!(),
        }),
        (Text(a), Text(b)) => Ok(match op {
            "==" => a == b,
            "!=" => a != b,
            ">" => a > b,
            ">=" => a >= b,
            "<" => a < b,
            "<=" => a <= b,
            _ => unreachable!(),
        }),
        (Bool(a), Bool(b)) => match op {
            "==" => Ok(a == b),
            "!=" => Ok(a != b),
            _ => Err(TemplateResolutionError::InvalidCondition {
                expression: condition.to_string(),
                reason: format!("'{op}' not defined for booleans"),
            }),
        },
        _ => match op {
            "==" => Ok(false),
            "!=" => Ok(true),
            _ => Err(TemplateResolutionError::InvalidCondition {
                expression: condition.to_string(),
                reason: "ordering comparison across mixed types".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::{StepResult, StepStatus};
    use serde_json::json;

    fn context() -> Value {
        json!({
            "generate": {
                "output": {"image": "render_00001.png", "type": "image", "count": 1},
                "parameters": {"3.text": "a lighthouse", "width": 512},
                "status": "completed"
            },
            "score": {
                "output": {"value": "0.92"},
                "parameters": {},
                "status": "completed"
            }
        })
    }

    #[test]
    fn whole_string_reference_substitutes_value() {
        let mut params = Map::new();
        params.insert("12.image".into(), json!("{{ generate.output.image }}"));
        let resolved = resolve_parameters(&params, &context()).unwrap();
        assert_eq!(resolved["12.image"], json!("render_00001.png"));
    }

    #[test]
    fn numeric_results_are_coerced() {
        let mut params = Map::new();
        params.insert("w".into(), json!("{{ generate.parameters.width }}"));
        params.insert("s".into(), json!("{{ score.output.value }}"));
        let resolved = resolve_parameters(&params, &context()).unwrap();
        assert_eq!(resolved["w"], json!(512));
        assert_eq!(resolved["s"], json!(0.92));
    }

    #[test]
    fn embedded_references_concatenate() {
        let mut params = Map::new();
        params.insert("p".into(), json!("inputs/{{ generate.output.image }}"));
        let resolved = resolve_parameters(&params, &context()).unwrap();
        assert_eq!(resolved["p"], json!("inputs/render_00001.png"));
    }

    #[test]
    fn nested_containers_resolve_recursively() {
        let mut params = Map::new();
        params.insert(
            "cfg".into(),
            json!({"file": "{{ generate.output.image }}", "list": ["{{ generate.status }}"]}),
        );
        let resolved = resolve_parameters(&params, &context()).unwrap();
        assert_eq!(resolved["cfg"]["file"], json!("render_00001.png"));
        assert_eq!(resolved["cfg"]["list"][0], json!("completed"));
    }

    #[test]
    fn plain_values_pass_through() {
        let mut params = Map::new();
        params.insert("n".into(), json!(7));
        params.insert("t".into(), json!("no templates here"));
        let resolved = resolve_parameters(&params, &context()).unwrap();
        assert_eq!(resolved["n"], json!(7));
        assert_eq!(resolved["t"], json!("no templates here"));
    }

    #[test]
    fn missing_reference_is_an_error() {
        let mut params = Map::new();
        params.insert("x".into(), json!("{{ ghost.output.video }}"));
        let err = resolve_parameters(&params, &context()).unwrap_err();
        match err {
            TemplateResolutionError::UnknownReference { reference, .. } => {
                assert_eq!(reference, "ghost.output.video");
            }
            other => panic!("expected UnknownReference, got {other:?}"),
        }
    }

    #[test]
    fn build_context_shapes_step_results() {
        let mut results = BTreeMap::new();
        results.insert(
            "a".to_string(),
            StepResult {
                step_id: "a".into(),
                workflow: "w".into(),
                status: StepStatus::Completed,
                output: None,
                parameters: Some(json!({"k": 1})),
                backend: None,
                job_db_id: None,
                error: None,
            },
        );
        let ctx = build_context(&results);
        assert_eq!(ctx["a"]["status"], json!("completed"));
        assert_eq!(ctx["a"]["parameters"]["k"], json!(1));
        assert!(ctx["a"]["output"].is_object());
    }

    // -----------------------------------------------------------------------
    // Conditions
    // -----------------------------------------------------------------------

    #[test]
    fn string_equality_condition() {
        assert!(evaluate_condition("{{ generate.status }} == 'completed'", &context()).unwrap());
        assert!(!evaluate_condition("{{ generate.status }} == 'failed'", &context()).unwrap());
        assert!(evaluate_condition("{{ generate.status }} != 'failed'", &context()).unwrap());
    }

    #[test]
    fn numeric_ordering_condition() {
        assert!(evaluate_condition("{{ score.output.value }} > 0.8", &context()).unwrap());
        assert!(!evaluate_condition("{{ generate.output.count }} >= 2", &context()).unwrap());
        assert!(evaluate_condition("{{ generate.parameters.width }} <= 512", &context()).unwrap());
    }

    #[test]
    fn bare_boolean_condition() {
        assert!(evaluate_condition("true", &context()).unwrap());
        assert!(!evaluate_condition("false", &context()).unwrap());
    }

    #[test]
    fn garbage_condition_is_invalid() {
        let err = evaluate_condition("{{ generate.status }}", &context()).unwrap_err();
        assert!(matches!(err, TemplateResolutionError::InvalidCondition { .. }));

        let err = evaluate_condition("launch the missiles", &context()).unwrap_err();
        assert!(matches!(err, TemplateResolutionError::InvalidCondition { .. }));
    }

    #[test]
    fn unknown_reference_in_condition() {
        let err = evaluate_condition("{{ ghost.status }} == 'x'", &context()).unwrap_err();
        assert!(matches!(err, TemplateResolutionError::UnknownReference { .. }));
    }

    #[test]
    fn operator_inside_quotes_is_ignored() {
        assert!(evaluate_condition("'a == b' == 'a == b'", &context()).unwrap());
    }
}
