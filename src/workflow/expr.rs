/// Value-expression resolution for step and trigger specs
///
/// Spec values may embed `${parameters.x}`, `${outputs.step.key}` (step names
/// with special characters can be quoted: `${outputs.'my step'.key}`), and
/// `${secrets.name}` references. Resolution is a single pure pass over a
/// binding context, executed once per step at launch, so every reference is
/// auditable and secret usage is tracked in one place. Containers only ever
/// see fully resolved plain values.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors produced while parsing or resolving spec expressions
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("malformed expression '{0}'")]
    Syntax(String),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("no output '{key}' recorded for step '{step}'")]
    UnknownOutput { step: String, key: String },
    #[error("unknown secret '{0}'")]
    UnknownSecret(String),
}

/// A parsed `${...}` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Parameter(String),
    Output { step: String, key: String },
    Secret(String),
}

/// Named inputs an expression pass resolves against
///
/// Built by the scheduler from the current run state right before a step
/// launches: parameters bound at run creation, outputs of already-succeeded
/// steps, and the run-scoped secrets.
#[derive(Debug, Default, Clone)]
pub struct Bindings {
    pub parameters: HashMap<String, Value>,
    pub outputs: HashMap<String, HashMap<String, Value>>,
    pub secrets: HashMap<String, String>,
}

/// A spec with all expressions evaluated, plus the secrets it consumed
///
/// `secrets_used` feeds the metadata store's leak guard: any value a step
/// obtained from a secret must never round-trip into its outputs or logs.
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    pub values: HashMap<String, Value>,
    pub secrets_used: HashSet<String>,
}

/// Resolve every value in a spec map against the binding context
pub fn resolve_spec(
    spec: &HashMap<String, Value>,
    bindings: &Bindings,
) -> Result<ResolvedSpec, ExprError> {
    let mut values = HashMap::new();
    let mut secrets_used = HashSet::new();
    for (key, value) in spec {
        values.insert(key.clone(), resolve_value(value, bindings, &mut secrets_used)?);
    }
    Ok(ResolvedSpec {
        values,
        secrets_used,
    })
}

/// Resolve a single spec value
///
/// A string that is exactly one `${...}` expression substitutes the bound
/// value with its JSON type preserved. Expressions embedded in longer strings
/// interpolate their string form. Arrays and objects resolve recursively.
pub fn resolve_value(
    value: &Value,
    bindings: &Bindings,
    secrets_used: &mut HashSet<String>,
) -> Result<Value, ExprError> {
    match value {
        Value::String(s) => resolve_string(s, bindings, secrets_used),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_value(item, bindings, secrets_used)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_value(v, bindings, secrets_used)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Collect the step names a spec depends on via `${outputs.<step>.<key>}`
///
/// This is how implicit dependency edges are extracted at validation time.
pub fn referenced_steps(spec: &HashMap<String, Value>) -> Result<HashSet<String>, ExprError> {
    let mut steps = HashSet::new();
    for value in spec.values() {
        for reference in collect_references(value)? {
            if let Reference::Output { step, .. } = reference {
                steps.insert(step);
            }
        }
    }
    Ok(steps)
}

/// Collect every reference appearing anywhere in a value
pub fn collect_references(value: &Value) -> Result<Vec<Reference>, ExprError> {
    let mut refs = Vec::new();
    collect_into(value, &mut refs)?;
    Ok(refs)
}

fn collect_into(value: &Value, refs: &mut Vec<Reference>) -> Result<(), ExprError> {
    match value {
        Value::String(s) => {
            for (_, _, inner) in find_expressions(s) {
                refs.push(parse_reference(inner)?);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, refs)?;
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_into(v, refs)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolve_string(
    s: &str,
    bindings: &Bindings,
    secrets_used: &mut HashSet<String>,
) -> Result<Value, ExprError> {
    let expressions = find_expressions(s);
    if expressions.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    // Exactly one expression spanning the entire string keeps its JSON type
    if expressions.len() == 1 {
        let (start, end, inner) = expressions[0];
        if start == 0 && end == s.len() {
            let reference = parse_reference(inner)?;
            return lookup(&reference, bindings, secrets_used);
        }
    }

    // Otherwise interpolate string forms into the surrounding text
    let mut result = String::new();
    let mut cursor = 0;
    for (start, end, inner) in expressions {
        result.push_str(&s[cursor..start]);
        let reference = parse_reference(inner)?;
        let value = lookup(&reference, bindings, secrets_used)?;
        match value {
            Value::String(text) => result.push_str(&text),
            other => result.push_str(&other.to_string()),
        }
        cursor = end;
    }
    result.push_str(&s[cursor..]);
    Ok(Value::String(result))
}

fn lookup(
    reference: &Reference,
    bindings: &Bindings,
    secrets_used: &mut HashSet<String>,
) -> Result<Value, ExprError> {
    match reference {
        Reference::Parameter(name) => bindings
            .parameters
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownParameter(name.clone())),
        Reference::Output { step, key } => bindings
            .outputs
            .get(step)
            .and_then(|outputs| outputs.get(key))
            .cloned()
            .ok_or_else(|| ExprError::UnknownOutput {
                step: step.clone(),
                key: key.clone(),
            }),
        Reference::Secret(name) => {
            let value = bindings
                .secrets
                .get(name)
                .ok_or_else(|| ExprError::UnknownSecret(name.clone()))?;
            secrets_used.insert(value.clone());
            Ok(Value::String(value.clone()))
        }
    }
}

/// Find `${...}` spans in a string: (start, end-exclusive, inner text)
fn find_expressions(s: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut search_from = 0;
    while let Some(offset) = s[search_from..].find("${") {
        let start = search_from + offset;
        match s[start + 2..].find('}') {
            Some(close) => {
                let end = start + 2 + close + 1;
                found.push((start, end, &s[start + 2..end - 1]));
                search_from = end;
            }
            None => break,
        }
    }
    found
}

/// Parse the inner text of a `${...}` expression into a typed reference
fn parse_reference(inner: &str) -> Result<Reference, ExprError> {
    let inner = inner.trim();
    if let Some(name) = inner.strip_prefix("parameters.") {
        if name.is_empty() {
            return Err(ExprError::Syntax(inner.to_string()));
        }
        return Ok(Reference::Parameter(name.to_string()));
    }
    if let Some(name) = inner.strip_prefix("secrets.") {
        if name.is_empty() {
            return Err(ExprError::Syntax(inner.to_string()));
        }
        return Ok(Reference::Secret(name.to_string()));
    }
    if let Some(rest) = inner.strip_prefix("outputs.") {
        return parse_output_reference(inner, rest);
    }
    Err(ExprError::Syntax(inner.to_string()))
}

/// Parse `step.key` or `'step name'.key` after the `outputs.` prefix
fn parse_output_reference(full: &str, rest: &str) -> Result<Reference, ExprError> {
    let (step, remainder) = if let Some(quoted) = rest.strip_prefix('\'') {
        let close = quoted
            .find('\'')
            .ok_or_else(|| ExprError::Syntax(full.to_string()))?;
        (&quoted[..close], &quoted[close + 1..])
    } else {
        let dot = rest
            .find('.')
            .ok_or_else(|| ExprError::Syntax(full.to_string()))?;
        (&rest[..dot], &rest[dot..])
    };

    let key = remainder
        .strip_prefix('.')
        .ok_or_else(|| ExprError::Syntax(full.to_string()))?;
    if step.is_empty() || key.is_empty() {
        return Err(ExprError::Syntax(full.to_string()));
    }

    Ok(Reference::Output {
        step: step.to_string(),
        key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Bindings {
        let mut parameters = HashMap::new();
        parameters.insert("dockerTagName".to_string(), json!("v1.2.3"));
        parameters.insert("replicas".to_string(), json!(3));

        let mut build_outputs = HashMap::new();
        build_outputs.insert("digest".to_string(), json!("sha256:abc"));
        let mut outputs = HashMap::new();
        outputs.insert("build".to_string(), build_outputs.clone());
        outputs.insert("unit tests".to_string(), build_outputs);

        let mut secrets = HashMap::new();
        secrets.insert("registry_password".to_string(), "hunter2".to_string());

        Bindings {
            parameters,
            outputs,
            secrets,
        }
    }

    #[test]
    fn full_string_parameter_keeps_json_type() {
        let mut seen = HashSet::new();
        let resolved =
            resolve_value(&json!("${parameters.replicas}"), &bindings(), &mut seen).unwrap();
        assert_eq!(resolved, json!(3));
    }

    #[test]
    fn event_parameter_flows_into_spec_field() {
        let mut seen = HashSet::new();
        let resolved =
            resolve_value(&json!("${parameters.dockerTagName}"), &bindings(), &mut seen).unwrap();
        assert_eq!(resolved, json!("v1.2.3"));
    }

    #[test]
    fn embedded_expression_interpolates() {
        let mut seen = HashSet::new();
        let resolved = resolve_value(
            &json!("registry.local/app:${parameters.dockerTagName}"),
            &bindings(),
            &mut seen,
        )
        .unwrap();
        assert_eq!(resolved, json!("registry.local/app:v1.2.3"));
    }

    #[test]
    fn output_reference_resolves() {
        let mut seen = HashSet::new();
        let resolved =
            resolve_value(&json!("${outputs.build.digest}"), &bindings(), &mut seen).unwrap();
        assert_eq!(resolved, json!("sha256:abc"));
    }

    #[test]
    fn quoted_step_name_resolves() {
        let mut seen = HashSet::new();
        let resolved = resolve_value(
            &json!("${outputs.'unit tests'.digest}"),
            &bindings(),
            &mut seen,
        )
        .unwrap();
        assert_eq!(resolved, json!("sha256:abc"));
    }

    #[test]
    fn secret_resolution_tracks_usage() {
        let mut seen = HashSet::new();
        let resolved =
            resolve_value(&json!("${secrets.registry_password}"), &bindings(), &mut seen).unwrap();
        assert_eq!(resolved, json!("hunter2"));
        assert!(seen.contains("hunter2"));
    }

    #[test]
    fn nested_values_resolve_recursively() {
        let mut seen = HashSet::new();
        let value = json!({
            "tag": "${parameters.dockerTagName}",
            "digests": ["${outputs.build.digest}"]
        });
        let resolved = resolve_value(&value, &bindings(), &mut seen).unwrap();
        assert_eq!(
            resolved,
            json!({"tag": "v1.2.3", "digests": ["sha256:abc"]})
        );
    }

    #[test]
    fn unknown_parameter_is_an_error() {
        let mut seen = HashSet::new();
        let err = resolve_value(&json!("${parameters.missing}"), &bindings(), &mut seen)
            .unwrap_err();
        assert_eq!(err, ExprError::UnknownParameter("missing".to_string()));
    }

    #[test]
    fn missing_output_key_is_an_error() {
        let mut seen = HashSet::new();
        let err =
            resolve_value(&json!("${outputs.build.missing}"), &bindings(), &mut seen).unwrap_err();
        assert_eq!(
            err,
            ExprError::UnknownOutput {
                step: "build".to_string(),
                key: "missing".to_string()
            }
        );
    }

    #[test]
    fn malformed_expression_is_rejected() {
        let mut seen = HashSet::new();
        let err = resolve_value(&json!("${bogus.thing}"), &bindings(), &mut seen).unwrap_err();
        assert!(matches!(err, ExprError::Syntax(_)));
    }

    #[test]
    fn referenced_steps_extracts_implicit_edges() {
        let mut spec = HashMap::new();
        spec.insert("image".to_string(), json!("${outputs.build.digest}"));
        spec.insert(
            "report".to_string(),
            json!("${outputs.'unit tests'.digest}"),
        );
        spec.insert("tag".to_string(), json!("${parameters.dockerTagName}"));

        let steps = referenced_steps(&spec).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.contains("build"));
        assert!(steps.contains("unit tests"));
    }

    #[test]
    fn plain_values_pass_through_untouched() {
        let mut seen = HashSet::new();
        let resolved = resolve_value(&json!({"count": 2, "flag": true}), &bindings(), &mut seen)
            .unwrap();
        assert_eq!(resolved, json!({"count": 2, "flag": true}));
    }
}
