use crate::domain::{EnvVariable, Environment, SendRequestPayload, VariableMap};
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Unresolved request parts shared by scenario steps and batch test cases.
#[derive(Debug, Clone, Copy)]
pub struct RequestTemplate<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: &'a BTreeMap<String, Value>,
    pub query: &'a BTreeMap<String, Value>,
    pub body: Option<&'a Value>,
    pub timeout_ms: Option<u64>,
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Text form of a variable when spliced into a string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Interpolate `${name}` placeholders in a string using the provided variable map.
///
/// Text that does not form a valid placeholder is copied through untouched.
pub fn interpolate(input: &str, variables: &VariableMap) -> Result<String> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_identifier(&after[..end]) => {
                let name = &after[..end];
                let value = variables.get(name).ok_or_else(|| Error::MissingVariable {
                    name: name.to_string(),
                })?;
                result.push_str(&stringify(value));
                rest = &after[end + 1..];
            }
            _ => {
                result.push_str("${");
                rest = after;
            }
        }
    }

    result.push_str(rest);
    Ok(result)
}

/// Deep-copy `value`, interpolating every string leaf. Object keys are left as-is.
pub fn resolve_value(value: &Value, variables: &VariableMap) -> Result<Value> {
    match value {
        Value::String(text) => Ok(Value::String(interpolate(text, variables)?)),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, variables))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, variables)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string_map(
    input: &BTreeMap<String, Value>,
    variables: &VariableMap,
) -> Result<BTreeMap<String, String>> {
    input
        .iter()
        .map(|(key, value)| Ok((key.clone(), stringify(&resolve_value(value, variables)?))))
        .collect()
}

/// Build a merged variable map from global variables and environment variables.
/// Priority: environment variables override global variables.
pub fn build_variable_map(
    global_variables: &[EnvVariable],
    environment: Option<&Environment>,
) -> VariableMap {
    let mut variables = VariableMap::new();

    // 1. Global variables (lowest priority)
    for v in global_variables {
        if v.enabled && !v.key.is_empty() {
            variables.insert(v.key.clone(), Value::String(v.value.clone()));
        }
    }

    // 2. Environment variables (override globals)
    if let Some(env) = environment {
        for v in &env.variables {
            if v.enabled && !v.key.is_empty() {
                variables.insert(v.key.clone(), Value::String(v.value.clone()));
            }
        }
    }

    variables
}

/// Copy `overlay` on top of `base`; overlay wins on conflicts.
pub fn layer_variables(base: &VariableMap, overlay: &VariableMap) -> VariableMap {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Prefix relative URLs with `base_url`; absolute URLs pass through.
pub fn join_url(base_url: Option<&str>, url: &str) -> String {
    if url.contains("://") {
        return url.to_string();
    }
    match base_url.map(str::trim).filter(|base| !base.is_empty()) {
        Some(base) if url.is_empty() => base.to_string(),
        Some(base) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        ),
        None => url.to_string(),
    }
}

/// Resolve all `${var}` placeholders in a request template.
pub fn resolve_request(
    template: RequestTemplate<'_>,
    variables: &VariableMap,
    base_url: Option<&str>,
) -> Result<SendRequestPayload> {
    let url = join_url(base_url, &interpolate(template.url, variables)?);
    let mut headers = resolve_string_map(template.headers, variables)?;
    let query = resolve_string_map(template.query, variables)?;

    let body = match template.body {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(interpolate(text, variables)?),
        Some(structured) => {
            let resolved = resolve_value(structured, variables)?;
            if !headers
                .keys()
                .any(|name| name.eq_ignore_ascii_case("content-type"))
            {
                headers.insert("Content-Type".to_string(), "application/json".to_string());
            }
            Some(serde_json::to_string(&resolved)?)
        }
    };

    Ok(SendRequestPayload {
        method: template.method.to_ascii_uppercase(),
        url,
        headers,
        query,
        body,
        timeout_ms: template.timeout_ms,
    })
}
