use crate::domain::{ExtractionRule, ExtractionSource, VariableMap};
use crate::engine::env::is_identifier;
use crate::engine::jsonpath::JsonPath;
use crate::engine::response::ResponseView;
use crate::error::{Error, Result};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

fn required_expression(rule: &ExtractionRule) -> Result<&str> {
    rule.expression
        .as_deref()
        .map(str::trim)
        .filter(|expression| !expression.is_empty())
        .ok_or_else(|| {
            Error::malformed(format!(
                "Extraction `{}` requires an expression for source {:?}",
                rule.name, rule.source
            ))
        })
}

pub(crate) fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| Error::malformed(format!("Invalid regex `{pattern}`: {err}")))
}

fn invalid_name(rule: &ExtractionRule) -> Error {
    Error::malformed(format!(
        "Extraction name `{}` is not a valid variable identifier",
        rule.name
    ))
}

/// Check an extraction rule without a response.
pub fn validate_extraction(rule: &ExtractionRule) -> Result<()> {
    if !is_identifier(&rule.name) {
        return Err(invalid_name(rule));
    }
    match rule.source {
        ExtractionSource::JsonPath => JsonPath::parse(required_expression(rule)?).map(|_| ()),
        ExtractionSource::Regex => compile_regex(required_expression(rule)?).map(|_| ()),
        ExtractionSource::Header => required_expression(rule).map(|_| ()),
        ExtractionSource::Status | ExtractionSource::Body => Ok(()),
    }
}

/// Compute the value of one rule. `Ok(None)` means nothing matched.
pub fn extract(view: &ResponseView, rule: &ExtractionRule) -> Result<Option<Value>> {
    match rule.source {
        ExtractionSource::Status => Ok(Some(Value::from(view.response.status))),
        ExtractionSource::Header => {
            let name = required_expression(rule)?;
            Ok(view
                .response
                .header(name)
                .map(|value| Value::String(value.to_string())))
        }
        ExtractionSource::JsonPath => {
            let path = JsonPath::parse(required_expression(rule)?)?;
            Ok(view.json.as_ref().and_then(|json| path.first(json)).cloned())
        }
        ExtractionSource::Regex => {
            let regex = compile_regex(required_expression(rule)?)?;
            Ok(regex.captures(&view.response.body).and_then(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|found| Value::String(found.as_str().to_string()))
            }))
        }
        ExtractionSource::Body => Ok(Some(view.body_value())),
    }
}

/// Run every rule and merge hits into `variables`.
///
/// Returns only the values produced by this call. Nothing is merged if any rule is malformed.
pub fn apply_extractions(
    view: &ResponseView,
    rules: &[ExtractionRule],
    variables: &mut VariableMap,
) -> Result<VariableMap> {
    if let Some(rule) = rules.iter().find(|rule| !is_identifier(&rule.name)) {
        return Err(invalid_name(rule));
    }

    let mut extracted = VariableMap::new();
    for rule in rules {
        match extract(view, rule)? {
            Some(value) => {
                extracted.insert(rule.name.clone(), value);
            }
            None => debug!("Extraction `{}` found nothing", rule.name),
        }
    }

    for (name, value) in &extracted {
        variables.insert(name.clone(), value.clone());
    }
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SendResponsePayload;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn view(status: u16, body: &str) -> ResponseView {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("x-request-id".to_string(), "req-42".to_string());
        ResponseView::new(SendResponsePayload::new(status, headers, body, 8))
    }

    fn rule(name: &str, source: ExtractionSource, expression: Option<&str>) -> ExtractionRule {
        ExtractionRule {
            name: name.to_string(),
            source,
            expression: expression.map(str::to_string),
        }
    }

    #[test]
    fn extracts_from_every_source() {
        let view = view(201, r#"{"data":{"token":"abc123"},"note":"order #981 created"}"#);

        assert_eq!(
            extract(&view, &rule("s", ExtractionSource::Status, None)).expect("ok"),
            Some(json!(201))
        );
        assert_eq!(
            extract(&view, &rule("h", ExtractionSource::Header, Some("X-Request-Id"))).expect("ok"),
            Some(json!("req-42"))
        );
        assert_eq!(
            extract(&view, &rule("t", ExtractionSource::JsonPath, Some("$.data.token")))
                .expect("ok"),
            Some(json!("abc123"))
        );
        assert_eq!(
            extract(&view, &rule("o", ExtractionSource::Regex, Some(r"order #(\d+)"))).expect("ok"),
            Some(json!("981"))
        );
        assert_eq!(
            extract(&view, &rule("w", ExtractionSource::Regex, Some(r"#\d+"))).expect("ok"),
            Some(json!("#981"))
        );
        assert_eq!(
            extract(&view, &rule("b", ExtractionSource::Body, None)).expect("ok"),
            Some(json!({"data": {"token": "abc123"}, "note": "order #981 created"}))
        );
    }

    #[test]
    fn misses_are_not_errors() {
        let view = view(500, r#"{"error":"boom"}"#);

        assert_eq!(
            extract(&view, &rule("t", ExtractionSource::JsonPath, Some("$.data.token")))
                .expect("ok"),
            None
        );
        assert_eq!(
            extract(&view, &rule("h", ExtractionSource::Header, Some("authorization"))).expect("ok"),
            None
        );
        assert_eq!(
            extract(&view, &rule("r", ExtractionSource::Regex, Some("nothing here"))).expect("ok"),
            None
        );
    }

    #[test]
    fn malformed_rules_error() {
        let view = view(200, "{}");
        assert!(extract(&view, &rule("r", ExtractionSource::Regex, Some("(unclosed"))).is_err());
        assert!(extract(&view, &rule("j", ExtractionSource::JsonPath, None)).is_err());
        assert!(validate_extraction(&rule("1bad", ExtractionSource::Status, None)).is_err());
        assert!(validate_extraction(&rule("ok_name", ExtractionSource::Header, Some(" "))).is_err());
        assert!(validate_extraction(&rule("ok_name", ExtractionSource::Status, None)).is_ok());
    }

    #[test]
    fn apply_extractions_overwrites_and_reports_hits() {
        let view = view(200, r#"{"data":{"token":"new"}}"#);
        let mut variables = VariableMap::new();
        variables.insert("token".to_string(), json!("old"));
        variables.insert("keep".to_string(), json!(1));

        let extracted = apply_extractions(
            &view,
            &[
                rule("token", ExtractionSource::JsonPath, Some("$.data.token")),
                rule("missing", ExtractionSource::JsonPath, Some("$.nope")),
            ],
            &mut variables,
        )
        .expect("extractions");

        assert_eq!(extracted.len(), 1);
        assert_eq!(variables["token"], json!("new"));
        assert_eq!(variables["keep"], json!(1));
        assert!(!variables.contains_key("missing"));
    }

    #[test]
    fn apply_extractions_rejects_names_placeholders_cannot_reach() {
        let view = view(200, r#"{"a":1}"#);
        let mut variables = VariableMap::new();

        let err = apply_extractions(
            &view,
            &[
                rule("a", ExtractionSource::JsonPath, Some("$.a")),
                rule("bad name!", ExtractionSource::JsonPath, Some("$.a")),
            ],
            &mut variables,
        )
        .expect_err("invalid name");

        assert!(matches!(err, Error::MalformedRule(_)));
        assert!(err.to_string().contains("bad name!"));
        assert!(variables.is_empty());
    }

    #[test]
    fn apply_extractions_is_all_or_nothing_on_malformed_rules() {
        let view = view(200, r#"{"a":1}"#);
        let mut variables = VariableMap::new();

        let result = apply_extractions(
            &view,
            &[
                rule("a", ExtractionSource::JsonPath, Some("$.a")),
                rule("b", ExtractionSource::Regex, Some("[")),
            ],
            &mut variables,
        );

        assert!(result.is_err());
        assert!(variables.is_empty());
    }
}
