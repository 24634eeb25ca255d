use crate::domain::{AssertionResult, AssertionRule, AssertionSource, AssertionType};
use crate::engine::env::stringify;
use crate::engine::extract::compile_regex;
use crate::engine::jsonpath::JsonPath;
use crate::engine::response::ResponseView;
use crate::error::{Error, Result};
use serde_json::Value;

fn source_label(source: AssertionSource) -> &'static str {
    match source {
        AssertionSource::Status => "status",
        AssertionSource::JsonPath => "jsonpath",
        AssertionSource::Header => "header",
        AssertionSource::Body => "body",
        AssertionSource::ResponseTime => "response_time",
    }
}

fn selector(rule: &AssertionRule) -> Result<&str> {
    rule.expression
        .as_deref()
        .map(str::trim)
        .filter(|expression| !expression.is_empty())
        .ok_or_else(|| {
            Error::malformed(format!(
                "{} assertion requires an expression",
                source_label(rule.source)
            ))
        })
}

/// Pattern for `regex` assertions. When the expression selects the value the
/// pattern comes from `expected`.
fn regex_pattern(rule: &AssertionRule) -> Result<&str> {
    let from_expected = rule.expected.as_str();
    let pattern = match rule.source {
        AssertionSource::JsonPath | AssertionSource::Header => from_expected,
        _ => rule
            .expression
            .as_deref()
            .filter(|expression| !expression.is_empty())
            .or(from_expected),
    };
    pattern.ok_or_else(|| Error::malformed("regex assertion requires a string pattern"))
}

pub(crate) fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|number| number.is_finite())
}

fn expected_number(rule: &AssertionRule) -> Result<f64> {
    numeric(&rule.expected).ok_or_else(|| {
        Error::malformed(format!(
            "{:?} assertion needs a numeric expected value, got {}",
            rule.assertion_type, rule.expected
        ))
    })
}

fn same_kind(left: &Value, right: &Value) -> bool {
    std::mem::discriminant(left) == std::mem::discriminant(right)
}

/// Numeric when both sides look numeric, JSON equality for same-typed values,
/// text equality otherwise.
pub(crate) fn values_equal(actual: &Value, expected: &Value) -> bool {
    if let (Some(left), Some(right)) = (numeric(actual), numeric(expected)) {
        return left == right;
    }
    if same_kind(actual, expected) {
        actual == expected
    } else {
        stringify(actual) == stringify(expected)
    }
}

pub(crate) fn value_contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => map.contains_key(&stringify(needle)),
        other => stringify(other).contains(&stringify(needle)),
    }
}

/// Reject rules that can never evaluate, before any request is sent.
pub fn validate_assertion(rule: &AssertionRule) -> Result<()> {
    match rule.source {
        AssertionSource::JsonPath => {
            JsonPath::parse(selector(rule)?)?;
        }
        AssertionSource::Header => {
            selector(rule)?;
        }
        AssertionSource::Status | AssertionSource::Body | AssertionSource::ResponseTime => {}
    }

    match rule.assertion_type {
        AssertionType::Regex => {
            compile_regex(regex_pattern(rule)?)?;
        }
        AssertionType::GreaterThan
        | AssertionType::LessThan
        | AssertionType::GreaterOrEqual
        | AssertionType::LessOrEqual => {
            expected_number(rule)?;
        }
        AssertionType::Equals
        | AssertionType::NotEquals
        | AssertionType::Contains
        | AssertionType::Exists => {}
    }
    Ok(())
}

fn actual_value(view: &ResponseView, rule: &AssertionRule) -> Result<Option<Value>> {
    let response = &view.response;
    Ok(match rule.source {
        AssertionSource::Status => Some(Value::from(response.status)),
        AssertionSource::ResponseTime => Some(Value::from(response.time)),
        AssertionSource::Header => response
            .header(selector(rule)?)
            .map(|value| Value::String(value.to_string())),
        AssertionSource::JsonPath => {
            let path = JsonPath::parse(selector(rule)?)?;
            view.json.as_ref().and_then(|json| path.first(json)).cloned()
        }
        AssertionSource::Body => Some(view.body_value()),
    })
}

/// Compare one rule against a response. Only malformed rules return `Err`.
pub fn evaluate(view: &ResponseView, rule: &AssertionRule) -> Result<AssertionResult> {
    let actual = actual_value(view, rule)?;
    let label = source_label(rule.source);

    let (passed, message) = match (rule.assertion_type, actual.as_ref()) {
        (AssertionType::Exists, found) => {
            let must_exist = rule.expected != Value::Bool(false);
            let passed = found.is_some() == must_exist;
            let message = match (passed, must_exist) {
                (true, _) => None,
                (false, true) => Some(format!("{label} value does not exist")),
                (false, false) => Some(format!("{label} value exists but should not")),
            };
            (passed, message)
        }
        (_, None) => (false, Some(format!("{label} value does not exist"))),
        (assertion_type, Some(actual)) => {
            compare(assertion_type, rule, actual, label, &view.response.body)?
        }
    };

    Ok(AssertionResult {
        assertion_type: rule.assertion_type,
        source: rule.source,
        expression: rule.expression.clone(),
        expected: rule.expected.clone(),
        actual,
        passed,
        message,
    })
}

fn compare(
    assertion_type: AssertionType,
    rule: &AssertionRule,
    actual: &Value,
    label: &str,
    raw_body: &str,
) -> Result<(bool, Option<String>)> {
    let expected = &rule.expected;
    let verdict = |passed: bool, describe: &str| {
        let message = (!passed).then(|| format!("expected {label} {describe}, got {actual}"));
        (passed, message)
    };

    Ok(match assertion_type {
        AssertionType::Equals => verdict(
            values_equal(actual, expected),
            &format!("to equal {expected}"),
        ),
        AssertionType::NotEquals => verdict(
            !values_equal(actual, expected),
            &format!("to differ from {expected}"),
        ),
        AssertionType::Contains => verdict(
            value_contains(actual, expected),
            &format!("to contain {expected}"),
        ),
        AssertionType::Regex => {
            let pattern = regex_pattern(rule)?;
            let regex = compile_regex(pattern)?;
            let subject = match rule.source {
                AssertionSource::Body => raw_body.to_string(),
                _ => stringify(actual),
            };
            verdict(
                regex.is_match(&subject),
                &format!("to match /{pattern}/"),
            )
        }
        AssertionType::GreaterThan
        | AssertionType::LessThan
        | AssertionType::GreaterOrEqual
        | AssertionType::LessOrEqual => {
            let bound = expected_number(rule)?;
            let Some(value) = numeric(actual) else {
                return Ok((false, Some(format!("{label} value {actual} is not numeric"))));
            };
            let (passed, symbol) = match assertion_type {
                AssertionType::GreaterThan => (value > bound, ">"),
                AssertionType::LessThan => (value < bound, "<"),
                AssertionType::GreaterOrEqual => (value >= bound, ">="),
                _ => (value <= bound, "<="),
            };
            verdict(passed, &format!("{symbol} {expected}"))
        }
        AssertionType::Exists => (true, None),
    })
}

/// Evaluate every rule in order. Stops at the first malformed rule.
pub fn evaluate_all(view: &ResponseView, rules: &[AssertionRule]) -> Result<Vec<AssertionResult>> {
    rules.iter().map(|rule| evaluate(view, rule)).collect()
}

pub fn all_passed(results: &[AssertionResult]) -> bool {
    results.iter().all(|result| result.passed)
}
