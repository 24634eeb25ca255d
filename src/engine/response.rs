use crate::domain::SendResponsePayload;
use serde_json::Value;

/// A response plus its body parsed once as JSON, when it is JSON.
#[derive(Debug, Clone)]
pub struct ResponseView {
    pub response: SendResponsePayload,
    pub json: Option<Value>,
}

impl ResponseView {
    pub fn new(response: SendResponsePayload) -> Self {
        let json = parse_json_body(&response);
        Self { response, json }
    }

    /// Parsed JSON when available, raw text otherwise.
    pub fn body_value(&self) -> Value {
        self.json
            .clone()
            .unwrap_or_else(|| Value::String(self.response.body.clone()))
    }
}

fn parse_json_body(response: &SendResponsePayload) -> Option<Value> {
    let declared_json = response.content_type.to_ascii_lowercase().contains("json");
    let trimmed = response.body.trim_start();
    let looks_json = trimmed.starts_with('{') || trimmed.starts_with('[');

    if declared_json || looks_json {
        serde_json::from_str(&response.body).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn response(content_type: Option<&str>, body: &str) -> SendResponsePayload {
        let mut headers = BTreeMap::new();
        if let Some(content_type) = content_type {
            headers.insert("content-type".to_string(), content_type.to_string());
        }
        SendResponsePayload::new(200, headers, body, 5)
    }

    #[test]
    fn parses_declared_json() {
        let view = ResponseView::new(response(Some("application/json"), r#"{"ok":true}"#));
        assert_eq!(view.json, Some(json!({"ok": true})));
        assert_eq!(view.body_value(), json!({"ok": true}));
    }

    #[test]
    fn sniffs_undeclared_json_objects() {
        let view = ResponseView::new(response(None, r#"[1,2]"#));
        assert_eq!(view.json, Some(json!([1, 2])));
    }

    #[test]
    fn plain_text_stays_raw() {
        let view = ResponseView::new(response(Some("text/plain"), "42"));
        assert!(view.json.is_none());
        assert_eq!(view.body_value(), json!("42"));
    }

    #[test]
    fn broken_json_falls_back_to_text() {
        let view = ResponseView::new(response(Some("application/json"), "{oops"));
        assert!(view.json.is_none());
        assert_eq!(view.body_value(), json!("{oops"));
    }
}
