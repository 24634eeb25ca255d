use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── HTTP Types ───────────────────────────────────────────────────────────────

/// A fully resolved request, ready to hand to an [`HttpTransport`](crate::engine::http::HttpTransport).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequestPayload {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponsePayload {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Elapsed wall time of the call in milliseconds.
    pub time: u64,
    pub size: u64,
    pub content_type: String,
}

impl SendResponsePayload {
    pub fn new(
        status: u16,
        headers: BTreeMap<String, String>,
        body: impl Into<String>,
        time: u64,
    ) -> Self {
        let body = body.into();
        let status_text = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("Unknown")
            .to_string();
        let content_type = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| "text/plain".to_string());

        Self {
            status,
            status_text,
            size: body.len() as u64,
            headers,
            body,
            time,
            content_type,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

// ─── Environment Types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVariable {
    #[serde(default)]
    pub id: String,
    pub key: String,
    pub value: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub variables: Vec<EnvVariable>,
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_response_derives_metadata_from_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let response = SendResponsePayload::new(404, headers, "{}", 12);

        assert_eq!(response.status_text, "Not Found");
        assert_eq!(response.content_type, "application/json");
        assert_eq!(response.size, 2);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.header("x-missing"), None);
    }
}
