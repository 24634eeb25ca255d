use crate::config::TransportConfig;
use crate::domain::{SendRequestPayload, SendResponsePayload};
use crate::error::{Error, Result, TransportError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Proxy};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// The HTTP capability the executors depend on.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn call(
        &self,
        request: &SendRequestPayload,
    ) -> std::result::Result<SendResponsePayload, TransportError>;
}

/// Run `call` under a hard deadline. Expiry is reported as [`TransportError::Timeout`].
pub async fn call_with_deadline(
    transport: &dyn HttpTransport,
    request: &SendRequestPayload,
    timeout_ms: u64,
) -> std::result::Result<SendResponsePayload, TransportError> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), transport.call(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout { timeout_ms }),
    }
}

pub fn build_headers(
    input: &BTreeMap<String, String>,
) -> std::result::Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();

    for (key, value) in input {
        if key.is_empty() {
            continue;
        }

        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|err| {
            TransportError::InvalidRequest(format!("Invalid header name `{key}`: {err}"))
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|err| {
            TransportError::InvalidRequest(format!("Invalid header value for `{key}`: {err}"))
        })?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

fn should_send_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn classify_reqwest_error(err: &reqwest::Error, timeout_ms: u64) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout { timeout_ms };
    }
    if err.is_builder() {
        return TransportError::InvalidRequest(err.to_string());
    }

    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("dns") || lowered.contains("failed to lookup address") {
        return TransportError::Dns(message);
    }
    if lowered.contains("tls") || lowered.contains("ssl") || lowered.contains("certificate") {
        return TransportError::Tls(message);
    }
    if err.is_connect() {
        return TransportError::Connect(message);
    }

    TransportError::Read(message)
}

/// Production transport over a shared `reqwest` connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    default_timeout_ms: u64,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = Client::builder();
        builder = if config.follow_redirects {
            builder.redirect(reqwest::redirect::Policy::limited(10))
        } else {
            builder.redirect(reqwest::redirect::Policy::none())
        };

        if let Some(proxy_url) = config
            .proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            let proxy = Proxy::all(proxy_url)
                .map_err(|err| Error::InvalidConfig(format!("Invalid proxy URL: {err}")))?;
            builder = builder.proxy(proxy);
        }

        if !config.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if !config.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }

        let client = builder
            .build()
            .map_err(|err| Error::InvalidConfig(format!("Failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            default_timeout_ms: config.default_timeout_ms,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn call(
        &self,
        payload: &SendRequestPayload,
    ) -> std::result::Result<SendResponsePayload, TransportError> {
        let method = Method::from_bytes(payload.method.as_bytes()).map_err(|err| {
            TransportError::InvalidRequest(format!("Invalid HTTP method: {err}"))
        })?;
        let headers = build_headers(&payload.headers)?;
        let timeout_ms = payload
            .timeout_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_timeout_ms);

        let mut request = self
            .client
            .request(method.clone(), &payload.url)
            .headers(headers)
            .timeout(Duration::from_millis(timeout_ms));

        if !payload.query.is_empty() {
            request = request.query(&payload.query);
        }

        if should_send_body(&method) {
            if let Some(ref body) = payload.body {
                request = request.body(body.clone());
            }
        }

        debug!(method = %method, url = %payload.url, "Sending request");
        let start = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err, timeout_ms))?;

        let status = response.status().as_u16();
        let mut response_headers = BTreeMap::new();
        for (key, value) in response.headers() {
            response_headers.insert(
                key.to_string(),
                value.to_str().unwrap_or_default().to_string(),
            );
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| classify_reqwest_error(&err, timeout_ms))?;
        let elapsed = start.elapsed().as_millis() as u64;
        let body = String::from_utf8_lossy(&bytes).to_string();

        Ok(SendResponsePayload::new(
            status,
            response_headers,
            body,
            elapsed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_headers_rejects_invalid_names() {
        let mut input = BTreeMap::new();
        input.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            build_headers(&input),
            Err(TransportError::InvalidRequest(_))
        ));

        let mut input = BTreeMap::new();
        input.insert("X-Ok".to_string(), "1".to_string());
        input.insert(String::new(), "ignored".to_string());
        let headers = build_headers(&input).expect("valid headers");
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn bodies_are_dropped_for_safe_methods() {
        assert!(!should_send_body(&Method::GET));
        assert!(!should_send_body(&Method::HEAD));
        assert!(should_send_body(&Method::POST));
        assert!(should_send_body(&Method::DELETE));
    }

    #[tokio::test]
    async fn unroutable_url_is_a_transport_error() {
        let transport = ReqwestTransport::new(&TransportConfig::default()).expect("client");
        let request = SendRequestPayload {
            method: "GET".to_string(),
            url: "not a url".to_string(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_ms: Some(200),
        };
        let err = transport.call(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
        assert!(!err.is_retryable());
    }
}
