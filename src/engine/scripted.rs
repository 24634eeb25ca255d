//! In-memory [`HttpTransport`] that answers from canned replies.

use crate::domain::{SendRequestPayload, SendResponsePayload};
use crate::engine::http::HttpTransport;
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond {
        status: u16,
        headers: BTreeMap<String, String>,
        body: String,
        delay_ms: u64,
    },
    Fail(TransportError),
}

impl ScriptedReply {
    pub fn json(status: u16, body: Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        ScriptedReply::Respond {
            status,
            headers,
            body: body.to_string(),
            delay_ms: 0,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        ScriptedReply::Respond {
            status,
            headers,
            body: body.into(),
            delay_ms: 0,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let ScriptedReply::Respond { headers, .. } = &mut self {
            headers.insert(name.to_string(), value.to_string());
        }
        self
    }

    /// Hold the reply back for `delay_ms` before answering.
    pub fn delayed(mut self, ms: u64) -> Self {
        if let ScriptedReply::Respond { delay_ms, .. } = &mut self {
            *delay_ms = ms;
        }
        self
    }
}

#[derive(Debug)]
struct Route {
    method: String,
    path: String,
    replies: VecDeque<ScriptedReply>,
}

impl Route {
    fn matches(&self, request: &SendRequestPayload) -> bool {
        self.method.eq_ignore_ascii_case(&request.method) && request.url.ends_with(&self.path)
    }

    /// Replies are consumed in order; the last one repeats.
    fn next_reply(&mut self) -> Option<ScriptedReply> {
        if self.replies.len() > 1 {
            self.replies.pop_front()
        } else {
            self.replies.front().cloned()
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<SendRequestPayload>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `method` requests whose URL ends with `path`.
    pub fn route(self, method: &str, path: &str, reply: ScriptedReply) -> Self {
        self.route_sequence(method, path, vec![reply])
    }

    pub fn route_sequence(self, method: &str, path: &str, replies: Vec<ScriptedReply>) -> Self {
        self.routes.lock().push(Route {
            method: method.to_string(),
            path: path.to_string(),
            replies: replies.into(),
        });
        self
    }

    /// Every request received, in arrival order.
    pub fn calls(&self) -> Vec<SendRequestPayload> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.url.ends_with(path))
            .count()
    }

    /// Highest number of calls that were in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn call(
        &self,
        request: &SendRequestPayload,
    ) -> Result<SendResponsePayload, TransportError> {
        self.calls.lock().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let reply = self
            .routes
            .lock()
            .iter_mut()
            .find(|route| route.matches(request))
            .and_then(Route::next_reply);

        match reply {
            Some(ScriptedReply::Respond {
                status,
                headers,
                body,
                delay_ms,
            }) => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Ok(SendResponsePayload::new(status, headers, body, delay_ms))
            }
            Some(ScriptedReply::Fail(err)) => Err(err),
            None => Err(TransportError::Connect(format!(
                "no route for {} {}",
                request.method, request.url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn get(url: &str) -> SendRequestPayload {
        SendRequestPayload {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn sequences_repeat_their_last_reply() {
        let transport = ScriptedTransport::new().route_sequence(
            "GET",
            "/flaky",
            vec![
                ScriptedReply::Fail(TransportError::Connect("refused".into())),
                ScriptedReply::json(200, json!({"ok": true})),
            ],
        );

        assert!(transport.call(&get("http://api.test/flaky")).await.is_err());
        assert_eq!(transport.call(&get("http://api.test/flaky")).await.map(|r| r.status), Ok(200));
        assert_eq!(transport.call(&get("http://api.test/flaky")).await.map(|r| r.status), Ok(200));
        assert_eq!(transport.calls_to("/flaky"), 3);
    }

    #[tokio::test]
    async fn unknown_routes_fail_to_connect() {
        let transport = ScriptedTransport::new();
        let err = transport.call(&get("http://api.test/nope")).await.unwrap_err();
        assert_eq!(err.code(), "CONNECT_ERROR");
        assert_eq!(transport.call_count(), 1);
    }
}
