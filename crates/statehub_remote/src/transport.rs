//! Transport abstraction over the HTTP medium.
//!
//! The rest of the crate only ever sees [`Transport`]; the queue, the
//! offline manager and the adapters are all tested against the scripted
//! [`MockTransport`]. Requests are serializable so they can be persisted as
//! offline envelopes and replayed after reconnection.

use crate::error::{RemoteError, RemoteResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// HTTP verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// GET, read-class.
    Get,
    /// POST, write-class.
    Post,
    /// PUT, write-class.
    Put,
    /// PATCH, write-class.
    Patch,
    /// DELETE, write-class.
    Delete,
}

impl Method {
    /// Returns true for verbs that mutate server state.
    ///
    /// Write-class requests are queued durably while offline; read-class
    /// requests are rejected instead.
    #[must_use]
    pub fn is_write(&self) -> bool {
        !matches!(self, Method::Get)
    }
}

/// One outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Full request URL.
    pub url: String,
    /// HTTP verb.
    pub method: Method,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// JSON body, for write-class requests.
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Creates a bodyless GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a request with the given verb and JSON body.
    pub fn with_body(url: impl Into<String>, method: Method, body: Value) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: Some(body),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// One response as seen by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed JSON body; `Value::Null` when the body was empty.
    pub json: Value,
}

impl HttpResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(status: u16, json: Value) -> Self {
        Self { status, json }
    }

    /// 200-class.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 304.
    #[must_use]
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    /// 403-class: authentication expired.
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    /// 500-class: server unreachable for our purposes.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Issues one request and returns the server's answer.
pub trait Transport: Send + Sync {
    /// Performs the call.
    ///
    /// # Errors
    ///
    /// Returns an error when no response was received at all; server error
    /// statuses come back as an `Ok` response carrying the status.
    fn call(&self, request: &HttpRequest) -> RemoteResult<HttpResponse>;
}

enum Scripted {
    Respond(HttpResponse),
    Fail(String),
}

/// Scripted transport for tests.
///
/// Responses are consumed in order; a call past the end of the script fails
/// as a transport error. Every request is recorded.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    /// Creates a transport with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a response to the script.
    pub fn respond_with(&self, status: u16, json: Value) {
        self.script
            .lock()
            .push_back(Scripted::Respond(HttpResponse::new(status, json)));
    }

    /// Appends a transport-level failure to the script.
    pub fn fail_with(&self, message: impl Into<String>) {
        self.script.lock().push_back(Scripted::Fail(message.into()));
    }

    /// Returns every request seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().clone()
    }

    /// Returns the number of requests seen so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Transport for MockTransport {
    fn call(&self, request: &HttpRequest) -> RemoteResult<HttpResponse> {
        self.calls.lock().push(request.clone());
        match self.script.lock().pop_front() {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(RemoteError::Transport(message)),
            None => Err(RemoteError::Transport("script exhausted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_classification() {
        assert!(!Method::Get.is_write());
        assert!(Method::Post.is_write());
        assert!(Method::Delete.is_write());
    }

    #[test]
    fn mock_replays_script_in_order() {
        let transport = MockTransport::new();
        transport.respond_with(200, json!({"ok": true}));
        transport.fail_with("connection reset");

        let first = transport.call(&HttpRequest::get("http://x/a")).unwrap();
        assert!(first.is_success());

        let second = transport.call(&HttpRequest::get("http://x/b"));
        assert!(matches!(second, Err(RemoteError::Transport(_))));

        assert_eq!(transport.call_count(), 2);
        assert_eq!(transport.calls()[0].url, "http://x/a");
    }

    #[test]
    fn request_round_trips_through_json() {
        let request = HttpRequest::with_body("http://x/tasks", Method::Post, json!({"id": 1}))
            .header("X-Ctx", "tenant-1");
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: HttpRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, request);
    }
}
