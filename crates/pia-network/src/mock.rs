//! Scripted transport for tests
//!
//! Responses are queued per request path and handed out in order; every
//! request is recorded so tests can assert on what went over the wire.

use crate::client::{HttpError, Response, Transport};
use crate::request::Request;
use hyper::StatusCode;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;

/// A request as seen by [`MockTransport`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: Request,
}

impl RecordedRequest {
    pub fn path(&self) -> &str {
        &self.request.path
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.request.query_value(key)
    }
}

/// In-memory [`Transport`] returning queued responses
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<Result<Response, HttpError>>>>,
    recorded: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a `200 OK` with the given body for `path`
    pub fn respond(&self, path: &str, body: impl Into<Vec<u8>>) -> &Self {
        self.respond_with(path, Ok(Response::new(StatusCode::OK, body)))
    }

    /// Queue an arbitrary outcome for `path`
    pub fn respond_with(&self, path: &str, outcome: Result<Response, HttpError>) -> &Self {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.entry(path.to_string()).or_default().push_back(outcome);
        self
    }

    /// All requests seen so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Requests seen for one path
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path() == path)
            .collect()
    }

    fn next_outcome(&self, request: Request) -> Result<Response, HttpError> {
        let path = request.path.clone();
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedRequest { request });

        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes
            .get_mut(&path)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| {
                Err(HttpError::ConnectionFailed {
                    addr: "mock".to_string(),
                    reason: format!("no scripted response for {path}"),
                })
            })
    }
}

impl Transport for MockTransport {
    fn send(&self, request: Request) -> impl Future<Output = Result<Response, HttpError>> + Send {
        let outcome = self.next_outcome(request);
        async move { outcome }
    }
}
