//! Transmission RPC
//!
//! JSON over `POST /transmission/rpc`. The daemon answers the first call of
//! a connection with `409 Conflict` and a session id header that has to be
//! echoed on every later call; that handshake is handled here and the id
//! kept for the life of the client.

use super::{ConsumerError, endpoint};
use pia_network::{Request, StatusCode, Transport};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Mutex;
use tracing::debug;

const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";

#[derive(Deserialize)]
struct RpcReply {
    result: String,
    #[serde(default)]
    arguments: Value,
}

/// Transmission RPC client
pub struct TransmissionClient<T> {
    transport: T,
    url: String,
    auth: Option<(String, String)>,
    session_id: Mutex<Option<String>>,
}

impl<T: Transport> TransmissionClient<T> {
    /// `base` is the web interface root, e.g. `http://localhost:9091`
    pub fn new(transport: T, base: &str) -> Self {
        Self {
            transport,
            url: endpoint(base, "/transmission/rpc"),
            auth: None,
            session_id: Mutex::new(None),
        }
    }

    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = Some((username.to_string(), password.to_string()));
        self
    }

    /// `session-set` with `peer-port`
    pub async fn set_peer_port(&self, port: u16) -> Result<(), ConsumerError> {
        self.call("session-set", json!({ "peer-port": port })).await?;
        Ok(())
    }

    /// `session-get` for `peer-port`
    pub async fn peer_port(&self) -> Result<u16, ConsumerError> {
        let arguments = self
            .call("session-get", json!({ "fields": ["peer-port"] }))
            .await?;
        arguments
            .get("peer-port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| ConsumerError::Decode("no usable peer-port in session-get".to_string()))
    }

    async fn call(&self, method: &str, arguments: Value) -> Result<Value, ConsumerError> {
        let body = serde_json::to_vec(&json!({ "method": method, "arguments": arguments }))
            .map_err(|e| ConsumerError::Decode(e.to_string()))?;

        // A second 409 means the daemon rejected the id it just handed out
        for _ in 0..2 {
            let mut request = Request::post(&self.url, body.clone())?
                .header("Content-Type", "application/json");
            if let Some((username, password)) = &self.auth {
                request = request.basic_auth(username, password);
            }
            if let Some(id) = self.current_session_id() {
                request = request.header(SESSION_ID_HEADER, id);
            }

            debug!("Transmission {} -> {}", method, self.url);
            let response = self.transport.send(request).await?;

            if response.status == StatusCode::CONFLICT {
                let id = response.header(SESSION_ID_HEADER).ok_or_else(|| {
                    ConsumerError::Decode(format!("409 without {SESSION_ID_HEADER}"))
                })?;
                debug!("Transmission session id changed");
                self.store_session_id(id.to_string());
                continue;
            }
            if !response.is_success() {
                return Err(ConsumerError::Status(response.status.as_u16()));
            }

            let reply: RpcReply = response
                .json()
                .map_err(|e| ConsumerError::Decode(e.to_string()))?;
            if reply.result != "success" {
                return Err(ConsumerError::Rpc(reply.result));
            }
            return Ok(reply.arguments);
        }

        Err(ConsumerError::Rpc("session id handshake failed".to_string()))
    }

    fn current_session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store_session_id(&self, id: String) {
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pia_network::{MockTransport, Response};

    const RPC: &str = "/transmission/rpc";

    fn conflict(id: &str) -> Response {
        Response::new(StatusCode::CONFLICT, "").with_header(SESSION_ID_HEADER, id)
    }

    fn body(request: &pia_network::RecordedRequest) -> Value {
        serde_json::from_slice(request.request.body.as_deref().unwrap()).unwrap()
    }

    fn header<'a>(request: &'a pia_network::RecordedRequest, name: &str) -> Option<&'a str> {
        request
            .request
            .headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[tokio::test]
    async fn test_session_id_handshake() {
        let mock = MockTransport::new();
        mock.respond_with(RPC, Ok(conflict("abc123")))
            .respond(RPC, r#"{"result":"success","arguments":{}}"#)
            .respond(RPC, r#"{"result":"success","arguments":{"peer-port":51413}}"#);

        let client = TransmissionClient::new(&mock, "http://localhost:9091/");
        client.set_peer_port(51413).await.unwrap();
        assert_eq!(client.peer_port().await.unwrap(), 51413);

        let sent = mock.requests();
        assert_eq!(sent.len(), 3);
        assert_eq!(header(&sent[0], SESSION_ID_HEADER), None);
        assert_eq!(header(&sent[1], SESSION_ID_HEADER), Some("abc123"));
        assert_eq!(header(&sent[2], SESSION_ID_HEADER), Some("abc123"));

        assert_eq!(body(&sent[1])["method"], "session-set");
        assert_eq!(body(&sent[1])["arguments"]["peer-port"], 51413);
        assert_eq!(body(&sent[2])["arguments"]["fields"][0], "peer-port");
        assert_eq!(sent[0].request.port, 9091);
    }

    #[tokio::test]
    async fn test_basic_auth() {
        let mock = MockTransport::new();
        mock.respond(RPC, r#"{"result":"success"}"#);

        TransmissionClient::new(&mock, "http://localhost:9091")
            .with_auth("admin", "secret")
            .set_peer_port(1)
            .await
            .unwrap();

        let sent = &mock.requests()[0];
        assert!(header(sent, "Authorization").is_some_and(|v| v.starts_with("Basic ")));
    }

    #[tokio::test]
    async fn test_rpc_failure() {
        let mock = MockTransport::new();
        mock.respond(RPC, r#"{"result":"invalid argument"}"#);

        let err = TransmissionClient::new(&mock, "http://localhost:9091")
            .set_peer_port(70)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid argument"));
    }

    #[tokio::test]
    async fn test_repeated_conflict() {
        let mock = MockTransport::new();
        mock.respond_with(RPC, Ok(conflict("a")))
            .respond_with(RPC, Ok(conflict("b")));

        let err = TransmissionClient::new(&mock, "http://localhost:9091")
            .peer_port()
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Rpc(_)));
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let mock = MockTransport::new();
        mock.respond_with(RPC, Ok(Response::new(StatusCode::UNAUTHORIZED, "")));

        let err = TransmissionClient::new(&mock, "http://localhost:9091")
            .peer_port()
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Status(401)));
    }
}
