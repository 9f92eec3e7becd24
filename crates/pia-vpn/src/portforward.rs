//! Port forwarding
//!
//! # Protocol
//!
//! 1. `getSignature` (with the token) returns an envelope
//!    `{status, message, payload, signature}` where `payload` is base64 of
//!    `{port, expires_at, ...}`.
//! 2. `bindPort` submits `payload` and `signature` back, verbatim. It has to
//!    be repeated before the assignment expires to keep the port.
//!
//! The payload string is the only thing the server trusts, so it is stored
//! exactly as received and never re-encoded from the decoded fields.
//!
//! ```text
//!  NoAssignment ──getSignature──▶ SignatureObtained ──bindPort──▶ Bound
//!                                                                   │ ▲
//!                                                                   └─┘ bindPort
//! ```

use crate::error::{ProtocolError, ensure_ok};
use crate::region::Server;
use crate::token::Token;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use pia_network::{Request, Transport};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{debug, info};

/// Port of the port-forward API, reachable through the tunnel only
const PORT_FORWARD_API_PORT: u16 = 19999;

/// A forwarded port as granted by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub port: u16,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
    /// Base64 payload exactly as received
    pub payload: String,
    /// Time of the last successful bind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_at: Option<DateTime<Utc>>,
}

impl PortAssignment {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn state(&self) -> PortForwardState {
        if self.bound_at.is_some() {
            PortForwardState::Bound
        } else {
            PortForwardState::SignatureObtained
        }
    }
}

/// Where a session stands in the port-forward protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortForwardState {
    NoAssignment,
    SignatureObtained,
    Bound,
}

impl PortForwardState {
    pub fn of(assignment: Option<&PortAssignment>) -> Self {
        assignment.map_or(PortForwardState::NoAssignment, PortAssignment::state)
    }
}

/// Outer `getSignature` envelope
#[derive(Deserialize)]
struct SignatureEnvelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

/// Decoded contents of `payload`
#[derive(Deserialize)]
struct SignaturePayload {
    port: u16,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    signature: Option<String>,
}

/// Status/message pair from `bindPort`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindStatus {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// Client for the in-tunnel port-forward API
pub struct PortForwardManager<T> {
    transport: T,
}

impl<T: Transport> PortForwardManager<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Ask for a new port assignment
    ///
    /// The port may differ from any earlier assignment.
    pub async fn request_signature(
        &self,
        server_vip: IpAddr,
        server: &Server,
        token: &Token,
    ) -> Result<PortAssignment, ProtocolError> {
        debug!("Requesting port-forward signature from {}", server_vip);
        let request = Request::provider(server_vip.to_string(), PORT_FORWARD_API_PORT, "/getSignature")
            .server_name(server.cn.as_str())
            .query("token", token.token.as_str());

        let response = self.transport.send(request).await?;
        let assignment = decode_signature(&response.body)?;

        info!(
            "Assigned port {} (expires {})",
            assignment.port, assignment.expires_at
        );
        Ok(assignment)
    }

    /// Bind (or keep alive) an assignment
    pub async fn bind(
        &self,
        server_vip: IpAddr,
        server: &Server,
        assignment: &PortAssignment,
    ) -> Result<BindStatus, ProtocolError> {
        debug!("Binding port {} via {}", assignment.port, server_vip);
        let request = Request::provider(server_vip.to_string(), PORT_FORWARD_API_PORT, "/bindPort")
            .server_name(server.cn.as_str())
            .query("payload", assignment.payload.as_str())
            .query("signature", assignment.signature.as_str());

        let response = self.transport.send(request).await?;
        let status: BindStatus = response
            .json()
            .map_err(|e| ProtocolError::decode("bindPort response", e))?;

        ensure_ok("port bind", &status.status, Some(&status.message))?;
        info!("Port {} bound: {}", assignment.port, status.message);
        Ok(status)
    }
}

/// Decode the envelope, then the payload inside it
fn decode_signature(body: &[u8]) -> Result<PortAssignment, ProtocolError> {
    let envelope: SignatureEnvelope = serde_json::from_slice(body)
        .map_err(|e| ProtocolError::decode("getSignature response", e))?;

    ensure_ok("port-forward signature", &envelope.status, envelope.message.as_deref())?;

    let payload = envelope
        .payload
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ProtocolError::decode("getSignature response", "missing payload"))?;

    let raw = BASE64
        .decode(payload.as_bytes())
        .map_err(|e| ProtocolError::decode("port-forward payload base64", e))?;
    let inner: SignaturePayload = serde_json::from_slice(&raw)
        .map_err(|e| ProtocolError::decode("port-forward payload", e))?;

    // The signature travels next to the payload; accept it from inside too
    let signature = inner
        .signature
        .or(envelope.signature)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProtocolError::decode("getSignature response", "missing signature"))?;

    Ok(PortAssignment {
        port: inner.port,
        expires_at: inner.expires_at,
        signature,
        payload,
        bound_at: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeDelta;
    use pia_network::MockTransport;

    pub(crate) fn encode_payload(port: u16, expires_at: &str) -> String {
        BASE64.encode(format!(
            r#"{{"token":"opaque","port":{port},"expires_at":"{expires_at}"}}"#
        ))
    }

    pub(crate) fn signature_response(port: u16) -> String {
        format!(
            r#"{{"status":"OK","payload":"{}","signature":"sig=="}}"#,
            encode_payload(port, "2030-01-01T00:00:00.123456789Z")
        )
    }

    fn server() -> Server {
        Server {
            ip: "66.115.142.46".parse().unwrap(),
            cn: "toronto401".to_string(),
        }
    }

    fn vip() -> IpAddr {
        "10.44.128.1".parse().unwrap()
    }

    fn token() -> Token {
        Token {
            token: "tok123".to_string(),
            expiry: Utc::now() + TimeDelta::hours(1),
        }
    }

    #[tokio::test]
    async fn test_request_signature() {
        let mock = MockTransport::new();
        mock.respond("/getSignature", signature_response(51413));

        let assignment = PortForwardManager::new(&mock)
            .request_signature(vip(), &server(), &token())
            .await
            .unwrap();

        assert_eq!(assignment.port, 51413);
        assert_eq!(assignment.signature, "sig==");
        assert_eq!(assignment.payload, encode_payload(51413, "2030-01-01T00:00:00.123456789Z"));
        assert_eq!(assignment.state(), PortForwardState::SignatureObtained);
        assert!(!assignment.is_expired_at(Utc::now()));

        let sent = &mock.requests()[0];
        assert_eq!(sent.request.host, "10.44.128.1");
        assert_eq!(sent.request.port, 19999);
        assert_eq!(sent.request.tls_identity(), "toronto401");
        assert_eq!(sent.query("token"), Some("tok123"));
    }

    #[test]
    fn test_signature_inside_payload() {
        let payload = BASE64.encode(
            r#"{"port":6881,"expires_at":"2030-01-01T00:00:00Z","signature":"inner"}"#,
        );
        let body = format!(r#"{{"status":"OK","message":"","payload":"{payload}"}}"#);

        let assignment = decode_signature(body.as_bytes()).unwrap();
        assert_eq!(assignment.port, 6881);
        assert_eq!(assignment.signature, "inner");
        assert_eq!(assignment.payload, payload);
    }

    #[tokio::test]
    async fn test_request_signature_rejected() {
        let mock = MockTransport::new();
        mock.respond(
            "/getSignature",
            r#"{"status":"ERROR","message":"exceeded limit"}"#,
        );

        let err = PortForwardManager::new(&mock)
            .request_signature(vip(), &server(), &token())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeded limit"));
    }

    #[test]
    fn test_malformed_payload() {
        let bad_base64 = r#"{"status":"OK","payload":"%%%","signature":"s"}"#;
        assert!(matches!(
            decode_signature(bad_base64.as_bytes()),
            Err(ProtocolError::Decode { what: "port-forward payload base64", .. })
        ));

        let not_json = format!(
            r#"{{"status":"OK","payload":"{}","signature":"s"}}"#,
            BASE64.encode("port=1")
        );
        assert!(matches!(
            decode_signature(not_json.as_bytes()),
            Err(ProtocolError::Decode { what: "port-forward payload", .. })
        ));

        let no_signature = format!(
            r#"{{"status":"OK","payload":"{}"}}"#,
            encode_payload(1, "2030-01-01T00:00:00Z")
        );
        assert!(decode_signature(no_signature.as_bytes()).is_err());
    }

    #[tokio::test]
    async fn test_bind_twice_sends_payload_verbatim() {
        let mock = MockTransport::new();
        mock.respond("/getSignature", signature_response(51413));
        for _ in 0..2 {
            mock.respond("/bindPort", r#"{"status":"OK","message":"port scheduled for add"}"#);
        }

        let manager = PortForwardManager::new(&mock);
        let assignment = manager
            .request_signature(vip(), &server(), &token())
            .await
            .unwrap();

        let first = manager.bind(vip(), &server(), &assignment).await.unwrap();
        let second = manager.bind(vip(), &server(), &assignment).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.message, "port scheduled for add");

        let binds = mock.requests_to("/bindPort");
        assert_eq!(binds.len(), 2);
        for bind in binds {
            assert_eq!(bind.query("payload"), Some(assignment.payload.as_str()));
            assert_eq!(bind.query("signature"), Some("sig=="));
        }
    }

    #[tokio::test]
    async fn test_bind_rejected() {
        let mock = MockTransport::new();
        mock.respond("/getSignature", signature_response(51413));
        mock.respond("/bindPort", r#"{"status":"ERROR","message":"signature expired"}"#);

        let manager = PortForwardManager::new(&mock);
        let assignment = manager
            .request_signature(vip(), &server(), &token())
            .await
            .unwrap();
        let err = manager.bind(vip(), &server(), &assignment).await.unwrap_err();
        assert_eq!(err.provider_message(), Some("signature expired"));
    }

    #[test]
    fn test_state() {
        assert_eq!(PortForwardState::of(None), PortForwardState::NoAssignment);
    }
}
