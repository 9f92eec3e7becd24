//! Torrent clients that follow the forwarded port

mod rtorrent;
mod transmission;

pub use rtorrent::RtorrentClient;
pub use transmission::TransmissionClient;

use crate::config::AppConfig;
use pia_network::{HttpClient, HttpClientConfig, HttpError, Transport};
use pia_vpn::PortConsumer;

/// Errors talking to a consumer's RPC interface
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Malformed reply: {0}")]
    Decode(String),

    #[error("RPC call failed: {0}")]
    Rpc(String),
}

/// Every supported consumer
pub enum Consumer<T> {
    Transmission(TransmissionClient<T>),
    Rtorrent(RtorrentClient<T>),
}

impl<T: Transport> PortConsumer for Consumer<T> {
    type Error = ConsumerError;

    fn name(&self) -> &str {
        match self {
            Consumer::Transmission(_) => "transmission",
            Consumer::Rtorrent(_) => "rtorrent",
        }
    }

    async fn notify(&self, port: u16) -> Result<(), ConsumerError> {
        match self {
            Consumer::Transmission(client) => client.set_peer_port(port).await,
            Consumer::Rtorrent(client) => client.set_port_range(port).await,
        }
    }

    async fn confirm(&self) -> Result<u16, ConsumerError> {
        match self {
            Consumer::Transmission(client) => client.peer_port().await,
            Consumer::Rtorrent(client) => client.port_range_start().await,
        }
    }
}

/// Consumers enabled in the configuration
pub fn from_config(config: &AppConfig, http: &HttpClientConfig) -> Vec<Consumer<HttpClient>> {
    let mut consumers = Vec::new();

    if let Some(section) = &config.rtorrent {
        consumers.push(Consumer::Rtorrent(RtorrentClient::new(
            HttpClient::new(http.clone()),
            &section.url,
        )));
    }
    if let Some(section) = &config.transmission {
        let mut client = TransmissionClient::new(HttpClient::new(http.clone()), &section.url);
        if let Some(username) = &section.username {
            client = client.with_auth(username, section.password.as_deref().unwrap_or_default());
        }
        consumers.push(Consumer::Transmission(client));
    }

    consumers
}

/// Join a path onto a configured base URL
fn endpoint(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RtorrentSection, TransmissionSection};
    use pia_network::{MockTransport, Response, StatusCode};
    use pia_vpn::{SessionError, confirm_port};
    use std::error::Error;

    #[test]
    fn test_endpoint() {
        assert_eq!(
            endpoint("http://localhost:9091/", "/transmission/rpc"),
            "http://localhost:9091/transmission/rpc"
        );
        assert_eq!(endpoint("http://nas:8080", "/RPC2"), "http://nas:8080/RPC2");
    }

    #[test]
    fn test_from_config() {
        let mut config = AppConfig::default();
        assert!(from_config(&config, &HttpClientConfig::default()).is_empty());

        config.rtorrent = Some(RtorrentSection {
            url: "http://localhost:8080".to_string(),
        });
        config.transmission = Some(TransmissionSection {
            url: "http://localhost:9091".to_string(),
            username: None,
            password: None,
        });
        let names: Vec<String> = from_config(&config, &HttpClientConfig::default())
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["rtorrent", "transmission"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_consumer_error() {
        let mock = MockTransport::new();
        mock.respond_with(
            "/transmission/rpc",
            Ok(Response::new(StatusCode::UNAUTHORIZED, "")),
        );
        let consumer = Consumer::Transmission(TransmissionClient::new(&mock, "http://localhost:9091"));

        let err = confirm_port(&consumer, 51413).await.unwrap_err();
        assert!(matches!(&err, SessionError::Consumer { consumer, .. } if consumer == "transmission"));
        let source = err.source().and_then(|e| e.downcast_ref::<ConsumerError>());
        assert!(matches!(source, Some(ConsumerError::Status(401))));
    }
}
