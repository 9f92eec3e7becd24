//! WireGuard key registration
//!
//! `addKey` on the region's WireGuard server hands back the tunnel's
//! network parameters. Registering the same public key again returns the
//! same parameters, which is how an existing session is refreshed without
//! new keys.

use crate::error::{ProtocolError, ensure_ok};
use crate::keys::PublicKey;
use crate::region::Server;
use crate::session::NegotiatedParams;
use crate::token::Token;
use pia_network::{Request, Transport};
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{debug, info};

/// Port of the key registration API on WireGuard servers
const ADD_KEY_PORT: u16 = 1337;

#[derive(Deserialize)]
struct AddKeyResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    server_key: Option<String>,
    server_port: Option<u16>,
    server_ip: Option<IpAddr>,
    server_vip: Option<IpAddr>,
    peer_ip: Option<IpAddr>,
    #[serde(default)]
    dns_servers: Vec<IpAddr>,
}

impl AddKeyResponse {
    fn into_params(self) -> Result<NegotiatedParams, ProtocolError> {
        fn field<V>(value: Option<V>, name: &str) -> Result<V, ProtocolError> {
            value.ok_or_else(|| ProtocolError::decode("addKey response", format!("missing {name}")))
        }

        let server_key = PublicKey::from_base64(&field(self.server_key, "server_key")?)
            .map_err(|e| ProtocolError::decode("addKey server_key", e))?;

        Ok(NegotiatedParams {
            server_key,
            server_port: field(self.server_port, "server_port")?,
            server_ip: field(self.server_ip, "server_ip")?,
            server_vip: field(self.server_vip, "server_vip")?,
            peer_ip: field(self.peer_ip, "peer_ip")?,
            dns_servers: self.dns_servers,
        })
    }
}

/// Registers tunnel public keys with a WireGuard server
pub struct TunnelRegistrar<T> {
    transport: T,
}

impl<T: Transport> TunnelRegistrar<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Submit `public_key` and return what the server negotiated
    pub async fn register(
        &self,
        server: &Server,
        token: &Token,
        public_key: &PublicKey,
    ) -> Result<NegotiatedParams, ProtocolError> {
        debug!("Registering public key with {} ({})", server.ip, server.cn);
        let request = Request::provider(server.ip.to_string(), ADD_KEY_PORT, "/addKey")
            .server_name(server.cn.as_str())
            .query("pt", token.token.as_str())
            .query("pubkey", public_key.to_base64());

        let response = self.transport.send(request).await?;
        let body: AddKeyResponse = response
            .json()
            .map_err(|e| ProtocolError::decode("addKey response", e))?;

        ensure_ok("key registration", &body.status, body.message.as_deref())?;
        let params = body.into_params()?;

        info!(
            "Registered with {}: peer {} via {}",
            server.cn,
            params.peer_ip,
            params.endpoint()
        );
        Ok(params)
    }
}
