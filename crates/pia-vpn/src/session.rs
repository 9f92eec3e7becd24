//! Session record
//!
//! Everything one tunnel needs between invocations: its region, its keys,
//! what the server negotiated, the token and the port assignment.

use crate::keys::{KeyPair, PublicKey};
use crate::portforward::PortAssignment;
use crate::region::{Region, Server};
use crate::token::Token;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Network parameters returned by key registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedParams {
    /// Server's WireGuard public key
    pub server_key: PublicKey,
    /// Server's WireGuard UDP port
    pub server_port: u16,
    /// Server's public address
    pub server_ip: IpAddr,
    /// Server address inside the tunnel (also hosts the port-forward API)
    pub server_vip: IpAddr,
    /// Address assigned to us inside the tunnel
    pub peer_ip: IpAddr,
    /// DNS servers reachable through the tunnel
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
}

impl NegotiatedParams {
    /// WireGuard endpoint to configure for the peer
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.server_port)
    }
}

/// Persisted state of one tunnel, keyed by its logical name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Logical session name (the WireGuard interface name)
    pub name: String,
    pub region: Region,
    /// Generated once; kept for the life of the record
    pub keys: KeyPair,
    #[serde(default)]
    pub params: Option<NegotiatedParams>,
    #[serde(default)]
    pub token: Token,
    #[serde(default)]
    pub port_forward: Option<PortAssignment>,
    /// Last status/message pair reported by the provider
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl Session {
    pub fn new(name: impl Into<String>, region: Region, keys: KeyPair) -> Self {
        Self {
            name: name.into(),
            region,
            keys,
            params: None,
            token: Token::default(),
            port_forward: None,
            status: String::new(),
            message: String::new(),
        }
    }

    /// Has key registration completed?
    pub fn is_registered(&self) -> bool {
        self.params.is_some()
    }

    /// WireGuard server of the session's region
    pub fn tunnel_server(&self) -> Option<&Server> {
        self.region.tunnel_server()
    }

    /// Currently assigned forwarded port
    pub fn forwarded_port(&self) -> Option<u16> {
        self.port_forward.as_ref().map(|pf| pf.port)
    }
}
