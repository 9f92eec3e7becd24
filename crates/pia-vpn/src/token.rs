//! Authentication tokens
//!
//! Tokens are never renewed behind the caller's back: check
//! [`Token::is_valid`] before a protected call and [`TokenManager::acquire`]
//! a fresh one when it fails.

use crate::error::{ProtocolError, ensure_ok};
use crate::region::Server;
use chrono::{DateTime, TimeDelta, Utc};
use pia_network::{Request, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Lifetime assumed for a new token: 23h55m, just under the provider's day
pub const DEFAULT_TOKEN_VALIDITY: TimeDelta = TimeDelta::seconds(23 * 3600 + 55 * 60);

/// Bearer token with a locally computed expiry
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    pub expiry: DateTime<Utc>,
}

impl Token {
    /// Non-empty and not yet expired
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Validity against an explicit clock reading
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_empty() && self.expiry > now
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("token", &"[redacted]")
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    token: String,
}

/// Obtains tokens from a region's metadata server
pub struct TokenManager<T> {
    transport: T,
    validity: TimeDelta,
}

impl<T: Transport> TokenManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            validity: DEFAULT_TOKEN_VALIDITY,
        }
    }

    /// Override the assumed token lifetime
    pub fn with_validity(mut self, validity: TimeDelta) -> Self {
        self.validity = validity;
        self
    }

    /// Request a new token with username/password
    pub async fn acquire(
        &self,
        meta: &Server,
        username: &str,
        password: &str,
    ) -> Result<Token, ProtocolError> {
        debug!("Requesting token from {} ({})", meta.ip, meta.cn);
        let request = Request::provider(meta.ip.to_string(), 443, "/authv3/generateToken")
            .server_name(meta.cn.as_str())
            .basic_auth(username, password);

        let response = self.transport.send(request).await?;
        let body: TokenResponse = response
            .json()
            .map_err(|e| ProtocolError::decode("token response", e))?;

        ensure_ok("token request", &body.status, body.message.as_deref())?;
        if body.token.is_empty() {
            return Err(ProtocolError::decode("token response", "empty token"));
        }

        let token = Token {
            token: body.token,
            expiry: Utc::now() + self.validity,
        };
        info!("Obtained token valid until {}", token.expiry);
        Ok(token)
    }
}
