//! Session Manager
//!
//! Drives the provider protocol for one named session across invocations.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = SessionManager::new(HttpClient::with_defaults(), IcmpProbe::default(), store);
//!
//! // Once: pick a region, register keys
//! manager.setup("pia", &RegionSelector::Auto, &credentials, &NativeKeyGenerator).await?;
//!
//! // Periodically: keep the forwarded port alive
//! let outcome = manager.forward("pia", Some(&credentials), true, &consumers).await?;
//! println!("{outcome}");
//! ```
//!
//! Every step is attempted once. Whatever has been obtained is saved before
//! the next step runs, so a failed invocation can be repeated and picks up
//! where the last one stopped.

use crate::consumer::{PortConsumer, confirm_port};
use crate::error::ProtocolError;
use crate::keys::{KeyError, KeyGenerator, KeyPair};
use crate::portforward::{PortForwardManager, PortForwardState};
use crate::probe::LatencyProbe;
use crate::region::{Region, RegionCatalog, RegionError, Server, select_best};
use crate::session::Session;
use crate::store::{SessionStore, StoreError};
use crate::token::{DEFAULT_TOKEN_VALIDITY, Token, TokenManager};
use crate::tunnel::TunnelRegistrar;
use chrono::{TimeDelta, Utc};
use pia_network::Transport;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error("Could not generate keypair: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Token expired and username/password were not provided")]
    MissingCredentials,

    #[error("Provider assigned port {assigned}, but {consumer} reports port {reported}")]
    Consistency {
        consumer: String,
        assigned: u16,
        reported: u16,
    },

    #[error("Could not update {consumer}: {source}")]
    Consumer {
        consumer: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Session {0} has no registered tunnel; run setup first")]
    NotRegistered(String),
}

/// Provider account credentials
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// How `setup` chooses a region
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSelector {
    /// Exact region id
    Id(String),
    /// Lowest-latency region with port forwarding
    Auto,
}

impl FromStr for RegionSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "auto" => RegionSelector::Auto,
            id => RegionSelector::Id(id.to_string()),
        })
    }
}

impl fmt::Display for RegionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionSelector::Id(id) => f.write_str(id),
            RegionSelector::Auto => f.write_str("auto"),
        }
    }
}

/// Result of a `forward` run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub port: u16,
    /// Provider status of the bind
    pub status: String,
    /// Provider message of the bind
    pub message: String,
    /// Was a new assignment requested (as opposed to rebinding the stored one)?
    pub requested: bool,
}

impl fmt::Display for ForwardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (Port = {})", self.status, self.message, self.port)
    }
}

/// Session Manager
///
/// Owns the transport, the latency probe and the store; every protocol
/// component is built per call around a borrow of the transport.
pub struct SessionManager<T, P> {
    transport: T,
    probe: Arc<P>,
    store: SessionStore,
    catalog_url: Option<String>,
    token_validity: TimeDelta,
}

impl<T: Transport, P: LatencyProbe> SessionManager<T, P> {
    pub fn new(transport: T, probe: P, store: SessionStore) -> Self {
        Self {
            transport,
            probe: Arc::new(probe),
            store,
            catalog_url: None,
            token_validity: DEFAULT_TOKEN_VALIDITY,
        }
    }

    /// Fetch the server list from somewhere else
    pub fn with_catalog_url(mut self, url: impl Into<String>) -> Self {
        self.catalog_url = Some(url.into());
        self
    }

    /// Lifetime assumed for newly acquired tokens
    pub fn with_token_validity(mut self, validity: TimeDelta) -> Self {
        self.token_validity = validity;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn catalog(&self) -> RegionCatalog<&T, P> {
        let catalog = RegionCatalog::with_shared_probe(&self.transport, Arc::clone(&self.probe));
        match &self.catalog_url {
            Some(url) => catalog.with_url(url.as_str()),
            None => catalog,
        }
    }

    fn tokens(&self) -> TokenManager<&T> {
        TokenManager::new(&self.transport).with_validity(self.token_validity)
    }

    /// Every region, fastest first
    pub async fn list_regions(&self) -> Result<Vec<Region>, SessionError> {
        let catalog = self.catalog();
        let regions = catalog.fetch_all().await?;
        Ok(catalog.rank_by_latency(regions).await)
    }

    /// Choose a region, make sure keys and a token exist, register the
    /// public key and save the session
    ///
    /// A saved session with the same name in the same region keeps its
    /// keys; anything else starts over with a new key pair.
    pub async fn setup<G: KeyGenerator>(
        &self,
        name: &str,
        selector: &RegionSelector,
        credentials: &Credentials,
        keygen: &G,
    ) -> Result<Session, SessionError> {
        SessionStore::check_name(name)?;
        let catalog = self.catalog();
        let regions = catalog.fetch_all().await?;
        let region = match selector {
            RegionSelector::Id(id) => catalog.locate(id, &regions).await?,
            RegionSelector::Auto => {
                let ranked = catalog.rank_by_latency(regions).await;
                select_best(&ranked)?
            }
        };
        info!("Using region {} ({})", region.id, region.name);

        let previous = match self.store.load_optional(name).await {
            Ok(previous) => previous.filter(|s| s.region.id == region.id),
            Err(e) => {
                warn!("Ignoring unreadable session {}: {}", name, e);
                None
            }
        };

        let mut session = match previous {
            Some(mut previous) => {
                debug!("Reusing keys of saved session {}", name);
                previous.region = region;
                previous
            }
            None => {
                let keys = KeyPair::generate_with(keygen).await?;
                Session::new(name, region, keys)
            }
        };

        let server = tunnel_server(&session.region)?;
        if !session.token.is_valid() {
            session.token = self.acquire_token(&session.region, credentials).await?;
        }

        let params = TunnelRegistrar::new(&self.transport)
            .register(&server, &session.token, &session.keys.public)
            .await?;

        // An assignment only survives if the tunnel still ends at the same server
        let same_endpoint = session
            .params
            .as_ref()
            .is_some_and(|old| old.server_vip == params.server_vip);
        if !same_endpoint && session.port_forward.take().is_some() {
            debug!("Dropping port assignment from previous registration");
        }

        session.params = Some(params);
        self.store.save(&session).await?;
        Ok(session)
    }

    /// Obtain (or refresh) the forwarded port and hand it to `consumers`
    ///
    /// With `refresh_only` the stored assignment is bound again so the port
    /// stays the same; only when nothing is stored is a new one requested.
    pub async fn forward<C: PortConsumer>(
        &self,
        name: &str,
        credentials: Option<&Credentials>,
        refresh_only: bool,
        consumers: &[C],
    ) -> Result<ForwardOutcome, SessionError> {
        let mut session = self.store.load(name).await?;
        let Some(server_vip) = session.params.as_ref().map(|p| p.server_vip) else {
            return Err(SessionError::NotRegistered(name.to_string()));
        };
        let server = tunnel_server(&session.region)?;

        if !session.token.is_valid() {
            let credentials = credentials.ok_or(SessionError::MissingCredentials)?;
            info!("Token for session {} expired; requesting a new one", name);
            session.token = self.acquire_token(&session.region, credentials).await?;
            self.store.save(&session).await?;
        }

        let ports = PortForwardManager::new(&self.transport);
        let state = PortForwardState::of(session.port_forward.as_ref());
        debug!("Session {} port forward state: {:?}", name, state);
        let rebind = match state {
            PortForwardState::NoAssignment => {
                if refresh_only {
                    warn!("No stored port assignment for {}; requesting one", name);
                }
                false
            }
            PortForwardState::SignatureObtained | PortForwardState::Bound => refresh_only,
        };

        let (mut assignment, requested) = match session.port_forward.take() {
            Some(stored) if rebind => {
                if stored.is_expired_at(Utc::now()) {
                    warn!(
                        "Stored assignment for port {} expired at {}",
                        stored.port, stored.expires_at
                    );
                }
                (stored, false)
            }
            _ => {
                let fresh = ports
                    .request_signature(server_vip, &server, &session.token)
                    .await?;
                session.port_forward = Some(fresh.clone());
                self.store.save(&session).await?;
                (fresh, true)
            }
        };

        let bound = ports.bind(server_vip, &server, &assignment).await;
        let status = match bound {
            Ok(status) => status,
            Err(e) => {
                if let ProtocolError::Rejected {
                    status, message, ..
                } = &e
                {
                    session.status = status.clone();
                    session.message = message.clone();
                    session.port_forward = Some(assignment);
                    self.store.save(&session).await?;
                }
                return Err(e.into());
            }
        };

        assignment.bound_at = Some(Utc::now());
        let port = assignment.port;
        session.port_forward = Some(assignment);
        session.status = status.status.clone();
        session.message = status.message.clone();
        self.store.save(&session).await?;

        for consumer in consumers {
            confirm_port(consumer, port).await?;
        }

        Ok(ForwardOutcome {
            port,
            status: status.status,
            message: status.message,
            requested,
        })
    }

    async fn acquire_token(
        &self,
        region: &Region,
        credentials: &Credentials,
    ) -> Result<Token, SessionError> {
        let meta = region.meta_server().ok_or_else(|| RegionError::NoMetaService {
            id: region.id.clone(),
            name: region.name.clone(),
        })?;
        let token = self
            .tokens()
            .acquire(meta, &credentials.username, &credentials.password)
            .await?;
        Ok(token)
    }
}

fn tunnel_server(region: &Region) -> Result<Server, RegionError> {
    region
        .tunnel_server()
        .cloned()
        .ok_or_else(|| RegionError::NoTunnelService {
            id: region.id.clone(),
            name: region.name.clone(),
        })
}

impl<T, P> fmt::Debug for SessionManager<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("store", &self.store)
            .field("catalog_url", &self.catalog_url)
            .finish_non_exhaustive()
    }
}
