//! PIA VPN - WireGuard session and port-forward engine
//!
//! Drives a session against the provider's control plane from region
//! discovery to a bound, forwarded port.
//!
//! # Flow
//!
//! ```text
//!  RegionCatalog ──▶ pick region ──▶ keys + token ──▶ addKey (register)
//!                                                           │
//!                                                           ▼
//!  port consumers ◀── bindPort (keepalive) ◀── getSignature (assignment)
//! ```
//!
//! Every step is a single attempt. The [`SessionStore`] keeps what has been
//! obtained so far, so the next invocation can resume: a refresh binds the
//! stored assignment again instead of asking for a new one, which would
//! likely change the port.

mod consumer;
mod error;
mod keys;
mod manager;
mod portforward;
mod probe;
mod region;
mod session;
mod store;
mod token;
mod tunnel;

pub use consumer::{PortConsumer, confirm_port};
pub use error::{ProtocolError, STATUS_OK};
pub use keys::{KeyError, KeyGenerator, KeyPair, NativeKeyGenerator, PrivateKey, PublicKey, WgToolKeyGenerator};
pub use manager::{Credentials, ForwardOutcome, RegionSelector, SessionError, SessionManager};
pub use portforward::{BindStatus, PortAssignment, PortForwardManager, PortForwardState};
pub use probe::{IcmpProbe, LatencyProbe, ProbeConfig};
pub use region::{
    DEFAULT_CATALOG_URL, Region, RegionCatalog, RegionError, Server, ServiceKind, find_by_id,
    select_best, sort_by_latency,
};
pub use session::{NegotiatedParams, Session};
pub use store::{SessionStore, StoreError};
pub use token::{Token, TokenManager, DEFAULT_TOKEN_VALIDITY};
pub use tunnel::TunnelRegistrar;
