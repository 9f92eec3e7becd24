//! TLS trust anchors
//!
//! Two process-wide client configurations, each built once on first use and
//! shared read-only afterwards. Tests can supply their own anchors.

use crate::client::HttpError;
use rustls::ClientConfig;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Root certificate of the provider's private CA
const PROVIDER_ROOT_PEM: &[u8] = include_bytes!("../certs/provider-root.pem");

static PROVIDER_PINNED: OnceLock<Result<Arc<ClientConfig>, HttpError>> = OnceLock::new();
static PUBLIC_ROOTS: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Which roots a server certificate is validated against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trust {
    /// Mozilla root program (via `webpki-roots`)
    PublicRoots,
    /// Only the provider root compiled into the binary
    ProviderPinned,
    #[cfg(test)]
    Anchors(Anchors),
}

/// Client configuration over an arbitrary root store
#[cfg(test)]
#[derive(Clone)]
pub struct Anchors(Arc<ClientConfig>);

#[cfg(test)]
impl Anchors {
    pub(crate) fn new(roots: rustls::RootCertStore) -> Self {
        Self(Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        ))
    }
}

#[cfg(test)]
impl std::fmt::Debug for Anchors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Anchors(..)")
    }
}

#[cfg(test)]
impl PartialEq for Anchors {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
impl Eq for Anchors {}

impl Trust {
    /// Shared client configuration for this trust mode
    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>, HttpError> {
        match self {
            Trust::PublicRoots => Ok(PUBLIC_ROOTS
                .get_or_init(|| {
                    let mut root_store = rustls::RootCertStore::empty();
                    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                    Arc::new(
                        ClientConfig::builder()
                            .with_root_certificates(root_store)
                            .with_no_client_auth(),
                    )
                })
                .clone()),
            Trust::ProviderPinned => PROVIDER_PINNED.get_or_init(build_pinned).clone(),
            #[cfg(test)]
            Trust::Anchors(anchors) => Ok(anchors.0.clone()),
        }
    }
}

fn build_pinned() -> Result<Arc<ClientConfig>, HttpError> {
    let cert = CertificateDer::from_pem_slice(PROVIDER_ROOT_PEM)
        .map_err(|e| HttpError::TlsError(format!("embedded root certificate: {e}")))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(cert)
        .map_err(|e| HttpError::TlsError(format!("embedded root certificate: {e}")))?;

    debug!("Provider root certificate loaded");
    Ok(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    ))
}
