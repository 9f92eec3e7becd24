//! PIA Network Layer
//!
//! HTTPS transport for the provider's control plane.
//!
//! Provider endpoints are dialed by IP literal, so certificate validation
//! cannot rely on the address: every request carries the expected server
//! identity (the certificate common name from the region catalog) and is
//! checked against the provider's root certificate compiled into the binary.
//! The public server list is the one exception and uses the web PKI.

mod client;
mod request;
mod trust;

#[cfg(any(test, feature = "test-utils"))]
mod mock;

pub use client::{HttpClient, HttpClientConfig, HttpError, Response, Transport};
pub use request::{Method, Request, Scheme};
pub use trust::Trust;

pub use hyper::StatusCode;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockTransport, RecordedRequest};
