//! HTTP Client
//!
//! Uses hyper with tokio for HTTP/1.1 over plain TCP or rustls.
//! Features:
//! - Dialed address and certificate identity chosen independently
//! - One attempt per call, no retries
//! - Connect and overall response timeouts

use crate::request::{Request, Scheme};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST, HeaderMap, HeaderValue, USER_AGENT};
use hyper::StatusCode;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// HTTP client errors
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),
}

/// Something that can carry a [`Request`] to a server
///
/// The provider protocol is written against this trait so it can run over
/// the real client or a scripted one.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> impl Future<Output = Result<Response, HttpError>> + Send;
}

impl<T: Transport> Transport for &T {
    fn send(&self, request: Request) -> impl Future<Output = Result<Response, HttpError>> + Send {
        (**self).send(request)
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout (connect excluded)
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("pia-tools/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 4 * 1024 * 1024, // 4 MB, the server list is ~300 KB
        }
    }
}

/// HTTP response wrapper
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
    /// Total round-trip time
    pub total_time: Duration,
}

impl Response {
    /// Build a response from parts (used by scripted transports)
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            total_time: Duration::ZERO,
        }
    }

    /// Add a header (used by scripted transports)
    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }

    /// Get a header as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// Decode the first JSON value in the body
    ///
    /// Anything after that value is ignored: the server list appends a
    /// detached signature to its JSON document.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let mut values = serde_json::Deserializer::from_slice(&self.body).into_iter::<T>();
        match values.next() {
            Some(value) => value,
            None => serde_json::from_slice(&self.body),
        }
    }
}

/// HTTP client
pub struct HttpClient {
    /// Configuration
    config: HttpClientConfig,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(config: HttpClientConfig) -> Self {
        debug!(
            "HTTP client initialized (timeout: {:?}, connect timeout: {:?})",
            config.timeout, config.connect_timeout
        );
        Self { config }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// Perform a request, bounded by the configured timeouts
    pub async fn execute(&self, request: Request) -> Result<Response, HttpError> {
        let start = Instant::now();
        let addr = request.authority();

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((request.host.as_str(), request.port)),
        )
        .await
        .map_err(|_| HttpError::Timeout(self.config.connect_timeout))?
        .map_err(|e| HttpError::ConnectionFailed {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        let exchange = async {
            match request.scheme {
                Scheme::Https => {
                    let tls_config = request.trust.client_config()?;
                    let connector = TlsConnector::from(tls_config);
                    let server_name =
                        rustls::pki_types::ServerName::try_from(request.tls_identity().to_string())
                            .map_err(|_| {
                                HttpError::TlsError(format!(
                                    "Invalid server name {}",
                                    request.tls_identity()
                                ))
                            })?;

                    let tls_stream = connector
                        .connect(server_name, stream)
                        .await
                        .map_err(|e| HttpError::TlsError(e.to_string()))?;

                    self.exchange(tls_stream, &request).await
                }
                Scheme::Http => self.exchange(stream, &request).await,
            }
        };

        let (status, headers, body) = tokio::time::timeout(self.config.timeout, exchange)
            .await
            .map_err(|_| HttpError::Timeout(self.config.timeout))??;

        let total_time = start.elapsed();
        debug!(
            "HTTP {:?} {}{} -> {} ({} bytes, {:?})",
            request.method,
            addr,
            request.path,
            status,
            body.len(),
            total_time
        );

        Ok(Response {
            status,
            headers,
            body,
            total_time,
        })
    }

    async fn exchange<S>(
        &self,
        io: S,
        request: &Request,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>), HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = hyper_util::rt::TokioIo::new(io);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!("Connection error: {}", e);
            }
        });

        let mut builder = hyper::Request::builder()
            .method(request.method.as_hyper())
            .uri(request.path_and_query())
            .header(HOST, request.authority())
            .header(USER_AGENT, &self.config.user_agent);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = request.body.clone().unwrap_or_default();
        let outbound = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        let response = sender
            .send_request(outbound)
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();

        // Collect body with size limit
        let collected = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::BodyError(e.to_string()))?;

        Ok((status, headers, collected.to_bytes().to_vec()))
    }
}

impl Transport for HttpClient {
    fn send(&self, request: Request) -> impl Future<Output = Result<Response, HttpError>> + Send {
        self.execute(request)
    }
}
