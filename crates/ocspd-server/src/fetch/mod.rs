//! Network retrieval of revocation artifacts
//!
//! A [`Fetcher`] retrieves the bytes behind one URL. It performs no
//! semantic validation beyond requiring a non-empty body, and it never
//! retries: that policy belongs to the caller, which can use
//! [`FetchError::is_retryable`] to decide whether to move on.
//!
//! # Scheme dispatch
//!
//! | Scheme            | Transport                                              |
//! |-------------------|--------------------------------------------------------|
//! | `http`, `https`   | GET (CRL, certificate) or POST `application/ocsp-request` (OCSP) |
//! | `ldap`, `ldaps`   | RFC 4516 directory search, exactly one value           |
//! | anything else     | [`FetchError::BadUri`]                                  |

pub mod http;
pub mod ldap;

pub use http::HttpFetcher;
pub use ldap::{LdapFetcher, LdapUrl};

use crate::config::FetchConfig;
use async_trait::async_trait;
use ocspd_proto::ArtifactKind;
use reqwest::Url;
use thiserror::Error;
use tracing::debug;

/// One resource to retrieve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub url: String,
    pub kind: ArtifactKind,
    /// Pre-encoded OCSP request (POSTed as-is)
    pub body: Option<Vec<u8>>,
}

impl FetchTarget {
    pub fn new(url: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            url: url.into(),
            kind,
            body: None,
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// Network retrieval errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// URL unparseable or scheme unsupported
    #[error("bad URI: {0}")]
    BadUri(String),

    /// Request cannot be made or was refused as malformed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Resource absent (HTTP 404/410, no or ambiguous LDAP match)
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection failure or server-side error
    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("empty response from {0}")]
    EmptyResponse(String),

    #[error("response of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
}

impl FetchError {
    /// Transient failures where another attempt (or URL) may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::NetworkFailure(_) | FetchError::Timeout(_))
    }
}

/// Retrieves the bytes behind a single URL
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<u8>, FetchError>;
}

/// URL schemes the daemon can fetch from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Ldap,
}

/// Parse and classify a URL; unsupported schemes are [`FetchError::BadUri`]
pub fn parse_url(url: &str) -> Result<(Url, Scheme), FetchError> {
    let parsed = Url::parse(url.trim()).map_err(|e| FetchError::BadUri(format!("{}: {}", url, e)))?;
    let scheme = match parsed.scheme() {
        "http" | "https" => Scheme::Http,
        "ldap" | "ldaps" => Scheme::Ldap,
        other => return Err(FetchError::BadUri(format!("unsupported scheme '{}'", other))),
    };
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(FetchError::BadUri(format!("{}: missing host", url)));
    }
    Ok((parsed, scheme))
}

/// Canonical text form of a URL, used for deduplication
///
/// Scheme and host are lower-cased by the URL parser, default ports are
/// dropped; unparseable input is returned trimmed.
pub fn canonical_url(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => url.trim().to_string(),
    }
}

/// Production fetcher dispatching on URL scheme
#[derive(Debug, Clone)]
pub struct NetworkFetcher {
    http: HttpFetcher,
    ldap: LdapFetcher,
}

impl NetworkFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            ldap: LdapFetcher::new(config),
        })
    }
}

#[async_trait]
impl Fetcher for NetworkFetcher {
    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<u8>, FetchError> {
        let (url, scheme) = parse_url(&target.url)?;
        debug!(url = %url, kind = %target.kind, "Fetching");

        match (scheme, target.kind) {
            (Scheme::Http, ArtifactKind::Ocsp) => {
                let body = target.body.as_deref().ok_or_else(|| {
                    FetchError::BadRequest("OCSP fetch requires a request body".to_string())
                })?;
                self.http.post_ocsp(&url, body).await
            }
            (Scheme::Http, _) => self.http.get(&url).await,
            (Scheme::Ldap, ArtifactKind::Ocsp) => Err(FetchError::BadUri(format!(
                "OCSP is not served over LDAP: {}",
                url
            ))),
            (Scheme::Ldap, kind) => {
                let ldap_url = LdapUrl::parse(&url, kind)?;
                self.ldap.search(&ldap_url).await
            }
        }
    }
}

/// Scripted fetcher for unit tests
#[cfg(test)]
pub(crate) mod mock {
    use super::{FetchError, FetchTarget, Fetcher};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub struct MockFetcher {
        responses: Mutex<HashMap<String, Result<Vec<u8>, FetchError>>>,
        calls: Mutex<Vec<String>>,
        count: AtomicUsize,
        delay: Option<Duration>,
    }

    impl MockFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn respond(&self, url: &str, result: Result<Vec<u8>, FetchError>) {
            self.responses.lock().unwrap().insert(url.to_string(), result);
        }

        pub fn call_count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, target: &FetchTarget) -> Result<Vec<u8>, FetchError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(target.url.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let response = self.responses.lock().unwrap().get(&target.url).cloned();
            response.unwrap_or_else(|| Err(FetchError::NotFound(target.url.clone())))
        }
    }
}
