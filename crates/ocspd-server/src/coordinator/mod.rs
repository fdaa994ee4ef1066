//! Per-request entry point
//!
//! [`RequestCoordinator::lookup`] answers from the cache when it can and
//! otherwise walks the candidate URLs, registering each in the
//! [`InFlightSet`] so that concurrent requests for the same resource share
//! one fetch. Fetches run as spawned tasks: a caller that stops waiting
//! (CRL wait ceiling) does not cancel the fetch, which still populates the
//! cache when it completes.

pub mod activity;
pub mod inflight;

pub use activity::{ActivityGuard, ActivityTracker};
pub use inflight::{FlightResult, FlightTicket, InFlightSet, PendingFetch, Registration};

use crate::config::Config;
use crate::fetch::{canonical_url, FetchError, FetchTarget, Fetcher};
use crate::store::{CacheKey, ResponseCache, StoreError};
use chrono::{DateTime, Utc};
use ocspd_proto::{ArtifactKind, CrlVerifier};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lookup failures, as reported to callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("bad URI: {0}")]
    BadUri(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("coordinator is shutting down")]
    Unavailable,
}

/// Stable wire code of a [`LookupError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SignatureInvalid,
    MalformedPayload,
    NetworkFailure,
    Timeout,
    BadUri,
    BadRequest,
    NotFound,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SignatureInvalid => "signature_invalid",
            ErrorCode::MalformedPayload => "malformed_payload",
            ErrorCode::NetworkFailure => "network_failure",
            ErrorCode::Timeout => "timeout",
            ErrorCode::BadUri => "bad_uri",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unavailable => "unavailable",
        }
    }
}

impl LookupError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LookupError::SignatureInvalid(_) => ErrorCode::SignatureInvalid,
            LookupError::MalformedPayload(_) => ErrorCode::MalformedPayload,
            LookupError::NetworkFailure(_) => ErrorCode::NetworkFailure,
            LookupError::Timeout(_) => ErrorCode::Timeout,
            LookupError::BadUri(_) => ErrorCode::BadUri,
            LookupError::BadRequest(_) => ErrorCode::BadRequest,
            LookupError::NotFound(_) => ErrorCode::NotFound,
            LookupError::Unavailable => ErrorCode::Unavailable,
        }
    }

    /// Precedence when several candidates failed; highest is reported
    fn severity(&self) -> u8 {
        match self {
            LookupError::SignatureInvalid(_) => 6,
            LookupError::MalformedPayload(_) => 5,
            LookupError::NetworkFailure(_) | LookupError::Timeout(_) => 4,
            LookupError::BadUri(_) | LookupError::BadRequest(_) => 3,
            LookupError::NotFound(_) => 2,
            LookupError::Unavailable => 1,
        }
    }

    /// Most severe of `errors`, the earliest on ties
    pub fn aggregate(errors: Vec<LookupError>) -> LookupError {
        let mut worst: Option<LookupError> = None;
        for err in errors {
            match &worst {
                Some(w) if w.severity() >= err.severity() => {}
                _ => worst = Some(err),
            }
        }
        worst.unwrap_or_else(|| LookupError::NotFound("no candidate URLs".to_string()))
    }
}

impl From<FetchError> for LookupError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::BadUri(m) => LookupError::BadUri(m),
            FetchError::BadRequest(m) => LookupError::BadRequest(m),
            FetchError::NotFound(m) => LookupError::NotFound(m),
            FetchError::NetworkFailure(m) => LookupError::NetworkFailure(m),
            FetchError::Timeout(m) => LookupError::Timeout(m),
            e @ (FetchError::EmptyResponse(_) | FetchError::TooLarge { .. }) => {
                LookupError::MalformedPayload(e.to_string())
            }
        }
    }
}

/// One revocation-data request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub kind: ArtifactKind,
    /// Cache identity; empty disables the cache read
    pub identity: Vec<u8>,
    pub candidate_urls: Vec<String>,
    /// Tried before every candidate
    pub local_responder_url: Option<String>,
    pub cache_read: bool,
    pub cache_write: bool,
    /// Validity reference time for the cache read (default: now)
    pub verify_time: Option<DateTime<Utc>>,
    /// Pre-encoded OCSP request
    pub request_body: Option<Vec<u8>>,
    /// PEM issuer chain stored next to the fetched record
    pub issuer_chain_pem: Option<Vec<u8>>,
}

impl LookupRequest {
    pub fn new(kind: ArtifactKind, identity: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            identity: identity.into(),
            candidate_urls: Vec::new(),
            local_responder_url: None,
            cache_read: true,
            cache_write: true,
            verify_time: None,
            request_body: None,
            issuer_chain_pem: None,
        }
    }

    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidate_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_local_responder(mut self, url: impl Into<String>) -> Self {
        self.local_responder_url = Some(url.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.request_body = Some(body);
        self
    }

    pub fn with_issuer_chain(mut self, chain_pem: Vec<u8>) -> Self {
        self.issuer_chain_pem = Some(chain_pem);
        self
    }

    pub fn at(mut self, verify_time: DateTime<Utc>) -> Self {
        self.verify_time = Some(verify_time);
        self
    }

    pub fn cache_read(mut self, enabled: bool) -> Self {
        self.cache_read = enabled;
        self
    }

    pub fn cache_write(mut self, enabled: bool) -> Self {
        self.cache_write = enabled;
        self
    }

    /// Local responder first, then candidates, without repeated dedup keys
    fn urls(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut urls = Vec::new();
        for url in self.local_responder_url.iter().chain(self.candidate_urls.iter()) {
            let key = dedup_key(self.kind, url, self.request_body.as_deref());
            if !seen.contains(&key) {
                seen.push(key);
                urls.push(url.clone());
            }
        }
        urls
    }
}

/// Where a lookup's payload came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Cache,
    Network(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResponse {
    pub payload: Arc<Vec<u8>>,
    pub origin: Origin,
}

/// Key identifying one fetch for deduplication
///
/// CRLs and certificates dedup on the canonical URL. An OCSP responder
/// serves many certificates from one URL, so OCSP dedups on
/// `SHA-1(canonical URL || request body)`.
pub fn dedup_key(kind: ArtifactKind, url: &str, body: Option<&[u8]>) -> String {
    let canonical = canonical_url(url);
    match kind {
        ArtifactKind::Ocsp => {
            let mut hasher = Sha1::new();
            hasher.update(canonical.as_bytes());
            hasher.update(body.unwrap_or_default());
            format!("{}:{}", kind, hex::encode(hasher.finalize()))
        }
        _ => format!("{}:{}", kind, canonical),
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_concurrent_requests: usize,
    /// How long a CRL lookup waits on one fetch
    pub crl_wait_ceiling: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 64,
            crl_wait_ceiling: Duration::from_secs(3),
        }
    }
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_requests: config.max_concurrent_requests,
            crl_wait_ceiling: config.crl_wait_ceiling(),
        }
    }
}

pub struct RequestCoordinator {
    cache: Arc<ResponseCache>,
    fetcher: Arc<dyn Fetcher>,
    verifier: Option<Arc<dyn CrlVerifier>>,
    inflight: InFlightSet,
    activity: Arc<ActivityTracker>,
    permits: Semaphore,
    crl_wait_ceiling: Duration,
}

impl RequestCoordinator {
    pub fn new(
        cache: Arc<ResponseCache>,
        fetcher: Arc<dyn Fetcher>,
        activity: Arc<ActivityTracker>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            cache,
            fetcher,
            verifier: None,
            inflight: InFlightSet::new(),
            activity,
            permits: Semaphore::new(settings.max_concurrent_requests.max(1)),
            crl_wait_ceiling: settings.crl_wait_ceiling,
        }
    }

    /// Reject fetched CRLs that fail signature or trust verification
    pub fn with_verifier(mut self, verifier: Arc<dyn CrlVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Stop admitting new lookups; queued ones fail with `Unavailable`
    pub fn close(&self) {
        self.permits.close();
    }

    /// Serve one request from the cache or the network
    pub async fn lookup(&self, request: LookupRequest) -> Result<LookupResponse, LookupError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LookupError::Unavailable)?;
        self.activity.touch();

        let result = self.lookup_inner(&request).await;
        self.activity.touch();
        result
    }

    async fn lookup_inner(&self, request: &LookupRequest) -> Result<LookupResponse, LookupError> {
        // 1. Cache
        if request.cache_read && request.kind.is_cacheable() && !request.identity.is_empty() {
            let as_of = request.verify_time.unwrap_or_else(Utc::now);
            let key = CacheKey::new(request.kind).with_identity(request.identity.clone());
            match self.cache.blocking(move |c| Ok(c.lookup(&key, as_of))).await {
                Ok(Some(payload)) => {
                    debug!(kind = %request.kind, "Served from cache");
                    return Ok(LookupResponse {
                        payload: Arc::new(payload),
                        origin: Origin::Cache,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(kind = %request.kind, error = %e, "Cache read failed, treating as miss")
                }
            }
        }

        // 2. Network: local responder first, then candidates in order.
        // CRL lookups share one wait deadline across every candidate.
        let deadline = (request.kind == ArtifactKind::Crl)
            .then(|| Instant::now() + self.crl_wait_ceiling);
        let mut errors: Vec<LookupError> = Vec::new();
        let mut joined: Vec<(String, PendingFetch)> = Vec::new();

        for url in request.urls() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(self.ceiling_exceeded(request, &url));
            }
            let key = dedup_key(request.kind, &url, request.request_body.as_deref());
            match self.inflight.try_register(&key) {
                Registration::Registered(ticket) => {
                    let pending = self.spawn_fetch(ticket, request, &url);
                    match Self::await_flight(pending, deadline).await {
                        Some(Ok(payload)) => {
                            return Ok(LookupResponse {
                                payload,
                                origin: Origin::Network(url),
                            })
                        }
                        Some(Err(e)) => {
                            debug!(url = %url, error = %e, "Candidate failed");
                            errors.push(e);
                        }
                        None => return Err(self.ceiling_exceeded(request, &url)),
                    }
                }
                Registration::InFlight(pending) => {
                    debug!(url = %url, "Fetch already in flight, trying next candidate");
                    joined.push((url, pending));
                }
            }
        }

        // 3. Flights started by other requests
        for (url, pending) in joined {
            match Self::await_flight(pending, deadline).await {
                Some(Ok(payload)) => {
                    return Ok(LookupResponse {
                        payload,
                        origin: Origin::Network(url),
                    })
                }
                Some(Err(e)) => errors.push(e),
                None => return Err(self.ceiling_exceeded(request, &url)),
            }
        }

        let err = LookupError::aggregate(errors);
        info!(kind = %request.kind, code = err.code().as_str(), "Lookup failed");
        Err(err)
    }

    fn spawn_fetch(&self, ticket: FlightTicket, request: &LookupRequest, url: &str) -> PendingFetch {
        let pending = ticket.subscribe();
        let mut target = FetchTarget::new(url, request.kind);
        if let Some(body) = &request.request_body {
            target = target.with_body(body.clone());
        }

        let job = FetchJob {
            cache: Arc::clone(&self.cache),
            fetcher: Arc::clone(&self.fetcher),
            verifier: self.verifier.clone(),
            target,
            cache_write: request.cache_write,
            chain_pem: request.issuer_chain_pem.clone(),
        };
        let guard = self.activity.begin();
        tokio::spawn(async move {
            let _guard = guard;
            let result = job.run().await;
            ticket.complete(result);
        });
        pending
    }

    /// Wait for a flight, until `deadline` when one is set
    ///
    /// `None` means the deadline passed with the fetch still running; the
    /// fetch carries on detached.
    async fn await_flight(mut pending: PendingFetch, deadline: Option<Instant>) -> Option<FlightResult> {
        match deadline {
            Some(deadline) => pending.try_wait_until(deadline).await,
            None => Some(pending.wait().await),
        }
    }

    fn ceiling_exceeded(&self, request: &LookupRequest, url: &str) -> LookupError {
        info!(
            kind = %request.kind,
            url = %url,
            ceiling = ?self.crl_wait_ceiling,
            "CRL wait ceiling reached, leaving fetches to finish in the background"
        );
        LookupError::NetworkFailure(format!(
            "no CRL within {:?} (last candidate {})",
            self.crl_wait_ceiling, url
        ))
    }

    /// Whether a current CRL for `issuer` (optionally from `url`) is cached
    pub async fn crl_status(
        &self,
        issuer: &[u8],
        url: Option<&str>,
        as_of: DateTime<Utc>,
    ) -> bool {
        let mut key = CacheKey::new(ArtifactKind::Crl).with_identity(issuer.to_vec());
        if let Some(url) = url {
            key = key.with_url(url);
        }
        match self.cache.blocking(move |c| Ok(c.lookup(&key, as_of))).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(error = %e, "CRL status read failed");
                false
            }
        }
    }

    /// Fetch a certificate from the first URL that serves one; never cached
    pub async fn fetch_certificate(&self, urls: &[String]) -> Result<LookupResponse, LookupError> {
        let request = LookupRequest::new(ArtifactKind::Certificate, Vec::new())
            .with_urls(urls.iter().cloned())
            .cache_read(false)
            .cache_write(false);
        self.lookup(request).await
    }

    /// Delete cached records matching `key`
    pub async fn flush(&self, key: &CacheKey) -> Result<usize, StoreError> {
        let target = key.clone();
        let removed = self.cache.blocking(move |c| c.delete(&target)).await?;
        info!(kind = %key.kind, removed = removed, "Flushed cache entries");
        Ok(removed)
    }
}

/// Everything a detached fetch task needs
struct FetchJob {
    cache: Arc<ResponseCache>,
    fetcher: Arc<dyn Fetcher>,
    verifier: Option<Arc<dyn CrlVerifier>>,
    target: FetchTarget,
    cache_write: bool,
    chain_pem: Option<Vec<u8>>,
}

impl FetchJob {
    async fn run(self) -> FlightResult {
        let payload = self.fetcher.fetch(&self.target).await?;

        if self.target.kind == ArtifactKind::Crl {
            if let Some(verifier) = &self.verifier {
                let outcome = verifier.verify(&payload, Utc::now());
                if outcome.is_integrity_failure() {
                    warn!(url = %self.target.url, outcome = %outcome, "Fetched CRL rejected");
                    return Err(LookupError::SignatureInvalid(format!(
                        "{}: {}",
                        self.target.url, outcome
                    )));
                }
            }
        }

        let payload = Arc::new(payload);
        if self.cache_write && self.target.kind.is_cacheable() {
            let (kind, url) = (self.target.kind, self.target.url.clone());
            let (stored, chain) = (Arc::clone(&payload), self.chain_pem);
            let written = self
                .cache
                .blocking(move |c| {
                    c.insert_with_chain(kind, &stored, Some(url.as_str()), chain.as_deref())
                })
                .await;
            match written {
                Ok(outcome) => debug!(url = %self.target.url, outcome = ?outcome, "Cached fetch result"),
                Err(StoreError::MalformedPayload(e)) => {
                    warn!(url = %self.target.url, error = %e, "Fetched payload is malformed");
                    return Err(LookupError::MalformedPayload(format!(
                        "{}: {}",
                        self.target.url, e
                    )));
                }
                Err(e) => warn!(url = %self.target.url, error = %e, "Cache write failed"),
            }
        }

        Ok(payload)
    }
}
