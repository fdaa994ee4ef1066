//! Admin and lookup HTTP surface
//!
//! | Route                 | Purpose                                          |
//! |-----------------------|--------------------------------------------------|
//! | `GET /health`         | store counts, in-flight fetches, sweeper state   |
//! | `POST /v1/lookup`     | serve one request; raw payload on success        |
//! | `GET /v1/crl-status`  | cache-only check for a current CRL               |
//! | `POST /v1/flush`      | delete cached records by kind/identity/URL       |
//! | `POST /v1/sweep`      | run a sweep now (409 while one is running)       |
//!
//! Binary values (identities, OCSP request bodies) travel as hex strings.

use crate::coordinator::{ErrorCode, LookupError, LookupRequest, Origin, RequestCoordinator};
use crate::store::{CacheKey, CacheStats};
use crate::sweeper::{PeriodicSweeper, SweepError, SweeperState};
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ocspd_proto::ArtifactKind;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Response header naming where a lookup payload came from
pub const ORIGIN_HEADER: &str = "x-ocspd-origin";

#[derive(Clone)]
pub struct AdminState {
    coordinator: Arc<RequestCoordinator>,
    sweeper: Arc<PeriodicSweeper>,
}

impl AdminState {
    pub fn new(coordinator: Arc<RequestCoordinator>, sweeper: Arc<PeriodicSweeper>) -> Self {
        Self {
            coordinator,
            sweeper,
        }
    }

    fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "healthy".to_string(),
            cache: self.coordinator.cache().stats(),
            in_flight: self.coordinator.in_flight_count(),
            active_fetches: self.coordinator.activity().active_count(),
            idle_secs: self.coordinator.activity().idle_for().as_secs(),
            sweeper: self.sweeper.state(),
            last_sweep: self.sweeper.last_report().map(|r| r.finished_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub cache: CacheStats,
    pub in_flight: usize,
    pub active_fetches: usize,
    pub idle_secs: u64,
    pub sweeper: SweeperState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sweep: Option<DateTime<Utc>>,
}

/// Wire form of a lookup failure
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                code: ErrorCode::BadRequest,
                message: message.into(),
            },
        }
    }
}

impl From<LookupError> for ApiError {
    fn from(e: LookupError) -> Self {
        let status = match e.code() {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::BadUri | ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::SignatureInvalid
            | ErrorCode::MalformedPayload
            | ErrorCode::NetworkFailure => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            body: ErrorBody {
                code: e.code(),
                message: e.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct LookupBody {
    pub kind: ArtifactKind,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub local_responder_url: Option<String>,
    #[serde(default = "default_true")]
    pub cache_read: bool,
    #[serde(default = "default_true")]
    pub cache_write: bool,
    #[serde(default)]
    pub verify_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request_body: Option<String>,
    /// PEM issuer chain kept next to the cached record
    #[serde(default)]
    pub issuer_chain_pem: Option<String>,
}

impl LookupBody {
    fn into_request(self) -> Result<LookupRequest, ApiError> {
        let identity = decode_hex("identity", self.identity.as_deref())?.unwrap_or_default();
        let mut request = LookupRequest::new(self.kind, identity)
            .with_urls(self.urls)
            .cache_read(self.cache_read)
            .cache_write(self.cache_write);
        if let Some(url) = self.local_responder_url {
            request = request.with_local_responder(url);
        }
        if let Some(at) = self.verify_time {
            request = request.at(at);
        }
        if let Some(body) = decode_hex("request_body", self.request_body.as_deref())? {
            request = request.with_body(body);
        }
        if let Some(chain) = self.issuer_chain_pem {
            request = request.with_issuer_chain(chain.into_bytes());
        }
        Ok(request)
    }
}

fn decode_hex(field: &str, value: Option<&str>) -> Result<Option<Vec<u8>>, ApiError> {
    value
        .map(|v| hex::decode(v).map_err(|e| ApiError::bad_request(format!("{}: {}", field, e))))
        .transpose()
}

#[derive(Debug, Deserialize)]
pub struct CrlStatusQuery {
    pub issuer: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CrlStatus {
    pub current: bool,
}

#[derive(Debug, Deserialize)]
pub struct FlushBody {
    pub kind: ArtifactKind,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlushResult {
    pub removed: usize,
}

async fn health_handler(State(state): State<AdminState>) -> Json<HealthStatus> {
    Json(state.health())
}

async fn lookup_handler(
    State(state): State<AdminState>,
    Json(body): Json<LookupBody>,
) -> Result<Response, ApiError> {
    let request = body.into_request()?;
    let response = state.coordinator.lookup(request).await?;

    let origin = match &response.origin {
        Origin::Cache => "cache".to_string(),
        Origin::Network(url) => url.clone(),
    };
    let origin = HeaderValue::from_str(&origin).unwrap_or(HeaderValue::from_static("network"));
    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (header::HeaderName::from_static(ORIGIN_HEADER), origin),
        ],
        response.payload.as_ref().clone(),
    )
        .into_response())
}

async fn crl_status_handler(
    State(state): State<AdminState>,
    Query(query): Query<CrlStatusQuery>,
) -> Result<Json<CrlStatus>, ApiError> {
    let issuer = decode_hex("issuer", Some(&query.issuer))?.unwrap_or_default();
    let current = state
        .coordinator
        .crl_status(&issuer, query.url.as_deref(), Utc::now())
        .await;
    Ok(Json(CrlStatus { current }))
}

async fn flush_handler(
    State(state): State<AdminState>,
    Json(body): Json<FlushBody>,
) -> Result<Json<FlushResult>, ApiError> {
    let mut key = CacheKey::new(body.kind);
    if let Some(identity) = decode_hex("identity", body.identity.as_deref())? {
        key = key.with_identity(identity);
    }
    if let Some(url) = body.url {
        key = key.with_url(url);
    }
    let removed = state.coordinator.flush(&key).await.map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorBody {
            code: ErrorCode::Unavailable,
            message: e.to_string(),
        },
    })?;
    Ok(Json(FlushResult { removed }))
}

async fn sweep_handler(State(state): State<AdminState>) -> Response {
    match state.sweeper.trigger_now().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(SweepError::AlreadyRunning) => {
            (StatusCode::CONFLICT, "a sweep is already running").into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Build the admin router
pub fn create_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/lookup", post(lookup_handler))
        .route("/v1/crl-status", get(crl_status_handler))
        .route("/v1/flush", post(flush_handler))
        .route("/v1/sweep", post(sweep_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router on `addr` until `shutdown` resolves
pub async fn start_admin_server<F>(
    state: AdminState,
    addr: SocketAddr,
    shutdown: F,
) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admin server listening on {}", listener.local_addr()?);
    axum::serve(listener, create_admin_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
