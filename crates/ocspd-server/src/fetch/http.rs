//! HTTP(S) transport
//!
//! One pooled async `reqwest` client is reused for every request. CRLs and
//! certificates are fetched with GET; OCSP requests are POSTed with
//! `Content-Type: application/ocsp-request`.

use super::FetchError;
use crate::config::FetchConfig;
use reqwest::{Response, StatusCode, Url};
use tracing::debug;

const OCSP_REQUEST_CONTENT_TYPE: &str = "application/ocsp-request";
const OCSP_RESPONSE_CONTENT_TYPE: &str = "application/ocsp-response";

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_response_bytes: u64,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone());
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build().map_err(|e| {
            FetchError::NetworkFailure(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            max_response_bytes: config.max_response_bytes,
        })
    }

    pub async fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| map_transport_error(url, e))?;
        self.read_body(url, response).await
    }

    pub async fn post_ocsp(&self, url: &Url, body: &[u8]) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, OCSP_REQUEST_CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, OCSP_RESPONSE_CONTENT_TYPE)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| map_transport_error(url, e))?;
        self.read_body(url, response).await
    }

    /// Check the status, then read the body up to the size limit
    async fn read_body(&self, url: &Url, mut response: Response) -> Result<Vec<u8>, FetchError> {
        let status = response.status();
        if !status.is_success() {
            return Err(map_status(url, status));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_response_bytes {
                return Err(FetchError::TooLarge {
                    size: len,
                    limit: self.max_response_bytes,
                });
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| map_transport_error(url, e))?
        {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > self.max_response_bytes {
                return Err(FetchError::TooLarge {
                    size: body.len() as u64,
                    limit: self.max_response_bytes,
                });
            }
        }

        if body.is_empty() {
            return Err(FetchError::EmptyResponse(url.to_string()));
        }

        debug!(url = %url, bytes = body.len(), "HTTP fetch complete");
        Ok(body)
    }
}

fn map_status(url: &Url, status: StatusCode) -> FetchError {
    let detail = format!("{} returned HTTP {}", url, status);
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT => FetchError::Timeout(detail),
        s if s.is_client_error() => FetchError::BadRequest(detail),
        _ => FetchError::NetworkFailure(detail),
    }
}

fn map_transport_error(url: &Url, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(format!("{}: {}", url, e))
    } else if e.is_builder() {
        FetchError::BadRequest(format!("{}: {}", url, e))
    } else {
        FetchError::NetworkFailure(format!("{}: {}", url, e))
    }
}
