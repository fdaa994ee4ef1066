//! Shared helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ocspd_proto::fixture::CrlBuilder;
use ocspd_proto::X509AttributeExtractor;
use ocspd_server::coordinator::{ActivityTracker, CoordinatorSettings};
use ocspd_server::{FetchError, FetchTarget, Fetcher, RequestCoordinator, ResponseCache};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fetcher that serves canned responses and counts calls per URL
#[derive(Default)]
pub struct CountingFetcher {
    responses: Mutex<HashMap<String, Result<Vec<u8>, FetchError>>>,
    calls: Mutex<Vec<String>>,
    total: AtomicUsize,
    delay: Duration,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn respond(&self, url: &str, result: Result<Vec<u8>, FetchError>) {
        self.responses.lock().unwrap().insert(url.to_string(), result);
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<u8>, FetchError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(target.url.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let response = self.responses.lock().unwrap().get(&target.url).cloned();
        response.unwrap_or_else(|| Err(FetchError::NotFound(target.url.clone())))
    }
}

pub fn cache_in(dir: &Path) -> Arc<ResponseCache> {
    Arc::new(ResponseCache::new(dir, Arc::new(X509AttributeExtractor)))
}

pub fn coordinator(
    cache: &Arc<ResponseCache>,
    fetcher: &Arc<CountingFetcher>,
    crl_wait_ceiling: Duration,
) -> RequestCoordinator {
    RequestCoordinator::new(
        Arc::clone(cache),
        fetcher.clone(),
        ActivityTracker::new(),
        CoordinatorSettings {
            crl_wait_ceiling,
            ..CoordinatorSettings::default()
        },
    )
}

/// Current time at whole-second precision, as DER times carry it
pub fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap()
}

pub fn days(n: i64) -> chrono::Duration {
    chrono::Duration::days(n)
}

/// DER CRL for `issuer` expiring at `next`, issued a day before the
/// earlier of `next` and now
pub fn crl(issuer: &str, next: DateTime<Utc>) -> Vec<u8> {
    CrlBuilder::new(issuer)
        .this_update_at(next.min(now()) - days(1))
        .next_update_at(next)
        .build()
}

pub fn issuer_identity(issuer: &str) -> Vec<u8> {
    CrlBuilder::new(issuer).issuer_name_der()
}
