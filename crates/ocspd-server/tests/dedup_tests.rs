//! Concurrent lookups for the same resource share one fetch

mod common;

use common::{cache_in, coordinator, crl, days, issuer_identity, now, CountingFetcher};
use ocspd_proto::ArtifactKind;
use ocspd_server::{FetchError, LookupError, LookupRequest, Origin};
use std::sync::Arc;
use std::time::Duration;

const ISSUER: &str = "Dedup Test CA";
const URL: &str = "http://crl.example/dedup.crl";
const OCSP_URL: &str = "http://ocsp.example/";

#[tokio::test]
async fn test_concurrent_crl_lookups_fetch_once() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let payload = crl(ISSUER, now() + days(7));
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(300)));
    fetcher.respond(URL, Ok(payload.clone()));
    let coordinator = Arc::new(coordinator(&cache, &fetcher, Duration::from_secs(5)));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move {
            coordinator
                .lookup(LookupRequest::new(ArtifactKind::Crl, issuer_identity(ISSUER)).with_urls([URL]))
                .await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.payload.as_slice(), payload.as_slice());
    }
    assert_eq!(fetcher.total(), 1);
    assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test]
async fn test_ocsp_requests_with_different_bodies_fetch_separately() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(100)));
    fetcher.respond(OCSP_URL, Err(FetchError::NotFound(OCSP_URL.to_string())));
    let coordinator = Arc::new(coordinator(&cache, &fetcher, Duration::from_secs(5)));

    let lookup = |body: &'static [u8]| {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .lookup(
                    LookupRequest::new(ArtifactKind::Ocsp, body.to_vec())
                        .with_urls([OCSP_URL])
                        .with_body(body.to_vec()),
                )
                .await
        })
    };
    let first = lookup(b"request-one");
    let second = lookup(b"request-two");

    assert!(first.await.unwrap().is_err());
    assert!(second.await.unwrap().is_err());
    assert_eq!(fetcher.total(), 2);
}

#[tokio::test]
async fn test_failed_fetch_releases_marker() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let fetcher = Arc::new(CountingFetcher::new());
    fetcher.respond(URL, Err(FetchError::Timeout(URL.to_string())));
    let coordinator = coordinator(&cache, &fetcher, Duration::from_secs(5));
    let request = || LookupRequest::new(ArtifactKind::Crl, issuer_identity(ISSUER)).with_urls([URL]);

    let err = coordinator.lookup(request()).await.unwrap_err();
    assert!(matches!(err, LookupError::Timeout(_)));
    assert_eq!(coordinator.in_flight_count(), 0);

    // A later lookup starts a fresh fetch instead of joining a dead one
    fetcher.respond(URL, Ok(crl(ISSUER, now() + days(7))));
    let response = coordinator.lookup(request()).await.unwrap();
    assert_eq!(response.origin, Origin::Network(URL.to_string()));
    assert_eq!(fetcher.total(), 2);
}

#[tokio::test]
async fn test_slow_crl_fetch_detached_and_cached() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(400)));
    fetcher.respond(URL, Ok(crl(ISSUER, now() + days(7))));
    let coordinator = coordinator(&cache, &fetcher, Duration::from_millis(50));

    let err = coordinator
        .lookup(LookupRequest::new(ArtifactKind::Crl, issuer_identity(ISSUER)).with_urls([URL]))
        .await
        .unwrap_err();
    assert!(matches!(err, LookupError::NetworkFailure(_)));

    // The fetch keeps running after the caller gave up
    tokio::time::timeout(Duration::from_secs(3), async {
        while cache.stats().crl_records == 0 || coordinator.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("detached fetch populated the cache");
    assert_eq!(coordinator.in_flight_count(), 0);
    assert_eq!(fetcher.total(), 1);
}

#[tokio::test]
async fn test_crl_wait_ceiling_spans_all_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(400)));
    let urls = [
        "http://crl-a.example/ca.crl",
        "http://crl-b.example/ca.crl",
        "http://crl-c.example/ca.crl",
    ];
    for url in urls {
        fetcher.respond(url, Ok(crl(ISSUER, now() + days(7))));
    }
    let coordinator = coordinator(&cache, &fetcher, Duration::from_millis(100));

    let started = std::time::Instant::now();
    let err = coordinator
        .lookup(LookupRequest::new(ArtifactKind::Crl, issuer_identity(ISSUER)).with_urls(urls))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, LookupError::NetworkFailure(_)));
    assert!(elapsed < Duration::from_millis(250), "waited {:?}", elapsed);
    assert_eq!(fetcher.total(), 1);
    assert_eq!(fetcher.calls_for(urls[0]), 1);
    assert_eq!(coordinator.in_flight_count(), 1);

    tokio::time::timeout(Duration::from_secs(3), async {
        while cache.stats().crl_records == 0 || coordinator.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("first candidate still cached after the caller gave up");
    assert_eq!(fetcher.total(), 1);
}
