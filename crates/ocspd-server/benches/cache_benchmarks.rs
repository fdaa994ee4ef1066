use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ocspd_proto::fixture::CrlBuilder;
use ocspd_proto::{derive_cache_attributes, ArtifactKind, X509AttributeExtractor};
use ocspd_server::coordinator::dedup_key;
use ocspd_server::{CacheKey, ResponseCache};
use std::sync::Arc;

fn build_crl(issuer: &str, revoked: usize) -> Vec<u8> {
    let now = Utc::now();
    let mut builder = CrlBuilder::new(issuer)
        .this_update_at(now - Duration::days(1))
        .next_update_at(now + Duration::days(7));
    for serial in 0..revoked as u32 {
        builder = builder.revoke(&(serial + 1).to_be_bytes());
    }
    builder.build()
}

fn bench_derive_attributes(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive_crl_attributes");

    for revoked in [0, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(revoked), revoked, |b, &revoked| {
            let crl = build_crl("Bench CA", revoked);
            b.iter(|| derive_cache_attributes(ArtifactKind::Crl, black_box(&crl)).unwrap());
        });
    }

    group.finish();
}

fn bench_cache_insert(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let cache = ResponseCache::new(dir.path(), Arc::new(X509AttributeExtractor));
    let crls: Vec<Vec<u8>> = (0..64).map(|i| build_crl(&format!("Bench CA {}", i), 10)).collect();

    let mut i = 0usize;
    c.bench_function("cache_insert_crl", |b| {
        b.iter(|| {
            let crl = &crls[i % crls.len()];
            i += 1;
            cache
                .insert(ArtifactKind::Crl, black_box(crl), Some("http://crl.example/bench.crl"))
                .unwrap()
        });
    });
}

fn bench_cache_lookup(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let cache = ResponseCache::new(dir.path(), Arc::new(X509AttributeExtractor));
    let crl = build_crl("Lookup CA", 100);
    cache
        .insert(ArtifactKind::Crl, &crl, Some("http://crl.example/lookup.crl"))
        .unwrap();
    let key = CacheKey::new(ArtifactKind::Crl)
        .with_identity(CrlBuilder::new("Lookup CA").issuer_name_der());

    c.bench_function("cache_lookup_crl_hit", |b| {
        b.iter(|| cache.lookup(black_box(&key), Utc::now()).unwrap());
    });

    let miss = CacheKey::new(ArtifactKind::Crl).with_identity(b"unknown issuer".to_vec());
    c.bench_function("cache_lookup_crl_miss", |b| {
        b.iter(|| cache.lookup(black_box(&miss), Utc::now()));
    });
}

fn bench_dedup_key(c: &mut Criterion) {
    let body = vec![0x30u8; 120];

    c.bench_function("dedup_key_crl", |b| {
        b.iter(|| dedup_key(ArtifactKind::Crl, black_box("HTTP://CRL.Example:80/ca.crl"), None));
    });
    c.bench_function("dedup_key_ocsp", |b| {
        b.iter(|| dedup_key(ArtifactKind::Ocsp, black_box("http://ocsp.example/"), Some(&body)));
    });
}

criterion_group!(
    benches,
    bench_derive_attributes,
    bench_cache_insert,
    bench_cache_lookup,
    bench_dedup_key
);
criterion_main!(benches);
