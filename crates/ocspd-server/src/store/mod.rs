//! Persistent revocation cache
//!
//! [`ResponseCache`] owns two independent stores, one for OCSP responses and
//! one for CRLs, each behind its own mutex. Callers hand it raw payloads; the
//! cache derives identity and validity from the bytes itself through an
//! [`AttributeExtractor`] and never trusts caller-declared metadata.
//!
//! # Uniqueness
//!
//! A record is unique per **identity + source URL**. Inserting for an
//! existing pair either replaces the stored payload (newer or equal
//! thisUpdate) or reports [`InsertOutcome::AlreadyPresent`], which callers
//! treat as success.
//!
//! # Example
//!
//! ```no_run
//! use ocspd_server::store::{CacheKey, ResponseCache};
//! use ocspd_proto::{ArtifactKind, X509AttributeExtractor};
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! # fn example(crl: Vec<u8>, issuer: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let cache = ResponseCache::new("/var/db/ocspd", Arc::new(X509AttributeExtractor));
//! cache.insert(ArtifactKind::Crl, &crl, Some("http://ca.example/ca.crl"))?;
//!
//! let key = CacheKey::new(ArtifactKind::Crl).with_identity(issuer);
//! assert!(cache.lookup(&key, Utc::now()).is_some());
//! # Ok(())
//! # }
//! ```

mod disk;
pub mod layout;
pub mod record;

pub use layout::RecordId;
pub use record::{CacheKey, RecordMeta};

use chrono::{DateTime, Utc};
use disk::RecordStore;
use ocspd_proto::{ArtifactKind, AttributeExtractor, NextUpdate, ParseError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Default ceiling on stored payload size (10 MiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Errors raised by the revocation cache
#[derive(Error, Debug)]
pub enum StoreError {
    /// Payload could not be parsed into cache attributes
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] ParseError),

    /// Derived metadata could not be serialised
    #[error("metadata serialization failed: {0}")]
    Serialization(serde_json::Error),

    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("{0} artifacts are not cached")]
    NotCacheable(ArtifactKind),

    #[error("cannot open store at {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("record {0} not found")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A store operation on the blocking pool panicked or was cancelled
    #[error("store task failed: {0}")]
    Task(String),
}

/// Result of a successful insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    /// Same identity and source, different bytes, not older
    Replaced,
    /// Byte-identical, or the stored record is newer
    AlreadyPresent,
}

/// Record counts per store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub ocsp_records: usize,
    pub crl_records: usize,
}

/// Attribute-queryable persistent cache of OCSP responses and CRLs
pub struct ResponseCache {
    ocsp: RecordStore,
    crl: RecordStore,
    extractor: Arc<dyn AttributeExtractor>,
    max_payload_bytes: u64,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ocsp", &self.ocsp.root())
            .field("crl", &self.crl.root())
            .field("max_payload_bytes", &self.max_payload_bytes)
            .finish()
    }
}

impl ResponseCache {
    /// Create a cache rooted at `cache_dir`
    ///
    /// Nothing is touched on disk until the first write.
    pub fn new(cache_dir: impl AsRef<Path>, extractor: Arc<dyn AttributeExtractor>) -> Self {
        let dir = cache_dir.as_ref();
        Self {
            ocsp: RecordStore::new(ArtifactKind::Ocsp, dir),
            crl: RecordStore::new(ArtifactKind::Crl, dir),
            extractor,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_max_payload_bytes(mut self, limit: u64) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    fn store(&self, kind: ArtifactKind) -> Option<&RecordStore> {
        match kind {
            ArtifactKind::Ocsp => Some(&self.ocsp),
            ArtifactKind::Crl => Some(&self.crl),
            ArtifactKind::Certificate => None,
        }
    }

    /// Payload of the best record valid at `as_of`
    ///
    /// Expired matches are a miss and stay on disk. Among several valid
    /// records the latest thisUpdate wins.
    pub fn lookup(&self, key: &CacheKey, as_of: DateTime<Utc>) -> Option<Vec<u8>> {
        let hit = self.store(key.kind)?.lookup(key, as_of);
        debug!(kind = %key.kind, hit = hit.is_some(), "Cache lookup");
        hit
    }

    /// Parse and store `payload`
    pub fn insert(
        &self,
        kind: ArtifactKind,
        payload: &[u8],
        source_url: Option<&str>,
    ) -> Result<InsertOutcome, StoreError> {
        self.insert_with_chain(kind, payload, source_url, None)
    }

    /// Like [`ResponseCache::insert`], also storing the issuer chain (PEM)
    pub fn insert_with_chain(
        &self,
        kind: ArtifactKind,
        payload: &[u8],
        source_url: Option<&str>,
        chain_pem: Option<&[u8]>,
    ) -> Result<InsertOutcome, StoreError> {
        let store = self.store(kind).ok_or(StoreError::NotCacheable(kind))?;

        let size = payload.len() as u64;
        if size > self.max_payload_bytes {
            return Err(StoreError::PayloadTooLarge {
                size,
                limit: self.max_payload_bytes,
            });
        }

        let attrs = self.extractor.derive(kind, payload)?;
        if attrs.kind != kind {
            return Err(StoreError::MalformedPayload(ParseError::Field("kind")));
        }
        store.insert(&attrs, payload, source_url, chain_pem)
    }

    /// Delete every record matching `key`; returns how many went
    pub fn delete(&self, key: &CacheKey) -> Result<usize, StoreError> {
        match self.store(key.kind) {
            Some(store) => store.delete(key),
            None => Ok(0),
        }
    }

    pub fn delete_record(&self, id: &RecordId) -> Result<bool, StoreError> {
        match self.store(id.kind) {
            Some(store) => store.delete_record(id),
            None => Ok(false),
        }
    }

    /// Metadata of every record of `kind` matching `predicate`
    ///
    /// Payloads are not loaded; use [`ResponseCache::read_payload`].
    pub fn scan<P>(&self, kind: ArtifactKind, predicate: P) -> impl Iterator<Item = RecordMeta>
    where
        P: Fn(&RecordMeta) -> bool,
    {
        let metas = match self.store(kind) {
            Some(store) => store.scan(predicate),
            None => Vec::new(),
        };
        metas.into_iter()
    }

    pub fn read_payload(&self, id: &RecordId) -> Result<Vec<u8>, StoreError> {
        match self.store(id.kind) {
            Some(store) => store.read_payload(id),
            None => Err(StoreError::NotCacheable(id.kind)),
        }
    }

    /// Delete OCSP responses that are malformed or no longer valid at `now`
    pub fn purge_expired_ocsp(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.ocsp.delete_where(|meta| {
            !meta.is_well_formed()
                || meta
                    .next_update
                    .map_or(true, |next: NextUpdate| !next.covers(now))
        })?;
        if removed > 0 {
            info!(removed = removed, "Purged expired OCSP responses");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            ocsp_records: self.ocsp.count(),
            crl_records: self.crl.count(),
        }
    }

    /// Run `op` against the cache on tokio's blocking pool
    ///
    /// Every store operation does file I/O under a store mutex; async
    /// callers go through here instead of calling the store inline.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&ResponseCache) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&cache))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ocspd_proto::fixture::{FixtureArtifact, FixtureExtractor};
    use ocspd_proto::{RECORD_TYPE_CRL_V2, X509AttributeExtractor};

    fn cache(dir: &Path) -> ResponseCache {
        ResponseCache::new(dir, Arc::new(FixtureExtractor))
    }

    fn at(days: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap() + Duration::days(days)
    }

    fn crl(identity: &[u8], this: i64, next: i64) -> Vec<u8> {
        FixtureArtifact::crl(identity, at(next))
            .this_update(at(this))
            .encode()
    }

    #[test]
    fn test_lookup_against_missing_store_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir.path().join("not-yet"));

        let key = CacheKey::new(ArtifactKind::Crl).with_identity(b"issuer".to_vec());
        assert_eq!(cache.lookup(&key, at(0)), None);
        assert_eq!(cache.stats(), CacheStats::default());
        // Reads never create the store
        assert!(!dir.path().join("not-yet").exists());
    }

    #[test]
    fn test_insert_then_lookup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let payload = crl(b"issuer", 0, 7);

        let outcome = cache
            .insert(ArtifactKind::Crl, &payload, Some("http://ca/a.crl"))
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        let key = CacheKey::new(ArtifactKind::Crl).with_identity(b"issuer".to_vec());
        assert_eq!(cache.lookup(&key, at(3)), Some(payload.clone()));
        let by_url = CacheKey::new(ArtifactKind::Crl).with_url("http://ca/a.crl");
        assert_eq!(cache.lookup(&by_url, at(3)), Some(payload));
    }

    #[test]
    fn test_expired_match_is_miss_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        cache
            .insert(ArtifactKind::Crl, &crl(b"issuer", 0, 7), None)
            .unwrap();

        let key = CacheKey::new(ArtifactKind::Crl).with_identity(b"issuer".to_vec());
        assert_eq!(cache.lookup(&key, at(7)), None);
        assert_eq!(cache.lookup(&key, at(-1)), None);
        assert_eq!(cache.stats().crl_records, 1);
    }

    #[test]
    fn test_duplicate_insert_is_already_present() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let payload = crl(b"issuer", 0, 7);

        cache.insert(ArtifactKind::Crl, &payload, Some("http://ca/a.crl")).unwrap();
        let second = cache
            .insert(ArtifactKind::Crl, &payload, Some("http://ca/a.crl"))
            .unwrap();

        assert_eq!(second, InsertOutcome::AlreadyPresent);
        assert_eq!(cache.stats().crl_records, 1);
    }

    #[test]
    fn test_newer_payload_replaces_older() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let old = crl(b"issuer", 0, 7);
        let new = crl(b"issuer", 5, 12);

        cache.insert(ArtifactKind::Crl, &old, Some("http://ca/a.crl")).unwrap();
        let outcome = cache.insert(ArtifactKind::Crl, &new, Some("http://ca/a.crl")).unwrap();
        assert_eq!(outcome, InsertOutcome::Replaced);

        // Re-inserting the older one does not roll back
        let outcome = cache.insert(ArtifactKind::Crl, &old, Some("http://ca/a.crl")).unwrap();
        assert_eq!(outcome, InsertOutcome::AlreadyPresent);

        let key = CacheKey::new(ArtifactKind::Crl).with_identity(b"issuer".to_vec());
        assert_eq!(cache.lookup(&key, at(6)), Some(new));
        assert_eq!(cache.stats().crl_records, 1);
    }

    #[test]
    fn test_latest_this_update_wins_across_sources() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let a = crl(b"issuer", 0, 10);
        let b = crl(b"issuer", 2, 10);

        cache.insert(ArtifactKind::Crl, &a, Some("http://a/x.crl")).unwrap();
        cache.insert(ArtifactKind::Crl, &b, Some("ldap://b/cn=x")).unwrap();

        let key = CacheKey::new(ArtifactKind::Crl).with_identity(b"issuer".to_vec());
        assert_eq!(cache.lookup(&key, at(3)), Some(b));
        assert_eq!(cache.lookup(&key, at(1)), Some(a));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        let err = cache
            .insert(ArtifactKind::Crl, b"garbage", None)
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedPayload(_)));

        let no_next = FixtureArtifact::crl(b"issuer", at(7)).next_update(None).encode();
        let err = cache.insert(ArtifactKind::Crl, &no_next, None).unwrap_err();
        assert!(matches!(
            err,
            StoreError::MalformedPayload(ParseError::MissingNextUpdate)
        ));
    }

    #[test]
    fn test_payload_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).with_max_payload_bytes(16);

        let err = cache
            .insert(ArtifactKind::Crl, &crl(b"issuer", 0, 7), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::PayloadTooLarge { limit: 16, .. }));
    }

    #[test]
    fn test_certificates_not_cacheable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        assert!(matches!(
            cache.insert(ArtifactKind::Certificate, b"cert", None),
            Err(StoreError::NotCacheable(ArtifactKind::Certificate))
        ));
    }

    #[test]
    fn test_delete_with_wildcards() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        cache.insert(ArtifactKind::Crl, &crl(b"one", 0, 7), Some("http://a/1.crl")).unwrap();
        cache.insert(ArtifactKind::Crl, &crl(b"one", 1, 7), Some("http://b/1.crl")).unwrap();
        cache.insert(ArtifactKind::Crl, &crl(b"two", 0, 7), Some("http://a/2.crl")).unwrap();

        let one = CacheKey::new(ArtifactKind::Crl).with_identity(b"one".to_vec());
        assert_eq!(cache.delete(&one).unwrap(), 2);
        assert_eq!(cache.lookup(&one, at(3)), None);
        assert_eq!(cache.stats().crl_records, 1);

        assert_eq!(cache.delete(&CacheKey::new(ArtifactKind::Crl)).unwrap(), 1);
        assert_eq!(cache.stats().crl_records, 0);
        // Nothing left to delete
        assert_eq!(cache.delete(&CacheKey::new(ArtifactKind::Crl)).unwrap(), 0);
    }

    #[test]
    fn test_stores_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let ocsp = FixtureArtifact::ocsp(b"cert", at(0), at(1)).encode();

        cache.insert(ArtifactKind::Ocsp, &ocsp, Some("http://ocsp/")).unwrap();
        cache.insert(ArtifactKind::Crl, &crl(b"cert", 0, 7), None).unwrap();

        assert_eq!(cache.delete(&CacheKey::new(ArtifactKind::Ocsp)).unwrap(), 1);
        assert_eq!(cache.stats(), CacheStats { ocsp_records: 0, crl_records: 1 });
    }

    #[test]
    fn test_scan_reports_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let payload = FixtureArtifact::crl(b"issuer", at(7))
            .this_update(at(0))
            .revoke(&[0x01])
            .encode();
        cache.insert(ArtifactKind::Crl, &payload, Some("http://ca/a.crl")).unwrap();

        let metas: Vec<RecordMeta> = cache.scan(ArtifactKind::Crl, |_| true).collect();
        assert_eq!(metas.len(), 1);
        let meta = &metas[0];
        assert_eq!(meta.identity, b"issuer".to_vec());
        assert_eq!(meta.source_url.as_deref(), Some("http://ca/a.crl"));
        assert_eq!(meta.next_update, Some(NextUpdate::At(at(7))));
        assert_eq!(meta.record_type, RECORD_TYPE_CRL_V2);
        assert!(meta.is_well_formed());

        assert_eq!(cache.read_payload(&meta.record_id).unwrap(), payload);
        let revoked = std::fs::read_to_string(meta.record_id.file(
            &dir.path().join("crl"),
            layout::EXT_REVOKED,
        ))
        .unwrap();
        assert_eq!(revoked, "01\n");

        assert_eq!(cache.scan(ArtifactKind::Crl, |m| m.source_url.is_none()).count(), 0);
    }

    #[test]
    fn test_chain_written_alongside() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let chain = b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n";
        cache
            .insert_with_chain(ArtifactKind::Crl, &crl(b"issuer", 0, 7), None, Some(chain))
            .unwrap();

        let id = RecordId::new(ArtifactKind::Crl, b"issuer", None);
        let stored = std::fs::read(id.file(&dir.path().join("crl"), layout::EXT_PEM)).unwrap();
        assert_eq!(stored, chain.to_vec());
    }

    #[test]
    fn test_open_failure_degrades_to_miss_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = cache(&root);

        // A regular file where the CRL store directory should be
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("crl"), b"in the way").unwrap();

        let key = CacheKey::new(ArtifactKind::Crl).with_identity(b"issuer".to_vec());
        assert_eq!(cache.lookup(&key, at(3)), None);
        assert!(cache.insert(ArtifactKind::Crl, &crl(b"issuer", 0, 7), None).is_err());
        assert_eq!(cache.scan(ArtifactKind::Crl, |_| true).count(), 0);

        // The OCSP store is unaffected
        let ocsp = FixtureArtifact::ocsp(b"cert", at(0), at(1)).encode();
        assert!(cache.insert(ArtifactKind::Ocsp, &ocsp, None).is_ok());

        // Retried once the obstruction goes away
        std::fs::remove_file(root.join("crl")).unwrap();
        cache.insert(ArtifactKind::Crl, &crl(b"issuer", 0, 7), None).unwrap();
        assert!(cache.lookup(&key, at(3)).is_some());
    }

    #[test]
    fn test_record_exists_only_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let payload = crl(b"issuer", 0, 7);
        cache.insert(ArtifactKind::Crl, &payload, None).unwrap();

        let id = RecordId::new(ArtifactKind::Crl, b"issuer", None);
        std::fs::remove_file(id.sidecar_file(&dir.path().join("crl"))).unwrap();

        let key = CacheKey::new(ArtifactKind::Crl).with_identity(b"issuer".to_vec());
        assert_eq!(cache.lookup(&key, at(3)), None);
        assert_eq!(cache.stats().crl_records, 0);
    }

    #[test]
    fn test_purge_expired_ocsp() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let fresh = FixtureArtifact::ocsp(b"fresh", at(0), at(2)).encode();
        let expired = FixtureArtifact::ocsp(b"expired", at(-2), at(-1)).encode();
        cache.insert(ArtifactKind::Ocsp, &fresh, None).unwrap();
        cache.insert(ArtifactKind::Ocsp, &expired, None).unwrap();

        assert_eq!(cache.purge_expired_ocsp(at(0)).unwrap(), 1);
        let remaining: Vec<RecordMeta> = cache.scan(ArtifactKind::Ocsp, |_| true).collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].identity, b"fresh".to_vec());
    }

    #[test]
    fn test_real_der_crl_with_production_extractor() {
        use ocspd_proto::fixture::CrlBuilder;

        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), Arc::new(X509AttributeExtractor));
        let builder = CrlBuilder::new("Cache Test CA")
            .this_update("250101000000Z")
            .next_update("250201000000Z")
            .revoke(&[0x2A]);
        let der = builder.build();

        cache.insert(ArtifactKind::Crl, &der, Some("http://ca/ca.crl")).unwrap();

        let key = CacheKey::new(ArtifactKind::Crl).with_identity(builder.issuer_name_der());
        let as_of = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(cache.lookup(&key, as_of), Some(der));
    }

    #[tokio::test]
    async fn test_blocking_runs_store_ops_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(dir.path()));
        let payload = crl(b"issuer", 0, 7);

        let stored = payload.clone();
        let outcome = cache
            .blocking(move |c| c.insert(ArtifactKind::Crl, &stored, None))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        let key = CacheKey::new(ArtifactKind::Crl).with_identity(b"issuer".to_vec());
        let found = cache.blocking(move |c| Ok(c.lookup(&key, at(1)))).await.unwrap();
        assert_eq!(found, Some(payload));

        let err = cache
            .blocking(|c| c.insert(ArtifactKind::Crl, b"not a fixture", None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedPayload(_)));
    }
}
