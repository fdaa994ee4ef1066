//! CRL refresh engine
//!
//! One pass over every cached CRL:
//!
//! 1. **Structural check**: unrecognised record type or encoding, or a
//!    missing/unparseable nextUpdate, makes a record badly formed.
//! 2. **Crypto check** (optional): a signature that does not verify against
//!    the trust anchors or uses an algorithm that cannot be checked, or an
//!    issuer no anchor vouches for, makes a record badly formed.
//!    Indeterminate results keep the record for this pass.
//! 3. **Temporal check**: with `update_time = now + overlap` and
//!    `stale_time = now - stale_days`, a record is *expired* when
//!    `next_update < update_time` and *stale* when it is expired and
//!    `next_update < stale_time`.
//! 4. Badly-formed and stale records are deleted. Expired records are kept
//!    and re-fetched from their source URL unless the issuer already has a
//!    current CRL.
//!
//! Per-record failures are logged and counted; they never abort the pass.

use crate::config::{ConfigError, RefreshConfig, SECS_PER_DAY};
use crate::fetch::{FetchTarget, Fetcher};
use crate::coordinator::ActivityTracker;
use crate::store::{InsertOutcome, RecordMeta, ResponseCache, StoreError};
use chrono::{DateTime, Duration, Utc};
use ocspd_proto::{ArtifactKind, CrlVerifier, NextUpdate, VerifyOutcome};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("invalid refresh configuration: {0}")]
    Config(String),

    #[error("cannot scan CRL store: {0}")]
    Store(#[from] StoreError),
}

impl From<ConfigError> for RefreshError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Invalid(msg) => RefreshError::Config(msg),
            other => RefreshError::Config(other.to_string()),
        }
    }
}

/// Counts per category for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub scanned: usize,
    /// Failed the structural check
    pub malformed: usize,
    /// Failed signature or trust verification
    pub signature_failures: usize,
    /// Verification could not run; record kept
    pub indeterminate: usize,
    pub expired: usize,
    pub stale: usize,
    pub deleted: usize,
    pub delete_failed: usize,
    pub refreshed: usize,
    pub refresh_failed: usize,
    /// Expired, but the issuer already has a current CRL
    pub skipped_current: usize,
    /// Expired, but there is no source URL to fetch from
    pub skipped_no_url: usize,
}

/// Validity thresholds for one pass
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    update_time: DateTime<Utc>,
    stale_time: DateTime<Utc>,
    purge_all: bool,
}

impl Thresholds {
    fn new(config: &RefreshConfig, now: DateTime<Utc>) -> Self {
        let overlap = config.effective_expire_overlap_secs() as i64;
        let stale_secs = i64::from(config.effective_stale_days()) * SECS_PER_DAY as i64;
        Self {
            update_time: now + Duration::seconds(overlap),
            stale_time: now - Duration::seconds(stale_secs),
            purge_all: config.purge_all,
        }
    }

    fn is_expired(&self, next: NextUpdate) -> bool {
        self.purge_all || next.is_before(self.update_time)
    }

    fn is_stale(&self, next: NextUpdate) -> bool {
        self.purge_all || (self.is_expired(next) && next.is_before(self.stale_time))
    }
}

/// What a pass decided for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Malformed,
    SignatureFailure,
    Stale,
    Expired,
    Current,
}

pub struct RefreshEngine {
    cache: Arc<ResponseCache>,
    fetcher: Arc<dyn Fetcher>,
    verifier: Option<Arc<dyn CrlVerifier>>,
    activity: Option<Arc<ActivityTracker>>,
}

impl RefreshEngine {
    pub fn new(
        cache: Arc<ResponseCache>,
        fetcher: Arc<dyn Fetcher>,
        verifier: Option<Arc<dyn CrlVerifier>>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            verifier,
            activity: None,
        }
    }

    /// Hold an activity guard for every refresh fetch
    pub fn with_activity(mut self, activity: Arc<ActivityTracker>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Run one refresh pass as of `now`
    pub async fn run(
        &self,
        config: &RefreshConfig,
        now: DateTime<Utc>,
    ) -> Result<RefreshReport, RefreshError> {
        config.validate()?;
        let verifier = match (config.full_crypto_verify, &self.verifier) {
            (false, _) => None,
            (true, Some(v)) => Some(Arc::clone(v)),
            (true, None) => {
                return Err(RefreshError::Config(
                    "full_crypto_verify requested without a verifier".to_string(),
                ))
            }
        };

        let thresholds = Thresholds::new(config, now);
        let mut report = RefreshReport::default();

        let records: Vec<RecordMeta> = self
            .cache
            .blocking(|c| Ok(c.scan(ArtifactKind::Crl, |_| true).collect::<Vec<_>>()))
            .await?;
        report.scanned = records.len();
        debug!(records = records.len(), "Starting CRL refresh pass");

        // Classify, then delete what cannot stay
        let mut current_issuers: HashSet<Vec<u8>> = HashSet::new();
        let mut expired: Vec<RecordMeta> = Vec::new();
        for meta in records {
            let verdict = self
                .classify(&meta, &thresholds, verifier.as_ref(), now, &mut report)
                .await;
            match verdict {
                Verdict::Current => {
                    current_issuers.insert(meta.identity.clone());
                }
                Verdict::Expired => {
                    report.expired += 1;
                    expired.push(meta);
                }
                Verdict::Stale => {
                    report.expired += 1;
                    report.stale += 1;
                    self.delete(&meta, verdict, &mut report).await;
                }
                Verdict::Malformed => {
                    report.malformed += 1;
                    self.delete(&meta, verdict, &mut report).await;
                }
                Verdict::SignatureFailure => {
                    report.signature_failures += 1;
                    self.delete(&meta, verdict, &mut report).await;
                }
            }
        }

        if config.do_refresh {
            self.refresh_expired(expired, &mut current_issuers, verifier.as_ref(), now, &mut report)
                .await;
        }

        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            refreshed = report.refreshed,
            refresh_failed = report.refresh_failed,
            "CRL refresh pass complete"
        );
        Ok(report)
    }

    async fn classify(
        &self,
        meta: &RecordMeta,
        thresholds: &Thresholds,
        verifier: Option<&Arc<dyn CrlVerifier>>,
        now: DateTime<Utc>,
        report: &mut RefreshReport,
    ) -> Verdict {
        let next = match meta.next_update {
            Some(next) if meta.is_well_formed() => next,
            _ => return Verdict::Malformed,
        };

        if let Some(verifier) = verifier {
            let record_id = meta.record_id.clone();
            let verifier = Arc::clone(verifier);
            let checked = self
                .cache
                .blocking(move |c| {
                    c.read_payload(&record_id)
                        .map(|payload| verifier.verify(&payload, now))
                })
                .await;
            match checked {
                Ok(outcome) if outcome.is_integrity_failure() => {
                    warn!(record = %meta.record_id, outcome = %outcome, "CRL failed verification");
                    return Verdict::SignatureFailure;
                }
                Ok(VerifyOutcome::Indeterminate(reason)) => {
                    warn!(record = %meta.record_id, reason = %reason, "CRL verification indeterminate, keeping");
                    report.indeterminate += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(record = %meta.record_id, error = %e, "Cannot read CRL for verification, keeping");
                    report.indeterminate += 1;
                }
            }
        }

        if thresholds.is_stale(next) {
            Verdict::Stale
        } else if thresholds.is_expired(next) {
            Verdict::Expired
        } else {
            Verdict::Current
        }
    }

    async fn delete(&self, meta: &RecordMeta, verdict: Verdict, report: &mut RefreshReport) {
        let record_id = meta.record_id.clone();
        match self.cache.blocking(move |c| c.delete_record(&record_id)).await {
            Ok(_) => {
                debug!(record = %meta.record_id, verdict = ?verdict, "Deleted CRL");
                report.deleted += 1;
            }
            Err(e) => {
                warn!(record = %meta.record_id, error = %e, "Failed to delete CRL");
                report.delete_failed += 1;
            }
        }
    }

    async fn refresh_expired(
        &self,
        expired: Vec<RecordMeta>,
        current_issuers: &mut HashSet<Vec<u8>>,
        verifier: Option<&Arc<dyn CrlVerifier>>,
        now: DateTime<Utc>,
        report: &mut RefreshReport,
    ) {
        for meta in expired {
            if current_issuers.contains(&meta.identity) {
                report.skipped_current += 1;
                continue;
            }
            let url = match meta.source_url.as_deref() {
                Some(url) if !url.is_empty() => url,
                _ => {
                    debug!(record = %meta.record_id, "Expired CRL has no source URL");
                    report.skipped_no_url += 1;
                    continue;
                }
            };

            match self.refresh_one(url, verifier, now).await {
                Ok(outcome) => {
                    debug!(url = %url, outcome = ?outcome, "Refreshed CRL");
                    report.refreshed += 1;
                    current_issuers.insert(meta.identity.clone());
                }
                Err(reason) => {
                    warn!(url = %url, reason = %reason, "CRL refresh failed");
                    report.refresh_failed += 1;
                }
            }
        }
    }

    async fn refresh_one(
        &self,
        url: &str,
        verifier: Option<&Arc<dyn CrlVerifier>>,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, String> {
        let _busy = self.activity.as_ref().map(|a| a.begin());

        let payload = self
            .fetcher
            .fetch(&FetchTarget::new(url, ArtifactKind::Crl))
            .await
            .map_err(|e| e.to_string())?;

        if let Some(verifier) = verifier {
            let outcome = verifier.verify(&payload, now);
            if outcome.is_integrity_failure() {
                return Err(format!("fetched CRL failed verification: {}", outcome));
            }
        }

        let url = url.to_string();
        self.cache
            .blocking(move |c| c.insert(ArtifactKind::Crl, &payload, Some(url.as_str())))
            .await
            .map_err(|e| e.to_string())
    }
}
