//! Revocation artifact model
//!
//! Every artifact the daemon caches is reduced to a fixed set of attributes
//! before it is stored: who it speaks for (identity), when it was issued, and
//! when it stops being authoritative. Those attributes are always derived
//! from the payload bytes themselves, never from caller-declared metadata.

use crate::crl::CrlInfo;
use crate::error::ParseError;
use crate::ocsp::OcspResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds since the epoch of `99991231235959Z`, the RFC 5280 value for
/// "no well-defined expiration date".
pub const NO_EXPIRY_TIMESTAMP: i64 = 253_402_300_799;

/// Validity assumed for OCSP responses that omit nextUpdate, counted from
/// thisUpdate.
pub const OCSP_DEFAULT_VALIDITY_SECS: i64 = 3600;

/// Record type tags written alongside stored artifacts
pub const RECORD_TYPE_CRL_V1: &str = "x509-crl-v1";
pub const RECORD_TYPE_CRL_V2: &str = "x509-crl-v2";
pub const RECORD_TYPE_OCSP_BASIC: &str = "ocsp-basic";

/// Kind of revocation artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// OCSP response (RFC 6960)
    Ocsp,
    /// Certificate revocation list (RFC 5280)
    Crl,
    /// Certificate fetched for chain building; never cached
    Certificate,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Ocsp => "ocsp",
            ArtifactKind::Crl => "crl",
            ArtifactKind::Certificate => "certificate",
        }
    }

    /// Whether artifacts of this kind are persisted by the cache
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, ArtifactKind::Certificate)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// End of an artifact's validity window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextUpdate {
    /// Authoritative until this instant (exclusive)
    At(DateTime<Utc>),
    /// Explicit "never expires" marker
    Never,
}

impl NextUpdate {
    /// Build from an ASN.1 timestamp, recognising the no-expiry sentinel
    pub fn from_timestamp(secs: i64) -> Option<Self> {
        if secs == NO_EXPIRY_TIMESTAMP {
            return Some(NextUpdate::Never);
        }
        DateTime::<Utc>::from_timestamp(secs, 0).map(NextUpdate::At)
    }

    /// `true` when the window closes strictly before `t`
    pub fn is_before(&self, t: DateTime<Utc>) -> bool {
        match self {
            NextUpdate::At(at) => *at < t,
            NextUpdate::Never => false,
        }
    }

    /// `true` when `t` still falls inside the window
    pub fn covers(&self, t: DateTime<Utc>) -> bool {
        match self {
            NextUpdate::At(at) => t < *at,
            NextUpdate::Never => true,
        }
    }

    /// Stable textual form used in on-disk metadata
    pub fn to_field(&self) -> String {
        match self {
            NextUpdate::At(at) => at.to_rfc3339(),
            NextUpdate::Never => "never".to_string(),
        }
    }

    /// Inverse of [`NextUpdate::to_field`]; `None` for anything unparseable
    pub fn parse_field(field: &str) -> Option<Self> {
        if field == "never" {
            return Some(NextUpdate::Never);
        }
        DateTime::parse_from_rfc3339(field)
            .ok()
            .map(|dt| NextUpdate::At(dt.with_timezone(&Utc)))
    }
}

impl fmt::Display for NextUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_field())
    }
}

/// Transfer encoding of a stored payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Der,
    Pem,
}

impl PayloadEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadEncoding::Der => "der",
            PayloadEncoding::Pem => "pem",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "der" => Some(PayloadEncoding::Der),
            "pem" => Some(PayloadEncoding::Pem),
            _ => None,
        }
    }

    /// Sniff a payload: PEM armour or raw DER
    pub fn detect(payload: &[u8]) -> Self {
        let start = payload
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(0);
        if payload[start..].starts_with(b"-----BEGIN") {
            PayloadEncoding::Pem
        } else {
            PayloadEncoding::Der
        }
    }
}

/// Attributes derived from a payload, feeding the cache's fixed schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheAttributes {
    pub kind: ArtifactKind,
    /// CRL: raw DER issuer Name. OCSP: issuerNameHash || issuerKeyHash || serial.
    pub identity: Vec<u8>,
    pub this_update: DateTime<Utc>,
    pub next_update: NextUpdate,
    pub record_type: &'static str,
    pub encoding: PayloadEncoding,
    /// Revoked serial numbers (CRLs only)
    pub revoked_serials: Vec<Vec<u8>>,
}

impl CacheAttributes {
    /// `true` when `at` falls inside `[this_update, next_update)`
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.this_update <= at && self.next_update.covers(at)
    }
}

/// Turns a raw payload into cache attributes
///
/// The cache never trusts caller-supplied identity or expiry; it runs every
/// payload through an extractor before storing it.
pub trait AttributeExtractor: Send + Sync {
    fn derive(&self, kind: ArtifactKind, payload: &[u8]) -> Result<CacheAttributes, ParseError>;
}

/// Derive cache attributes from a DER or PEM payload
pub fn derive_cache_attributes(
    kind: ArtifactKind,
    payload: &[u8],
) -> Result<CacheAttributes, ParseError> {
    if payload.is_empty() {
        return Err(ParseError::Empty);
    }
    match kind {
        ArtifactKind::Crl => {
            let encoding = PayloadEncoding::detect(payload);
            let crl = CrlInfo::parse(payload)?;
            let next_update = crl.next_update.ok_or(ParseError::MissingNextUpdate)?;
            let record_type = if crl.version >= 1 {
                RECORD_TYPE_CRL_V2
            } else {
                RECORD_TYPE_CRL_V1
            };
            let mut revoked_serials: Vec<Vec<u8>> = crl.revoked_serials.into_iter().collect();
            revoked_serials.sort();
            Ok(CacheAttributes {
                kind,
                identity: crl.issuer_raw,
                this_update: crl.this_update,
                next_update,
                record_type,
                encoding,
                revoked_serials,
            })
        }
        ArtifactKind::Ocsp => {
            let response = OcspResponse::parse(payload)?;
            let next_update = response.effective_next_update();
            Ok(CacheAttributes {
                kind,
                identity: response.cert_id.identity(),
                this_update: response.this_update,
                next_update,
                record_type: RECORD_TYPE_OCSP_BASIC,
                encoding: PayloadEncoding::Der,
                revoked_serials: Vec::new(),
            })
        }
        ArtifactKind::Certificate => Err(ParseError::NotCacheable("certificate")),
    }
}

/// Production extractor backed by x509-parser/der-parser
#[derive(Debug, Clone, Copy, Default)]
pub struct X509AttributeExtractor;

impl AttributeExtractor for X509AttributeExtractor {
    fn derive(&self, kind: ArtifactKind, payload: &[u8]) -> Result<CacheAttributes, ParseError> {
        derive_cache_attributes(kind, payload)
    }
}
