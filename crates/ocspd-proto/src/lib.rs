//! Revocation artifact model for ocspd
//!
//! This crate knows how to read the two artifact types the daemon caches:
//! CRLs (RFC 5280) and OCSP responses (RFC 6960). Everything the cache and
//! refresh engine need is reduced to [`CacheAttributes`] by one pure
//! function, [`derive_cache_attributes`].
//!
//! # Example
//!
//! ```no_run
//! use ocspd_proto::{derive_cache_attributes, ArtifactKind};
//! use chrono::Utc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let der = std::fs::read("issuer.crl")?;
//! let attrs = derive_cache_attributes(ArtifactKind::Crl, &der)?;
//!
//! println!("valid now: {}", attrs.is_valid_at(Utc::now()));
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod crl;
pub mod error;
pub mod ocsp;
pub mod verify;

#[cfg(any(test, feature = "test-support"))]
pub mod der;
#[cfg(any(test, feature = "test-support"))]
pub mod fixture;

pub use artifact::{
    derive_cache_attributes, ArtifactKind, AttributeExtractor, CacheAttributes, NextUpdate,
    PayloadEncoding, X509AttributeExtractor, NO_EXPIRY_TIMESTAMP, OCSP_DEFAULT_VALIDITY_SECS,
    RECORD_TYPE_CRL_V1, RECORD_TYPE_CRL_V2, RECORD_TYPE_OCSP_BASIC,
};
pub use crl::CrlInfo;
pub use error::ParseError;
pub use ocsp::{CertificateStatus, OcspCertId, OcspResponse, OcspResponseStatus};
pub use verify::{CrlVerifier, TrustAnchorVerifier, VerifyOutcome};
