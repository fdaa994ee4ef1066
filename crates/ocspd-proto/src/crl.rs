//! CRL parsing
//!
//! Parses Certificate Revocation Lists (RFC 5280) with x509-parser and
//! extracts what the cache and refresh engine need: the raw issuer name
//! (cache identity), the validity window and the revoked serial set.
//!
//! Signatures are not checked here; see [`crate::verify`].
//!
//! # Example
//!
//! ```no_run
//! use ocspd_proto::crl::CrlInfo;
//! use chrono::Utc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let crl_der = std::fs::read("crl.der")?;
//! let crl = CrlInfo::parse(&crl_der)?;
//!
//! if crl.is_current(Utc::now()) && crl.is_revoked(&[0x01, 0x02, 0x03]) {
//!     println!("Certificate is revoked!");
//! }
//! # Ok(())
//! # }
//! ```

use crate::artifact::{NextUpdate, PayloadEncoding};
use crate::error::ParseError;
use std::collections::HashSet;
use x509_parser::prelude::*;

/// Parsed CRL information
#[derive(Debug, Clone)]
pub struct CrlInfo {
    /// CRL issuer distinguished name, for display
    pub issuer: String,

    /// Raw DER encoding of the issuer Name
    pub issuer_raw: Vec<u8>,

    /// CRL version field (0 = v1, 1 = v2)
    pub version: u32,

    /// CRL thisUpdate time
    pub this_update: chrono::DateTime<chrono::Utc>,

    /// CRL nextUpdate (absent CRLs are rejected by the cache)
    pub next_update: Option<NextUpdate>,

    /// Set of revoked certificate serial numbers (for O(1) lookup)
    pub revoked_serials: HashSet<Vec<u8>>,

    /// Signature algorithm OID
    pub signature_algorithm: String,
}

impl CrlInfo {
    /// Parse a CRL in either DER or PEM form
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        match PayloadEncoding::detect(data) {
            PayloadEncoding::Pem => Self::parse_pem(data),
            PayloadEncoding::Der => Self::parse_der(data),
        }
    }

    /// Parse a CRL from DER-encoded bytes
    ///
    /// A nextUpdate of `99991231235959Z` is reported as
    /// [`NextUpdate::Never`], not as a far-future date.
    pub fn parse_der(crl_der: &[u8]) -> Result<Self, ParseError> {
        let (_, crl) = parse_x509_crl(crl_der)
            .map_err(|e| ParseError::Encoding(format!("failed to parse CRL DER: {}", e)))?;

        let issuer = crl.issuer().to_string();
        let issuer_raw = crl.issuer().as_raw().to_vec();
        let version = crl.tbs_cert_list.version.map(|v| v.0).unwrap_or(0);

        let this_update = asn1_time_to_chrono(&crl.last_update())
            .ok_or_else(|| ParseError::Time("thisUpdate".to_string()))?;

        let next_update = match crl.next_update() {
            Some(t) => Some(
                NextUpdate::from_timestamp(t.timestamp())
                    .ok_or_else(|| ParseError::Time("nextUpdate".to_string()))?,
            ),
            None => None,
        };

        let signature_algorithm = crl.signature_algorithm.algorithm.to_id_string();

        let revoked_serials = crl
            .iter_revoked_certificates()
            .map(|revoked| revoked.raw_serial().to_vec())
            .collect();

        Ok(CrlInfo {
            issuer,
            issuer_raw,
            version,
            this_update,
            next_update,
            revoked_serials,
            signature_algorithm,
        })
    }

    /// Parse a CRL from PEM-encoded bytes
    pub fn parse_pem(pem_data: &[u8]) -> Result<Self, ParseError> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem_data)
            .map_err(|e| ParseError::Encoding(format!("failed to parse CRL PEM: {}", e)))?;

        Self::parse_der(&pem.contents)
    }

    /// Check if a certificate serial number is revoked
    pub fn is_revoked(&self, serial: &[u8]) -> bool {
        self.revoked_serials.contains(serial)
    }

    /// `thisUpdate <= now < nextUpdate`
    pub fn is_current(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.this_update <= now && self.next_update.map_or(false, |n| n.covers(now))
    }

    /// Get the number of revoked certificates in this CRL
    pub fn revoked_count(&self) -> usize {
        self.revoked_serials.len()
    }
}

/// Convert ASN.1 time to chrono DateTime
pub(crate) fn asn1_time_to_chrono(asn1_time: &ASN1Time) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(asn1_time.timestamp(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{CrlBuilder, CRL_NEXT_UPDATE_NEVER};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_parse_der_crl() {
        let der = CrlBuilder::new("Test Intermediate CA")
            .this_update("250101000000Z")
            .next_update("250108000000Z")
            .revoke(&[0x01, 0x02, 0x03])
            .revoke(&[0x0A])
            .build();

        let crl = CrlInfo::parse(&der).unwrap();
        assert!(crl.issuer.contains("Test Intermediate CA"));
        assert_eq!(crl.version, 1);
        assert_eq!(
            crl.this_update,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            crl.next_update,
            Some(NextUpdate::At(Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap()))
        );
        assert_eq!(crl.revoked_count(), 2);
        assert!(crl.is_revoked(&[0x01, 0x02, 0x03]));
        assert!(!crl.is_revoked(&[0xFF]));
        assert_eq!(crl.signature_algorithm, "1.2.840.113549.1.1.11");
    }

    #[test]
    fn test_issuer_raw_is_stable() {
        let a = CrlBuilder::new("CA One").build();
        let b = CrlBuilder::new("CA One").next_update("300101000000Z").build();
        let c = CrlBuilder::new("CA Two").build();

        let a = CrlInfo::parse(&a).unwrap();
        let b = CrlInfo::parse(&b).unwrap();
        let c = CrlInfo::parse(&c).unwrap();

        assert_eq!(a.issuer_raw, b.issuer_raw);
        assert_ne!(a.issuer_raw, c.issuer_raw);
    }

    #[test]
    fn test_no_expiry_marker() {
        let der = CrlBuilder::new("Forever CA")
            .next_update_generalized(CRL_NEXT_UPDATE_NEVER)
            .build();

        let crl = CrlInfo::parse(&der).unwrap();
        assert_eq!(crl.next_update, Some(NextUpdate::Never));
        assert!(crl.is_current(Utc::now()));
    }

    #[test]
    fn test_missing_next_update() {
        let der = CrlBuilder::new("Lazy CA").without_next_update().build();
        let crl = CrlInfo::parse(&der).unwrap();
        assert_eq!(crl.next_update, None);
        assert!(!crl.is_current(Utc::now()));
    }

    #[test]
    fn test_pem_wrapped_crl() {
        let pem = CrlBuilder::new("Armoured CA").build_pem();
        let crl = CrlInfo::parse(pem.as_bytes()).unwrap();
        assert!(crl.issuer.contains("Armoured CA"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            CrlInfo::parse(&[0x30, 0x03, 0x02, 0x01]),
            Err(ParseError::Encoding(_))
        ));
        assert!(CrlInfo::parse(b"-----BEGIN X509 CRL-----\n!!!\n-----END X509 CRL-----\n").is_err());
    }

    #[test]
    fn test_is_current_window() {
        let der = CrlBuilder::new("Window CA")
            .this_update("250101000000Z")
            .next_update("250108000000Z")
            .build();
        let crl = CrlInfo::parse(&der).unwrap();

        assert!(crl.is_current(Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap()));
        assert!(!crl.is_current(Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap()));
        assert!(!crl.is_current(Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap()));
    }
}
