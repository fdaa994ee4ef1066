//! CRL signature verification against a trust-anchor set
//!
//! The refresh engine only needs a verdict. What matters is keeping real
//! integrity failures apart from "could not decide"
//! ([`VerifyOutcome::Indeterminate`]), because only the former may delete a
//! cached record. A CRL whose issuer anchor is known but whose signature
//! algorithm cannot be checked counts as an integrity failure: it can never
//! be shown to come from that issuer.

use crate::artifact::PayloadEncoding;
use crate::crl::asn1_time_to_chrono;
use crate::error::ParseError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use tracing::debug;
use x509_parser::error::X509Error;
use x509_parser::pem::Pem;
use x509_parser::prelude::*;

/// Result of verifying one CRL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Signed by a trust anchor and inside its validity window
    Verified,
    /// Signature good but nextUpdate has passed
    Expired,
    /// Issuer anchor found, signature does not verify
    SignatureInvalid,
    /// No anchor matches the CRL issuer
    Untrusted,
    /// Issuer anchor found, signature algorithm not supported
    UnsupportedAlgorithm,
    /// Verification could not run (unreadable payload or no anchors)
    Indeterminate(String),
}

impl VerifyOutcome {
    /// Outcomes that make a cached record unusable
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            VerifyOutcome::SignatureInvalid
                | VerifyOutcome::Untrusted
                | VerifyOutcome::UnsupportedAlgorithm
        )
    }
}

impl fmt::Display for VerifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyOutcome::Verified => f.write_str("verified"),
            VerifyOutcome::Expired => f.write_str("expired"),
            VerifyOutcome::SignatureInvalid => f.write_str("signature invalid"),
            VerifyOutcome::Untrusted => f.write_str("untrusted issuer"),
            VerifyOutcome::UnsupportedAlgorithm => f.write_str("unsupported signature algorithm"),
            VerifyOutcome::Indeterminate(reason) => write!(f, "indeterminate: {}", reason),
        }
    }
}

/// Verifies a CRL payload at a reference time
pub trait CrlVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], at: DateTime<Utc>) -> VerifyOutcome;
}

/// Verifier backed by a fixed set of DER trust-anchor certificates
#[derive(Debug, Clone, Default)]
pub struct TrustAnchorVerifier {
    anchors: Vec<Vec<u8>>,
}

impl TrustAnchorVerifier {
    pub fn new(anchors: Vec<Vec<u8>>) -> Self {
        Self { anchors }
    }

    /// Load every `CERTIFICATE` block of a PEM bundle
    pub fn from_pem(bundle: &[u8]) -> Result<Self, ParseError> {
        let mut anchors = Vec::new();
        for pem in Pem::iter_from_buffer(bundle) {
            let pem = pem.map_err(|e| ParseError::Encoding(format!("bad PEM bundle: {}", e)))?;
            if pem.label == "CERTIFICATE" {
                anchors.push(pem.contents);
            }
        }
        debug!(anchors = anchors.len(), "Loaded trust anchors");
        Ok(Self { anchors })
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let bundle = std::fs::read(path.as_ref()).map_err(|e| {
            ParseError::Encoding(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_pem(&bundle)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

impl CrlVerifier for TrustAnchorVerifier {
    fn verify(&self, payload: &[u8], at: DateTime<Utc>) -> VerifyOutcome {
        if self.anchors.is_empty() {
            return VerifyOutcome::Indeterminate("no trust anchors configured".to_string());
        }

        let der = match PayloadEncoding::detect(payload) {
            PayloadEncoding::Der => payload.to_vec(),
            PayloadEncoding::Pem => match x509_parser::pem::parse_x509_pem(payload) {
                Ok((_, pem)) => pem.contents,
                Err(e) => return VerifyOutcome::Indeterminate(format!("PEM decode: {}", e)),
            },
        };
        let crl = match parse_x509_crl(&der) {
            Ok((_, crl)) => crl,
            Err(e) => return VerifyOutcome::Indeterminate(format!("CRL decode: {}", e)),
        };

        for anchor in &self.anchors {
            let cert = match parse_x509_certificate(anchor) {
                Ok((_, cert)) => cert,
                Err(e) => {
                    debug!(error = %e, "Skipping unparseable trust anchor");
                    continue;
                }
            };
            if cert.subject().as_raw() != crl.issuer().as_raw() {
                continue;
            }

            return match crl.verify_signature(cert.public_key()) {
                Ok(()) => {
                    let expired = crl
                        .next_update()
                        .and_then(|t| asn1_time_to_chrono(&t))
                        .map_or(false, |next| next <= at);
                    if expired {
                        VerifyOutcome::Expired
                    } else {
                        VerifyOutcome::Verified
                    }
                }
                Err(X509Error::SignatureUnsupportedAlgorithm) => {
                    VerifyOutcome::UnsupportedAlgorithm
                }
                Err(_) => VerifyOutcome::SignatureInvalid,
            };
        }

        VerifyOutcome::Untrusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{CertificateBuilder, CrlBuilder};

    #[test]
    fn test_no_anchors_is_indeterminate() {
        let crl = CrlBuilder::new("Some CA").build();
        let outcome = TrustAnchorVerifier::default().verify(&crl, Utc::now());
        assert!(matches!(outcome, VerifyOutcome::Indeterminate(_)));
        assert!(!outcome.is_integrity_failure());
    }

    #[test]
    fn test_unknown_issuer_is_untrusted() {
        let anchor = CertificateBuilder::new("Other CA").build();
        let verifier = TrustAnchorVerifier::new(vec![anchor]);
        let crl = CrlBuilder::new("Some CA").build();

        assert_eq!(verifier.verify(&crl, Utc::now()), VerifyOutcome::Untrusted);
    }

    #[test]
    fn test_bad_signature_detected() {
        // Placeholder signature bytes never verify against the anchor key
        let anchor = CertificateBuilder::new("Some CA").build();
        let verifier = TrustAnchorVerifier::new(vec![anchor]);
        let crl = CrlBuilder::new("Some CA").build();

        let outcome = verifier.verify(&crl, Utc::now());
        assert_eq!(outcome, VerifyOutcome::SignatureInvalid);
        assert!(outcome.is_integrity_failure());
    }

    #[test]
    fn test_unsupported_algorithm_is_integrity_failure() {
        let anchor = CertificateBuilder::new("Some CA").build();
        let verifier = TrustAnchorVerifier::new(vec![anchor]);
        let crl = CrlBuilder::new("Some CA")
            .signature_algorithm(&[1, 3, 6, 1, 4, 1, 55555, 1])
            .build();

        let outcome = verifier.verify(&crl, Utc::now());
        assert_eq!(outcome, VerifyOutcome::UnsupportedAlgorithm);
        assert!(outcome.is_integrity_failure());
    }

    #[test]
    fn test_unreadable_payload_is_not_a_signature_failure() {
        let anchor = CertificateBuilder::new("Some CA").build();
        let verifier = TrustAnchorVerifier::new(vec![anchor]);

        let outcome = verifier.verify(b"\x30\x05garbage", Utc::now());
        assert!(matches!(outcome, VerifyOutcome::Indeterminate(_)));
    }

    #[test]
    fn test_load_pem_bundle() {
        let a = CertificateBuilder::new("CA A").build_pem();
        let b = CertificateBuilder::new("CA B").build_pem();
        let crl = CrlBuilder::new("CA A").build_pem();
        let bundle = format!("{}{}{}", a, crl, b);

        let verifier = TrustAnchorVerifier::from_pem(bundle.as_bytes()).unwrap();
        assert_eq!(verifier.len(), 2);
    }
}
