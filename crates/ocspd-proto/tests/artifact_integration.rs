//! Integration tests for revocation artifact parsing
//!
//! Payloads come from the `fixture` builders, which emit structurally real
//! DER (X.509 CRLs, BasicOCSPResponses) with placeholder signatures. They
//! exercise the same parse paths a CA-issued artifact does; signature
//! verification of these payloads always fails.

#![cfg(feature = "test-support")]

use chrono::{TimeZone, Utc};
use ocspd_proto::fixture::{CertificateBuilder, CrlBuilder, FixtureCertStatus, OcspResponseBuilder};
use ocspd_proto::{
    derive_cache_attributes, ArtifactKind, CertificateStatus, CrlInfo, CrlVerifier, NextUpdate,
    OcspResponse, ParseError, PayloadEncoding, TrustAnchorVerifier, VerifyOutcome,
    RECORD_TYPE_CRL_V2, RECORD_TYPE_OCSP_BASIC,
};

#[test]
fn test_crl_der_and_pem_agree() {
    let builder = CrlBuilder::new("Integration CA")
        .revoke(&[0x01, 0x23])
        .revoke(&[0x45]);

    let from_der = CrlInfo::parse(&builder.build()).unwrap();
    let from_pem = CrlInfo::parse(builder.build_pem().as_bytes()).unwrap();

    assert_eq!(from_der.issuer_raw, from_pem.issuer_raw);
    assert_eq!(from_der.this_update, from_pem.this_update);
    assert_eq!(from_der.revoked_count(), 2);
    assert!(from_der.is_revoked(&[0x01, 0x23]));
    assert!(!from_der.is_revoked(&[0x99]));
}

#[test]
fn test_crl_attributes_use_issuer_name_as_identity() {
    let builder = CrlBuilder::new("Integration CA");
    let attrs = derive_cache_attributes(ArtifactKind::Crl, &builder.build()).unwrap();

    assert_eq!(attrs.identity, builder.issuer_name_der());
    assert_eq!(attrs.record_type, RECORD_TYPE_CRL_V2);
    assert_eq!(attrs.encoding, PayloadEncoding::Der);
    assert!(attrs.is_valid_at(Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap()));
    assert!(!attrs.is_valid_at(Utc.with_ymd_and_hms(2036, 1, 1, 0, 0, 0).unwrap()));
}

#[test]
fn test_crl_far_future_next_update_never_expires() {
    let crl = CrlBuilder::new("Integration CA")
        .next_update_generalized("99991231235959Z")
        .build();
    let attrs = derive_cache_attributes(ArtifactKind::Crl, &crl).unwrap();

    assert_eq!(attrs.next_update, NextUpdate::Never);
    assert!(attrs.is_valid_at(Utc.with_ymd_and_hms(2999, 1, 1, 0, 0, 0).unwrap()));
}

#[test]
fn test_crl_without_next_update_not_cacheable() {
    let crl = CrlBuilder::new("Integration CA").without_next_update().build();
    assert!(matches!(
        derive_cache_attributes(ArtifactKind::Crl, &crl),
        Err(ParseError::MissingNextUpdate)
    ));
}

#[test]
fn test_ocsp_response_identity_and_status() {
    let der = OcspResponseBuilder::new(&[0xAA; 20], &[0xBB; 20], &[0x10, 0x01])
        .cert_status(FixtureCertStatus::Revoked("20250601000000Z".to_string()))
        .build();

    let response = OcspResponse::parse(&der).unwrap();
    assert!(response.is_revoked());
    assert!(matches!(response.cert_status, CertificateStatus::Revoked { .. }));

    let attrs = derive_cache_attributes(ArtifactKind::Ocsp, &der).unwrap();
    assert_eq!(attrs.identity, response.cert_id.identity());
    assert_eq!(attrs.record_type, RECORD_TYPE_OCSP_BASIC);
    assert!(attrs.identity.starts_with(&[0xAA; 20]));
    assert!(attrs.identity.ends_with(&[0x10, 0x01]));
}

#[test]
fn test_unsuccessful_ocsp_response_rejected() {
    // tryLater
    let der = OcspResponseBuilder::new(&[0xAA; 20], &[0xBB; 20], &[0x01])
        .response_status(3)
        .build();
    assert!(derive_cache_attributes(ArtifactKind::Ocsp, &der).is_err());
}

#[test]
fn test_verifier_rejects_placeholder_signature() {
    let crl = CrlBuilder::new("Integration CA").build();
    let verifier = TrustAnchorVerifier::new(vec![CertificateBuilder::new("Integration CA").build()]);

    let outcome = verifier.verify(&crl, Utc::now());
    assert_eq!(outcome, VerifyOutcome::SignatureInvalid);
    assert!(outcome.is_integrity_failure());
}
