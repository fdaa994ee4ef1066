//! OCSP response parsing (RFC 6960)
//!
//! Only what the cache needs is decoded: the response status, the CertID of
//! the first SingleResponse (cache identity) and its validity window. The
//! responder signature is left to the relying party.
//!
//! ```asn1
//! OCSPResponse ::= SEQUENCE {
//!     responseStatus      OCSPResponseStatus,
//!     responseBytes       [0] EXPLICIT ResponseBytes OPTIONAL
//! }
//!
//! SingleResponse ::= SEQUENCE {
//!     certID              CertID,
//!     certStatus          CertStatus,
//!     thisUpdate          GeneralizedTime,
//!     nextUpdate          [0] EXPLICIT GeneralizedTime OPTIONAL,
//!     singleExtensions    [1] EXPLICIT Extensions OPTIONAL
//! }
//! ```

use crate::artifact::{NextUpdate, OCSP_DEFAULT_VALIDITY_SECS};
use crate::error::ParseError;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use der_parser::asn1_rs::{Any, Class, FromDer, Oid, Tag};
use std::borrow::Cow;

/// Content bytes of id-pkix-ocsp-basic (1.3.6.1.5.5.7.48.1.1)
const ID_PKIX_OCSP_BASIC: &[u8] = &[0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];

/// OCSP response status (RFC 6960 Section 2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspResponseStatus {
    /// Response has valid confirmations
    Successful = 0,
    /// Illegal confirmation request
    MalformedRequest = 1,
    /// Internal error in issuer
    InternalError = 2,
    /// Try again later
    TryLater = 3,
    /// Must sign the request
    SigRequired = 5,
    /// Request unauthorized
    Unauthorized = 6,
}

impl OcspResponseStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Successful),
            1 => Some(Self::MalformedRequest),
            2 => Some(Self::InternalError),
            3 => Some(Self::TryLater),
            5 => Some(Self::SigRequired),
            6 => Some(Self::Unauthorized),
            _ => None,
        }
    }
}

/// Certificate status in a SingleResponse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    Good,
    Revoked {
        revocation_time: DateTime<Utc>,
        reason: Option<u8>,
    },
    Unknown,
}

/// CertID of the certificate a response speaks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspCertId {
    /// Dotted OID of the hash used for the two issuer hashes
    pub hash_algorithm: String,
    pub issuer_name_hash: Vec<u8>,
    pub issuer_key_hash: Vec<u8>,
    /// INTEGER content octets as encoded
    pub serial: Vec<u8>,
}

impl OcspCertId {
    /// `issuerNameHash || issuerKeyHash || serialNumber`
    pub fn identity(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.issuer_name_hash.len() + self.issuer_key_hash.len() + self.serial.len(),
        );
        out.extend_from_slice(&self.issuer_name_hash);
        out.extend_from_slice(&self.issuer_key_hash);
        out.extend_from_slice(&self.serial);
        out
    }
}

/// Decoded successful OCSP response
#[derive(Debug, Clone)]
pub struct OcspResponse {
    pub status: OcspResponseStatus,
    pub cert_id: OcspCertId,
    pub cert_status: CertificateStatus,
    pub produced_at: DateTime<Utc>,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
}

impl OcspResponse {
    /// Parse a DER-encoded OCSPResponse
    ///
    /// Non-successful responses are rejected: they carry no status and are
    /// never cached.
    pub fn parse(der_bytes: &[u8]) -> Result<Self, ParseError> {
        if der_bytes.is_empty() {
            return Err(ParseError::Empty);
        }

        let outer = children(expect(parse_any(der_bytes)?, Tag::Sequence, "OCSPResponse")?)?;
        let status_any = outer.first().ok_or(ParseError::Field("responseStatus"))?;
        let status_any = expect(status_any.clone(), Tag::Enumerated, "responseStatus")?;
        let status_value = match status_any.data {
            [v] => *v,
            _ => return Err(ParseError::Field("responseStatus")),
        };
        let status = OcspResponseStatus::from_u8(status_value)
            .ok_or(ParseError::Field("responseStatus"))?;
        if status != OcspResponseStatus::Successful {
            return Err(ParseError::UnsuccessfulResponse(format!("{:?}", status)));
        }

        // responseBytes [0] EXPLICIT ResponseBytes
        let tagged = outer
            .get(1)
            .filter(|a| is_context(a, 0))
            .ok_or(ParseError::Field("responseBytes"))?;
        let response_bytes = children(expect(parse_any(tagged.data)?, Tag::Sequence, "responseBytes")?)?;
        if response_bytes.len() < 2 {
            return Err(ParseError::Field("responseBytes"));
        }
        let response_type = expect(response_bytes[0].clone(), Tag::Oid, "responseType")?;
        if response_type.data != ID_PKIX_OCSP_BASIC {
            return Err(ParseError::UnsupportedResponseType);
        }
        let basic_octets = expect(response_bytes[1].clone(), Tag::OctetString, "response")?;

        // BasicOCSPResponse ::= SEQUENCE { tbsResponseData, signatureAlgorithm, signature, certs }
        let basic = children(expect(parse_any(basic_octets.data)?, Tag::Sequence, "BasicOCSPResponse")?)?;
        let tbs = basic.first().ok_or(ParseError::Field("tbsResponseData"))?;
        let tbs = children(expect(tbs.clone(), Tag::Sequence, "tbsResponseData")?)?;

        let mut idx = 0;
        // version [0] EXPLICIT DEFAULT v1
        if tbs.get(idx).map_or(false, |a| is_context(a, 0)) {
            idx += 1;
        }
        // responderID: byName [1] or byKey [2]
        match tbs.get(idx) {
            Some(a) if is_context(a, 1) || is_context(a, 2) => idx += 1,
            _ => return Err(ParseError::Field("responderID")),
        }
        let produced_at = time_of(tbs.get(idx), "producedAt")?;
        idx += 1;

        let responses = tbs.get(idx).ok_or(ParseError::Field("responses"))?;
        let responses = children(expect(responses.clone(), Tag::Sequence, "responses")?)?;
        let single = responses.first().ok_or(ParseError::Field("SingleResponse"))?;
        let single = children(expect(single.clone(), Tag::Sequence, "SingleResponse")?)?;
        if single.len() < 3 {
            return Err(ParseError::Field("SingleResponse"));
        }

        let cert_id = parse_cert_id(&single[0])?;
        let cert_status = parse_cert_status(&single[1])?;
        let this_update = time_of(single.get(2), "thisUpdate")?;

        let next_update = match single.get(3) {
            Some(a) if is_context(a, 0) => Some(time_of(Some(&parse_any(a.data)?), "nextUpdate")?),
            _ => None,
        };

        Ok(Self {
            status,
            cert_id,
            cert_status,
            produced_at,
            this_update,
            next_update,
        })
    }

    /// nextUpdate, or thisUpdate plus one hour when the responder omitted it
    pub fn effective_next_update(&self) -> NextUpdate {
        match self.next_update {
            Some(at) => NextUpdate::from_timestamp(at.timestamp()).unwrap_or(NextUpdate::At(at)),
            None => NextUpdate::At(self.this_update + Duration::seconds(OCSP_DEFAULT_VALIDITY_SECS)),
        }
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self.cert_status, CertificateStatus::Revoked { .. })
    }
}

fn parse_any(bytes: &[u8]) -> Result<Any<'_>, ParseError> {
    let (_, any) = Any::from_der(bytes)
        .map_err(|e| ParseError::Encoding(format!("invalid DER: {:?}", e)))?;
    Ok(any)
}

/// Decode every TLV inside a constructed value
fn children<'a>(parent: Any<'a>) -> Result<Vec<Any<'a>>, ParseError> {
    let mut rest = parent.data;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let (next, any) = Any::from_der(rest)
            .map_err(|e| ParseError::Encoding(format!("invalid DER: {:?}", e)))?;
        out.push(any);
        rest = next;
    }
    Ok(out)
}

fn expect<'a>(any: Any<'a>, tag: Tag, field: &'static str) -> Result<Any<'a>, ParseError> {
    if any.header.class() == Class::Universal && any.header.tag() == tag {
        Ok(any)
    } else {
        Err(ParseError::Field(field))
    }
}

fn is_context(any: &Any<'_>, number: u32) -> bool {
    any.header.class() == Class::ContextSpecific && any.header.tag().0 == number
}

fn time_of(any: Option<&Any<'_>>, field: &'static str) -> Result<DateTime<Utc>, ParseError> {
    let any = any.ok_or(ParseError::Field(field))?;
    let any = expect(any.clone(), Tag::GeneralizedTime, field)?;
    let text = std::str::from_utf8(any.data).map_err(|_| ParseError::Field(field))?;
    parse_generalized_time(text)
}

/// CertID ::= SEQUENCE { hashAlgorithm, issuerNameHash, issuerKeyHash, serialNumber }
fn parse_cert_id(any: &Any<'_>) -> Result<OcspCertId, ParseError> {
    let fields = children(expect(any.clone(), Tag::Sequence, "certID")?)?;
    if fields.len() != 4 {
        return Err(ParseError::Field("certID"));
    }
    let algorithm = children(expect(fields[0].clone(), Tag::Sequence, "hashAlgorithm")?)?;
    let algorithm_oid = algorithm.first().ok_or(ParseError::Field("hashAlgorithm"))?;
    let algorithm_oid = expect(algorithm_oid.clone(), Tag::Oid, "hashAlgorithm")?;
    let hash_algorithm = Oid::new(Cow::Borrowed(algorithm_oid.data)).to_id_string();

    let issuer_name_hash = expect(fields[1].clone(), Tag::OctetString, "issuerNameHash")?;
    let issuer_key_hash = expect(fields[2].clone(), Tag::OctetString, "issuerKeyHash")?;
    let serial = expect(fields[3].clone(), Tag::Integer, "serialNumber")?;
    if serial.data.is_empty() {
        return Err(ParseError::Field("serialNumber"));
    }

    Ok(OcspCertId {
        hash_algorithm,
        issuer_name_hash: issuer_name_hash.data.to_vec(),
        issuer_key_hash: issuer_key_hash.data.to_vec(),
        serial: serial.data.to_vec(),
    })
}

/// ```asn1
/// CertStatus ::= CHOICE {
///     good        [0] IMPLICIT NULL,
///     revoked     [1] IMPLICIT RevokedInfo,
///     unknown     [2] IMPLICIT UnknownInfo
/// }
/// ```
fn parse_cert_status(any: &Any<'_>) -> Result<CertificateStatus, ParseError> {
    if is_context(any, 0) {
        return Ok(CertificateStatus::Good);
    }
    if is_context(any, 2) {
        return Ok(CertificateStatus::Unknown);
    }
    if !is_context(any, 1) {
        return Err(ParseError::Field("certStatus"));
    }

    // RevokedInfo ::= SEQUENCE { revocationTime, revocationReason [0] EXPLICIT CRLReason OPTIONAL }
    let info = children(any.clone())?;
    let revocation_time = time_of(info.first(), "revocationTime")?;
    let reason = match info.get(1) {
        Some(a) if is_context(a, 0) => parse_any(a.data)
            .ok()
            .and_then(|inner| inner.data.first().copied()),
        _ => None,
    };
    Ok(CertificateStatus::Revoked {
        revocation_time,
        reason,
    })
}

/// GeneralizedTime `YYYYMMDDHHMMSS[.fff]Z`
fn parse_generalized_time(time_str: &str) -> Result<DateTime<Utc>, ParseError> {
    NaiveDateTime::parse_from_str(time_str, "%Y%m%d%H%M%SZ")
        .or_else(|_| NaiveDateTime::parse_from_str(time_str, "%Y%m%d%H%M%S%.fZ"))
        .map(|naive| naive.and_utc())
        .map_err(|_| ParseError::Time(time_str.to_string()))
}
