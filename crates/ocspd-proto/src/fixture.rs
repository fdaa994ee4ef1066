//! Synthetic artifacts for tests
//!
//! Two flavours:
//!
//! - [`CrlBuilder`] / [`OcspResponseBuilder`] assemble structurally valid
//!   (unsigned) DER that the production extractor accepts.
//! - [`FixtureArtifact`] is a line-based text artifact understood only by
//!   [`FixtureExtractor`], for engine tests that care about identity and
//!   validity windows but not about ASN.1.

use crate::artifact::{
    ArtifactKind, AttributeExtractor, CacheAttributes, NextUpdate, PayloadEncoding,
    OCSP_DEFAULT_VALIDITY_SECS, RECORD_TYPE_CRL_V2, RECORD_TYPE_OCSP_BASIC,
};
use crate::der;
use crate::error::ParseError;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};

/// GeneralizedTime spelling of the no-expiry marker
pub const CRL_NEXT_UPDATE_NEVER: &str = "99991231235959Z";

#[derive(Debug, Clone)]
enum TimeField {
    Utc(String),
    Generalized(String),
    Absent,
}

impl TimeField {
    fn encode(&self) -> Option<Vec<u8>> {
        match self {
            TimeField::Utc(s) => Some(der::utc_time(s)),
            TimeField::Generalized(s) => Some(der::generalized_time(s)),
            TimeField::Absent => None,
        }
    }
}

/// Builds an unsigned v2 CRL
#[derive(Debug, Clone)]
pub struct CrlBuilder {
    issuer_cn: String,
    this_update: String,
    next_update: TimeField,
    revoked: Vec<Vec<u8>>,
    signature_algorithm: Vec<u8>,
}

impl CrlBuilder {
    pub fn new(issuer_cn: &str) -> Self {
        Self {
            issuer_cn: issuer_cn.to_string(),
            this_update: "250101000000Z".to_string(),
            next_update: TimeField::Utc("350101000000Z".to_string()),
            revoked: Vec::new(),
            signature_algorithm: der::sha256_rsa_algorithm(),
        }
    }

    /// UTCTime `YYMMDDHHMMSSZ`
    pub fn this_update(mut self, utc_time: &str) -> Self {
        self.this_update = utc_time.to_string();
        self
    }

    /// UTCTime `YYMMDDHHMMSSZ`
    pub fn next_update(mut self, utc_time: &str) -> Self {
        self.next_update = TimeField::Utc(utc_time.to_string());
        self
    }

    /// GeneralizedTime `YYYYMMDDHHMMSSZ`
    pub fn next_update_generalized(mut self, generalized_time: &str) -> Self {
        self.next_update = TimeField::Generalized(generalized_time.to_string());
        self
    }

    pub fn next_update_at(self, at: DateTime<Utc>) -> Self {
        self.next_update_generalized(&at.format("%Y%m%d%H%M%SZ").to_string())
    }

    pub fn this_update_at(self, at: DateTime<Utc>) -> Self {
        self.this_update(&at.format("%y%m%d%H%M%SZ").to_string())
    }

    pub fn without_next_update(mut self) -> Self {
        self.next_update = TimeField::Absent;
        self
    }

    pub fn revoke(mut self, serial: &[u8]) -> Self {
        self.revoked.push(serial.to_vec());
        self
    }

    /// Declare a signature algorithm by OID, with NULL parameters
    pub fn signature_algorithm(mut self, oid: &[u64]) -> Self {
        self.signature_algorithm = der::sequence(&[der::oid(oid), der::null()]);
        self
    }

    /// Raw DER of the issuer Name this CRL will carry
    pub fn issuer_name_der(&self) -> Vec<u8> {
        der::common_name(&self.issuer_cn)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut tbs = vec![
            der::integer(&[1]),
            self.signature_algorithm.clone(),
            self.issuer_name_der(),
            der::utc_time(&self.this_update),
        ];
        if let Some(next) = self.next_update.encode() {
            tbs.push(next);
        }
        if !self.revoked.is_empty() {
            let entries: Vec<Vec<u8>> = self
                .revoked
                .iter()
                .map(|serial| der::sequence(&[der::integer(serial), der::utc_time(&self.this_update)]))
                .collect();
            tbs.push(der::sequence(&entries));
        }

        der::sequence(&[
            der::sequence(&tbs),
            self.signature_algorithm.clone(),
            der::bit_string(&[0u8; 32]),
        ])
    }

    pub fn build_pem(&self) -> String {
        pem_armour("X509 CRL", &self.build())
    }
}

/// Builds a self-issued CA certificate with a placeholder key and signature
#[derive(Debug, Clone)]
pub struct CertificateBuilder {
    subject_cn: String,
}

impl CertificateBuilder {
    pub fn new(subject_cn: &str) -> Self {
        Self {
            subject_cn: subject_cn.to_string(),
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let name = der::common_name(&self.subject_cn);
        let rsa_key = der::sequence(&[der::integer(&[0xC3; 256]), der::integer(&[0x01, 0x00, 0x01])]);
        let spki = der::sequence(&[
            der::sequence(&[der::oid(&[1, 2, 840, 113549, 1, 1, 1]), der::null()]),
            der::bit_string(&rsa_key),
        ]);
        let tbs = der::sequence(&[
            der::explicit(0, &der::integer(&[2])),
            der::integer(&[0x42]),
            der::sha256_rsa_algorithm(),
            name.clone(),
            der::sequence(&[der::utc_time("200101000000Z"), der::utc_time("400101000000Z")]),
            name,
            spki,
        ]);
        der::sequence(&[tbs, der::sha256_rsa_algorithm(), der::bit_string(&[0u8; 256])])
    }

    pub fn build_pem(&self) -> String {
        pem_armour("CERTIFICATE", &self.build())
    }
}

/// Status carried by a synthetic SingleResponse
#[derive(Debug, Clone)]
pub enum FixtureCertStatus {
    Good,
    Revoked(String),
    Unknown,
}

/// Builds an unsigned OCSP response with a single SingleResponse
#[derive(Debug, Clone)]
pub struct OcspResponseBuilder {
    response_status: u8,
    issuer_name_hash: Vec<u8>,
    issuer_key_hash: Vec<u8>,
    serial: Vec<u8>,
    status: FixtureCertStatus,
    produced_at: String,
    this_update: String,
    next_update: Option<String>,
}

impl OcspResponseBuilder {
    pub fn new(issuer_name_hash: &[u8], issuer_key_hash: &[u8], serial: &[u8]) -> Self {
        Self {
            response_status: 0,
            issuer_name_hash: issuer_name_hash.to_vec(),
            issuer_key_hash: issuer_key_hash.to_vec(),
            serial: serial.to_vec(),
            status: FixtureCertStatus::Good,
            produced_at: "20250101000000Z".to_string(),
            this_update: "20250101000000Z".to_string(),
            next_update: Some("20350101000000Z".to_string()),
        }
    }

    pub fn response_status(mut self, status: u8) -> Self {
        self.response_status = status;
        self
    }

    pub fn cert_status(mut self, status: FixtureCertStatus) -> Self {
        self.status = status;
        self
    }

    /// GeneralizedTime `YYYYMMDDHHMMSSZ`
    pub fn this_update(mut self, generalized_time: &str) -> Self {
        self.this_update = generalized_time.to_string();
        self.produced_at = generalized_time.to_string();
        self
    }

    pub fn next_update(mut self, generalized_time: Option<&str>) -> Self {
        self.next_update = generalized_time.map(str::to_string);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        if self.response_status != 0 {
            return der::sequence(&[der::enumerated(self.response_status)]);
        }

        let cert_id = der::sequence(&[
            der::sequence(&[der::oid(&[1, 3, 14, 3, 2, 26]), der::null()]),
            der::octet_string(&self.issuer_name_hash),
            der::octet_string(&self.issuer_key_hash),
            der::integer(&self.serial),
        ]);
        let cert_status = match &self.status {
            FixtureCertStatus::Good => der::implicit_primitive(0, &[]),
            FixtureCertStatus::Revoked(at) => der::explicit(1, &der::generalized_time(at)),
            FixtureCertStatus::Unknown => der::implicit_primitive(2, &[]),
        };
        let mut single = vec![cert_id, cert_status, der::generalized_time(&self.this_update)];
        if let Some(next) = &self.next_update {
            single.push(der::explicit(0, &der::generalized_time(next)));
        }

        let response_data = der::sequence(&[
            der::explicit(1, &der::common_name("Test Responder")),
            der::generalized_time(&self.produced_at),
            der::sequence(&[der::sequence(&single)]),
        ]);
        let basic = der::sequence(&[
            response_data,
            der::sha256_rsa_algorithm(),
            der::bit_string(&[0u8; 32]),
        ]);
        let response_bytes = der::sequence(&[
            der::oid(&[1, 3, 6, 1, 5, 5, 7, 48, 1, 1]),
            der::octet_string(&basic),
        ]);

        der::sequence(&[der::enumerated(0), der::explicit(0, &response_bytes)])
    }

    /// Cache identity the production extractor derives for this response
    pub fn identity(&self) -> Vec<u8> {
        // INTEGER content octets, as they appear on the wire
        let serial = der::integer(&self.serial);
        [
            self.issuer_name_hash.as_slice(),
            self.issuer_key_hash.as_slice(),
            &serial[2..],
        ]
        .concat()
    }
}

fn pem_armour(label: &str, der: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

/// Text artifact understood by [`FixtureExtractor`]
///
/// ```text
/// FIXTURE crl
/// identity=<hex>
/// this=<rfc3339>
/// next=<rfc3339|never>
/// revoked=<hex>,<hex>
/// body=<free text>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureArtifact {
    pub kind: ArtifactKind,
    pub identity: Vec<u8>,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<NextUpdate>,
    pub revoked: Vec<Vec<u8>>,
    pub body: String,
}

impl FixtureArtifact {
    /// CRL valid from one hour before `next_update`'s window opens
    pub fn crl(identity: &[u8], next_update: DateTime<Utc>) -> Self {
        Self {
            kind: ArtifactKind::Crl,
            identity: identity.to_vec(),
            this_update: next_update - Duration::days(30),
            next_update: Some(NextUpdate::At(next_update)),
            revoked: Vec::new(),
            body: String::new(),
        }
    }

    pub fn ocsp(identity: &[u8], this_update: DateTime<Utc>, next_update: DateTime<Utc>) -> Self {
        Self {
            kind: ArtifactKind::Ocsp,
            identity: identity.to_vec(),
            this_update,
            next_update: Some(NextUpdate::At(next_update)),
            revoked: Vec::new(),
            body: String::new(),
        }
    }

    pub fn this_update(mut self, at: DateTime<Utc>) -> Self {
        self.this_update = at;
        self
    }

    pub fn next_update(mut self, next: Option<NextUpdate>) -> Self {
        self.next_update = next;
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn revoke(mut self, serial: &[u8]) -> Self {
        self.revoked.push(serial.to_vec());
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "FIXTURE {}\nidentity={}\nthis={}\n",
            self.kind,
            hex::encode(&self.identity),
            self.this_update.to_rfc3339()
        );
        if let Some(next) = &self.next_update {
            out.push_str(&format!("next={}\n", next.to_field()));
        }
        if !self.revoked.is_empty() {
            let serials: Vec<String> = self.revoked.iter().map(hex::encode).collect();
            out.push_str(&format!("revoked={}\n", serials.join(",")));
        }
        out.push_str(&format!("body={}\n", self.body));
        out.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ParseError::Encoding("fixture is not UTF-8".to_string()))?;
        let mut lines = text.lines();

        let header = lines.next().ok_or(ParseError::Empty)?;
        let kind = match header.strip_prefix("FIXTURE ") {
            Some("crl") => ArtifactKind::Crl,
            Some("ocsp") => ArtifactKind::Ocsp,
            Some("certificate") => ArtifactKind::Certificate,
            _ => return Err(ParseError::Encoding("missing FIXTURE header".to_string())),
        };

        let mut identity = None;
        let mut this_update = None;
        let mut next_update = None;
        let mut revoked = Vec::new();
        let mut body = String::new();

        for line in lines {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ParseError::Encoding(format!("bad fixture line '{}'", line)))?;
            match key {
                "identity" => {
                    identity = Some(hex::decode(value).map_err(|_| ParseError::Field("identity"))?)
                }
                "this" => {
                    this_update = Some(
                        DateTime::parse_from_rfc3339(value)
                            .map_err(|_| ParseError::Time(value.to_string()))?
                            .with_timezone(&Utc),
                    )
                }
                "next" => {
                    next_update = Some(
                        NextUpdate::parse_field(value)
                            .ok_or_else(|| ParseError::Time(value.to_string()))?,
                    )
                }
                "revoked" => {
                    for serial in value.split(',').filter(|s| !s.is_empty()) {
                        revoked.push(hex::decode(serial).map_err(|_| ParseError::Field("revoked"))?);
                    }
                }
                "body" => body = value.to_string(),
                _ => return Err(ParseError::Encoding(format!("unknown fixture key '{}'", key))),
            }
        }

        Ok(Self {
            kind,
            identity: identity.ok_or(ParseError::Field("identity"))?,
            this_update: this_update.ok_or(ParseError::Field("this"))?,
            next_update,
            revoked,
            body,
        })
    }
}

/// Extractor for [`FixtureArtifact`] payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureExtractor;

impl AttributeExtractor for FixtureExtractor {
    fn derive(&self, kind: ArtifactKind, payload: &[u8]) -> Result<CacheAttributes, ParseError> {
        if payload.is_empty() {
            return Err(ParseError::Empty);
        }
        let artifact = FixtureArtifact::decode(payload)?;
        if artifact.kind != kind {
            return Err(ParseError::Field("kind"));
        }
        let (next_update, record_type) = match kind {
            ArtifactKind::Crl => (
                artifact.next_update.ok_or(ParseError::MissingNextUpdate)?,
                RECORD_TYPE_CRL_V2,
            ),
            ArtifactKind::Ocsp => (
                artifact.next_update.unwrap_or(NextUpdate::At(
                    artifact.this_update + Duration::seconds(OCSP_DEFAULT_VALIDITY_SECS),
                )),
                RECORD_TYPE_OCSP_BASIC,
            ),
            ArtifactKind::Certificate => return Err(ParseError::NotCacheable("certificate")),
        };
        let mut revoked_serials = artifact.revoked;
        revoked_serials.sort();
        Ok(CacheAttributes {
            kind,
            identity: artifact.identity,
            this_update: artifact.this_update,
            next_update,
            record_type,
            encoding: PayloadEncoding::Der,
            revoked_serials,
        })
    }
}
