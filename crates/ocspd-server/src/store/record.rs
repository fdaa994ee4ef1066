//! Record metadata and its `.update` sidecar encoding

use super::layout::RecordId;
use chrono::{DateTime, Utc};
use ocspd_proto::{
    ArtifactKind, CacheAttributes, NextUpdate, PayloadEncoding, RECORD_TYPE_CRL_V1,
    RECORD_TYPE_CRL_V2, RECORD_TYPE_OCSP_BASIC,
};
use serde::{Deserialize, Serialize};

/// Lookup/delete key; `None` components match anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub kind: ArtifactKind,
    pub identity: Option<Vec<u8>>,
    pub resource_url: Option<String>,
}

impl CacheKey {
    pub fn new(kind: ArtifactKind) -> Self {
        Self {
            kind,
            identity: None,
            resource_url: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<Vec<u8>>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.resource_url = Some(url.into());
        self
    }

    pub fn matches(&self, meta: &RecordMeta) -> bool {
        meta.kind == self.kind
            && self.identity.as_ref().map_or(true, |id| *id == meta.identity)
            && self
                .resource_url
                .as_ref()
                .map_or(true, |url| meta.source_url.as_deref() == Some(url.as_str()))
    }
}

/// Metadata of a stored record, read without its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub record_id: RecordId,
    pub kind: ArtifactKind,
    pub identity: Vec<u8>,
    pub source_url: Option<String>,
    pub this_update: Option<DateTime<Utc>>,
    /// `None` when missing or unparseable
    pub next_update: Option<NextUpdate>,
    pub record_type: String,
    pub encoding: String,
    pub inserted_at: Option<DateTime<Utc>>,
    /// hex(SHA-1(payload))
    pub payload_digest: String,
}

impl RecordMeta {
    /// Tags and validity fields are all recognised
    pub fn is_well_formed(&self) -> bool {
        let known_type = match self.kind {
            ArtifactKind::Crl => {
                self.record_type == RECORD_TYPE_CRL_V1 || self.record_type == RECORD_TYPE_CRL_V2
            }
            ArtifactKind::Ocsp => self.record_type == RECORD_TYPE_OCSP_BASIC,
            ArtifactKind::Certificate => false,
        };
        known_type
            && PayloadEncoding::parse(&self.encoding).is_some()
            && self.this_update.is_some()
            && self.next_update.is_some()
    }

    /// `this_update <= at < next_update`
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        match (self.this_update, self.next_update) {
            (Some(this), Some(next)) => this <= at && next.covers(at),
            _ => false,
        }
    }
}

/// JSON form of [`RecordMeta`]
///
/// Every field defaults so that a damaged sidecar still decodes into a
/// record the refresh engine can classify as badly formed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Sidecar {
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub this_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_update: Option<String>,
    #[serde(default)]
    pub record_type: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub inserted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload_sha1: String,
}

impl Sidecar {
    pub fn from_attributes(
        attrs: &CacheAttributes,
        source_url: Option<&str>,
        payload_sha1: String,
        inserted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity: hex::encode(&attrs.identity),
            source_url: source_url.map(str::to_string),
            this_update: Some(attrs.this_update),
            next_update: Some(attrs.next_update.to_field()),
            record_type: attrs.record_type.to_string(),
            encoding: attrs.encoding.as_str().to_string(),
            inserted_at: Some(inserted_at),
            payload_sha1,
        }
    }

    pub fn into_meta(self, record_id: RecordId) -> RecordMeta {
        RecordMeta {
            kind: record_id.kind,
            identity: hex::decode(&self.identity).unwrap_or_default(),
            source_url: self.source_url,
            this_update: self.this_update,
            next_update: self.next_update.as_deref().and_then(NextUpdate::parse_field),
            record_type: self.record_type,
            encoding: self.encoding,
            inserted_at: self.inserted_at,
            payload_digest: self.payload_sha1,
            record_id,
        }
    }
}
