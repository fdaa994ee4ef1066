//! On-disk naming
//!
//! ```text
//! <cache_dir>/<kind>/<hex(SHA-1(identity))>/<hex(SHA-1(source_url or identity))>.<ext>
//! ```
//!
//! Identical identity/URL bytes always map to the same path, so a record is
//! addressed without any index file.

use ocspd_proto::ArtifactKind;
use sha1::{Digest, Sha1};
use std::fmt;
use std::path::{Path, PathBuf};

/// Raw CRL payload
pub const EXT_CRL: &str = "crl";
/// Raw OCSP response payload
pub const EXT_OCSP: &str = "ocsp";
/// JSON metadata sidecar; its presence is what makes a record exist
pub const EXT_UPDATE: &str = "update";
/// Revoked serials, hex, one per line (CRLs only)
pub const EXT_REVOKED: &str = "revoked";
/// Issuer chain supplied alongside the payload
pub const EXT_PEM: &str = "pem";
/// Suffix of files being written
pub const EXT_TMP: &str = "tmp";

pub fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

pub fn payload_ext(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Crl => EXT_CRL,
        _ => EXT_OCSP,
    }
}

/// Stable address of one record inside a store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub kind: ArtifactKind,
    /// hex(SHA-1(identity))
    pub bucket: String,
    /// hex(SHA-1(source_url or identity))
    pub stem: String,
}

impl RecordId {
    pub fn new(kind: ArtifactKind, identity: &[u8], source_url: Option<&str>) -> Self {
        let stem = match source_url {
            Some(url) => sha1_hex(url.as_bytes()),
            None => sha1_hex(identity),
        };
        Self {
            kind,
            bucket: sha1_hex(identity),
            stem,
        }
    }

    pub fn bucket_dir(&self, store_root: &Path) -> PathBuf {
        store_root.join(&self.bucket)
    }

    /// Path of one of this record's files
    pub fn file(&self, store_root: &Path, ext: &str) -> PathBuf {
        self.bucket_dir(store_root).join(format!("{}.{}", self.stem, ext))
    }

    pub fn payload_file(&self, store_root: &Path) -> PathBuf {
        self.file(store_root, payload_ext(self.kind))
    }

    pub fn sidecar_file(&self, store_root: &Path) -> PathBuf {
        self.file(store_root, EXT_UPDATE)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.bucket, self.stem)
    }
}

/// Temporary sibling used for write-then-rename
pub fn tmp_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(EXT_TMP);
    final_path.with_file_name(name)
}
