//! Artifact parsing error types
//!
//! Errors raised while deriving cache attributes from OCSP responses and CRLs.

/// Errors that can occur while parsing a revocation artifact
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Payload was empty
    #[error("empty payload")]
    Empty,

    /// DER/PEM structure could not be decoded
    #[error("malformed encoding: {0}")]
    Encoding(String),

    /// A required field was absent or had an unexpected type
    #[error("missing or invalid field: {0}")]
    Field(&'static str),

    /// Timestamp could not be decoded
    #[error("invalid time '{0}'")]
    Time(String),

    /// CRL carries no nextUpdate
    #[error("CRL has no nextUpdate")]
    MissingNextUpdate,

    /// OCSP responder answered with a non-successful status
    #[error("OCSP response status is {0}, not successful")]
    UnsuccessfulResponse(String),

    /// Response type other than id-pkix-ocsp-basic
    #[error("unsupported OCSP response type")]
    UnsupportedResponseType,

    /// Artifact kind cannot be cached (certificates)
    #[error("{0} artifacts are not cacheable")]
    NotCacheable(&'static str),
}
