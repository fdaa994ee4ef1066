//! LDAP transport (RFC 4516 URLs)
//!
//! `ldap://host[:port]/<dn>?<attributes>?<scope>?<filter>?<extensions>`
//!
//! The search must yield exactly one attribute value. Zero values and
//! ambiguous multiple values are both reported as [`FetchError::NotFound`];
//! the fetcher never picks one implicitly.

use super::FetchError;
use crate::config::FetchConfig;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchResult};
use ocspd_proto::ArtifactKind;
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, error, warn};

const LDAP_NO_SUCH_OBJECT: u32 = 32;

/// Search scope component of an LDAP URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    One,
    Sub,
}

impl From<SearchScope> for Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::One => Scope::OneLevel,
            SearchScope::Sub => Scope::Subtree,
        }
    }
}

/// Decoded RFC 4516 URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    /// `ldap[s]://host[:port]`
    pub server: String,
    pub base_dn: String,
    pub attributes: Vec<String>,
    pub scope: SearchScope,
    pub filter: String,
}

impl LdapUrl {
    /// Parse `url`, filling in the attribute that holds `kind` when the URL
    /// names none
    pub fn parse(url: &Url, kind: ArtifactKind) -> Result<Self, FetchError> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FetchError::BadUri(format!("{}: missing host", url)))?;
        let server = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };

        let base_dn = percent_decode(url.path().trim_start_matches('/'))?;

        let mut parts = url.query().unwrap_or("").splitn(4, '?');
        let attributes: Vec<String> = parts
            .next()
            .unwrap_or("")
            .split(',')
            .filter(|a| !a.is_empty())
            .map(percent_decode)
            .collect::<Result<_, _>>()?;
        let scope = match parts.next().unwrap_or("") {
            "" | "base" => SearchScope::Base,
            "one" => SearchScope::One,
            "sub" => SearchScope::Sub,
            other => return Err(FetchError::BadUri(format!("unknown LDAP scope '{}'", other))),
        };
        let filter = match parts.next().unwrap_or("") {
            "" => "(objectClass=*)".to_string(),
            f => percent_decode(f)?,
        };
        if let Some(extensions) = parts.next() {
            // No extensions are supported, so critical ones must fail
            if extensions.split(',').any(|ext| ext.starts_with('!')) {
                return Err(FetchError::BadUri(format!(
                    "unsupported critical LDAP extension in {}",
                    url
                )));
            }
        }

        let attributes = if attributes.is_empty() {
            vec![default_attribute(kind)?.to_string()]
        } else {
            attributes
        };

        Ok(Self {
            server,
            base_dn,
            attributes,
            scope,
            filter,
        })
    }
}

fn default_attribute(kind: ArtifactKind) -> Result<&'static str, FetchError> {
    match kind {
        ArtifactKind::Crl => Ok("certificateRevocationList;binary"),
        ArtifactKind::Certificate => Ok("cACertificate;binary"),
        ArtifactKind::Ocsp => Err(FetchError::BadUri(
            "OCSP is not served over LDAP".to_string(),
        )),
    }
}

/// Decode `%XX` escapes; the result must be UTF-8
fn percent_decode(s: &str) -> Result<String, FetchError> {
    urlencoding::decode(s)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| FetchError::BadUri(format!("'{}' is not UTF-8", s)))
}

#[derive(Debug, Clone)]
pub struct LdapFetcher {
    timeout: Duration,
    connect_timeout: Duration,
    max_response_bytes: u64,
}

impl LdapFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            max_response_bytes: config.max_response_bytes,
        }
    }

    /// Run the search described by `url`, bounded by the request timeout
    pub async fn search(&self, url: &LdapUrl) -> Result<Vec<u8>, FetchError> {
        match tokio::time::timeout(self.timeout, self.search_inner(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(format!(
                "LDAP search on {} exceeded {:?}",
                url.server, self.timeout
            ))),
        }
    }

    async fn search_inner(&self, url: &LdapUrl) -> Result<Vec<u8>, FetchError> {
        debug!(
            server = %url.server,
            base_dn = %url.base_dn,
            filter = %url.filter,
            "Searching LDAP"
        );

        let settings = LdapConnSettings::new().set_conn_timeout(self.connect_timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url.server)
            .await
            .map_err(|e| FetchError::NetworkFailure(format!("{}: {}", url.server, e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                error!("LDAP connection driver error: {}", e);
            }
        });

        let SearchResult(entries, result) = ldap
            .search(&url.base_dn, url.scope.into(), &url.filter, url.attributes.clone())
            .await
            .map_err(|e| FetchError::NetworkFailure(format!("{}: {}", url.server, e)))?;
        let _ = ldap.unbind().await;

        match result.rc {
            0 => {}
            LDAP_NO_SUCH_OBJECT => {
                return Err(FetchError::NotFound(format!("{} on {}", url.base_dn, url.server)))
            }
            rc => {
                return Err(FetchError::BadRequest(format!(
                    "LDAP search failed with rc={} ({})",
                    rc, result.text
                )))
            }
        }

        let mut values: Vec<Vec<u8>> = Vec::new();
        for entry in entries {
            let entry = SearchEntry::construct(entry);
            for (_, vals) in entry.bin_attrs {
                values.extend(vals);
            }
            for (_, vals) in entry.attrs {
                values.extend(vals.into_iter().map(String::into_bytes));
            }
        }

        let value = single_value(values, url)?;
        if value.len() as u64 > self.max_response_bytes {
            return Err(FetchError::TooLarge {
                size: value.len() as u64,
                limit: self.max_response_bytes,
            });
        }
        debug!(server = %url.server, bytes = value.len(), "LDAP fetch complete");
        Ok(value)
    }
}

/// Exactly one value, or `NotFound`
fn single_value(mut values: Vec<Vec<u8>>, url: &LdapUrl) -> Result<Vec<u8>, FetchError> {
    match values.len() {
        0 => Err(FetchError::NotFound(format!(
            "no {} value under {}",
            url.attributes.join(","),
            url.base_dn
        ))),
        1 => {
            let value = values.remove(0);
            if value.is_empty() {
                Err(FetchError::EmptyResponse(url.server.clone()))
            } else {
                Ok(value)
            }
        }
        n => {
            warn!(
                server = %url.server,
                base_dn = %url.base_dn,
                count = n,
                "Ambiguous LDAP result, refusing to pick one"
            );
            Err(FetchError::NotFound(format!(
                "{} values under {}, expected exactly one",
                n, url.base_dn
            )))
        }
    }
}
