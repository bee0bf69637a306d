//! Network permissions for sandboxed extensions.
//!
//! An extension may only reach the host of its `baseUrl` (plus subdomains)
//! and the domains it declares in its manifest. The set is derived once per
//! manifest and bound into every bridge primitive before extension code runs.

use std::collections::BTreeSet;
use std::fmt;

use url::Url;

use super::error::{ExtensionError, ExtensionResult};
use super::manifest::Manifest;

/// Immutable set of domain patterns an extension may reach.
///
/// Patterns are either exact hosts (`api.example.com`) or wildcard
/// subdomain forms (`*.example.com`, which also matches `example.com`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedDomainSet {
    exact: BTreeSet<String>,
    wildcard: BTreeSet<String>,
}

impl AllowedDomainSet {
    /// Derive the allowed set from a validated manifest.
    pub fn from_manifest(manifest: &Manifest) -> ExtensionResult<Self> {
        let host = manifest.base_host()?;
        let mut set = Self::default();

        set.insert_pattern(&host);
        set.insert_pattern(&format!("*.{}", host));

        for domain in &manifest.declared_domains {
            set.insert_pattern(domain);
        }

        Ok(set)
    }

    /// Build a set directly from patterns.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for pattern in patterns {
            set.insert_pattern(pattern.as_ref());
        }
        set
    }

    fn insert_pattern(&mut self, pattern: &str) {
        let pattern = normalize_host(pattern);
        if pattern.is_empty() {
            return;
        }

        if let Some(suffix) = pattern.strip_prefix("*.") {
            self.wildcard.insert(suffix.to_string());
        } else {
            self.exact.insert(pattern);
        }
    }

    /// Check whether a host is covered by the set.
    pub fn allows_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }

        if self.exact.contains(&host) {
            return true;
        }

        self.wildcard.iter().any(|suffix| {
            host == *suffix
                || (host.len() > suffix.len()
                    && host.ends_with(suffix.as_str())
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
        })
    }

    /// Parse and check a URL, returning it when its host is allowed.
    pub fn check_url(&self, raw: &str) -> ExtensionResult<Url> {
        let url = Url::parse(raw).map_err(|_| ExtensionError::DomainNotAllowed {
            domain: raw.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExtensionError::DomainNotAllowed {
                domain: raw.to_string(),
            });
        }

        let host = url.host_str().unwrap_or_default().to_string();
        if self.allows_host(&host) {
            Ok(url)
        } else {
            Err(ExtensionError::DomainNotAllowed { domain: host })
        }
    }

    /// Every pattern in the set, wildcard forms prefixed with `*.`.
    pub fn patterns(&self) -> Vec<String> {
        self.exact
            .iter()
            .cloned()
            .chain(self.wildcard.iter().map(|s| format!("*.{}", s)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }
}

impl fmt::Display for AllowedDomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.patterns().join(", "))
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
