//! Route table for the reverse proxy.
//!
//! Maps external path prefixes to upstream base URLs. Lookups use the longest
//! prefix that matches the request path on a segment boundary, so `/api`
//! matches `/api` and `/api/x` but never `/apiary`.
//!
//! # Example
//!
//! ```rust
//! use tollgate_gateway::routing::{RouteEntry, RouteTable};
//!
//! let table = RouteTable::from_entries(vec![
//!     RouteEntry::new("/backend", "http://svc:9000").unwrap(),
//! ]);
//!
//! let matched = table.resolve("/backend/accounts/abc").unwrap();
//! assert_eq!(
//!     matched.upstream_url(None).as_str(),
//!     "http://svc:9000/accounts/abc"
//! );
//! ```

use std::sync::Arc;

use reqwest::Url;
use thiserror::Error;

/// Reasons a route entry is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("route prefix '{0}' must start with '/'")]
    RelativePrefix(String),

    #[error("invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("upstream '{0}' must be an http(s) URL with a host")]
    UnsupportedUpstream(String),
}

/// A single `prefix -> upstream` mapping. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    prefix: String,
    upstream: Url,
    name: String,
}

impl RouteEntry {
    /// Creates a route entry.
    ///
    /// The prefix must start with `/`; a trailing slash is dropped. The
    /// upstream must be an absolute `http` or `https` URL.
    pub fn new(prefix: &str, upstream: &str) -> Result<Self, RouteError> {
        if !prefix.starts_with('/') {
            return Err(RouteError::RelativePrefix(prefix.to_string()));
        }

        let upstream = Url::parse(upstream).map_err(|e| RouteError::InvalidUpstream {
            url: upstream.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(upstream.scheme(), "http" | "https") || upstream.host_str().is_none() {
            return Err(RouteError::UnsupportedUpstream(upstream.to_string()));
        }

        let prefix = match prefix.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        let name = match prefix.trim_matches('/') {
            "" => upstream.host_str().unwrap_or("upstream").to_string(),
            segment => segment.to_string(),
        };

        Ok(Self {
            prefix,
            upstream,
            name,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Short name used in logs and error bodies.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `host[:port]` of the upstream, used as the forwarded `Host` header.
    pub fn authority(&self) -> String {
        let host = self.upstream.host_str().unwrap_or_default();
        match self.upstream.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Remainder of `path` after this prefix, or `None` if it does not match.
    fn strip<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.prefix == "/" {
            return Some(path);
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        (rest.is_empty() || rest.starts_with('/')).then_some(rest)
    }
}

/// Result of resolving a request path.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    entry: Arc<RouteEntry>,
    remainder: String,
}

impl RouteMatch {
    pub fn entry(&self) -> &RouteEntry {
        &self.entry
    }

    /// Path left after stripping the matched prefix.
    pub fn remainder(&self) -> &str {
        &self.remainder
    }

    /// Upstream URL for this match: base path joined with the remainder.
    pub fn upstream_url(&self, query: Option<&str>) -> Url {
        let mut url = self.entry.upstream.clone();
        let joined = join_paths(url.path(), &self.remainder);
        url.set_path(&joined);
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }
}

/// Joins two path pieces with exactly one slash between them.
fn join_paths(base: &str, rest: &str) -> String {
    if rest.is_empty() {
        return if base.is_empty() { "/".to_string() } else { base.to_string() };
    }
    match (base.ends_with('/'), rest.starts_with('/')) {
        (true, true) => format!("{base}{}", &rest[1..]),
        (false, false) => format!("{base}/{rest}"),
        _ => format!("{base}{rest}"),
    }
}

/// Longest-prefix route table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<Arc<RouteEntry>>,
}

impl RouteTable {
    /// Builds a table. Entries are kept longest prefix first; on duplicate
    /// prefixes the first entry wins.
    pub fn from_entries(entries: Vec<RouteEntry>) -> Self {
        let mut deduped: Vec<Arc<RouteEntry>> = Vec::with_capacity(entries.len());
        for entry in entries {
            if !deduped.iter().any(|e| e.prefix == entry.prefix) {
                deduped.push(Arc::new(entry));
            }
        }
        deduped.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { entries: deduped }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter().map(|e| e.as_ref())
    }

    /// Finds the entry with the longest prefix matching `path`.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        self.entries.iter().find_map(|entry| {
            entry.strip(path).map(|rest| RouteMatch {
                entry: Arc::clone(entry),
                remainder: rest.to_string(),
            })
        })
    }

    /// Bounded route label for a request: the matched route template when
    /// the router found one, else the proxy prefix, else `unmatched`.
    pub fn identity(&self, matched: Option<&str>, path: &str) -> String {
        match matched {
            Some(template) => template.to_string(),
            None => self
                .resolve(path)
                .map(|m| m.entry().prefix().to_string())
                .unwrap_or_else(|| "unmatched".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::from_entries(vec![
            RouteEntry::new("/backend", "http://svc:9000").unwrap(),
            RouteEntry::new("/backend/admin", "http://admin:9100/internal/").unwrap(),
            RouteEntry::new("/participant/", "https://participant.local/api").unwrap(),
        ])
    }

    #[test]
    fn rewrites_backend_path() {
        let matched = table().resolve("/backend/accounts/abc").unwrap();
        assert_eq!(matched.entry().name(), "backend");
        assert_eq!(
            matched.upstream_url(None).as_str(),
            "http://svc:9000/accounts/abc"
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let matched = table().resolve("/backend/admin/users").unwrap();
        assert_eq!(matched.entry().prefix(), "/backend/admin");
        assert_eq!(
            matched.upstream_url(None).as_str(),
            "http://admin:9100/internal/users"
        );
    }

    #[test]
    fn joins_base_path_and_keeps_query() {
        let matched = table().resolve("/participant/node/status").unwrap();
        assert_eq!(
            matched.upstream_url(Some("verbose=1")).as_str(),
            "https://participant.local/api/node/status?verbose=1"
        );
    }

    #[test]
    fn exact_prefix_maps_to_base() {
        let matched = table().resolve("/backend").unwrap();
        assert_eq!(matched.remainder(), "");
        assert_eq!(matched.upstream_url(None).as_str(), "http://svc:9000/");
    }

    #[test]
    fn prefix_matches_only_on_segment_boundary() {
        assert!(table().resolve("/backendish/x").is_none());
        assert!(table().resolve("/unknown").is_none());
    }

    #[test]
    fn root_prefix_matches_everything() {
        let table =
            RouteTable::from_entries(vec![RouteEntry::new("/", "http://fallback:80").unwrap()]);
        let matched = table.resolve("/a/b").unwrap();
        assert_eq!(matched.entry().name(), "fallback");
        assert_eq!(matched.upstream_url(None).as_str(), "http://fallback/a/b");
    }

    #[test]
    fn authority_includes_explicit_port() {
        let entry = RouteEntry::new("/x", "http://svc:9000").unwrap();
        assert_eq!(entry.authority(), "svc:9000");
        let entry = RouteEntry::new("/x", "https://svc.example").unwrap();
        assert_eq!(entry.authority(), "svc.example");
    }

    #[test]
    fn rejects_invalid_entries() {
        assert_eq!(
            RouteEntry::new("backend", "http://svc"),
            Err(RouteError::RelativePrefix("backend".into()))
        );
        assert!(matches!(
            RouteEntry::new("/backend", "not a url"),
            Err(RouteError::InvalidUpstream { .. })
        ));
        assert!(matches!(
            RouteEntry::new("/backend", "ftp://svc"),
            Err(RouteError::UnsupportedUpstream(_))
        ));
    }

    #[test]
    fn identity_prefers_template_then_prefix() {
        let table = table();
        assert_eq!(table.identity(Some("/messages/{id}/anchor"), "/messages/7/anchor"), "/messages/{id}/anchor");
        assert_eq!(table.identity(None, "/backend/admin/users/9"), "/backend/admin");
        assert_eq!(table.identity(None, "/nowhere/1"), "unmatched");
    }

    #[test]
    fn duplicate_prefix_keeps_first() {
        let table = RouteTable::from_entries(vec![
            RouteEntry::new("/a", "http://one").unwrap(),
            RouteEntry::new("/a/", "http://two").unwrap(),
        ]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve("/a").unwrap().entry().authority(), "one");
    }
}
