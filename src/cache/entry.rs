//! The cached-response record and its freshness rules.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{CACHE_CONTROL, ETAG, EXPIRES, LAST_MODIFIED};
use http::HeaderMap;

/// One cached response.
///
/// `stored_at <= last_accessed_at` and `expires_at >= stored_at` hold by
/// construction; `last_accessed_at` is the only field mutated after
/// insertion (besides a 304 refresh of the validity window).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The cached response body.
    pub body: Bytes,
    /// The response headers at store time, as name/value pairs.
    pub headers: Vec<(String, String)>,
    /// The response status at store time.
    pub status: u16,
    /// When the entry was stored (or last revalidated).
    pub stored_at: SystemTime,
    /// When the entry stops being fresh.
    pub expires_at: SystemTime,
    /// The `ETag` validator, when the response carried one.
    pub etag: Option<String>,
    /// The `Last-Modified` validator, when the response carried one.
    pub last_modified: Option<String>,
    /// When the entry was last read.
    pub last_accessed_at: SystemTime,
}

impl CacheEntry {
    /// Builds an entry from a response, or `None` when the response
    /// declares no cacheability and the endpoint supplied no TTL.
    #[must_use]
    pub fn from_response(
        status: u16,
        headers: &HeaderMap,
        body: Bytes,
        endpoint_ttl: Option<Duration>,
        now: SystemTime,
    ) -> Option<Self> {
        let expires_at = expiry_from_headers(headers, endpoint_ttl, now)?;
        Some(Self {
            body,
            headers: headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_owned(), v.to_owned()))
                })
                .collect(),
            status,
            stored_at: now,
            expires_at,
            etag: header_string(headers, ETAG.as_str()),
            last_modified: header_string(headers, LAST_MODIFIED.as_str()),
            last_accessed_at: now,
        })
    }

    /// Whether the entry can be served without revalidation.
    #[must_use]
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }

    /// Whether a stale entry carries validators for a conditional request.
    #[must_use]
    pub fn can_revalidate(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// Records an access.
    pub fn touch(&mut self, now: SystemTime) {
        self.last_accessed_at = now;
    }

    /// Restarts the validity window after a 304, keeping the cached body.
    ///
    /// `fresh_headers` is the 304 response's header set; when it renews the
    /// caching directives the new window is used, otherwise the previous
    /// lifetime is replayed from now.
    pub fn revalidated(&mut self, fresh_headers: &HeaderMap, now: SystemTime) {
        let previous_lifetime = self
            .expires_at
            .duration_since(self.stored_at)
            .unwrap_or_default();
        self.expires_at = expiry_from_headers(fresh_headers, None, now)
            .unwrap_or(now + previous_lifetime);
        self.stored_at = now;
        self.last_accessed_at = now;
        if let Some(etag) = header_string(fresh_headers, ETAG.as_str()) {
            self.etag = Some(etag);
        }
        if let Some(lm) = header_string(fresh_headers, LAST_MODIFIED.as_str())
        {
            self.last_modified = Some(lm);
        }
    }

    /// The entry's accounted size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Computes the expiry instant a response declares, or the endpoint TTL
/// fallback. Returns `None` for uncacheable responses.
pub(crate) fn expiry_from_headers(
    headers: &HeaderMap,
    endpoint_ttl: Option<Duration>,
    now: SystemTime,
) -> Option<SystemTime> {
    let cache_control = headers
        .get(CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase);

    if let Some(cc) = &cache_control {
        if cc.contains("no-store") || cc.contains("no-cache") {
            return None;
        }
        if let Some(max_age) = parse_max_age(cc) {
            return Some(now + max_age);
        }
    }

    if let Some(expires) = headers
        .get(EXPIRES)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
    {
        // An Expires in the past declares the response already stale.
        return if expires > now { Some(expires) } else { None };
    }

    endpoint_ttl.map(|ttl| now + ttl)
}

fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control.split(',').find_map(|directive| {
        let directive = directive.trim();
        directive
            .strip_prefix("max-age=")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}
