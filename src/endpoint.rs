//! Static description of a single API call and its environment.
//!
//! An [`Endpoint`] is a value: path, method, headers, query items, optional
//! body and a handful of per-call hints. It is immutable once built and
//! carries the response type as a compile-time tag. An [`Environment`]
//! supplies the base URL and defaults shared by every call.

use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use indexmap::IndexMap;
use serde::Serialize;
use url::Url;

use crate::error::{ErrorKind, NetworkError, Result};

/// Default request timeout applied when neither the endpoint nor the caller
/// overrides it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Controls whether concurrent identical requests are collapsed into one
/// transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupPolicy {
    /// Deduplicate safe reads (`GET`, `HEAD`) only.
    #[default]
    Automatic,
    /// Deduplicate regardless of method.
    Always,
    /// Never deduplicate.
    Never,
}

/// The encoded request body carried by an endpoint.
///
/// Encoding happens when the body is attached so the endpoint stays a plain
/// value; an encoding failure is deferred and surfaced as
/// [`ErrorKind::EncodingFailed`] when the request is built.
#[derive(Debug, Clone)]
pub(crate) enum BodySpec {
    /// Ready-to-send bytes and an optional explicit content type.
    Bytes { bytes: Bytes, content_type: Option<String> },
    /// The body failed to encode; the message describes why.
    Invalid(String),
}

/// A typed, immutable description of one API call.
///
/// The type parameter `T` tags the response type the call decodes to; it is
/// never stored.
pub struct Endpoint<T> {
    pub(crate) path: String,
    pub(crate) method: Method,
    pub(crate) headers: IndexMap<String, String>,
    pub(crate) query: IndexMap<String, String>,
    pub(crate) body: Option<BodySpec>,
    pub(crate) dedup: DedupPolicy,
    pub(crate) cache_ttl: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
    _response: PhantomData<fn() -> T>,
}

// Manual impls keep the phantom response tag from imposing bounds on `T`.
impl<T> Clone for Endpoint<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
            dedup: self.dedup,
            cache_ttl: self.cache_ttl,
            timeout: self.timeout,
            _response: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Endpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("dedup", &self.dedup)
            .finish_non_exhaustive()
    }
}

impl<T> Endpoint<T> {
    /// Creates an endpoint for `method` at `path` (relative to the
    /// environment's base URL).
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            headers: IndexMap::new(),
            query: IndexMap::new(),
            body: None,
            dedup: DedupPolicy::default(),
            cache_ttl: None,
            timeout: None,
            _response: PhantomData,
        }
    }

    /// Shorthand for a `GET` endpoint.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Shorthand for a `POST` endpoint.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Shorthand for a `PUT` endpoint.
    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// Shorthand for a `PATCH` endpoint.
    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// Shorthand for a `DELETE` endpoint.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Adds a header. Later additions with the same name replace earlier
    /// ones; endpoint headers override environment defaults.
    #[must_use]
    pub fn header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds a query item. Items are appended to the URL in the order they
    /// were declared.
    #[must_use]
    pub fn query(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Attaches a JSON body, encoded immediately with the crate's codec.
    #[must_use]
    pub fn json<B: Serialize>(mut self, body: &B) -> Self {
        self.body = Some(match serde_json::to_vec(body) {
            Ok(bytes) => {
                BodySpec::Bytes { bytes: Bytes::from(bytes), content_type: None }
            }
            Err(err) => BodySpec::Invalid(err.to_string()),
        });
        self
    }

    /// Attaches a raw body with an explicit content type.
    #[must_use]
    pub fn bytes(
        mut self,
        bytes: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Self {
        self.body = Some(BodySpec::Bytes {
            bytes: bytes.into(),
            content_type: Some(content_type.into()),
        });
        self
    }

    /// Sets the deduplication policy (default [`DedupPolicy::Automatic`]).
    #[must_use]
    pub fn dedup(mut self, policy: DedupPolicy) -> Self {
        self.dedup = policy;
        self
    }

    /// Opts the endpoint into caching with an explicit time-to-live, used
    /// when the response itself carries no caching headers.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Overrides the environment's default timeout for this call.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The endpoint's method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The endpoint's path, relative to the environment base URL.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this endpoint is eligible for request deduplication.
    #[must_use]
    pub fn dedup_eligible(&self) -> bool {
        match self.dedup {
            DedupPolicy::Always => true,
            DedupPolicy::Never => false,
            DedupPolicy::Automatic => {
                self.method == Method::GET || self.method == Method::HEAD
            }
        }
    }
}

/// Connection-independent defaults shared by every call of a client.
#[derive(Debug, Clone)]
pub struct Environment {
    pub(crate) base_url: Url,
    pub(crate) default_headers: IndexMap<String, String>,
    pub(crate) default_timeout: Duration,
}

impl Environment {
    /// Creates an environment from an absolute base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidUrl`] when the URL does not parse or is
    /// not an absolute `http`/`https` URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = Url::parse(base_url).map_err(|err| {
            NetworkError::new(ErrorKind::InvalidUrl).with_source(err)
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(NetworkError::new(ErrorKind::InvalidUrl).into());
        }
        Ok(Self {
            base_url: parsed,
            default_headers: IndexMap::new(),
            default_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Adds a default header applied to every request unless overridden.
    #[must_use]
    pub fn default_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Sets the default timeout (30 seconds when unset).
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The absolute base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automatic_dedup_covers_safe_reads_only() {
        assert!(Endpoint::<()>::get("/a").dedup_eligible());
        assert!(Endpoint::<()>::new(Method::HEAD, "/a").dedup_eligible());
        assert!(!Endpoint::<()>::post("/a").dedup_eligible());
        assert!(!Endpoint::<()>::delete("/a").dedup_eligible());
    }

    #[test]
    fn explicit_policies_override_method() {
        assert!(Endpoint::<()>::post("/a")
            .dedup(DedupPolicy::Always)
            .dedup_eligible());
        assert!(!Endpoint::<()>::get("/a")
            .dedup(DedupPolicy::Never)
            .dedup_eligible());
    }

    #[test]
    fn environment_requires_absolute_http_url() {
        assert!(Environment::new("https://api.example.com").is_ok());
        assert!(Environment::new("not a url").is_err());
        assert!(Environment::new("ftp://api.example.com").is_err());
        let err = Environment::new("/relative").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUrl);
    }

    #[test]
    fn later_headers_replace_earlier_ones() {
        let endpoint =
            Endpoint::<()>::get("/a").header("x-a", "1").header("x-a", "2");
        assert_eq!(endpoint.headers.get("x-a").map(String::as_str), Some("2"));
    }

    #[test]
    fn query_order_is_declaration_order() {
        let endpoint =
            Endpoint::<()>::get("/a").query("b", "2").query("a", "1");
        let keys: Vec<&str> =
            endpoint.query.keys().map(String::as_str).collect();
        assert_eq!(keys, ["b", "a"]);
    }
}
