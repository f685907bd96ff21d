//! Canonical request construction.
//!
//! Merges environment defaults, endpoint declarations and per-call
//! overrides into a single [`CanonicalRequest`], and derives the identities
//! the pipeline keys on: the deduplication [`RequestFingerprint`] and the
//! cache key.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::endpoint::{BodySpec, Endpoint, Environment};
use crate::error::{ErrorKind, NetworkError, Result};

/// Per-call overrides, highest in the header-precedence chain.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub(crate) headers: IndexMap<String, String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl RequestOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header that overrides both environment and endpoint values.
    #[must_use]
    pub fn header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Overrides the timeout for this call only.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a cancellation token; cancelling it aborts the call at its
    /// next suspension point with [`ErrorKind::Cancelled`].
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A fully resolved request, built once per attempt.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    /// The absolute request URL with query items appended.
    pub url: Url,
    /// The request method.
    pub method: Method,
    /// The effective header map after precedence merging.
    pub headers: HeaderMap,
    /// The encoded request body, when one was declared.
    pub body: Option<Bytes>,
    /// The per-attempt timeout.
    pub timeout: Duration,
    /// The absolute deadline for this attempt.
    pub deadline: Instant,
}

impl CanonicalRequest {
    /// Builds the canonical request for an endpoint.
    ///
    /// Header precedence, lowest to highest: environment defaults, endpoint
    /// headers, caller overrides. A body without an explicit `Content-Type`
    /// is sent as `application/json`.
    pub fn build<T>(
        endpoint: &Endpoint<T>,
        environment: &Environment,
        options: &RequestOptions,
    ) -> Result<Self> {
        let mut url =
            environment.base_url.join(&endpoint.path).map_err(|err| {
                NetworkError::new(ErrorKind::InvalidUrl).with_source(err)
            })?;
        if !endpoint.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &endpoint.query {
                pairs.append_pair(name, value);
            }
        }

        let mut headers = HeaderMap::new();
        for source in
            [&environment.default_headers, &endpoint.headers, &options.headers]
        {
            merge_headers(&mut headers, source)?;
        }

        let body = match &endpoint.body {
            None => None,
            Some(BodySpec::Invalid(message)) => {
                return Err(NetworkError::new(ErrorKind::EncodingFailed)
                    .with_source(EncodeFailure(message.clone())));
            }
            Some(BodySpec::Bytes { bytes, content_type }) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    let declared =
                        content_type.as_deref().unwrap_or("application/json");
                    headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_str(declared).map_err(|err| {
                            NetworkError::new(ErrorKind::EncodingFailed)
                                .with_source(err)
                        })?,
                    );
                }
                Some(bytes.clone())
            }
        };

        let timeout = options
            .timeout
            .or(endpoint.timeout)
            .unwrap_or(environment.default_timeout);

        Ok(Self {
            url,
            method: endpoint.method.clone(),
            headers,
            body,
            timeout,
            deadline: Instant::now() + timeout,
        })
    }

    /// Returns a copy with the deadline recomputed from now, for a fresh
    /// retry attempt.
    #[must_use]
    pub fn with_fresh_deadline(&self) -> Self {
        let mut copy = self.clone();
        copy.deadline = Instant::now() + copy.timeout;
        copy
    }

    /// The cache key for this request: `"{method}:{url}"`.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.method, self.url)
    }

    /// Whether the method participates in response caching.
    #[must_use]
    pub fn is_cacheable_method(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// Computes the deduplication fingerprint of this request.
    #[must_use]
    pub fn fingerprint(&self) -> RequestFingerprint {
        let mut hasher = Sha256::new();
        if let Some(body) = &self.body {
            hasher.update(body);
        }
        RequestFingerprint {
            method: self.method.clone(),
            url: self.url.to_string(),
            body_sha256: hasher.finalize().into(),
        }
    }
}

fn merge_headers(
    target: &mut HeaderMap,
    source: &IndexMap<String, String>,
) -> Result<()> {
    for (name, value) in source {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
            NetworkError::new(ErrorKind::Unknown).with_source(err)
        })?;
        let value = HeaderValue::from_str(value).map_err(|err| {
            NetworkError::new(ErrorKind::Unknown).with_source(err)
        })?;
        target.insert(name, value);
    }
    Ok(())
}

/// Structural identity of an outgoing request, used to collapse concurrent
/// duplicates.
///
/// The fingerprint is the method, the final URL and the SHA-256 of the
/// encoded body bytes (the hash of the empty string when there is no body).
/// It does not depend on headers or their order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint {
    method: Method,
    url: String,
    body_sha256: [u8; 32],
}

impl RequestFingerprint {
    /// Hex rendering of the body hash, for diagnostics.
    #[must_use]
    pub fn body_digest(&self) -> String {
        hex::encode(self.body_sha256)
    }
}

#[derive(Debug)]
struct EncodeFailure(String);

impl std::fmt::Display for EncodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "body encoding failed: {}", self.0)
    }
}

impl std::error::Error for EncodeFailure {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    fn environment() -> Environment {
        Environment::new("https://api.example.com/v1/")
            .unwrap()
            .default_header("x-client", "reqflow")
            .default_header("accept", "application/json")
    }

    #[test]
    fn url_joins_base_and_path_with_ordered_query() {
        let endpoint =
            Endpoint::<()>::get("items").query("b", "2").query("a", "1");
        let request = CanonicalRequest::build(
            &endpoint,
            &environment(),
            &RequestOptions::new(),
        )
        .unwrap();
        assert_eq!(
            request.url.as_str(),
            "https://api.example.com/v1/items?b=2&a=1"
        );
    }

    #[test]
    fn header_precedence_is_env_endpoint_override() {
        let endpoint = Endpoint::<()>::get("items")
            .header("x-client", "endpoint")
            .header("x-extra", "e");
        let options = RequestOptions::new().header("x-extra", "override");
        let request =
            CanonicalRequest::build(&endpoint, &environment(), &options)
                .unwrap();
        assert_eq!(request.headers.get("x-client").unwrap(), "endpoint");
        assert_eq!(request.headers.get("x-extra").unwrap(), "override");
        assert_eq!(request.headers.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn json_body_defaults_content_type() {
        #[derive(Serialize)]
        struct Payload {
            name: &'static str,
        }
        let endpoint =
            Endpoint::<()>::post("items").json(&Payload { name: "a" });
        let request = CanonicalRequest::build(
            &endpoint,
            &environment(),
            &RequestOptions::new(),
        )
        .unwrap();
        assert_eq!(
            request.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let expected: &[u8] = br#"{"name":"a"}"#;
        assert_eq!(request.body.as_deref(), Some(expected));
    }

    #[test]
    fn timeout_precedence_is_override_endpoint_env() {
        let endpoint =
            Endpoint::<()>::get("items").timeout(Duration::from_secs(5));
        let env = environment().default_timeout(Duration::from_secs(10));

        let from_endpoint =
            CanonicalRequest::build(&endpoint, &env, &RequestOptions::new())
                .unwrap();
        assert_eq!(from_endpoint.timeout, Duration::from_secs(5));

        let options = RequestOptions::new().timeout(Duration::from_secs(1));
        let from_options =
            CanonicalRequest::build(&endpoint, &env, &options).unwrap();
        assert_eq!(from_options.timeout, Duration::from_secs(1));

        let plain = Endpoint::<()>::get("items");
        let from_env =
            CanonicalRequest::build(&plain, &env, &RequestOptions::new())
                .unwrap();
        assert_eq!(from_env.timeout, Duration::from_secs(10));
    }

    #[test]
    fn bad_join_is_invalid_url() {
        let endpoint = Endpoint::<()>::get("https://[bad/");
        let err = CanonicalRequest::build(
            &endpoint,
            &environment(),
            &RequestOptions::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUrl);
    }

    #[test]
    fn fingerprint_ignores_headers_but_not_body() {
        let env = environment();
        let a = CanonicalRequest::build(
            &Endpoint::<()>::get("items"),
            &env,
            &RequestOptions::new(),
        )
        .unwrap();
        let b = CanonicalRequest::build(
            &Endpoint::<()>::get("items").header("x-whatever", "1"),
            &env,
            &RequestOptions::new(),
        )
        .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = CanonicalRequest::build(
            &Endpoint::<()>::post("items").json(&serde_json::json!({"a": 1})),
            &env,
            &RequestOptions::new(),
        )
        .unwrap();
        let d = CanonicalRequest::build(
            &Endpoint::<()>::post("items").json(&serde_json::json!({"a": 2})),
            &env,
            &RequestOptions::new(),
        )
        .unwrap();
        assert_ne!(c.fingerprint(), d.fingerprint());
    }

    #[test]
    fn cache_key_is_method_and_url() {
        let request = CanonicalRequest::build(
            &Endpoint::<()>::get("items"),
            &environment(),
            &RequestOptions::new(),
        )
        .unwrap();
        assert_eq!(request.cache_key(), "GET:https://api.example.com/v1/items");
    }
}
