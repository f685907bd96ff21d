#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    trivial_casts,
    trivial_numeric_casts
)]
//! A typed HTTP client pipeline.
//!
//! `reqflow` executes declarative [`Endpoint`]s through a pipeline of
//! composable concerns: ordered request/response [`Interceptor`]s, a
//! two-level response cache with revalidation, single-flight deduplication
//! of identical in-flight requests, coordinated bearer-token refresh on
//! 401, bounded exponential retry, long-polling streams, uploads and
//! downloads with progress, and per-attempt metrics. The HTTP engine
//! itself is pluggable: hosts implement the [`Transport`] trait.
//!
//! ## A request
//!
//! ```ignore
//! use std::sync::Arc;
//! use reqflow::{Endpoint, Environment, NetworkClient};
//!
//! #[derive(serde::Deserialize)]
//! struct User { id: u64, name: String }
//!
//! let environment = Environment::new("https://api.example.com")?
//!     .default_header("accept", "application/json");
//! let client = NetworkClient::builder(environment, Arc::new(MyTransport))
//!     .build();
//!
//! let user: reqflow::Response<User> = client
//!     .request(&Endpoint::get("users/1"))
//!     .await?;
//! println!("{} (cached: {})", user.value.name, user.was_from_cache);
//! ```
//!
//! ## Endpoints are values
//!
//! ```
//! use std::time::Duration;
//! use reqflow::{DedupPolicy, Endpoint};
//!
//! let search: Endpoint<serde_json::Value> = Endpoint::get("search")
//!     .query("q", "pipelines")
//!     .query("page", "2")
//!     .cache_ttl(Duration::from_secs(30))
//!     .dedup(DedupPolicy::Always);
//! assert_eq!(search.path(), "search");
//! ```
//!
//! ## Caching
//!
//! Attach a [`HybridCache`]: memory in front, an optional compressed
//! disk store behind it. Responses that declare cacheability (or whose
//! endpoint opts in via `cache_ttl`) are served without transport while
//! fresh, and revalidated with `If-None-Match` / `If-Modified-Since`
//! once stale.
//!
//! ```ignore
//! use reqflow::{DiskCache, DiskCacheConfig, HybridCache, MemoryCacheConfig};
//!
//! let disk = DiskCache::open(DiskCacheConfig::new("./response-cache".into())).await?;
//! let cache = HybridCache::new(MemoryCacheConfig::default(), disk);
//! let client = NetworkClient::builder(environment, transport)
//!     .cache(cache)
//!     .build();
//! // ...
//! client.flush_cache().await; // at shutdown
//! ```
//!
//! ## Retry
//!
//! ```
//! use std::time::Duration;
//! use reqflow::{DelayStrategy, RetryPolicy};
//!
//! let policy = RetryPolicy::new(
//!     3,
//!     DelayStrategy::Exponential {
//!         base: Duration::from_millis(200),
//!         multiplier: 2.0,
//!         jitter: 0.25,
//!         max_delay: Duration::from_secs(60),
//!     },
//! );
//! assert!(policy.should_retry(&reqflow::ErrorKind::Timeout, 0));
//! assert!(!policy.should_retry(&reqflow::ErrorKind::NotFound, 0));
//! ```
//!
//! ## Certificate pinning
//!
//! ```
//! use reqflow::{PinningMode, SecurityPolicy, ServerCertificate};
//!
//! let leaf = ServerCertificate {
//!     der: b"certificate der".to_vec(),
//!     public_key_der: b"spki der".to_vec(),
//! };
//! let pin = SecurityPolicy::pin_for(PinningMode::PublicKey, &leaf);
//! let policy = SecurityPolicy::new(PinningMode::PublicKey, vec![pin]).unwrap();
//! # let _ = policy;
//! ```
//!
//! Every log event and captured error snapshot passes through a
//! [`Sanitizer`] first; credentials in headers, query strings and JSON
//! bodies never leave the crate in clear text.

mod auth;
mod cache;
mod client;
mod endpoint;
mod error;
mod inflight;
mod interceptor;
mod metrics;
mod pinning;
mod polling;
mod request;
mod retry;
mod sanitize;
mod token;
mod transfer;
mod transport;

#[cfg(test)]
mod test_util;

pub use auth::{AuthInterceptor, StaticBearer};
pub use cache::{
    CacheEntry, CacheLookup, DiskCache, DiskCacheConfig, DiskPutMeta,
    DiskRecord, HybridCache, MemoryCache, MemoryCacheConfig,
};
pub use client::{NetworkClient, NetworkClientBuilder, Response};
pub use endpoint::{
    DedupPolicy, Endpoint, Environment, DEFAULT_TIMEOUT,
};
pub use error::{
    ErrorKind, NetworkError, RequestSnapshot, ResponseSnapshot, Result,
};
pub use interceptor::{
    InterceptContext, Interceptor, LogDetail, LoggingInterceptor, ResponseHead,
};
pub use metrics::{LogMetricsCollector, MetricsCollector, RequestMetrics};
pub use pinning::{
    ChallengeDisposition, EmptyPinSet, PinFailureAction, PinnedHosts,
    PinningMode, SecurityPolicy, ServerCertificate, TlsChallenge,
};
pub use polling::{PollingConfig, PollingStream};
pub use request::{CanonicalRequest, RequestFingerprint, RequestOptions};
pub use retry::{DelayStrategy, RetryPolicy, DEFAULT_MAX_DELAY};
pub use sanitize::{Sanitizer, REDACTED};
pub use token::{InMemoryTokenStore, RefreshCoordinator, TokenStore};
pub use transfer::{
    MultipartFormData, ProgressStream, TransferFuture, TransferHandle,
    TransferProgress, UploadSource,
};
pub use transport::{
    ProgressFn, Transport, TransportError, TransportResponse,
};
