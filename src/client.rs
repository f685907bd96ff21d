//! The request pipeline.
//!
//! [`NetworkClient`] executes typed endpoints: build the canonical request,
//! run the pre-send interceptor pass, consult the cache, deduplicate
//! against identical in-flight requests, send, run the post-receive pass,
//! classify the outcome and loop through the retry policy. Every attempt
//! emits one metrics record, and a cancellation token aborts the call at
//! any suspension point.

use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::cache::{
    entry_from_response, CacheEntry, CacheLookup, HybridCache,
};
use crate::endpoint::{Endpoint, Environment};
use crate::error::{
    ErrorKind, NetworkError, RequestSnapshot, ResponseSnapshot, Result,
};
use crate::inflight::{InFlightTracker, Role, SharedOutcome};
use crate::interceptor::{
    InterceptContext, Interceptor, InterceptorChain, ResponseHead,
};
use crate::metrics::{MetricsCollector, RequestMetrics};
use crate::request::{CanonicalRequest, RequestOptions};
use crate::retry::RetryPolicy;
use crate::sanitize::Sanitizer;
use crate::transport::{ProgressFn, Transport};

/// A decoded response delivered to the caller.
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The decoded payload.
    pub value: T,
    /// The response status (200 for cache hits served without transport).
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// Whether the response was served from cache without a transport call.
    pub was_from_cache: bool,
    /// Whether this call joined another identical in-flight request.
    pub was_deduplicated: bool,
}

/// Executes typed endpoints through the full pipeline.
///
/// The client is cheap to clone; clones share the cache, the in-flight
/// tracker and every other component.
#[derive(Clone)]
pub struct NetworkClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    environment: Environment,
    transport: Arc<dyn Transport>,
    interceptors: InterceptorChain,
    retry: RetryPolicy,
    cache: Option<HybridCache>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    inflight: InFlightTracker,
    sanitizer: Arc<Sanitizer>,
}

impl std::fmt::Debug for NetworkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkClient")
            .field("base_url", &self.inner.environment.base_url().as_str())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`NetworkClient`].
pub struct NetworkClientBuilder {
    environment: Environment,
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    retry: RetryPolicy,
    cache: Option<HybridCache>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    sanitizer: Arc<Sanitizer>,
}

impl std::fmt::Debug for NetworkClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkClientBuilder")
            .field("base_url", &self.environment.base_url().as_str())
            .field("interceptors", &self.interceptors.len())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl NetworkClientBuilder {
    /// Adds an interceptor; registration order is pre-send order.
    #[must_use]
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Sets the retry policy (default: 3 retries, exponential backoff).
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attaches a response cache.
    #[must_use]
    pub fn cache(mut self, cache: HybridCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attaches a metrics collector.
    #[must_use]
    pub fn metrics(mut self, collector: impl MetricsCollector + 'static) -> Self {
        self.metrics = Some(Arc::new(collector));
        self
    }

    /// Replaces the default sanitizer used for snapshots and logging.
    #[must_use]
    pub fn sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = Arc::new(sanitizer);
        self
    }

    /// Finishes the client.
    #[must_use]
    pub fn build(self) -> NetworkClient {
        NetworkClient {
            inner: Arc::new(ClientInner {
                environment: self.environment,
                transport: self.transport,
                interceptors: InterceptorChain::new(self.interceptors),
                retry: self.retry,
                cache: self.cache,
                metrics: self.metrics,
                inflight: InFlightTracker::new(),
                sanitizer: self.sanitizer,
            }),
        }
    }
}

impl NetworkClient {
    /// Starts building a client over an environment and transport.
    #[must_use]
    pub fn builder(
        environment: Environment,
        transport: Arc<dyn Transport>,
    ) -> NetworkClientBuilder {
        NetworkClientBuilder {
            environment,
            transport,
            interceptors: Vec::new(),
            retry: RetryPolicy::default(),
            cache: None,
            metrics: None,
            sanitizer: Arc::new(Sanitizer::default()),
        }
    }

    /// Executes an endpoint and decodes the response body to `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint<T>,
    ) -> Result<Response<T>> {
        self.request_with_options(endpoint, RequestOptions::new()).await
    }

    /// Executes an endpoint with per-call overrides.
    pub async fn request_with_options<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint<T>,
        options: RequestOptions,
    ) -> Result<Response<T>> {
        self.execute(endpoint, &options, None, None, &json_decode::<T>).await
    }

    /// The environment this client runs against.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.inner.environment
    }

    /// Drops one cached response, addressed by its endpoint.
    pub async fn invalidate_cached<T>(&self, endpoint: &Endpoint<T>) -> Result<()> {
        if let Some(cache) = &self.inner.cache {
            let request = CanonicalRequest::build(
                endpoint,
                &self.inner.environment,
                &RequestOptions::new(),
            )?;
            cache.invalidate(&request.cache_key()).await;
        }
        Ok(())
    }

    /// Empties both cache layers.
    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.clear().await;
        }
    }

    /// Forces the disk cache index to durable storage. Call at shutdown.
    pub async fn flush_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.flush().await;
        }
    }

    /// Drops expired, unrevalidatable entries from the cache.
    pub async fn sweep_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.sweep_expired(SystemTime::now()).await;
        }
    }

    /// The full attempt loop shared by plain requests, uploads and
    /// downloads. `decode` turns the raw payload into the caller's type and
    /// runs inside the attempt, so its failures are classified and recorded
    /// like any other outcome.
    pub(crate) async fn execute<E, T>(
        &self,
        endpoint: &Endpoint<E>,
        options: &RequestOptions,
        progress: Option<ProgressFn>,
        retry_override: Option<&RetryPolicy>,
        decode: &(dyn Fn(StatusCode, &HeaderMap, &Bytes) -> Result<T> + Send + Sync),
    ) -> Result<Response<T>> {
        let retry = retry_override.unwrap_or(&self.inner.retry);
        let cancel = options.cancel.clone().unwrap_or_default();
        let canonical =
            CanonicalRequest::build(endpoint, &self.inner.environment, options)?;

        let mut attempt: u32 = 0;
        loop {
            let started_at = SystemTime::now();
            let mut flags = AttemptFlags::default();
            let outcome = self
                .attempt(
                    endpoint,
                    &canonical,
                    attempt,
                    &cancel,
                    progress.clone(),
                    decode,
                    &mut flags,
                )
                .await;

            self.emit_metrics(endpoint, started_at, attempt, &flags, &outcome)
                .await;

            match outcome {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let kind = err.kind();
                    if kind != ErrorKind::Cancelled
                        && retry.should_retry(&kind, attempt)
                    {
                        let delay = retry.delay_for(attempt);
                        log::debug!(
                            "retrying {} {} after {delay:?} (attempt {attempt}, {})",
                            canonical.method,
                            self.inner.sanitizer.url(&canonical.url),
                            kind.tag()
                        );
                        cancellable(&cancel, tokio::time::sleep(delay)).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(err.with_attempt(attempt));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt<E, T>(
        &self,
        endpoint: &Endpoint<E>,
        canonical: &CanonicalRequest,
        attempt: u32,
        cancel: &CancellationToken,
        progress: Option<ProgressFn>,
        decode: &(dyn Fn(StatusCode, &HeaderMap, &Bytes) -> Result<T> + Send + Sync),
        flags: &mut AttemptFlags,
    ) -> Result<Response<T>> {
        let cx = InterceptContext { cancel: cancel.clone(), attempt };
        let mut request = canonical.with_fresh_deadline();
        request = cancellable(
            cancel,
            self.inner.interceptors.run_request(request, &cx),
        )
        .await??;

        let request_snapshot = RequestSnapshot::capture(
            &self.inner.sanitizer,
            &request.url,
            &request.method,
            &request.headers,
            request.body.as_ref(),
        );

        // Cache lookup after the pre-send pass, so interceptor-added
        // validators and auth are already in place.
        let cache_key = request.cache_key();
        let mut revalidation_base: Option<CacheEntry> = None;
        if let Some(cache) = &self.inner.cache {
            if request.is_cacheable_method() {
                let lookup = cancellable(
                    cancel,
                    cache.lookup(&cache_key, SystemTime::now()),
                )
                .await?;
                match lookup {
                    CacheLookup::Fresh(entry) => {
                        flags.was_from_cache = true;
                        flags.status = Some(entry.status);
                        let headers = pairs_to_headers(&entry.headers);
                        let status = StatusCode::from_u16(entry.status)
                            .unwrap_or(StatusCode::OK);
                        let value = decode(status, &headers, &entry.body)
                            .map_err(|err| {
                                err.with_request(request_snapshot.clone())
                            })?;
                        return Ok(Response {
                            value,
                            status,
                            headers,
                            was_from_cache: true,
                            was_deduplicated: false,
                        });
                    }
                    CacheLookup::Stale(entry) => {
                        attach_validators(&mut request, &entry);
                        revalidation_base = Some(entry);
                    }
                    CacheLookup::Miss => {}
                }
            }
        }

        // Transport, deduplicated when the endpoint allows it.
        let (status, headers, body) = if endpoint.dedup_eligible() {
            let fingerprint = request.fingerprint();
            let transport = Arc::clone(&self.inner.transport);
            let shared_request = request.clone();
            let shared_snapshot = request_snapshot.clone();
            let shared_progress = progress.clone();
            let (role, shared) = self
                .inner
                .inflight
                .get_or_create(fingerprint, async move {
                    send_over_transport(
                        transport,
                        shared_request,
                        shared_progress,
                        shared_snapshot,
                    )
                    .await
                })
                .await;
            flags.was_deduplicated = role == Role::Waiter;
            cancellable(cancel, shared).await??
        } else {
            cancellable(
                cancel,
                send_over_transport(
                    Arc::clone(&self.inner.transport),
                    request.clone(),
                    progress,
                    request_snapshot.clone(),
                ),
            )
            .await??
        };
        flags.status = Some(status.as_u16());

        let head = ResponseHead {
            status,
            headers: headers.clone(),
            url: request.url.clone(),
        };
        let body = cancellable(
            cancel,
            self.inner.interceptors.run_response(&head, body, &cx),
        )
        .await??;

        // Classification.
        if status == StatusCode::NOT_MODIFIED {
            if let (Some(cache), Some(base)) =
                (&self.inner.cache, revalidation_base.take())
            {
                let refreshed = cache
                    .revalidate(&cache_key, &head.headers, &base, SystemTime::now())
                    .await;
                flags.was_from_cache = true;
                let served_headers = pairs_to_headers(&refreshed.headers);
                let value = decode(StatusCode::OK, &served_headers, &refreshed.body)
                    .map_err(|err| err.with_request(request_snapshot.clone()))?;
                return Ok(Response {
                    value,
                    status: StatusCode::OK,
                    headers: served_headers,
                    was_from_cache: true,
                    was_deduplicated: flags.was_deduplicated,
                });
            }
            // A 304 with nothing to revalidate against is a protocol
            // violation from our point of view.
            return Err(NetworkError::new(ErrorKind::Unknown)
                .with_request(request_snapshot)
                .with_response(ResponseSnapshot::capture(
                    &self.inner.sanitizer,
                    status,
                    &head.headers,
                    &body,
                )));
        }

        if status.is_success() {
            if status != StatusCode::NO_CONTENT {
                if let Some(cache) = &self.inner.cache {
                    if request.is_cacheable_method() {
                        if let Some(entry) = entry_from_response(
                            status.as_u16(),
                            &head.headers,
                            &body,
                            endpoint.cache_ttl,
                            SystemTime::now(),
                        ) {
                            cache.store(&cache_key, entry).await;
                        }
                    }
                }
            }
            let value = decode(status, &head.headers, &body).map_err(|err| {
                err.with_request(request_snapshot.clone()).with_response(
                    ResponseSnapshot::capture(
                        &self.inner.sanitizer,
                        status,
                        &head.headers,
                        &body,
                    ),
                )
            })?;
            return Ok(Response {
                value,
                status,
                headers: head.headers,
                was_from_cache: false,
                was_deduplicated: flags.was_deduplicated,
            });
        }

        let kind =
            ErrorKind::from_status(status).unwrap_or(ErrorKind::Unknown);
        Err(NetworkError::new(kind)
            .with_request(request_snapshot)
            .with_response(ResponseSnapshot::capture(
                &self.inner.sanitizer,
                status,
                &head.headers,
                &body,
            )))
    }

    async fn emit_metrics<E, T>(
        &self,
        endpoint: &Endpoint<E>,
        started_at: SystemTime,
        attempt: u32,
        flags: &AttemptFlags,
        outcome: &Result<Response<T>>,
    ) {
        let Some(collector) = &self.inner.metrics else { return };
        let record = RequestMetrics {
            path: endpoint.path().to_owned(),
            method: endpoint.method().clone(),
            base_url: self.inner.environment.base_url().to_string(),
            started_at,
            finished_at: SystemTime::now(),
            status: flags.status,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(NetworkError::kind),
            attempt,
            was_from_cache: flags.was_from_cache,
            was_deduplicated: flags.was_deduplicated,
        };
        collector.record(record).await;
    }
}

#[derive(Debug, Default)]
struct AttemptFlags {
    status: Option<u16>,
    was_from_cache: bool,
    was_deduplicated: bool,
}

/// Sends a request with its deadline enforced, translating transport
/// failures into the error taxonomy.
async fn send_over_transport(
    transport: Arc<dyn Transport>,
    request: CanonicalRequest,
    progress: Option<ProgressFn>,
    snapshot: RequestSnapshot,
) -> SharedOutcome {
    let outcome =
        tokio::time::timeout_at(request.deadline, transport.send(&request, progress))
            .await;
    match outcome {
        Err(_elapsed) => Err(NetworkError::new(ErrorKind::Timeout)
            .with_request(snapshot)),
        Ok(Err(transport_err)) => {
            Err(transport_err.into_network_error().with_request(snapshot))
        }
        Ok(Ok(response)) => {
            Ok((response.status, response.headers, response.body))
        }
    }
}

/// Races a future against the request's cancellation token.
pub(crate) async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    future: F,
) -> Result<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(NetworkError::new(ErrorKind::Cancelled)),
        output = future => Ok(output),
    }
}

/// The standard JSON decode used by [`NetworkClient::request`].
///
/// A 204 (or an empty body) decodes as JSON `null`, so `()`, `Option<T>`
/// and similar types accept it; anything else raises
/// [`ErrorKind::NoContent`].
pub(crate) fn json_decode<T: DeserializeOwned>(
    status: StatusCode,
    _headers: &HeaderMap,
    body: &Bytes,
) -> Result<T> {
    if status == StatusCode::NO_CONTENT || body.is_empty() {
        return serde_json::from_slice(b"null")
            .map_err(|_| NetworkError::new(ErrorKind::NoContent));
    }
    serde_json::from_slice(body).map_err(|err| {
        NetworkError::new(ErrorKind::DecodingFailed).with_source(err)
    })
}

fn pairs_to_headers(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

fn attach_validators(request: &mut CanonicalRequest, entry: &CacheEntry) {
    if let Some(etag) = &entry.etag {
        if let Ok(value) = HeaderValue::from_str(etag) {
            request.headers.insert(IF_NONE_MATCH, value);
        }
    }
    if let Some(last_modified) = &entry.last_modified {
        if let Ok(value) = HeaderValue::from_str(last_modified) {
            request.headers.insert(IF_MODIFIED_SINCE, value);
        }
    }
}
