//! Pluggable request/response transforms.
//!
//! Interceptors see every attempt: the pre-send pass runs in registration
//! order on the canonical request, the post-receive pass runs in reverse
//! order on the response body. Because the chain re-runs on every retry
//! attempt, interceptors must be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Result;
use crate::request::CanonicalRequest;
use crate::sanitize::Sanitizer;

/// Ambient per-attempt state handed to every interceptor invocation.
#[derive(Debug, Clone)]
pub struct InterceptContext {
    /// The request's cancellation token.
    pub cancel: CancellationToken,
    /// The zero-based attempt index.
    pub attempt: u32,
}

/// The response head seen by post-receive interceptors.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The URL the response was served for.
    pub url: Url,
}

impl ResponseHead {
    /// The declared content type, without parameters.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }
}

/// A transform applied to requests before sending and to response bodies
/// after receipt. Both operations default to pass-through.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Transforms an outgoing request. Runs in registration order.
    async fn on_request(
        &self,
        request: CanonicalRequest,
        _cx: &InterceptContext,
    ) -> Result<CanonicalRequest> {
        Ok(request)
    }

    /// Transforms a received response body. Runs in reverse registration
    /// order; each invocation sees the previous one's output.
    async fn on_response(
        &self,
        _head: &ResponseHead,
        body: Bytes,
        _cx: &InterceptContext,
    ) -> Result<Bytes> {
        Ok(body)
    }
}

/// An ordered set of interceptors.
#[derive(Clone, Default)]
pub(crate) struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    pub(crate) fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub(crate) async fn run_request(
        &self,
        mut request: CanonicalRequest,
        cx: &InterceptContext,
    ) -> Result<CanonicalRequest> {
        for interceptor in &self.interceptors {
            request = interceptor.on_request(request, cx).await?;
        }
        Ok(request)
    }

    pub(crate) async fn run_response(
        &self,
        head: &ResponseHead,
        mut body: Bytes,
        cx: &InterceptContext,
    ) -> Result<Bytes> {
        for interceptor in self.interceptors.iter().rev() {
            body = interceptor.on_response(head, body, cx).await?;
        }
        Ok(body)
    }
}

/// How much detail the [`LoggingInterceptor`] emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogDetail {
    /// Method, URL, status and attempt only.
    #[default]
    Minimal,
    /// Adds sanitized headers and, for small JSON payloads, sanitized
    /// bodies.
    Verbose,
}

/// Logs every attempt through the `log` crate with sanitized data.
///
/// Bodies larger than 10 KiB are never inspected.
#[derive(Debug, Clone)]
pub struct LoggingInterceptor {
    detail: LogDetail,
    sanitizer: Arc<Sanitizer>,
}

impl LoggingInterceptor {
    /// Creates a logging interceptor with the given detail level.
    #[must_use]
    pub fn new(detail: LogDetail, sanitizer: Arc<Sanitizer>) -> Self {
        Self { detail, sanitizer }
    }
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::new(LogDetail::Minimal, Arc::new(Sanitizer::default()))
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn on_request(
        &self,
        request: CanonicalRequest,
        cx: &InterceptContext,
    ) -> Result<CanonicalRequest> {
        match self.detail {
            LogDetail::Minimal => log::debug!(
                "--> {} {} (attempt {})",
                request.method,
                self.sanitizer.url(&request.url),
                cx.attempt
            ),
            LogDetail::Verbose => {
                log::debug!(
                    "--> {} {} (attempt {}) headers={:?}",
                    request.method,
                    self.sanitizer.url(&request.url),
                    cx.attempt,
                    self.sanitizer.headers(&request.headers)
                );
                if let Some(body) = &request.body {
                    let content_type = request
                        .headers
                        .get(CONTENT_TYPE)
                        .and_then(|value| value.to_str().ok());
                    if let Some(redacted) =
                        self.sanitizer.body(body, content_type)
                    {
                        log::trace!(
                            "--> body: {}",
                            String::from_utf8_lossy(&redacted)
                        );
                    } else {
                        log::trace!("--> body: {} bytes (not inspected)", body.len());
                    }
                }
            }
        }
        Ok(request)
    }

    async fn on_response(
        &self,
        head: &ResponseHead,
        body: Bytes,
        cx: &InterceptContext,
    ) -> Result<Bytes> {
        match self.detail {
            LogDetail::Minimal => log::debug!(
                "<-- {} {} (attempt {})",
                head.status,
                self.sanitizer.url(&head.url),
                cx.attempt
            ),
            LogDetail::Verbose => {
                log::debug!(
                    "<-- {} {} (attempt {}) headers={:?}",
                    head.status,
                    self.sanitizer.url(&head.url),
                    cx.attempt,
                    self.sanitizer.headers(&head.headers)
                );
                if let Some(redacted) =
                    self.sanitizer.body(&body, head.content_type())
                {
                    log::trace!(
                        "<-- body: {}",
                        String::from_utf8_lossy(&redacted)
                    );
                } else {
                    log::trace!("<-- body: {} bytes (not inspected)", body.len());
                }
            }
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, Environment};
    use crate::request::RequestOptions;

    struct Tagger(&'static str);

    #[async_trait]
    impl Interceptor for Tagger {
        async fn on_request(
            &self,
            mut request: CanonicalRequest,
            _cx: &InterceptContext,
        ) -> Result<CanonicalRequest> {
            let mut trace = request
                .headers
                .get("x-trace")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_owned();
            trace.push_str(self.0);
            request.headers.insert("x-trace", trace.parse().unwrap());
            Ok(request)
        }

        async fn on_response(
            &self,
            _head: &ResponseHead,
            body: Bytes,
            _cx: &InterceptContext,
        ) -> Result<Bytes> {
            let mut text = String::from_utf8_lossy(&body).into_owned();
            text.push_str(self.0);
            Ok(Bytes::from(text))
        }
    }

    fn context() -> InterceptContext {
        InterceptContext { cancel: CancellationToken::new(), attempt: 0 }
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest::build(
            &Endpoint::<()>::get("items"),
            &Environment::new("https://api.example.com").unwrap(),
            &RequestOptions::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn pre_send_runs_in_registration_order() {
        let chain = InterceptorChain::new(vec![
            Arc::new(Tagger("a")),
            Arc::new(Tagger("b")),
        ]);
        let out = chain.run_request(request(), &context()).await.unwrap();
        assert_eq!(out.headers.get("x-trace").unwrap(), "ab");
    }

    #[tokio::test]
    async fn post_receive_runs_in_reverse_order() {
        let chain = InterceptorChain::new(vec![
            Arc::new(Tagger("a")),
            Arc::new(Tagger("b")),
        ]);
        let head = ResponseHead {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            url: Url::parse("https://api.example.com/items").unwrap(),
        };
        let out = chain
            .run_response(&head, Bytes::from_static(b""), &context())
            .await
            .unwrap();
        assert_eq!(&out[..], b"ba");
    }
}
