//! Bearer authentication as an interceptor.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderValue, StatusCode};

use crate::error::Result;
use crate::interceptor::{InterceptContext, Interceptor, ResponseHead};
use crate::request::CanonicalRequest;
use crate::token::RefreshCoordinator;

/// Injects the stored bearer token on the way out and triggers a
/// coordinated refresh when a 401 comes back.
///
/// The 401 response still flows to the caller after the refresh completes;
/// re-issuing the request is a caller decision. Because the interceptor
/// chain re-runs on retries, a retried attempt picks up the refreshed token
/// automatically.
#[derive(Debug, Clone)]
pub struct AuthInterceptor {
    coordinator: RefreshCoordinator,
}

impl AuthInterceptor {
    /// Creates the interceptor around a shared coordinator.
    #[must_use]
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self { coordinator }
    }

    /// The coordinator this interceptor triggers on 401.
    #[must_use]
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    async fn on_request(
        &self,
        mut request: CanonicalRequest,
        _cx: &InterceptContext,
    ) -> Result<CanonicalRequest> {
        // An explicit Authorization header on the request wins.
        if !request.headers.contains_key(AUTHORIZATION) {
            if let Some(token) = self.coordinator.store().load().await {
                if let Ok(value) =
                    HeaderValue::from_str(&format!("Bearer {token}"))
                {
                    request.headers.insert(AUTHORIZATION, value);
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
        if head.status == StatusCode::UNAUTHORIZED {
            match self.coordinator.refresh_if_needed(&cx.cancel).await {
                Ok(_) => {
                    log::debug!("401 triggered token refresh; refresh succeeded");
                }
                Err(err) if err.kind() == crate::ErrorKind::Cancelled => {
                    return Err(err);
                }
                Err(err) => {
                    // The 401 itself is surfaced downstream; the refresh
                    // failure is advisory here.
                    log::warn!("401 triggered token refresh; refresh failed: {err}");
                }
            }
        }
        Ok(body)
    }
}

/// An interceptor that attaches a fixed bearer token, for callers that
/// manage credentials themselves.
#[derive(Debug, Clone)]
pub struct StaticBearer {
    value: Arc<str>,
}

impl StaticBearer {
    /// Creates the interceptor from a token.
    #[must_use]
    pub fn new(token: impl AsRef<str>) -> Self {
        Self { value: Arc::from(format!("Bearer {}", token.as_ref())) }
    }
}

#[async_trait]
impl Interceptor for StaticBearer {
    async fn on_request(
        &self,
        mut request: CanonicalRequest,
        _cx: &InterceptContext,
    ) -> Result<CanonicalRequest> {
        if !request.headers.contains_key(AUTHORIZATION) {
            if let Ok(value) = HeaderValue::from_str(&self.value) {
                request.headers.insert(AUTHORIZATION, value);
            }
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, Environment};
    use crate::request::RequestOptions;
    use crate::token::{InMemoryTokenStore, TokenStore};
    use http::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;
    use url::Url;

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

    fn head(status: StatusCode) -> ResponseHead {
        ResponseHead {
            status,
            headers: HeaderMap::new(),
            url: Url::parse("https://api.example.com/items").unwrap(),
        }
    }

    #[tokio::test]
    async fn injects_stored_token() {
        let store = Arc::new(InMemoryTokenStore::with_token("abc"));
        let coordinator = RefreshCoordinator::new(store, || async {
            Ok("unused".to_owned())
        });
        let auth = AuthInterceptor::new(coordinator);
        let out = auth.on_request(request(), &context()).await.unwrap();
        assert_eq!(out.headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
    }

    #[tokio::test]
    async fn explicit_authorization_header_wins() {
        let store = Arc::new(InMemoryTokenStore::with_token("abc"));
        let coordinator = RefreshCoordinator::new(store, || async {
            Ok("unused".to_owned())
        });
        let auth = AuthInterceptor::new(coordinator);
        let mut incoming = request();
        incoming
            .headers
            .insert(AUTHORIZATION, "Bearer explicit".parse().unwrap());
        let out = auth.on_request(incoming, &context()).await.unwrap();
        assert_eq!(out.headers.get(AUTHORIZATION).unwrap(), "Bearer explicit");
    }

    #[tokio::test]
    async fn unauthorized_triggers_refresh_and_passes_body_through() {
        let store = Arc::new(InMemoryTokenStore::with_token("stale"));
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&refreshes);
        let coordinator = RefreshCoordinator::new(store.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("fresh".to_owned())
            }
        });
        let auth = AuthInterceptor::new(coordinator);

        let body = auth
            .on_response(
                &head(StatusCode::UNAUTHORIZED),
                Bytes::from_static(b"denied"),
                &context(),
            )
            .await
            .unwrap();
        assert_eq!(&body[..], b"denied");
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(store.load().await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn non_401_does_not_refresh() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&refreshes);
        let coordinator = RefreshCoordinator::new(
            Arc::new(InMemoryTokenStore::new()),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("fresh".to_owned())
                }
            },
        );
        let auth = AuthInterceptor::new(coordinator);
        auth.on_response(
            &head(StatusCode::OK),
            Bytes::from_static(b"ok"),
            &context(),
        )
        .await
        .unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }
}
