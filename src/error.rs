//! The typed error surface of the crate.
//!
//! Every failure is a [`NetworkError`]: a stable [`ErrorKind`] tag plus
//! sanitized request and response snapshots captured at construction time.
//! Errors never carry unredacted header, query or body data.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use url::Url;

use crate::sanitize::Sanitizer;

/// A `Result` typedef to use with the [`NetworkError`] type.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Maximum length of the UTF-8 body preview captured in a
/// [`ResponseSnapshot`].
const BODY_PREVIEW_LIMIT: usize = 512;

/// Stable classification of a request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The request URL could not be constructed.
    #[error("invalid URL")]
    InvalidUrl,
    /// The transport could not reach the host.
    #[error("no connection")]
    NoConnection,
    /// The request deadline elapsed.
    #[error("request timed out")]
    Timeout,
    /// The server answered 401.
    #[error("unauthorized")]
    Unauthorized,
    /// The server answered 403.
    #[error("forbidden")]
    Forbidden,
    /// The server answered 404.
    #[error("not found")]
    NotFound,
    /// The server answered 204 and the response type requires a body.
    #[error("no content")]
    NoContent,
    /// The server answered 429.
    #[error("rate limited")]
    RateLimited,
    /// The server answered 502.
    #[error("bad gateway")]
    BadGateway,
    /// The server answered 503.
    #[error("service unavailable")]
    ServiceUnavailable,
    /// The server answered 504.
    #[error("gateway timeout")]
    GatewayTimeout,
    /// Any other 5xx answer.
    #[error("server error ({0})")]
    ServerError(u16),
    /// Any other 4xx answer.
    #[error("client error ({0})")]
    ClientError(u16),
    /// The response body could not be decoded into the requested type.
    #[error("decoding failed")]
    DecodingFailed,
    /// The request body could not be encoded.
    #[error("encoding failed")]
    EncodingFailed,
    /// The caller cancelled the request.
    #[error("cancelled")]
    Cancelled,
    /// A failure that fits no other kind.
    #[error("unknown error")]
    Unknown,
}

impl ErrorKind {
    /// Maps an HTTP status code to its error kind, or `None` for statuses
    /// that are not failures (2xx other than 204, 3xx).
    #[must_use]
    pub fn from_status(status: StatusCode) -> Option<Self> {
        match status.as_u16() {
            204 => Some(Self::NoContent),
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            429 => Some(Self::RateLimited),
            502 => Some(Self::BadGateway),
            503 => Some(Self::ServiceUnavailable),
            504 => Some(Self::GatewayTimeout),
            code @ 500..=599 => Some(Self::ServerError(code)),
            code @ 400..=499 => Some(Self::ClientError(code)),
            _ => None,
        }
    }

    /// The stable wire tag of this kind, used in logs and metrics.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalidURL",
            Self::NoConnection => "noConnection",
            Self::Timeout => "timeout",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "notFound",
            Self::NoContent => "noContent",
            Self::RateLimited => "rateLimited",
            Self::BadGateway => "badGateway",
            Self::ServiceUnavailable => "serviceUnavailable",
            Self::GatewayTimeout => "gatewayTimeout",
            Self::ServerError(_) => "serverError",
            Self::ClientError(_) => "clientError",
            Self::DecodingFailed => "decodingFailed",
            Self::EncodingFailed => "encodingFailed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

/// A sanitized capture of an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    /// The request URL, rendered with sensitive query values redacted.
    pub url: String,
    /// The request method.
    pub method: Method,
    /// Redacted header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Size of the request body in bytes.
    pub body_size: usize,
}

impl RequestSnapshot {
    /// Captures a request, redacting through the given sanitizer.
    #[must_use]
    pub fn capture(
        sanitizer: &Sanitizer,
        url: &Url,
        method: &Method,
        headers: &HeaderMap,
        body: Option<&Bytes>,
    ) -> Self {
        Self {
            url: sanitizer.url(url),
            method: method.clone(),
            headers: sanitizer.headers(headers),
            body_size: body.map_or(0, Bytes::len),
        }
    }
}

/// A sanitized capture of a received response head and body preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    /// The response status code.
    pub status: u16,
    /// Redacted header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Up to 512 bytes of the body, truncated at a valid UTF-8 boundary.
    pub body_preview: String,
    /// The total size of the body in bytes.
    pub body_size: usize,
}

impl ResponseSnapshot {
    /// Captures a response, redacting through the given sanitizer.
    #[must_use]
    pub fn capture(
        sanitizer: &Sanitizer,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Self {
        Self {
            status: status.as_u16(),
            headers: sanitizer.headers(headers),
            body_preview: utf8_preview(body, BODY_PREVIEW_LIMIT),
            body_size: body.len(),
        }
    }
}

/// Truncates `body` to at most `limit` bytes at a valid code-point boundary
/// and renders it as UTF-8, substituting invalid sequences.
fn utf8_preview(body: &[u8], limit: usize) -> String {
    if body.len() <= limit {
        return String::from_utf8_lossy(body).into_owned();
    }
    match std::str::from_utf8(&body[..limit]) {
        Ok(text) => text.to_owned(),
        // The cut may split a multi-byte code point; back up to the last
        // complete one.
        Err(err) => {
            String::from_utf8_lossy(&body[..err.valid_up_to()]).into_owned()
        }
    }
}

/// An error produced by the request pipeline.
///
/// Equality ignores the capture timestamp, and underlying causes are
/// compared only by presence (the cause's identity is not structural).
#[derive(Debug, Clone)]
pub struct NetworkError {
    kind: ErrorKind,
    request: Option<RequestSnapshot>,
    response: Option<ResponseSnapshot>,
    underlying: Option<Arc<dyn std::error::Error + Send + Sync>>,
    timestamp: SystemTime,
    retry_attempt: Option<u32>,
}

impl NetworkError {
    /// Creates a bare error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            request: None,
            response: None,
            underlying: None,
            timestamp: SystemTime::now(),
            retry_attempt: None,
        }
    }

    /// Attaches a request snapshot.
    #[must_use]
    pub fn with_request(mut self, snapshot: RequestSnapshot) -> Self {
        self.request = Some(snapshot);
        self
    }

    /// Attaches a response snapshot.
    #[must_use]
    pub fn with_response(mut self, snapshot: ResponseSnapshot) -> Self {
        self.response = Some(snapshot);
        self
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.underlying = Some(Arc::new(source));
        self
    }

    /// Records the attempt index the error was produced on.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.retry_attempt = Some(attempt);
        self
    }

    /// The error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The sanitized request snapshot, when one was captured.
    #[must_use]
    pub fn request(&self) -> Option<&RequestSnapshot> {
        self.request.as_ref()
    }

    /// The sanitized response snapshot, when one was captured.
    #[must_use]
    pub fn response(&self) -> Option<&ResponseSnapshot> {
        self.response.as_ref()
    }

    /// The underlying cause, when one was recorded.
    #[must_use]
    pub fn underlying(
        &self,
    ) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.underlying.as_deref()
    }

    /// The wall-clock instant the error was constructed.
    #[must_use]
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The attempt index the error was produced on, when known.
    #[must_use]
    pub fn retry_attempt(&self) -> Option<u32> {
        self.retry_attempt
    }

    /// Whether the default retry predicate considers this error transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Timeout
                | ErrorKind::NoConnection
                | ErrorKind::ServerError(_)
                | ErrorKind::BadGateway
                | ErrorKind::ServiceUnavailable
                | ErrorKind::GatewayTimeout
        )
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(request) = &self.request {
            write!(f, " ({} {})", request.method, request.url)?;
        }
        if let Some(response) = &self.response {
            write!(f, " [status {}]", response.status)?;
        }
        if let Some(attempt) = self.retry_attempt {
            write!(f, " [attempt {attempt}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.underlying {
            Some(cause) => Some(&**cause),
            None => None,
        }
    }
}

impl PartialEq for NetworkError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.request == other.request
            && self.response == other.response
            && self.retry_attempt == other.retry_attempt
            && self.underlying.is_some() == other.underlying.is_some()
    }
}

impl From<ErrorKind> for NetworkError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        let cases = [
            (204, ErrorKind::NoContent),
            (401, ErrorKind::Unauthorized),
            (403, ErrorKind::Forbidden),
            (404, ErrorKind::NotFound),
            (429, ErrorKind::RateLimited),
            (502, ErrorKind::BadGateway),
            (503, ErrorKind::ServiceUnavailable),
            (504, ErrorKind::GatewayTimeout),
            (500, ErrorKind::ServerError(500)),
            (550, ErrorKind::ServerError(550)),
            (418, ErrorKind::ClientError(418)),
        ];
        for (code, kind) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(ErrorKind::from_status(status), Some(kind));
        }
        assert_eq!(ErrorKind::from_status(StatusCode::OK), None);
        assert_eq!(ErrorKind::from_status(StatusCode::NOT_MODIFIED), None);
    }

    #[test]
    fn equality_ignores_timestamp() {
        let a = NetworkError::new(ErrorKind::Timeout);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = NetworkError::new(ErrorKind::Timeout);
        assert_ne!(a.timestamp(), b.timestamp());
        assert_eq!(a, b);
    }

    #[test]
    fn equality_compares_underlying_by_presence() {
        let io = || std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let a = NetworkError::new(ErrorKind::Unknown).with_source(io());
        let b = NetworkError::new(ErrorKind::Unknown).with_source(io());
        let c = NetworkError::new(ErrorKind::Unknown);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn request_snapshot_is_sanitized_at_capture() {
        let sanitizer = Sanitizer::default();
        let url = Url::parse("https://api.example.com/x?token=xyz").unwrap();
        let mut headers = HeaderMap::new();
        headers
            .insert(http::header::AUTHORIZATION, "Bearer abc".parse().unwrap());

        let snapshot = RequestSnapshot::capture(
            &sanitizer,
            &url,
            &Method::GET,
            &headers,
            None,
        );
        assert!(snapshot.url.contains("token=%5BREDACTED%5D"));
        assert_eq!(snapshot.headers[0].1, crate::sanitize::REDACTED);
        assert_eq!(snapshot.body_size, 0);
    }

    #[test]
    fn body_preview_truncates_on_code_point_boundary() {
        // 600 bytes of three-byte code points; byte 512 falls mid-character.
        let body = "€".repeat(200);
        let snapshot = ResponseSnapshot::capture(
            &Sanitizer::default(),
            StatusCode::BAD_REQUEST,
            &HeaderMap::new(),
            body.as_bytes(),
        );
        assert_eq!(snapshot.body_preview.len(), 510);
        assert!(snapshot.body_preview.chars().all(|c| c == '€'));
        assert_eq!(snapshot.body_size, 600);
    }

    #[test]
    fn transient_kinds_match_default_retry_set() {
        assert!(NetworkError::new(ErrorKind::Timeout).is_transient());
        assert!(NetworkError::new(ErrorKind::NoConnection).is_transient());
        assert!(NetworkError::new(ErrorKind::ServerError(500)).is_transient());
        assert!(NetworkError::new(ErrorKind::BadGateway).is_transient());
        assert!(!NetworkError::new(ErrorKind::NotFound).is_transient());
        assert!(!NetworkError::new(ErrorKind::Cancelled).is_transient());
    }
}
