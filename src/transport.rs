//! The transport seam.
//!
//! The crate does not ship an HTTP engine; the host supplies one by
//! implementing [`Transport`]. The contract is intentionally small: send a
//! [`CanonicalRequest`], honor its deadline, report byte progress when a
//! callback is provided, and return the response head plus buffered body.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::error::{ErrorKind, NetworkError};
use crate::request::CanonicalRequest;

/// Byte-progress callback: `(bytes_transferred, total_bytes)`.
///
/// Invoked by the transport as upload or download bytes move. A retried
/// attempt restarts the count from zero.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// The response head and buffered body produced by a transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The complete response body.
    pub body: Bytes,
}

/// Connection-level transport failures.
///
/// HTTP error statuses are not transport errors; the transport returns them
/// as a [`TransportResponse`] and the pipeline classifies the status.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The host could not be reached.
    #[error("connection failed")]
    NoConnection(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The request deadline elapsed inside the transport.
    #[error("transport deadline elapsed")]
    Timeout,
    /// The send was cancelled.
    #[error("transport send cancelled")]
    Cancelled,
    /// Any other transport failure.
    #[error("transport failure")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Translates the transport failure into the pipeline error taxonomy.
    #[must_use]
    pub fn into_network_error(self) -> NetworkError {
        match self {
            Self::NoConnection(source) => {
                NetworkError::new(ErrorKind::NoConnection)
                    .with_source(SourceBox(source))
            }
            Self::Timeout => NetworkError::new(ErrorKind::Timeout),
            Self::Cancelled => NetworkError::new(ErrorKind::Cancelled),
            Self::Other(source) => NetworkError::new(ErrorKind::Unknown)
                .with_source(SourceBox(source)),
        }
    }
}

#[derive(Debug)]
struct SourceBox(Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for SourceBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for SourceBox {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Sends canonical requests on behalf of the pipeline.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a request and returns the response head plus body bytes.
    ///
    /// Implementations must fail with [`TransportError::Timeout`] once the
    /// request deadline passes, and should call `progress` as bytes move in
    /// either direction when one is supplied.
    async fn send(
        &self,
        request: &CanonicalRequest,
        progress: Option<ProgressFn>,
    ) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_kinds() {
        let io = || -> Box<dyn std::error::Error + Send + Sync> {
            Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))
        };
        assert_eq!(
            TransportError::NoConnection(io()).into_network_error().kind(),
            ErrorKind::NoConnection
        );
        assert_eq!(
            TransportError::Timeout.into_network_error().kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            TransportError::Cancelled.into_network_error().kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(
            TransportError::Other(io()).into_network_error().kind(),
            ErrorKind::Unknown
        );
    }
}
