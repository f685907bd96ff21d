//! Per-attempt observation hand-off.
//!
//! The pipeline emits one [`RequestMetrics`] record per attempt, including
//! cache hits and deduplicated waits. Collectors receive records through
//! the [`MetricsCollector`] trait; the crate ships a `log`-backed one.

use std::time::SystemTime;

use async_trait::async_trait;
use http::Method;

use crate::error::ErrorKind;

/// One observed request attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMetrics {
    /// The endpoint path as declared.
    pub path: String,
    /// The request method.
    pub method: Method,
    /// The environment base URL the request ran against.
    pub base_url: String,
    /// Wall-clock start of the attempt.
    pub started_at: SystemTime,
    /// Wall-clock end of the attempt.
    pub finished_at: SystemTime,
    /// The HTTP status, when a response head was received.
    pub status: Option<u16>,
    /// Whether the attempt produced a delivered response.
    pub success: bool,
    /// The error kind for failed attempts.
    pub error: Option<ErrorKind>,
    /// Zero-based attempt index.
    pub attempt: u32,
    /// Whether the response was served from cache without transport.
    pub was_from_cache: bool,
    /// Whether the attempt joined an in-flight identical request.
    pub was_deduplicated: bool,
}

impl RequestMetrics {
    /// The elapsed duration of the attempt, zero if the clock went
    /// backwards.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}

/// Receives one record per request attempt.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Hands off a completed attempt record.
    async fn record(&self, metrics: RequestMetrics);
}

/// A collector that emits each record through the `log` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetricsCollector;

#[async_trait]
impl MetricsCollector for LogMetricsCollector {
    async fn record(&self, metrics: RequestMetrics) {
        log::debug!(
            "{} {} attempt={} status={} elapsed={:?} cache={} dedup={} outcome={}",
            metrics.method,
            metrics.path,
            metrics.attempt,
            metrics.status.map_or_else(|| "-".to_owned(), |s| s.to_string()),
            metrics.elapsed(),
            metrics.was_from_cache,
            metrics.was_deduplicated,
            match (&metrics.success, &metrics.error) {
                (true, _) => "ok".to_owned(),
                (false, Some(kind)) => kind.tag().to_owned(),
                (false, None) => "failed".to_owned(),
            }
        );
    }
}
