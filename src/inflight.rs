//! Deduplication of concurrent identical requests.
//!
//! The tracker maps a [`RequestFingerprint`] to one shared producer. The
//! producer runs on its own task, so cancelling any observer (the creator
//! included) never cancels the shared work; remaining observers still get
//! the result. An entry is removed exactly once, when its producer
//! resolves, after which the next identical request starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use http::{HeaderMap, StatusCode};
use tokio::sync::{oneshot, Mutex};

use crate::error::{ErrorKind, NetworkError};
use crate::request::RequestFingerprint;

/// The bytes-level outcome shared between observers of one fingerprint.
pub(crate) type SharedPayload = (StatusCode, HeaderMap, Bytes);

/// What every observer of a fingerprint receives.
pub(crate) type SharedOutcome = Result<SharedPayload, NetworkError>;

type SharedFuture = Shared<BoxFuture<'static, SharedOutcome>>;

/// The caller's role for one `get_or_create` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// This caller installed the producer; its metrics count as the origin.
    Creator,
    /// This caller joined an existing producer.
    Waiter,
}

/// Serialized map of in-flight request producers.
#[derive(Clone, Default)]
pub(crate) struct InFlightTracker {
    entries: Arc<Mutex<HashMap<RequestFingerprint, SharedFuture>>>,
}

impl std::fmt::Debug for InFlightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightTracker").finish_non_exhaustive()
    }
}

impl InFlightTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Atomically joins the producer for `fingerprint`, creating it from
    /// `factory` if absent.
    ///
    /// The factory future is driven by a spawned task whose lifetime is
    /// independent of every caller; awaiting the returned handle only
    /// observes its outcome.
    pub(crate) async fn get_or_create<F>(
        &self,
        fingerprint: RequestFingerprint,
        factory: F,
    ) -> (Role, SharedFuture)
    where
        F: Future<Output = SharedOutcome> + Send + 'static,
    {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&fingerprint) {
            log::trace!(
                "joined in-flight request (body digest {})",
                fingerprint.body_digest()
            );
            return (Role::Waiter, existing.clone());
        }

        let (tx, rx) = oneshot::channel();
        let map = Arc::clone(&self.entries);
        let producer_key = fingerprint.clone();
        tokio::spawn(async move {
            let outcome = factory.await;
            // Remove before resolving the observers so a request issued
            // after the result lands never joins a spent entry.
            map.lock().await.remove(&producer_key);
            let _ = tx.send(outcome);
        });

        let shared: SharedFuture = rx
            .map(|received| match received {
                Ok(outcome) => outcome,
                // The producer task died without reporting.
                Err(_) => Err(NetworkError::new(ErrorKind::Unknown)),
            })
            .boxed()
            .shared();
        entries.insert(fingerprint, shared.clone());
        (Role::Creator, shared)
    }

    /// The number of producers currently in flight.
    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
