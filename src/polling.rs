//! Long-polling as a lazy pull sequence.
//!
//! Each pull performs one request with an extended timeout and classifies
//! the outcome: yield the response, reconnect (immediately or after a
//! pause scaled to the error), or terminate. Termination also triggers
//! after a run of consecutive errors or on external cancellation.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::client::{NetworkClient, Response};
use crate::endpoint::Endpoint;
use crate::error::{ErrorKind, NetworkError, Result};
use crate::request::RequestOptions;
use crate::retry::RetryPolicy;

/// Tuning for a long-polling stream.
#[derive(Debug, Clone, Copy)]
pub struct PollingConfig {
    /// Per-pull request timeout.
    pub polling_timeout: Duration,
    /// Base pause before reconnecting after a transient failure.
    pub retry_interval: Duration,
    /// Consecutive-error budget before the stream terminates.
    pub max_consecutive_errors: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl PollingConfig {
    /// 10 s timeout, 0.5 s retry interval, 10 consecutive errors.
    #[must_use]
    pub fn short() -> Self {
        Self {
            polling_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(500),
            max_consecutive_errors: 10,
        }
    }

    /// 30 s timeout, 1 s retry interval, 5 consecutive errors.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            polling_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
            max_consecutive_errors: 5,
        }
    }

    /// 60 s timeout, 2 s retry interval, 3 consecutive errors.
    #[must_use]
    pub fn long() -> Self {
        Self {
            polling_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(2),
            max_consecutive_errors: 3,
        }
    }

    /// 15 s timeout, 0.1 s retry interval, 20 consecutive errors.
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            polling_timeout: Duration::from_secs(15),
            retry_interval: Duration::from_millis(100),
            max_consecutive_errors: 20,
        }
    }
}

/// What the reconnect table says to do after a failed pull.
enum NextAction {
    ReconnectNow,
    ReconnectAfter(Duration),
    /// Yield the error once, then end the stream.
    Stop,
}

/// A pull-only sequence of long-poll responses.
///
/// The stream is potentially infinite; it ends when the server signals
/// completion through `should_continue`, a fatal error kind arrives, the
/// consecutive-error budget runs out, or the cancellation token fires.
pub struct PollingStream<T> {
    client: NetworkClient,
    endpoint: Endpoint<T>,
    config: PollingConfig,
    should_continue: Arc<dyn Fn(&Response<T>) -> bool + Send + Sync>,
    cancel: CancellationToken,
    consecutive_errors: u32,
    done: bool,
}

impl<T> std::fmt::Debug for PollingStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingStream")
            .field("path", &self.endpoint.path())
            .field("consecutive_errors", &self.consecutive_errors)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl NetworkClient {
    /// Opens a long-polling stream over an endpoint with the standard
    /// configuration.
    #[must_use]
    pub fn poll<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint<T>,
    ) -> PollingStream<T> {
        self.poll_with_config(endpoint, PollingConfig::default())
    }

    /// Opens a long-polling stream with explicit tuning.
    #[must_use]
    pub fn poll_with_config<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint<T>,
        config: PollingConfig,
    ) -> PollingStream<T> {
        PollingStream {
            client: self.clone(),
            endpoint,
            config,
            should_continue: Arc::new(|_| true),
            cancel: CancellationToken::new(),
            consecutive_errors: 0,
            done: false,
        }
    }
}

impl<T: DeserializeOwned> PollingStream<T> {
    /// Installs a predicate deciding, per yielded response, whether the
    /// stream keeps polling.
    #[must_use]
    pub fn until(
        mut self,
        should_continue: impl Fn(&Response<T>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_continue = Arc::new(should_continue);
        self
    }

    /// Binds the stream to a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Pulls the next response.
    ///
    /// Transient failures reconnect internally and are not yielded; a
    /// terminating failure is yielded once, after which the stream returns
    /// `None` forever.
    pub async fn next(&mut self) -> Option<Result<Response<T>>> {
        if self.done {
            return None;
        }
        loop {
            if self.cancel.is_cancelled() {
                self.done = true;
                return None;
            }

            let options = RequestOptions::new()
                .timeout(self.config.polling_timeout)
                .cancellation(self.cancel.clone());
            // Reconnection is this loop's job; the inner pipeline must not
            // also retry.
            let outcome = self
                .client
                .execute(
                    &self.endpoint,
                    &options,
                    None,
                    Some(&RetryPolicy::none()),
                    &crate::client::json_decode::<T>,
                )
                .await;

            match outcome {
                Ok(response) => {
                    self.consecutive_errors = 0;
                    if !(self.should_continue)(&response) {
                        self.done = true;
                    }
                    return Some(Ok(response));
                }
                Err(err) => {
                    if err.kind() == ErrorKind::Cancelled {
                        self.done = true;
                        return None;
                    }
                    match self.classify(&err) {
                        NextAction::Stop => {
                            self.done = true;
                            return Some(Err(err));
                        }
                        NextAction::ReconnectNow => {}
                        NextAction::ReconnectAfter(pause) => {
                            tokio::select! {
                                () = self.cancel.cancelled() => {
                                    self.done = true;
                                    return None;
                                }
                                () = tokio::time::sleep(pause) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// The reconnect table. Counts the error and decides the next action.
    fn classify(&mut self, err: &NetworkError) -> NextAction {
        let kind = err.kind();
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.config.max_consecutive_errors {
            log::debug!(
                "long-poll terminating after {} consecutive errors ({})",
                self.consecutive_errors,
                kind.tag()
            );
            return NextAction::Stop;
        }

        match kind {
            // A long-poll timeout is the expected idle outcome.
            ErrorKind::Timeout => NextAction::ReconnectNow,
            ErrorKind::NoContent => {
                NextAction::ReconnectAfter(self.config.retry_interval)
            }
            ErrorKind::NoConnection => {
                NextAction::ReconnectAfter(self.config.retry_interval * 2)
            }
            ErrorKind::ClientError(408) => NextAction::ReconnectNow,
            ErrorKind::ServerError(_)
            | ErrorKind::BadGateway
            | ErrorKind::ServiceUnavailable
            | ErrorKind::GatewayTimeout
            | ErrorKind::RateLimited => {
                NextAction::ReconnectAfter(self.config.retry_interval)
            }
            ErrorKind::Unauthorized
            | ErrorKind::Forbidden
            | ErrorKind::NotFound
            | ErrorKind::InvalidUrl
            | ErrorKind::EncodingFailed
            | ErrorKind::DecodingFailed => NextAction::Stop,
            _ => NextAction::ReconnectAfter(self.config.retry_interval),
        }
    }
}
