//! Shared test helpers: a scripted transport that plays back a fixed
//! sequence of outcomes and records what the pipeline sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::Mutex;

use crate::request::CanonicalRequest;
use crate::transport::{
    ProgressFn, Transport, TransportError, TransportResponse,
};

pub(crate) enum Step {
    Status { status: u16, headers: Vec<(String, String)>, body: Vec<u8> },
    NoConnection,
}

impl Step {
    pub(crate) fn ok(body: &str) -> Self {
        Self::Status {
            status: 200,
            headers: vec![(
                "content-type".to_owned(),
                "application/json".to_owned(),
            )],
            body: body.as_bytes().to_vec(),
        }
    }

    pub(crate) fn status(status: u16) -> Self {
        Self::Status { status, headers: Vec::new(), body: Vec::new() }
    }

    pub(crate) fn with_headers(
        status: u16,
        headers: &[(&str, &str)],
        body: &str,
    ) -> Self {
        Self::Status {
            status,
            headers: headers
                .iter()
                .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
                .collect(),
            body: body.as_bytes().to_vec(),
        }
    }
}

pub(crate) struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<CanonicalRequest>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(steps: Vec<Step>) -> Arc<Self> {
        Self::with_delay(steps, Duration::ZERO)
    }

    /// A transport whose every send takes `delay`, so concurrent callers
    /// can pile onto one in-flight request.
    pub(crate) fn with_delay(steps: Vec<Step>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn requests(&self) -> Vec<CanonicalRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &CanonicalRequest,
        progress: Option<ProgressFn>,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self.steps.lock().await.pop_front();
        match step {
            None => Err(TransportError::Other("script exhausted".into())),
            Some(Step::NoConnection) => Err(TransportError::NoConnection(
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )
                .into(),
            )),
            Some(Step::Status { status, headers, body }) => {
                if let Some(progress) = progress {
                    let total = request
                        .body
                        .as_ref()
                        .map_or(body.len() as u64, |b| b.len() as u64);
                    progress(total / 2, Some(total));
                    progress(total, Some(total));
                }
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.append(
                        http::header::HeaderName::from_bytes(name.as_bytes())
                            .unwrap(),
                        value.parse().unwrap(),
                    );
                }
                Ok(TransportResponse {
                    status: StatusCode::from_u16(status).unwrap(),
                    headers: map,
                    body: Bytes::from(body),
                })
            }
        }
    }
}
