//! Uploads and downloads with observable progress.
//!
//! Both directions return a [`TransferHandle`]: a pull-only stream of
//! [`TransferProgress`] plus a future for the final outcome. Transfer speed
//! is a rolling mean of the last five transport samples; a retried upload
//! resets the counters and replays from zero.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::{json_decode, NetworkClient, Response};
use crate::endpoint::Endpoint;
use crate::error::{ErrorKind, NetworkError, Result};
use crate::request::RequestOptions;
use crate::retry::RetryPolicy;
use crate::transport::ProgressFn;

const SPEED_SAMPLES: usize = 5;

/// A point-in-time view of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    /// Bytes moved so far in the current attempt.
    pub bytes_completed: u64,
    /// Total bytes, when the transport knows it.
    pub total_bytes: Option<u64>,
    /// Whether the transfer has finished.
    pub is_complete: bool,
    /// Estimated time remaining, when computable.
    pub eta: Option<Duration>,
    /// Rolling mean transfer speed.
    pub bytes_per_second: Option<f64>,
}

/// Pull-only sequence of progress updates; finite, ending when the
/// transfer completes or fails.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<TransferProgress>,
}

impl ProgressStream {
    /// Waits for the next progress update; `None` once the transfer is
    /// over.
    pub async fn next(&mut self) -> Option<TransferProgress> {
        self.rx.recv().await
    }
}

/// Rolling speed estimate over the most recent transport samples.
struct SpeedEstimator {
    last: Option<(Instant, u64)>,
    samples: VecDeque<f64>,
}

impl SpeedEstimator {
    fn new() -> Self {
        Self { last: None, samples: VecDeque::with_capacity(SPEED_SAMPLES) }
    }

    fn update(
        &mut self,
        now: Instant,
        bytes: u64,
        total: Option<u64>,
    ) -> TransferProgress {
        if let Some((_, previous_bytes)) = self.last {
            if bytes < previous_bytes {
                // A retry replays the transfer from zero.
                self.samples.clear();
                self.last = None;
            }
        }
        if let Some((previous_at, previous_bytes)) = self.last {
            let elapsed = now.duration_since(previous_at).as_secs_f64();
            if elapsed > 0.0 {
                if self.samples.len() == SPEED_SAMPLES {
                    self.samples.pop_front();
                }
                self.samples
                    .push_back((bytes - previous_bytes) as f64 / elapsed);
            }
        }
        self.last = Some((now, bytes));

        let speed = if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        };
        let is_complete = total.is_some_and(|t| bytes >= t);
        let eta = match (speed, total) {
            (Some(speed), Some(total)) if speed > 0.0 && total > bytes => {
                Some(Duration::from_secs_f64((total - bytes) as f64 / speed))
            }
            _ => None,
        };
        TransferProgress {
            bytes_completed: bytes,
            total_bytes: total,
            is_complete,
            eta,
            bytes_per_second: speed,
        }
    }
}

/// Wires a transport progress callback to a [`ProgressStream`], returning
/// the callback, the stream, and a sender for the final completion event.
fn progress_channel(
) -> (ProgressFn, ProgressStream, mpsc::UnboundedSender<TransferProgress>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let estimator = Arc::new(std::sync::Mutex::new(SpeedEstimator::new()));
    let callback_tx = tx.clone();
    let callback: ProgressFn = Arc::new(move |bytes, total| {
        let mut estimator = match estimator.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let update = estimator.update(Instant::now(), bytes, total);
        let _ = callback_tx.send(update);
    });
    (callback, ProgressStream { rx }, tx)
}

/// The response half of a transfer.
#[derive(Debug)]
pub struct TransferFuture<R> {
    task: JoinHandle<Result<R>>,
}

impl<R> Future for TransferFuture<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(join_err) if join_err.is_cancelled() => {
                Err(NetworkError::new(ErrorKind::Cancelled))
            }
            Err(join_err) => {
                Err(NetworkError::new(ErrorKind::Unknown).with_source(join_err))
            }
        })
    }
}

/// A running transfer: progress stream plus outcome future.
#[derive(Debug)]
pub struct TransferHandle<R> {
    progress: ProgressStream,
    future: TransferFuture<R>,
}

impl<R> TransferHandle<R> {
    /// Splits into the progress stream and the outcome future, to be
    /// consumed concurrently.
    #[must_use]
    pub fn into_parts(self) -> (ProgressStream, TransferFuture<R>) {
        (self.progress, self.future)
    }

    /// Ignores progress and waits for the outcome.
    pub async fn finish(self) -> Result<R> {
        self.future.await
    }
}

/// What an upload sends.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// A file read from disk, with its mime type inferred from the
    /// extension.
    File(PathBuf),
    /// A multipart form.
    Multipart(MultipartFormData),
}

/// A `multipart/form-data` body builder with CRLF framing and a random
/// 16-character alphanumeric boundary.
#[derive(Debug, Clone)]
pub struct MultipartFormData {
    boundary: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone)]
struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

impl Default for MultipartFormData {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartFormData {
    /// Creates an empty form with a fresh boundary.
    #[must_use]
    pub fn new() -> Self {
        let boundary: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        Self { boundary, parts: Vec::new() }
    }

    /// Appends a plain text field.
    #[must_use]
    pub fn text(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        });
        self
    }

    /// Appends an in-memory data part with an explicit filename and mime
    /// type.
    #[must_use]
    pub fn bytes(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            data: data.into(),
        });
        self
    }

    /// Appends a part read from disk, inferring the mime type from the
    /// file extension (falling back to `application/octet-stream`).
    pub async fn file(
        self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> std::io::Result<Self> {
        let path = path.into();
        let data = tokio::fs::read(&path).await?;
        let filename = path
            .file_name()
            .map_or_else(|| "file".to_owned(), |n| n.to_string_lossy().into_owned());
        let content_type = mime_guess::from_path(&path)
            .first()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM)
            .to_string();
        Ok(self.bytes(name, filename, content_type, data))
    }

    /// The boundary in use.
    #[must_use]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// The `Content-Type` header value for this form.
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Renders the CRLF-framed body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(b"--");
            out.extend_from_slice(self.boundary.as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(b"Content-Disposition: form-data; name=\"");
            out.extend_from_slice(part.name.as_bytes());
            out.extend_from_slice(b"\"");
            if let Some(filename) = &part.filename {
                out.extend_from_slice(b"; filename=\"");
                out.extend_from_slice(filename.as_bytes());
                out.extend_from_slice(b"\"");
            }
            out.extend_from_slice(b"\r\n");
            if let Some(content_type) = &part.content_type {
                out.extend_from_slice(b"Content-Type: ");
                out.extend_from_slice(content_type.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&part.data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");
        Bytes::from(out)
    }
}

impl NetworkClient {
    /// Uploads a file or multipart form through the full pipeline.
    ///
    /// The endpoint's own body, if any, is replaced by the upload payload.
    /// Retries follow the client's retry policy; a replayed attempt resets
    /// the progress stream to zero.
    pub fn upload<T>(
        &self,
        source: UploadSource,
        endpoint: &Endpoint<T>,
    ) -> TransferHandle<Response<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.upload_with_options(source, endpoint, RequestOptions::new())
    }

    /// [`upload`](Self::upload) with per-call overrides.
    pub fn upload_with_options<T>(
        &self,
        source: UploadSource,
        endpoint: &Endpoint<T>,
        options: RequestOptions,
    ) -> TransferHandle<Response<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let (callback, progress, completion) = progress_channel();
        let client = self.clone();
        let endpoint = endpoint.clone();
        let task = tokio::spawn(async move {
            let endpoint = match source {
                UploadSource::File(path) => {
                    let data =
                        tokio::fs::read(&path).await.map_err(|err| {
                            NetworkError::new(ErrorKind::Unknown)
                                .with_source(err)
                        })?;
                    let content_type = mime_guess::from_path(&path)
                        .first()
                        .unwrap_or(mime::APPLICATION_OCTET_STREAM)
                        .to_string();
                    endpoint.bytes(data, content_type)
                }
                UploadSource::Multipart(form) => {
                    let content_type = form.content_type();
                    endpoint.bytes(form.encode(), content_type)
                }
            };
            let response = client
                .execute(
                    &endpoint,
                    &options,
                    Some(callback),
                    None,
                    &json_decode::<T>,
                )
                .await?;
            let _ = completion.send(TransferProgress {
                bytes_completed: endpoint_body_len(&endpoint),
                total_bytes: Some(endpoint_body_len(&endpoint)),
                is_complete: true,
                eta: None,
                bytes_per_second: None,
            });
            Ok(response)
        });
        TransferHandle { progress, future: TransferFuture { task } }
    }

    /// Downloads an endpoint's body to `destination`.
    ///
    /// The destination's parent directory is created when missing and an
    /// existing file is overwritten. On failure any partially written file
    /// is removed. Downloads do not auto-retry; re-issue the call to try
    /// again.
    pub fn download<T: 'static>(
        &self,
        endpoint: &Endpoint<T>,
        destination: impl Into<PathBuf>,
    ) -> TransferHandle<PathBuf> {
        self.download_with_options(endpoint, destination, RequestOptions::new())
    }

    /// [`download`](Self::download) with per-call overrides.
    pub fn download_with_options<T: 'static>(
        &self,
        endpoint: &Endpoint<T>,
        destination: impl Into<PathBuf>,
        options: RequestOptions,
    ) -> TransferHandle<PathBuf> {
        let (callback, progress, completion) = progress_channel();
        let client = self.clone();
        let endpoint = endpoint.clone();
        let destination: PathBuf = destination.into();
        let task = tokio::spawn(async move {
            let response = client
                .execute(
                    &endpoint,
                    &options,
                    Some(callback),
                    Some(&RetryPolicy::none()),
                    &raw_decode,
                )
                .await?;

            if let Some(parent) = destination.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.map_err(|err| {
                        NetworkError::new(ErrorKind::Unknown).with_source(err)
                    })?;
                }
            }
            if let Err(err) =
                tokio::fs::write(&destination, &response.value).await
            {
                let _ = tokio::fs::remove_file(&destination).await;
                return Err(NetworkError::new(ErrorKind::Unknown)
                    .with_source(err));
            }

            let written = response.value.len() as u64;
            let _ = completion.send(TransferProgress {
                bytes_completed: written,
                total_bytes: Some(written),
                is_complete: true,
                eta: None,
                bytes_per_second: None,
            });
            Ok(destination)
        });
        TransferHandle { progress, future: TransferFuture { task } }
    }
}

fn raw_decode(
    _status: StatusCode,
    _headers: &HeaderMap,
    body: &Bytes,
) -> Result<Bytes> {
    Ok(body.clone())
}

fn endpoint_body_len<T>(endpoint: &Endpoint<T>) -> u64 {
    use crate::endpoint::BodySpec;
    match &endpoint.body {
        Some(BodySpec::Bytes { bytes, .. }) => bytes.len() as u64,
        _ => 0,
    }
}
