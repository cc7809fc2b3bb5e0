//! HTTP generation backend.
//!
//! # Responsibilities
//! - Open a generation with `POST {base}/generate` and read its NDJSON frames
//! - Switch model and apply parameters through the control endpoints
//! - Retry stream establishment with jittered backoff
//!
//! # Wire Format
//! ```text
//! {"type":"delta","text":"..."}     → RawEvent::Fragment
//! {"type":"busy","active":true}     → busy signal
//! {"type":"done"}                   → RawEvent::Finished
//! {"type":"error","message":"..."}  → RawEvent::Failed
//! ```
//!
//! # Design Decisions
//! - One reader task per generation, owned by the returned source
//! - Malformed frames, including non-UTF-8 lines, are logged and skipped
//! - A line longer than `MAX_LINE_BYTES` fails the generation
//! - A body that ends without `done` closes the source (backend failure)

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time;
use url::Url;

use crate::backend::GenerationBackend;
use crate::config::BackendConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::queue::{GenerationParams, GenerationRequest, RequestId};
use crate::resilience::StartBackoff;
use crate::stream::{channel_source, RawEventSource, SourceFeed};

/// Events buffered between the reader task and the stream machine.
const FEED_CAPACITY: usize = 256;

/// Longest error body kept in an error message.
const ERROR_BODY_LIMIT: usize = 512;

/// Longest NDJSON line accepted from the generator.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Why an upstream line could not be decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// An upstream line grew past the accepted length.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream frame exceeded {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// Errors talking to the upstream generator.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to build request: {0}")]
    Build(#[from] axum::http::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    /// Transport failures and 5xx answers are worth another attempt.
    fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Request(_) | UpstreamError::Timeout(_) => true,
            UpstreamError::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        GatewayError::Backend(err.to_string())
    }
}

/// One NDJSON frame of a generation stream.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamFrame {
    Delta { text: String },
    Busy { active: bool },
    Done,
    Error { message: String },
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    request_id: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    params: &'a GenerationParams,
}

#[derive(Debug, Serialize)]
struct ModelBody<'a> {
    model: &'a str,
}

/// Generator reached over HTTP.
pub struct UpstreamBackend {
    client: Client<HttpConnector, Body>,
    base: Url,
    config: BackendConfig,
}

impl UpstreamBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, UpstreamError> {
        let mut base = Url::parse(&config.url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            client,
            base,
            config: config.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        Ok(self.base.join(path)?)
    }

    fn post_json<T: Serialize>(&self, url: &Url, body: &T) -> Result<Request<Body>, UpstreamError> {
        let bytes = serde_json::to_vec(body)?;
        Ok(Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, "stream-gateway")
            .body(Body::from(bytes))?)
    }

    /// Send `request` and require a success status within `timeout`.
    async fn send(
        &self,
        request: Request<Body>,
        timeout: Duration,
    ) -> Result<axum::http::Response<Incoming>, UpstreamError> {
        let response = time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| UpstreamError::Timeout(timeout))??;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = read_error_body(response.into_body(), timeout).await;
        Err(UpstreamError::Status { status, body })
    }

    async fn control<T: Serialize>(&self, path: &str, body: &T) -> Result<(), UpstreamError> {
        let url = self.endpoint(path)?;
        let request = self.post_json(&url, body)?;
        self.send(request, Duration::from_secs(self.config.control_timeout_secs))
            .await
            .map(|_| ())
    }

    async fn open(&self, id: RequestId, request: &GenerationRequest) -> Result<Incoming, UpstreamError> {
        let url = self.endpoint("generate")?;
        let body = GenerateBody {
            request_id: id.to_string(),
            prompt: request.rendered_prompt(),
            model: request.model.as_deref(),
            params: &request.params,
        };
        let attempts = self.config.start_attempts.max(1);
        let backoff = StartBackoff::from_config(&self.config);
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);

        let mut attempt = 0;
        loop {
            let outgoing = self.post_json(&url, &body)?;
            match self.send(outgoing, timeout).await {
                Ok(response) => return Ok(response.into_body()),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = backoff.delay(attempt + 1);
                    tracing::warn!(
                        request_id = %id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Generation start failed; retrying"
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl GenerationBackend for UpstreamBackend {
    fn start<'a>(
        &'a self,
        id: RequestId,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, GatewayResult<Box<dyn RawEventSource>>> {
        Box::pin(async move {
            let body = self.open(id, request).await?;
            let (feed, source) = channel_source(FEED_CAPACITY);
            let reader = tokio::spawn(pump(id, body, feed));
            tracing::debug!(request_id = %id, upstream = %self.base, "Generation stream opened");
            Ok(Box::new(source.with_reader(reader)) as Box<dyn RawEventSource>)
        })
    }

    fn switch_model<'a>(&'a self, model: &'a str) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.control("model", &ModelBody { model }).await?;
            Ok(())
        })
    }

    fn apply_params<'a>(&'a self, params: &'a GenerationParams) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.control("params", params).await?;
            Ok(())
        })
    }
}

/// Parse one NDJSON line. Blank lines yield `None`.
pub fn parse_frame(line: &[u8]) -> Option<Result<UpstreamFrame, FrameError>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(err) => return Some(Err(err.into())),
    };
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).map_err(FrameError::from))
}

/// Splits a byte stream into newline-terminated lines of bounded length.
#[derive(Debug)]
struct LineBuffer {
    pending: Vec<u8>,
    limit: usize,
}

impl LineBuffer {
    fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit,
        }
    }

    /// Append `chunk` and return every line it completed.
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, LineTooLong> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            if newline > self.limit {
                return Err(LineTooLong { limit: self.limit });
            }
            lines.push(self.pending.drain(..=newline).collect());
        }
        if self.pending.len() > self.limit {
            return Err(LineTooLong { limit: self.limit });
        }
        Ok(lines)
    }

    /// Bytes after the last newline.
    fn into_remainder(self) -> Vec<u8> {
        self.pending
    }
}

/// Forward frames from `body` into `feed` until a terminal frame or EOF.
async fn pump(id: RequestId, body: Incoming, feed: SourceFeed) {
    let mut data = Body::new(body).into_data_stream();
    let mut lines = LineBuffer::new(MAX_LINE_BYTES);

    while let Some(chunk) = data.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                feed.fail(format!("upstream stream error: {err}")).await;
                return;
            }
        };

        let complete = match lines.push(&chunk) {
            Ok(complete) => complete,
            Err(err) => {
                tracing::warn!(request_id = %id, error = %err, "Upstream frame too long");
                feed.set_generating(false);
                feed.fail(err.to_string()).await;
                return;
            }
        };
        for line in complete {
            if !deliver(id, &line, &feed).await {
                return;
            }
        }
    }

    let rest = lines.into_remainder();
    if !rest.is_empty() {
        deliver(id, &rest, &feed).await;
    }
    tracing::debug!(request_id = %id, "Upstream body ended");
}

/// Apply one line to `feed`. Returns `false` once the stream is over.
async fn deliver(id: RequestId, line: &[u8], feed: &SourceFeed) -> bool {
    match parse_frame(line) {
        None => true,
        Some(Err(err)) => {
            tracing::warn!(request_id = %id, error = %err, "Skipping malformed upstream frame");
            true
        }
        Some(Ok(UpstreamFrame::Delta { text })) => feed.fragment(text).await,
        Some(Ok(UpstreamFrame::Busy { active })) => {
            feed.set_generating(active);
            true
        }
        Some(Ok(UpstreamFrame::Done)) => {
            feed.set_generating(false);
            feed.finish().await;
            false
        }
        Some(Ok(UpstreamFrame::Error { message })) => {
            feed.set_generating(false);
            feed.fail(message).await;
            false
        }
    }
}

async fn read_error_body(body: Incoming, timeout: Duration) -> String {
    let mut data = Body::new(body).into_data_stream();
    let mut collected: Vec<u8> = Vec::new();
    let read = async {
        while let Some(Ok(chunk)) = data.next().await {
            collected.extend_from_slice(&chunk);
            if collected.len() >= ERROR_BODY_LIMIT {
                break;
            }
        }
    };
    let _ = time::timeout(timeout, read).await;
    collected.truncate(ERROR_BODY_LIMIT);
    String::from_utf8_lossy(&collected).trim().to_string()
}
