//! Backend calls with one-shot model fallback.
//!
//! A call whose explicitly requested model is rejected by the backend is
//! retried exactly once with the resolution's fallback model. Streams apply a
//! broader rejection heuristic and only fall back to a *different* model; a
//! stream that fails after output was forwarded restarts from the beginning
//! of the fallback stream, so the caller may see a partial answer followed by
//! a complete one.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use infiniproxy_provider_core::{
    BackendService, ByteStream, HttpMethod, RejectionHeuristic, Resolution, UpstreamBody,
    UpstreamFailure, UpstreamHttpRequest, header_set, is_model_rejection,
};

use crate::error::GatewayError;
use crate::upstream_client::UpstreamClient;

pub type JsonObject = serde_json::Map<String, Value>;

const STREAM_BUFFER: usize = 64;

/// A buffered backend answer.
#[derive(Debug, Clone)]
pub struct Completion {
    pub body: Bytes,
    /// Model that actually produced `body`.
    pub model: String,
    pub fell_back: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// One wire line, without its terminator. Blank lines are kept.
    Line(String),
    /// Forwarding restarted against `model`; lines that follow come from it.
    Restarted { model: String },
}

/// Lines of a streamed backend answer, in arrival order. A terminal `Err`
/// means the stream ended abnormally.
pub struct CompletionStream {
    pub model: String,
    items: mpsc::Receiver<Result<StreamItem, GatewayError>>,
}

impl CompletionStream {
    pub async fn next(&mut self) -> Option<Result<StreamItem, GatewayError>> {
        self.items.recv().await
    }
}

#[derive(Clone)]
pub struct CompletionInvoker {
    client: Arc<dyn UpstreamClient>,
}

impl CompletionInvoker {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self { client }
    }

    /// `body` is a chat/completions request; `model` and `stream` are
    /// overwritten per attempt.
    pub async fn complete(
        &self,
        resolution: &Resolution,
        body: JsonObject,
    ) -> Result<Completion, GatewayError> {
        let attempt = Attempt::new(self.client.clone(), &resolution.backend, body);

        let failure = match attempt.call(&resolution.model).await {
            Ok(body) => {
                return Ok(Completion {
                    body,
                    model: resolution.model.clone(),
                    fell_back: false,
                });
            }
            Err(failure) => failure,
        };
        let rejected = failure.is_model_rejection(RejectionHeuristic::Strict);
        if !(resolution.explicit_model && rejected) {
            return Err(attempt.fail(&failure, rejected, &resolution.model));
        }

        attempt.log_fallback(&resolution.model, &resolution.fallback_model, &failure);
        match attempt.call(&resolution.fallback_model).await {
            Ok(body) => Ok(Completion {
                body,
                model: resolution.fallback_model.clone(),
                fell_back: true,
            }),
            Err(failure) => {
                let rejected = failure.is_model_rejection(RejectionHeuristic::Strict);
                Err(attempt.fail(&failure, rejected, &resolution.fallback_model))
            }
        }
    }

    /// Opens the stream before returning, so failures that happen before the
    /// first byte surface as an `Err` here rather than inside the stream.
    pub async fn stream(
        &self,
        resolution: &Resolution,
        body: JsonObject,
    ) -> Result<CompletionStream, GatewayError> {
        let attempt = Attempt::new(self.client.clone(), &resolution.backend, body);
        let mut policy = StreamFallback {
            explicit_model: resolution.explicit_model,
            fallback_model: resolution.fallback_model.clone(),
            used: false,
        };

        let (model, upstream) = match attempt.open(&resolution.model).await {
            Ok(upstream) => (resolution.model.clone(), upstream),
            Err(failure) => {
                let rejected = failure.is_model_rejection(RejectionHeuristic::Streaming);
                let Some(fallback) = policy.take(&resolution.model, rejected) else {
                    return Err(attempt.fail(&failure, rejected, &resolution.model));
                };
                attempt.log_fallback(&resolution.model, &fallback, &failure);
                match attempt.open(&fallback).await {
                    Ok(upstream) => (fallback, upstream),
                    Err(failure) => {
                        let rejected = failure.is_model_rejection(RejectionHeuristic::Streaming);
                        return Err(attempt.fail(&failure, rejected, &fallback));
                    }
                }
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(forward(attempt, upstream, model.clone(), policy, tx));
        Ok(CompletionStream { model, items: rx })
    }
}

struct StreamFallback {
    explicit_model: bool,
    fallback_model: String,
    used: bool,
}

impl StreamFallback {
    fn take(&mut self, failed_model: &str, rejected: bool) -> Option<String> {
        if self.used || !self.explicit_model || !rejected || self.fallback_model == failed_model {
            return None;
        }
        self.used = true;
        Some(self.fallback_model.clone())
    }
}

struct Attempt {
    client: Arc<dyn UpstreamClient>,
    backend: String,
    url: String,
    api_key: String,
    body: JsonObject,
    started: Instant,
}

impl Attempt {
    fn new(client: Arc<dyn UpstreamClient>, backend: &BackendService, body: JsonObject) -> Self {
        Self {
            client,
            backend: backend.short_name.clone(),
            url: backend.chat_completions_url(),
            api_key: backend.api_key.clone(),
            body,
            started: Instant::now(),
        }
    }

    fn request(&self, model: &str, stream: bool) -> UpstreamHttpRequest {
        let mut body = self.body.clone();
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert("stream".to_string(), Value::Bool(stream));

        let mut headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        header_set(&mut headers, "authorization", format!("Bearer {}", self.api_key));
        if stream {
            header_set(&mut headers, "accept", "text/event-stream");
        }

        UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: self.url.clone(),
            headers,
            body: Some(Bytes::from(Value::Object(body).to_string())),
            is_stream: stream,
        }
    }

    async fn call(&self, model: &str) -> Result<Bytes, UpstreamFailure> {
        debug!(event = "upstream_request", backend = %self.backend, model = %model, stream = false);
        let response = self.client.send(self.request(model, false)).await?;
        let body = collect_body(response.body).await?;
        if (200..300).contains(&response.status) {
            return Ok(body);
        }
        Err(UpstreamFailure::Http {
            status: response.status,
            headers: response.headers,
            body,
        })
    }

    async fn open(&self, model: &str) -> Result<ByteStream, UpstreamFailure> {
        debug!(event = "upstream_request", backend = %self.backend, model = %model, stream = true);
        let response = self.client.send(self.request(model, true)).await?;
        if !(200..300).contains(&response.status) {
            return Err(UpstreamFailure::Http {
                status: response.status,
                headers: response.headers,
                body: collect_body(response.body).await?,
            });
        }
        match response.body {
            UpstreamBody::Stream(upstream) => Ok(upstream),
            UpstreamBody::Bytes(body) => {
                // backend ignored `stream`; replay the buffered body as one chunk
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(Ok(body));
                Ok(rx)
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn fail(&self, failure: &UpstreamFailure, rejected: bool, model: &str) -> GatewayError {
        GatewayError::from_upstream(failure, rejected, &self.backend, model, self.elapsed_ms())
    }

    fn log_fallback(&self, failed_model: &str, fallback_model: &str, reason: &dyn std::fmt::Display) {
        warn!(
            event = "upstream_fallback",
            backend = %self.backend,
            failed_model = %failed_model,
            fallback_model = %fallback_model,
            elapsed_ms = self.elapsed_ms(),
            reason = %reason
        );
    }
}

async fn collect_body(body: UpstreamBody) -> Result<Bytes, UpstreamFailure> {
    match body {
        UpstreamBody::Bytes(bytes) => Ok(bytes),
        UpstreamBody::Stream(mut rx) => {
            let mut buffer = BytesMut::new();
            while let Some(chunk) = rx.recv().await {
                buffer.extend_from_slice(&chunk?);
            }
            Ok(buffer.freeze())
        }
    }
}

enum Pump {
    Finished,
    /// The reader went away; dropping the upstream receiver tears the call down.
    Detached,
    Failed(UpstreamFailure),
    /// A `data:` line carrying an `error` object instead of a chunk.
    InBandError(String),
}

async fn forward(
    attempt: Attempt,
    mut upstream: ByteStream,
    mut model: String,
    mut policy: StreamFallback,
    tx: mpsc::Sender<Result<StreamItem, GatewayError>>,
) {
    let mut lines = LineSplitter::default();
    loop {
        let failure = match pump(&mut upstream, &mut lines, &tx).await {
            Pump::Finished | Pump::Detached => return,
            Pump::Failed(failure) => failure,
            Pump::InBandError(line) => {
                if !is_model_rejection(&line, RejectionHeuristic::Streaming) {
                    if tx.send(Ok(StreamItem::Line(line))).await.is_err() {
                        return;
                    }
                    continue;
                }
                match policy.take(&model, true) {
                    Some(fallback) => {
                        attempt.log_fallback(&model, &fallback, &line);
                        match restart(&attempt, &fallback, &tx).await {
                            Some(next) => {
                                upstream = next;
                                lines = LineSplitter::default();
                                model = fallback;
                            }
                            None => return,
                        }
                    }
                    None => {
                        if tx.send(Ok(StreamItem::Line(line))).await.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }
        };

        let rejected = failure.is_model_rejection(RejectionHeuristic::Streaming);
        let Some(fallback) = policy.take(&model, rejected) else {
            let _ = tx.send(Err(attempt.fail(&failure, rejected, &model))).await;
            return;
        };
        attempt.log_fallback(&model, &fallback, &failure);
        match restart(&attempt, &fallback, &tx).await {
            Some(next) => {
                upstream = next;
                lines = LineSplitter::default();
                model = fallback;
            }
            None => return,
        }
    }
}

/// Opens the fallback stream and announces it. `None` means forwarding is over,
/// either because the reader left or because the error was already delivered.
async fn restart(
    attempt: &Attempt,
    fallback: &str,
    tx: &mpsc::Sender<Result<StreamItem, GatewayError>>,
) -> Option<ByteStream> {
    match attempt.open(fallback).await {
        Ok(next) => {
            let announced = tx
                .send(Ok(StreamItem::Restarted {
                    model: fallback.to_string(),
                }))
                .await;
            announced.ok().map(|_| next)
        }
        Err(failure) => {
            let rejected = failure.is_model_rejection(RejectionHeuristic::Streaming);
            let _ = tx.send(Err(attempt.fail(&failure, rejected, fallback))).await;
            None
        }
    }
}

async fn pump(
    upstream: &mut ByteStream,
    lines: &mut LineSplitter,
    tx: &mpsc::Sender<Result<StreamItem, GatewayError>>,
) -> Pump {
    let mut ended = false;
    loop {
        while let Some(line) = lines.next_line() {
            if is_in_band_error(&line) {
                return Pump::InBandError(line);
            }
            if tx.send(Ok(StreamItem::Line(line))).await.is_err() {
                return Pump::Detached;
            }
        }
        if ended {
            return Pump::Finished;
        }
        let received = tokio::select! {
            received = upstream.recv() => received,
            _ = tx.closed() => return Pump::Detached,
        };
        match received {
            Some(Ok(chunk)) => lines.push(&chunk),
            Some(Err(failure)) => return Pump::Failed(failure),
            None => {
                lines.close();
                ended = true;
            }
        }
    }
}

fn is_in_band_error(line: &str) -> bool {
    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
        return false;
    };
    if !payload.starts_with('{') {
        return false;
    }
    serde_json::from_str::<Value>(payload)
        .ok()
        .and_then(|value| value.get("error").map(|error| !error.is_null()))
        .unwrap_or(false)
}

/// Splits a byte stream into lines; multi-byte characters may straddle chunks.
#[derive(Debug, Default)]
struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn close(&mut self) {
        if !self.buffer.is_empty() && self.buffer.last() != Some(&b'\n') {
            self.buffer.push(b'\n');
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
