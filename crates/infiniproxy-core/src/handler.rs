use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use infiniproxy_protocol::claude::create_message::{CreateMessageRequestBody, StreamEvent};
use infiniproxy_protocol::openai::create_chat_completions::{
    CompletionUsage, CreateChatCompletionResponse, CreateChatCompletionStreamResponse,
};
use infiniproxy_protocol::sse::{SseEvent, SseParser, encode_sse};
use infiniproxy_provider_core::{CallerIdentity, Resolution, UsageRecord};
use infiniproxy_transform::generate_content::claude2openai_chat_completions::{
    OpenAIToClaudeStreamState, transform_request, transform_response,
};

use crate::core::CoreState;
use crate::error::{ErrorFormat, GatewayError};
use crate::invoker::{CompletionStream, JsonObject, StreamItem};

pub const MESSAGES_ENDPOINT: &str = "/v1/messages";
pub const CHAT_COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";
const REQUEST_ID_HEADER: &str = "x-infiniproxy-request-id";
const RELAY_BUFFER: usize = 64;

type Outbound = mpsc::Sender<Result<Bytes, Infallible>>;

pub async fn service_info() -> Json<Value> {
    Json(json!({
        "service": "infiniproxy",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "messages": MESSAGES_ENDPOINT,
            "chat_completions": CHAT_COMPLETIONS_ENDPOINT,
            "health": "/health",
        },
    }))
}

pub async fn health(State(state): State<Arc<CoreState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "pid": std::process::id(),
        "backend": state.resolver.fallback_backend().base_url,
        "model": state.resolver.default_model(),
    }))
}

/// Format-A endpoint: messages in, messages out, chat/completions in between.
pub async fn create_message(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let exchange = Exchange::new(&headers, MESSAGES_ENDPOINT, ErrorFormat::Claude);
    let caller = match state.auth.authenticate(&headers).await {
        Ok(caller) => caller,
        Err(err) => return exchange.fail(err, None),
    };
    let request: CreateMessageRequestBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return exchange.fail(
                GatewayError::ClientRequest(format!("invalid request body: {err}")),
                None,
            );
        }
    };

    let is_stream = request.is_stream();
    let requested_model = request.model.clone();
    exchange.log_received(requested_model.as_deref(), is_stream, request.messages.len(), caller.as_ref());

    let resolution = match state
        .resolver
        .resolve(requested_model.as_deref(), caller.as_ref())
        .await
    {
        Ok(resolution) => resolution,
        Err(err) => return exchange.fail(err.into(), None),
    };
    exchange.log_resolved(&resolution);

    let visible_model = requested_model
        .filter(|model| !model.trim().is_empty())
        .unwrap_or_else(|| resolution.model.clone());
    let body = match serde_json::to_value(transform_request(request, &state.translator)) {
        Ok(Value::Object(body)) => body,
        _ => {
            return exchange.fail(
                GatewayError::ClientRequest("request could not be translated".to_string()),
                Some(&resolution),
            );
        }
    };

    if is_stream {
        let upstream = match state.invoker.stream(&resolution, body).await {
            Ok(upstream) => upstream,
            Err(err) => return exchange.fail(err, Some(&resolution)),
        };
        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        let relay = Relay {
            state: state.clone(),
            caller,
            backend: resolution.backend.short_name.clone(),
            exchange: exchange.clone(),
        };
        tokio::spawn(relay.messages(upstream, visible_model, tx));
        return exchange.tag(sse_response(rx));
    }

    let completion = match state.invoker.complete(&resolution, body).await {
        Ok(completion) => completion,
        Err(err) => return exchange.fail(err, Some(&resolution)),
    };
    let parsed: CreateChatCompletionResponse = match serde_json::from_slice(&completion.body) {
        Ok(parsed) => parsed,
        Err(err) => {
            let err = GatewayError::malformed_backend_response(
                &resolution.backend.short_name,
                &completion.model,
                err.to_string(),
            );
            return exchange.fail(err, Some(&resolution));
        }
    };
    let response = transform_response(parsed, visible_model);
    let usage = response.usage.unwrap_or_default();
    record_usage(
        &state,
        caller.as_ref(),
        MESSAGES_ENDPOINT,
        (usage.input_tokens, usage.output_tokens),
        &completion.model,
        &resolution.backend.short_name,
    )
    .await;
    info!(
        event = "downstream_responded",
        trace_id = %exchange.trace_id,
        endpoint = MESSAGES_ENDPOINT,
        status = 200u16,
        elapsed_ms = exchange.elapsed_ms(),
        stop_reason = ?response.stop_reason,
        tokens_in = usage.input_tokens,
        tokens_out = usage.output_tokens,
        fell_back = completion.fell_back,
        is_stream = false
    );
    exchange.tag(Json(response).into_response())
}

/// Format-B pass-through: only `model` is rewritten on the way in.
pub async fn chat_completions(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let exchange = Exchange::new(&headers, CHAT_COMPLETIONS_ENDPOINT, ErrorFormat::OpenAI);
    let caller = match state.auth.authenticate(&headers).await {
        Ok(caller) => caller,
        Err(err) => return exchange.fail(err, None),
    };
    let body: JsonObject = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(body)) => body,
        Ok(_) => {
            return exchange.fail(
                GatewayError::ClientRequest("request body must be a JSON object".to_string()),
                None,
            );
        }
        Err(err) => {
            return exchange.fail(
                GatewayError::ClientRequest(format!("invalid request body: {err}")),
                None,
            );
        }
    };

    let requested_model = body.get("model").and_then(Value::as_str).map(str::to_string);
    let is_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let message_count = body.get("messages").and_then(Value::as_array).map_or(0, Vec::len);
    exchange.log_received(requested_model.as_deref(), is_stream, message_count, caller.as_ref());

    let resolution = match state
        .resolver
        .resolve(requested_model.as_deref(), caller.as_ref())
        .await
    {
        Ok(resolution) => resolution,
        Err(err) => return exchange.fail(err.into(), None),
    };
    exchange.log_resolved(&resolution);

    if is_stream {
        let upstream = match state.invoker.stream(&resolution, body).await {
            Ok(upstream) => upstream,
            Err(err) => return exchange.fail(err, Some(&resolution)),
        };
        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        let relay = Relay {
            state: state.clone(),
            caller,
            backend: resolution.backend.short_name.clone(),
            exchange: exchange.clone(),
        };
        tokio::spawn(relay.lines(upstream, tx));
        return exchange.tag(sse_response(rx));
    }

    let completion = match state.invoker.complete(&resolution, body).await {
        Ok(completion) => completion,
        Err(err) => return exchange.fail(err, Some(&resolution)),
    };
    let usage = reported_usage(&completion.body);
    record_usage(
        &state,
        caller.as_ref(),
        CHAT_COMPLETIONS_ENDPOINT,
        (usage.prompt_tokens, usage.completion_tokens),
        &completion.model,
        &resolution.backend.short_name,
    )
    .await;
    info!(
        event = "downstream_responded",
        trace_id = %exchange.trace_id,
        endpoint = CHAT_COMPLETIONS_ENDPOINT,
        status = 200u16,
        elapsed_ms = exchange.elapsed_ms(),
        tokens_in = usage.prompt_tokens,
        tokens_out = usage.completion_tokens,
        fell_back = completion.fell_back,
        is_stream = false
    );
    let response = (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        completion.body,
    );
    exchange.tag(response.into_response())
}

#[derive(Clone)]
struct Exchange {
    trace_id: String,
    endpoint: &'static str,
    format: ErrorFormat,
    started: Instant,
}

impl Exchange {
    fn new(headers: &HeaderMap, endpoint: &'static str, format: ErrorFormat) -> Self {
        Self {
            trace_id: request_id(headers).unwrap_or_else(|| Uuid::new_v4().to_string()),
            endpoint,
            format,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    fn log_received(
        &self,
        model: Option<&str>,
        is_stream: bool,
        messages: usize,
        caller: Option<&CallerIdentity>,
    ) {
        info!(
            event = "downstream_received",
            trace_id = %self.trace_id,
            endpoint = self.endpoint,
            model = ?model,
            is_stream,
            messages,
            caller_id = ?caller.map(|caller| caller.caller_id)
        );
    }

    fn log_resolved(&self, resolution: &Resolution) {
        info!(
            event = "model_resolved",
            trace_id = %self.trace_id,
            backend = %resolution.backend.short_name,
            model = %resolution.model,
            explicit_model = resolution.explicit_model,
            fallback_model = %resolution.fallback_model
        );
    }

    fn log_failed(&self, err: &GatewayError, backend: Option<&str>, model: Option<&str>) {
        warn!(
            event = "downstream_failed",
            trace_id = %self.trace_id,
            endpoint = self.endpoint,
            kind = err.kind(),
            status = err.status().as_u16(),
            elapsed_ms = self.elapsed_ms(),
            backend = ?backend,
            model = ?model,
            error = %err
        );
    }

    fn fail(&self, err: GatewayError, resolution: Option<&Resolution>) -> Response {
        self.log_failed(
            &err,
            resolution.map(|resolution| resolution.backend.short_name.as_str()),
            resolution.map(|resolution| resolution.model.as_str()),
        );
        self.tag(err.render(self.format).into_response())
    }

    fn tag(&self, mut response: Response) -> Response {
        if let Ok(value) = HeaderValue::from_str(&self.trace_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

/// Background forwarding of one streamed answer to the caller.
struct Relay {
    state: Arc<CoreState>,
    caller: Option<CallerIdentity>,
    backend: String,
    exchange: Exchange,
}

impl Relay {
    async fn messages(self, mut upstream: CompletionStream, visible_model: String, tx: Outbound) {
        let mut translator = OpenAIToClaudeStreamState::new(visible_model);
        let mut parser = SseParser::new();
        let mut model_used = upstream.model.clone();
        let mut failure = None;

        'relay: loop {
            let item = tokio::select! {
                item = upstream.next() => item,
                _ = tx.closed() => {
                    self.log_detached(&model_used);
                    break 'relay;
                }
            };
            let Some(item) = item else {
                break;
            };
            let line = match item {
                Ok(StreamItem::Line(line)) => line,
                Ok(StreamItem::Restarted { model }) => {
                    model_used = model;
                    parser = SseParser::new();
                    for event in &translator.restart() {
                        if !send_event(&tx, event).await {
                            self.log_detached(&model_used);
                            break 'relay;
                        }
                    }
                    continue;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            let mut events = Vec::new();
            parser.push_line(&line, &mut events);
            for event in &events {
                for out in translate_chunk(&mut translator, event) {
                    if !send_event(&tx, &out).await {
                        self.log_detached(&model_used);
                        break 'relay;
                    }
                }
            }
        }
        if tx.is_closed() {
            return;
        }

        if let Some(err) = failure {
            let event = StreamEvent::Error {
                error: err.claude_error_detail(),
            };
            send_event(&tx, &event).await;
            self.exchange.log_failed(&err, Some(&self.backend), Some(&model_used));
            return;
        }

        let mut closing = Vec::new();
        for event in &parser.finish() {
            closing.extend(translate_chunk(&mut translator, event));
        }
        closing.extend(translator.finish());
        for event in &closing {
            if !send_event(&tx, event).await {
                self.log_detached(&model_used);
                return;
            }
        }

        let usage = translator.usage().unwrap_or_default();
        self.finish(
            MESSAGES_ENDPOINT,
            (usage.input_tokens, usage.output_tokens),
            &model_used,
        )
        .await;
    }

    async fn lines(self, mut upstream: CompletionStream, tx: Outbound) {
        let mut parser = SseParser::new();
        let mut model_used = upstream.model.clone();
        let mut usage = CompletionUsage::default();

        loop {
            let item = tokio::select! {
                item = upstream.next() => item,
                _ = tx.closed() => {
                    self.log_detached(&model_used);
                    return;
                }
            };
            let Some(item) = item else {
                break;
            };
            let line = match item {
                Ok(StreamItem::Line(line)) => line,
                Ok(StreamItem::Restarted { model }) => {
                    model_used = model;
                    parser = SseParser::new();
                    continue;
                }
                Err(err) => {
                    let rendered = err.render(ErrorFormat::OpenAI);
                    let data = String::from_utf8_lossy(&rendered.body);
                    let _ = tx.send(Ok(encode_sse(None, &data))).await;
                    self.exchange.log_failed(&err, Some(&self.backend), Some(&model_used));
                    return;
                }
            };

            let mut events = Vec::new();
            parser.push_line(&line, &mut events);
            for event in &events {
                if let Some(reported) = chunk_usage(event) {
                    usage = reported;
                }
            }

            let mut framed = line.into_bytes();
            framed.push(b'\n');
            if tx.send(Ok(Bytes::from(framed))).await.is_err() {
                self.log_detached(&model_used);
                return;
            }
        }

        for event in &parser.finish() {
            if let Some(reported) = chunk_usage(event) {
                usage = reported;
            }
        }
        self.finish(
            CHAT_COMPLETIONS_ENDPOINT,
            (usage.prompt_tokens, usage.completion_tokens),
            &model_used,
        )
        .await;
    }

    async fn finish(&self, endpoint: &'static str, (tokens_in, tokens_out): (u64, u64), model: &str) {
        record_usage(
            &self.state,
            self.caller.as_ref(),
            endpoint,
            (tokens_in, tokens_out),
            model,
            &self.backend,
        )
        .await;
        info!(
            event = "downstream_responded",
            trace_id = %self.exchange.trace_id,
            endpoint,
            status = 200u16,
            elapsed_ms = self.exchange.elapsed_ms(),
            tokens_in,
            tokens_out,
            model = %model,
            is_stream = true
        );
    }

    fn log_detached(&self, model: &str) {
        info!(
            event = "downstream_disconnected",
            trace_id = %self.exchange.trace_id,
            endpoint = self.exchange.endpoint,
            elapsed_ms = self.exchange.elapsed_ms(),
            backend = %self.backend,
            model = %model
        );
    }
}

fn translate_chunk(translator: &mut OpenAIToClaudeStreamState, event: &SseEvent) -> Vec<StreamEvent> {
    if event.is_done() || event.data.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<CreateChatCompletionStreamResponse>(&event.data) {
        Ok(chunk) => translator.transform_chunk(chunk),
        Err(err) => {
            debug!(event = "stream_chunk_skipped", error = %err);
            Vec::new()
        }
    }
}

fn chunk_usage(event: &SseEvent) -> Option<CompletionUsage> {
    if event.is_done() {
        return None;
    }
    serde_json::from_str::<CreateChatCompletionStreamResponse>(&event.data)
        .ok()
        .and_then(|chunk| chunk.usage)
}

#[derive(Deserialize)]
struct UsageEnvelope {
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

fn reported_usage(body: &[u8]) -> CompletionUsage {
    serde_json::from_slice::<UsageEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.usage)
        .unwrap_or_default()
}

/// Returns false once the caller has gone away.
async fn send_event(tx: &Outbound, event: &StreamEvent) -> bool {
    let Ok(data) = serde_json::to_string(event) else {
        return true;
    };
    tx.send(Ok(encode_sse(Some(event.event_name()), &data)))
        .await
        .is_ok()
}

/// Anonymous callers are served but not accounted.
async fn record_usage(
    state: &CoreState,
    caller: Option<&CallerIdentity>,
    endpoint: &str,
    (tokens_in, tokens_out): (u64, u64),
    model_used: &str,
    backend_used: &str,
) {
    let Some(caller) = caller else {
        return;
    };
    let record = UsageRecord {
        caller_id: caller.caller_id,
        user_id: caller.user_id,
        endpoint: endpoint.to_string(),
        tokens_in,
        tokens_out,
        model_used: model_used.to_string(),
        backend_used: backend_used.to_string(),
    };
    state.usage.record(&record).await;
}

fn sse_response(rx: mpsc::Receiver<Result<Bytes, Infallible>>) -> Response {
    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .or_else(|| headers.get("request-id"))
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_is_read_from_buffered_and_streamed_bodies() {
        let usage = reported_usage(
            br#"{"id":"x","choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#,
        );
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (7, 3));
        assert_eq!(reported_usage(b"not json"), CompletionUsage::default());

        let chunk = SseEvent {
            event: None,
            data: r#"{"choices":[],"usage":{"prompt_tokens":2,"completion_tokens":5}}"#.to_string(),
        };
        assert_eq!(chunk_usage(&chunk).map(|usage| usage.completion_tokens), Some(5));
        let done = SseEvent {
            event: None,
            data: "[DONE]".to_string(),
        };
        assert_eq!(chunk_usage(&done), None);
    }

    #[test]
    fn caller_request_id_is_reused() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req-42"));
        assert_eq!(request_id(&headers).as_deref(), Some("req-42"));
        assert_eq!(request_id(&HeaderMap::new()), None);
    }
}
