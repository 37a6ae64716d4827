mod support;

use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use infiniproxy_core::invoker::JsonObject;
use infiniproxy_core::{CompletionInvoker, GatewayError, StreamItem};
use infiniproxy_provider_core::{
    BackendService, Resolution, UpstreamFailure, UpstreamTransportErrorKind, header_get,
};

use support::{Reply, ScriptedClient};

fn resolution(model: &str, explicit_model: bool, fallback_model: &str) -> Resolution {
    Resolution {
        backend: BackendService {
            id: 1,
            short_name: "acme".to_string(),
            name: "Acme".to_string(),
            base_url: "https://acme.example.com/v1/".to_string(),
            api_key: "sk-acme".to_string(),
            default_model: Some(fallback_model.to_string()),
            is_active: true,
            is_default: true,
        },
        model: model.to_string(),
        explicit_model,
        fallback_model: fallback_model.to_string(),
    }
}

fn body() -> JsonObject {
    let mut body = JsonObject::new();
    body.insert("model".to_string(), json!("placeholder"));
    body.insert("messages".to_string(), json!([{"role": "user", "content": "hi"}]));
    body
}

fn ok_completion() -> Reply {
    Reply::ok(json!({
        "id": "chatcmpl-1",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}]
    }))
}

async fn drain(mut stream: infiniproxy_core::CompletionStream) -> Vec<Result<StreamItem, GatewayError>> {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item);
    }
    items
}

fn lines(items: &[Result<StreamItem, GatewayError>]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            Ok(StreamItem::Line(line)) => Some(line.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn successful_call_is_sent_once_with_backend_credentials() {
    let client = ScriptedClient::new(vec![ok_completion()]);
    let invoker = CompletionInvoker::new(client.clone());

    let completion = invoker
        .complete(&resolution("fancy", true, "base"), body())
        .await
        .unwrap();
    assert_eq!(completion.model, "fancy");
    assert!(!completion.fell_back);

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "https://acme.example.com/v1/chat/completions");
    assert_eq!(header_get(&requests[0].headers, "authorization"), Some("Bearer sk-acme"));
    assert_eq!(client.bodies()[0]["stream"], json!(false));
    assert_eq!(client.models(), vec!["fancy"]);
}

#[tokio::test]
async fn rejected_explicit_model_is_retried_once_with_fallback() {
    let client = ScriptedClient::new(vec![
        Reply::status(404, r#"{"error":{"message":"model fancy does not exist"}}"#),
        ok_completion(),
    ]);
    let invoker = CompletionInvoker::new(client.clone());

    let completion = invoker
        .complete(&resolution("fancy", true, "base"), body())
        .await
        .unwrap();
    assert_eq!(completion.model, "base");
    assert!(completion.fell_back);
    assert_eq!(client.models(), vec!["fancy", "base"]);
}

#[tokio::test]
async fn fallback_failure_propagates_without_a_third_attempt() {
    let client = ScriptedClient::new(vec![
        Reply::status(404, "model not found"),
        Reply::status(404, "model not found"),
        ok_completion(),
    ]);
    let invoker = CompletionInvoker::new(client.clone());

    let err = invoker
        .complete(&resolution("fancy", true, "base"), body())
        .await
        .unwrap_err();
    match err {
        GatewayError::ModelRejected { model, backend, status, .. } => {
            assert_eq!(model, "base");
            assert_eq!(backend, "acme");
            assert_eq!(status, Some(404));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(client.models(), vec!["fancy", "base"]);
}

#[tokio::test]
async fn implicit_model_is_never_substituted() {
    let client = ScriptedClient::new(vec![Reply::status(404, "model not found"), ok_completion()]);
    let invoker = CompletionInvoker::new(client.clone());

    let err = invoker
        .complete(&resolution("base", false, "base"), body())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ModelRejected { .. }));
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn timeouts_and_backend_auth_failures_are_not_retried() {
    let client = ScriptedClient::new(vec![Reply::timeout(), ok_completion()]);
    let invoker = CompletionInvoker::new(client.clone());
    let err = invoker
        .complete(&resolution("fancy", true, "base"), body())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BackendTransport { timed_out: true, .. }));
    assert_eq!(client.requests().len(), 1);

    let client = ScriptedClient::new(vec![Reply::status(401, "invalid api key"), ok_completion()]);
    let invoker = CompletionInvoker::new(client.clone());
    let err = invoker
        .complete(&resolution("fancy", true, "base"), body())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::BackendTransport { status: Some(401), timed_out: false, .. }
    ));
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn generic_bad_request_only_counts_for_streams() {
    let client = ScriptedClient::new(vec![Reply::status(400, "{}"), ok_completion()]);
    let invoker = CompletionInvoker::new(client.clone());
    let err = invoker
        .complete(&resolution("fancy", true, "base"), body())
        .await
        .unwrap_err();
    assert_eq!(err.status().as_u16(), 502);
    assert_eq!(client.requests().len(), 1);

    let client = ScriptedClient::new(vec![
        Reply::status(400, "{}"),
        Reply::chunks(&["data: {\"choices\":[]}\n\n", "data: [DONE]\n\n"]),
    ]);
    let invoker = CompletionInvoker::new(client.clone());
    let stream = invoker
        .stream(&resolution("fancy", true, "base"), body())
        .await
        .unwrap();
    assert_eq!(stream.model, "base");
    let items = drain(stream).await;
    assert_eq!(
        lines(&items),
        vec!["data: {\"choices\":[]}", "", "data: [DONE]", ""]
    );
    assert_eq!(client.models(), vec!["fancy", "base"]);
    assert!(client.requests().iter().all(|request| request.is_stream));
}

#[tokio::test]
async fn stream_does_not_fall_back_to_the_same_model() {
    let client = ScriptedClient::new(vec![Reply::status(404, "model not found")]);
    let invoker = CompletionInvoker::new(client.clone());
    let err = invoker
        .stream(&resolution("base", true, "base"), body())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, GatewayError::ModelRejected { .. }));
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn stream_lines_survive_chunk_boundaries() {
    let client = ScriptedClient::new(vec![Reply::chunks(&[
        "data: {\"choices\":[{\"delta\":",
        "{\"content\":\"hi\"}}]}\r\n\r\nda",
        "ta: [DONE]",
    ])]);
    let invoker = CompletionInvoker::new(client);
    let stream = invoker
        .stream(&resolution("fancy", true, "base"), body())
        .await
        .unwrap();
    let items = drain(stream).await;
    assert!(items.iter().all(Result::is_ok));
    assert_eq!(
        lines(&items),
        vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}",
            "",
            "data: [DONE]"
        ]
    );
}

#[tokio::test]
async fn in_band_model_error_restarts_against_fallback() {
    let client = ScriptedClient::new(vec![
        Reply::chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"unknown model fancy\"}}\n\n",
        ]),
        Reply::chunks(&["data: {\"choices\":[{\"delta\":{\"content\":\"full\"}}]}\n\n", "data: [DONE]\n\n"]),
    ]);
    let invoker = CompletionInvoker::new(client.clone());
    let stream = invoker
        .stream(&resolution("fancy", true, "base"), body())
        .await
        .unwrap();
    assert_eq!(stream.model, "fancy");

    let items = drain(stream).await;
    let restarted = items
        .iter()
        .position(|item| matches!(item, Ok(StreamItem::Restarted { model }) if model == "base"))
        .unwrap();
    assert_eq!(restarted, 2);
    assert_eq!(
        lines(&items),
        vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}",
            "",
            "data: {\"choices\":[{\"delta\":{\"content\":\"full\"}}]}",
            "",
            "data: [DONE]",
            ""
        ]
    );
    assert_eq!(client.models(), vec!["fancy", "base"]);
}

#[tokio::test]
async fn mid_stream_transport_failure_ends_the_stream() {
    let client = ScriptedClient::new(vec![
        Reply::Stream(vec![
            Ok("data: {\"choices\":[]}\n\n".to_string()),
            Err(UpstreamFailure::Transport {
                kind: UpstreamTransportErrorKind::ReadTimeout,
                message: "stream idle for 300s".to_string(),
            }),
        ]),
        ok_completion(),
    ]);
    let invoker = CompletionInvoker::new(client.clone());
    let stream = invoker
        .stream(&resolution("fancy", true, "base"), body())
        .await
        .unwrap();
    let items = drain(stream).await;

    assert_eq!(lines(&items), vec!["data: {\"choices\":[]}", ""]);
    assert!(matches!(
        items.last(),
        Some(Err(GatewayError::BackendTransport { timed_out: true, .. }))
    ));
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn in_band_error_without_fallback_is_forwarded() {
    let client = ScriptedClient::new(vec![Reply::chunks(&[
        "data: {\"error\":{\"message\":\"rate limited\"}}\n\n",
    ])]);
    let invoker = CompletionInvoker::new(client.clone());
    let stream = invoker
        .stream(&resolution("fancy", true, "base"), body())
        .await
        .unwrap();
    let items = drain(stream).await;
    assert_eq!(
        lines(&items),
        vec!["data: {\"error\":{\"message\":\"rate limited\"}}", ""]
    );
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn dropping_the_stream_releases_a_silent_backend() {
    let (backend, reply) = Reply::live();
    let client = ScriptedClient::new(vec![reply]);
    let invoker = CompletionInvoker::new(client);
    let mut stream = invoker
        .stream(&resolution("fancy", true, "base"), body())
        .await
        .unwrap();

    backend
        .send(Ok(Bytes::from_static(b"data: {\"choices\":[]}\n")))
        .await
        .unwrap();
    assert!(matches!(stream.next().await, Some(Ok(StreamItem::Line(_)))));

    // the backend now goes quiet; the caller leaves
    drop(stream);
    let released = tokio::time::timeout(Duration::from_secs(5), backend.closed()).await;
    assert!(released.is_ok(), "backend stream was kept open after the caller left");
}
