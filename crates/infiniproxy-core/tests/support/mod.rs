#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;

use infiniproxy_core::UpstreamClient;
use infiniproxy_provider_core::{
    ByteStream, UpstreamBody, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind,
};

pub enum Reply {
    Status(u16, String),
    Stream(Vec<Result<String, UpstreamFailure>>),
    /// A stream the test keeps feeding (or not) through the returned sender.
    Live(ByteStream),
    Fail(UpstreamFailure),
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Reply::Status(200, body.to_string())
    }

    pub fn status(status: u16, body: &str) -> Self {
        Reply::Status(status, body.to_string())
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Reply::Stream(chunks.iter().map(|chunk| Ok(chunk.to_string())).collect())
    }

    pub fn live() -> (tokio::sync::mpsc::Sender<Result<Bytes, UpstreamFailure>>, Self) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        (tx, Reply::Live(rx))
    }

    pub fn timeout() -> Self {
        Reply::Fail(UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::Timeout,
            message: "operation timed out".to_string(),
        })
    }
}

/// Answers requests from a fixed script and remembers what it was sent.
#[derive(Default)]
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<UpstreamHttpRequest>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::default(),
        })
    }

    pub fn requests(&self) -> Vec<UpstreamHttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.requests()
            .iter()
            .map(|request| serde_json::from_slice(request.body.as_deref().unwrap_or(b"null")).unwrap())
            .collect()
    }

    pub fn models(&self) -> Vec<String> {
        self.bodies()
            .iter()
            .map(|body| body["model"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.requests.lock().unwrap().push(req);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Status(status, body)) => Ok(UpstreamHttpResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from(body)),
                }),
                Some(Reply::Stream(chunks)) => {
                    let (tx, rx) = tokio::sync::mpsc::channel(chunks.len().max(1));
                    for chunk in chunks {
                        tx.try_send(chunk.map(Bytes::from)).unwrap();
                    }
                    Ok(UpstreamHttpResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Some(Reply::Live(rx)) => Ok(UpstreamHttpResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: UpstreamBody::Stream(rx),
                }),
                Some(Reply::Fail(failure)) => Err(failure),
                None => Err(UpstreamFailure::Transport {
                    kind: UpstreamTransportErrorKind::Other,
                    message: "no scripted reply left".to_string(),
                }),
            }
        })
    }
}
