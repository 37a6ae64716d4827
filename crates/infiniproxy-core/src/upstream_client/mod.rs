use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use wreq::{Client, Method};

use infiniproxy_common::GlobalConfig;
use infiniproxy_provider_core::{
    Headers, HttpMethod, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind, header_get,
};

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    /// Longest wait for a free slot on a saturated backend.
    pub queue_timeout: Duration,
    /// Whole-exchange bound for buffered requests.
    pub request_timeout: Duration,
    /// Longest gap tolerated between two stream chunks.
    pub stream_idle_timeout: Duration,
    /// Concurrent exchanges allowed per (base url, credential) pair.
    pub max_connections: usize,
    pub max_idle_per_host: usize,
}

impl UpstreamClientConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        let timeout = Duration::from_secs(global.timeout_secs.max(1));
        Self {
            request_timeout: timeout,
            stream_idle_timeout: timeout,
            ..Self::default()
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            stream_idle_timeout: Duration::from_secs(300),
            max_connections: 250,
            max_idle_per_host: 200,
        }
    }
}

/// One pooled client and one admission limit per (base url, credential) pair.
/// A saturated backend only queues its own callers, and only for
/// `queue_timeout`.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    clients: Arc<Mutex<HashMap<ClientKey, Client>>>,
    lanes: Arc<Mutex<HashMap<ClientKey, Arc<Semaphore>>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    origin: String,
    credential: [u8; 32],
}

impl ClientKey {
    fn for_request(req: &UpstreamHttpRequest) -> Self {
        let authorization = header_get(&req.headers, "authorization").unwrap_or_default();
        Self {
            origin: origin_of(&req.url).to_string(),
            credential: *blake3::hash(authorization.as_bytes()).as_bytes(),
        }
    }
}

fn origin_of(url: &str) -> &str {
    let after_scheme = url.find("://").map(|idx| idx + 3).unwrap_or(0);
    match url[after_scheme..].find('/') {
        Some(idx) => &url[..after_scheme + idx],
        None => url,
    }
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Self {
        Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &UpstreamClientConfig {
        &self.config
    }

    /// Waits for a free exchange slot on `key`'s backend.
    async fn admit(&self, key: &ClientKey) -> Result<OwnedSemaphorePermit, UpstreamFailure> {
        let lane = {
            let mut guard = self.lanes.lock().map_err(|_| cache_lock_failed())?;
            guard
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_connections.max(1))))
                .clone()
        };
        match tokio::time::timeout(self.config.queue_timeout, lane.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(UpstreamFailure::Transport {
                kind: UpstreamTransportErrorKind::Other,
                message: "upstream connection limiter closed".to_string(),
            }),
            Err(_) => Err(UpstreamFailure::Transport {
                kind: UpstreamTransportErrorKind::Timeout,
                message: format!(
                    "{} saturated: no free connection within {}ms",
                    key.origin,
                    self.config.queue_timeout.as_millis()
                ),
            }),
        }
    }

    fn client_for(&self, key: ClientKey) -> Result<Client, UpstreamFailure> {
        let mut guard = self.clients.lock().map_err(|_| cache_lock_failed())?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config).map_err(map_wreq_error)?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

fn cache_lock_failed() -> UpstreamFailure {
    UpstreamFailure::Transport {
        kind: UpstreamTransportErrorKind::Other,
        message: "upstream client cache lock failed".to_string(),
    }
}

fn build_client(config: &UpstreamClientConfig) -> Result<Client, wreq::Error> {
    Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.stream_idle_timeout)
        .pool_max_idle_per_host(config.max_idle_per_host)
        .build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let key = ClientKey::for_request(&req);
            let permit = self.admit(&key).await?;
            let client = self.client_for(key)?;

            let mut builder = client.request(http_method_to_wreq(req.method), &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            if req.is_stream {
                let resp = builder.send().await.map_err(map_wreq_error)?;
                return convert_streaming(resp, self.config.stream_idle_timeout, permit).await;
            }

            let exchange = async {
                let resp = builder.send().await.map_err(map_wreq_error)?;
                let status = resp.status().as_u16();
                let headers = headers_from_wreq(resp.headers());
                let body = resp.bytes().await.map_err(map_wreq_error)?;
                Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                })
            };
            let result = tokio::time::timeout(self.config.request_timeout, exchange)
                .await
                .map_err(|_| UpstreamFailure::Transport {
                    kind: UpstreamTransportErrorKind::Timeout,
                    message: format!(
                        "no response within {}s",
                        self.config.request_timeout.as_secs()
                    ),
                })?;
            drop(permit);
            result
        })
    }
}

fn http_method_to_wreq(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
    }
}

async fn convert_streaming(
    resp: wreq::Response,
    stream_idle_timeout: Duration,
    permit: OwnedSemaphorePermit,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    if !(200..300).contains(&status) {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, UpstreamFailure>>(16);
    tokio::spawn(async move {
        // held until the body is drained or the reader goes away
        let _permit = permit;
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(stream_idle_timeout, stream.next()) => next,
                _ = tx.closed() => break,
            };
            let item = match next {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    let _ = tx
                        .send(Err(UpstreamFailure::Transport {
                            kind: UpstreamTransportErrorKind::ReadTimeout,
                            message: format!(
                                "stream idle for {}s",
                                stream_idle_timeout.as_secs()
                            ),
                        }))
                        .await;
                    break;
                }
            };
            let forwarded = match item {
                Ok(chunk) => tx.send(Ok(chunk)).await,
                Err(err) => {
                    let _ = tx.send(Err(map_wreq_error(err))).await;
                    break;
                }
            };
            if forwarded.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    UpstreamFailure::Transport {
        kind: classify_wreq_error(&err),
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return UpstreamTransportErrorKind::ReadTimeout;
        }
        return UpstreamTransportErrorKind::Timeout;
    }
    if err.is_connect() || err.is_connection_reset() {
        if message.contains("dns") || message.contains("resolve") {
            return UpstreamTransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return UpstreamTransportErrorKind::Tls;
        }
        return UpstreamTransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return UpstreamTransportErrorKind::Tls;
    }
    UpstreamTransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, token: &str) -> UpstreamHttpRequest {
        UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: vec![("authorization".to_string(), format!("Bearer {token}"))],
            body: None,
            is_stream: false,
        }
    }

    #[test]
    fn origin_strips_path() {
        assert_eq!(
            origin_of("https://api.example.com/v1/chat/completions"),
            "https://api.example.com"
        );
        assert_eq!(origin_of("http://localhost:9000"), "http://localhost:9000");
    }

    #[test]
    fn clients_are_keyed_by_origin_and_credential() {
        let a = ClientKey::for_request(&request("https://a.example.com/v1/chat/completions", "k1"));
        let same = ClientKey::for_request(&request("https://a.example.com/other", "k1"));
        let other_key = ClientKey::for_request(&request("https://a.example.com/v1", "k2"));
        assert_eq!(a, same);
        assert_ne!(a, other_key);
    }

    #[test]
    fn config_follows_global_timeout() {
        let global = infiniproxy_common::GlobalConfigPatch {
            fallback_api_key: Some("sk".to_string()),
            dsn: Some("sqlite::memory:".to_string()),
            timeout_secs: Some(42),
            ..Default::default()
        }
        .into_config()
        .unwrap();
        let config = UpstreamClientConfig::from_global(&global);
        assert_eq!(config.request_timeout, Duration::from_secs(42));
        assert_eq!(config.max_connections, 250);
    }

    #[tokio::test]
    async fn saturated_backend_does_not_hold_up_another() {
        let client = WreqUpstreamClient::new(UpstreamClientConfig {
            max_connections: 2,
            queue_timeout: Duration::from_millis(100),
            ..UpstreamClientConfig::default()
        });
        let busy = ClientKey::for_request(&request("https://a.example.com/v1/chat/completions", "k"));
        let idle = ClientKey::for_request(&request("https://b.example.com/v1/chat/completions", "k"));
        let _first = client.admit(&busy).await.unwrap();
        let _second = client.admit(&busy).await.unwrap();

        let other = tokio::time::timeout(Duration::from_millis(50), client.admit(&idle)).await;
        assert!(matches!(other, Ok(Ok(_))));

        let err = client.admit(&busy).await.unwrap_err();
        assert_eq!(err.transport_kind(), Some(UpstreamTransportErrorKind::Timeout));
        assert!(err.to_string().contains("https://a.example.com saturated"));
    }

    #[tokio::test]
    async fn released_slot_is_reused() {
        let client = WreqUpstreamClient::new(UpstreamClientConfig {
            max_connections: 1,
            queue_timeout: Duration::from_millis(100),
            ..UpstreamClientConfig::default()
        });
        let key = ClientKey::for_request(&request("https://a.example.com/v1", "k"));
        drop(client.admit(&key).await.unwrap());
        assert!(client.admit(&key).await.is_ok());
    }
}
