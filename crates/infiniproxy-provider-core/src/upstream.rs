use std::fmt;

use bytes::Bytes;

use crate::headers::Headers;

/// Streaming body; a mid-stream failure arrives as the final `Err` item.
pub type ByteStream = tokio::sync::mpsc::Receiver<Result<Bytes, UpstreamFailure>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

impl fmt::Debug for UpstreamHttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("UpstreamHttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &header_names)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .field("is_stream", &self.is_stream)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

impl UpstreamTransportErrorKind {
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout
        )
    }
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failures (no HTTP response).
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// Non-2xx HTTP response captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

impl UpstreamFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamFailure::Http { status, .. } => Some(*status),
            UpstreamFailure::Transport { .. } => None,
        }
    }

    pub fn transport_kind(&self) -> Option<UpstreamTransportErrorKind> {
        match self {
            UpstreamFailure::Transport { kind, .. } => Some(*kind),
            UpstreamFailure::Http { .. } => None,
        }
    }
}

impl fmt::Display for UpstreamFailure {
    /// Status line plus response body, the text the rejection predicate inspects.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamFailure::Transport { kind, message } => {
                write!(f, "transport error ({kind:?}): {message}")
            }
            UpstreamFailure::Http { status, body, .. } => {
                let body = String::from_utf8_lossy(body);
                match reason_phrase(*status) {
                    Some(reason) => write!(f, "{status} {reason}: {body}"),
                    None => write!(f, "{status}: {body}"),
                }
            }
        }
    }
}

fn reason_phrase(status: u16) -> Option<&'static str> {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|status| status.canonical_reason())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_failure_text_carries_reason_phrase_and_body() {
        let failure = UpstreamFailure::Http {
            status: 404,
            headers: Vec::new(),
            body: Bytes::from_static(b"{\"error\":\"nope\"}"),
        };
        assert_eq!(failure.to_string(), "404 Not Found: {\"error\":\"nope\"}");
        assert_eq!(failure.status(), Some(404));
    }

    #[test]
    fn reason_phrase_covers_every_registered_status() {
        let gone = UpstreamFailure::Http {
            status: 410,
            headers: Vec::new(),
            body: Bytes::from_static(b"retired"),
        };
        assert_eq!(gone.to_string(), "410 Gone: retired");
        let unregistered = UpstreamFailure::Http {
            status: 599,
            headers: Vec::new(),
            body: Bytes::from_static(b"odd"),
        };
        assert_eq!(unregistered.to_string(), "599: odd");
    }

    #[test]
    fn debug_never_prints_header_values() {
        let request = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: "https://x/chat/completions".to_string(),
            headers: vec![("authorization".to_string(), "Bearer sk-secret".to_string())],
            body: None,
            is_stream: false,
        };
        assert!(!format!("{request:?}").contains("sk-secret"));
    }
}
