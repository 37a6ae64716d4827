use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::StatusCode;

use infiniproxy_protocol::claude::error::{ErrorDetail, ErrorKind, ErrorResponse};
use infiniproxy_protocol::openai::error::OpenAIErrorResponse;
use infiniproxy_provider_core::{RegistryError, ResolveError, UpstreamFailure};

const DETAIL_LIMIT: usize = 512;

/// Everything that can end a request before a response reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed body or an unknown backend prefix.
    #[error("{0}")]
    ClientRequest(String),
    #[error("backend {backend} rejected model {model} after {elapsed_ms}ms: {detail}")]
    ModelRejected {
        backend: String,
        model: String,
        status: Option<u16>,
        detail: String,
        elapsed_ms: u64,
    },
    #[error("backend {backend} failed for model {model} after {elapsed_ms}ms: {detail}")]
    BackendTransport {
        backend: String,
        model: String,
        status: Option<u16>,
        timed_out: bool,
        detail: String,
        elapsed_ms: u64,
    },
    #[error("{0}")]
    Unauthorized(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<ResolveError> for GatewayError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::UnknownBackend(_) => GatewayError::ClientRequest(err.to_string()),
            ResolveError::Registry(err) => GatewayError::Registry(err),
        }
    }
}

impl GatewayError {
    /// Classify a backend failure that is final for this request.
    pub fn from_upstream(
        failure: &UpstreamFailure,
        rejected_model: bool,
        backend: &str,
        model: &str,
        elapsed_ms: u64,
    ) -> Self {
        let detail = truncate_detail(&failure.to_string());
        if rejected_model {
            return GatewayError::ModelRejected {
                backend: backend.to_string(),
                model: model.to_string(),
                status: failure.status(),
                detail,
                elapsed_ms,
            };
        }
        GatewayError::BackendTransport {
            backend: backend.to_string(),
            model: model.to_string(),
            status: failure.status(),
            timed_out: failure.transport_kind().is_some_and(|kind| kind.is_timeout()),
            detail,
            elapsed_ms,
        }
    }

    pub fn malformed_backend_response(backend: &str, model: &str, detail: impl AsRef<str>) -> Self {
        GatewayError::BackendTransport {
            backend: backend.to_string(),
            model: model.to_string(),
            status: None,
            timed_out: false,
            detail: truncate_detail(&format!("malformed backend response: {}", detail.as_ref())),
            elapsed_ms: 0,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ClientRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::ModelRejected { status, .. } => status
                .and_then(|status| StatusCode::from_u16(status).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::BackendTransport { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendTransport { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ClientRequest(_) => "client_request",
            GatewayError::ModelRejected { .. } => "model_rejected",
            GatewayError::BackendTransport { .. } => "backend_transport",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Registry(_) => "registry",
        }
    }

    pub fn claude_error_detail(&self) -> ErrorDetail {
        let kind = match self {
            GatewayError::ClientRequest(_) => ErrorKind::InvalidRequestError,
            GatewayError::Unauthorized(_) => ErrorKind::AuthenticationError,
            GatewayError::ModelRejected { .. } => ErrorKind::NotFoundError,
            GatewayError::BackendTransport { .. } | GatewayError::Registry(_) => {
                ErrorKind::ApiError
            }
        };
        ErrorDetail {
            kind,
            message: self.to_string(),
        }
    }

    fn openai_error(&self) -> OpenAIErrorResponse {
        let (kind, code) = match self {
            GatewayError::ClientRequest(_) => ("invalid_request_error", None),
            GatewayError::Unauthorized(_) => ("authentication_error", Some("invalid_api_key")),
            GatewayError::ModelRejected { .. } => ("invalid_request_error", Some("model_not_found")),
            GatewayError::BackendTransport { timed_out: true, .. } => ("api_error", Some("timeout")),
            GatewayError::BackendTransport { .. } => ("api_error", Some("upstream_error")),
            GatewayError::Registry(_) => ("server_error", None),
        };
        OpenAIErrorResponse::new(kind, self.to_string(), code.map(str::to_string))
    }

    pub fn render(&self, format: ErrorFormat) -> ProxyError {
        let body = match format {
            ErrorFormat::Claude => serde_json::to_vec(&ErrorResponse {
                error: self.claude_error_detail(),
            }),
            ErrorFormat::OpenAI => serde_json::to_vec(&self.openai_error()),
        }
        .unwrap_or_else(|_| self.to_string().into_bytes());
        ProxyError {
            status: self.status(),
            body: Bytes::from(body),
        }
    }
}

/// Which dialect the caller speaks, and therefore the error body shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFormat {
    Claude,
    OpenAI,
}

#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status, [(CONTENT_TYPE, "application/json")], self.body).into_response()
    }
}

fn truncate_detail(text: &str) -> String {
    if text.len() <= DETAIL_LIMIT {
        return text.to_string();
    }
    let mut end = DETAIL_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
