use serde::{Deserialize, Serialize};

/// Error kinds the gateway reports on the messages surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequestError,
    AuthenticationError,
    NotFoundError,
    ApiError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

/// Body of a failed messages call: `{"type":"error","error":{..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "error")]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                kind,
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_the_tagged_envelope() {
        let body = serde_json::to_value(ErrorResponse::new(ErrorKind::NotFoundError, "no such model"))
            .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "type": "error",
                "error": { "type": "not_found_error", "message": "no such model" }
            })
        );
    }

    #[test]
    fn envelope_without_the_error_tag_is_rejected() {
        let parsed = serde_json::from_str::<ErrorResponse>(
            r#"{"type":"message","error":{"type":"api_error","message":"x"}}"#,
        );
        assert!(parsed.is_err());
    }
}
