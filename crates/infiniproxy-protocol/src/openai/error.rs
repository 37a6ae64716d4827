use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAIErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAIErrorResponse {
    pub error: OpenAIErrorDetail,
}

impl OpenAIErrorResponse {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, code: Option<String>) -> Self {
        Self {
            error: OpenAIErrorDetail {
                message: message.into(),
                r#type: kind.into(),
                code,
            },
        }
    }
}
