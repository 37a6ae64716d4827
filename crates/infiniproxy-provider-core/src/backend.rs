use serde::{Deserialize, Serialize};

const CHAT_COMPLETIONS_SUFFIX: &str = "/chat/completions";

/// A configured upstream chat/completions service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendService {
    /// Zero for the statically configured fallback backend.
    pub id: i64,
    pub short_name: String,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub default_model: Option<String>,
    pub is_active: bool,
    pub is_default: bool,
}

impl BackendService {
    /// The built-in backend used when the registry has nothing to offer.
    pub fn fallback(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            short_name: "default".to_string(),
            name: "Default backend".to_string(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            default_model: Some(default_model.into()),
            is_active: true,
            is_default: true,
        }
    }

    /// `base_url` may be an API root or the full endpoint URL.
    pub fn chat_completions_url(&self) -> String {
        let base = self.base_url.trim().trim_end_matches('/');
        if base.ends_with(CHAT_COMPLETIONS_SUFFIX) {
            base.to_string()
        } else {
            format!("{base}{CHAT_COMPLETIONS_SUFFIX}")
        }
    }

    /// Non-empty default model, if configured.
    pub fn default_model(&self) -> Option<&str> {
        self.default_model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
    }

    pub fn summary(&self) -> BackendSummary {
        BackendSummary {
            id: self.id,
            short_name: self.short_name.clone(),
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            api_key_masked: mask_secret(&self.api_key),
            default_model: self.default_model.clone(),
            is_active: self.is_active,
            is_default: self.is_default,
        }
    }
}

impl std::fmt::Debug for BackendService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendService")
            .field("id", &self.id)
            .field("short_name", &self.short_name)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_secret(&self.api_key))
            .field("default_model", &self.default_model)
            .field("is_active", &self.is_active)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/// Listing shape for backends; never carries the credential itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSummary {
    pub id: i64,
    pub short_name: String,
    pub name: String,
    pub base_url: String,
    pub api_key_masked: String,
    pub default_model: Option<String>,
    pub is_active: bool,
    pub is_default: bool,
}

/// Who is calling, and what they would like to be routed to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Api key id.
    pub caller_id: i64,
    pub user_id: i64,
    pub preferred_backend_id: Option<i64>,
    pub preferred_model: Option<String>,
}

impl CallerIdentity {
    pub fn preferred_model(&self) -> Option<&str> {
        self.preferred_model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
    }
}

/// Keep only the last four characters visible.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base_url: &str) -> BackendService {
        BackendService::fallback(base_url, "sk-abcdef123456", "glm-4.6")
    }

    #[test]
    fn chat_completions_suffix_is_appended_once() {
        assert_eq!(
            backend("https://api.example.com/v1").chat_completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            backend("https://api.example.com/v1/").chat_completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            backend("https://api.example.com/v1/chat/completions").chat_completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn secrets_are_masked_to_last_four() {
        assert_eq!(mask_secret("sk-abcdef123456"), "***********3456");
        assert_eq!(mask_secret("abc"), "***");
        let summary = backend("https://x").summary();
        assert!(summary.api_key_masked.ends_with("3456"));
        assert!(!format!("{:?}", backend("https://x")).contains("sk-abcdef"));
    }

    #[test]
    fn blank_default_model_counts_as_unset() {
        let mut backend = backend("https://x");
        backend.default_model = Some("  ".to_string());
        assert_eq!(backend.default_model(), None);
    }
}
