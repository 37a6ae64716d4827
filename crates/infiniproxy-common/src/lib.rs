use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BASE_URL: &str = "https://cloud.infini-ai.com/maas/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "glm-4.6";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_TOKENS: u32 = 200_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("global config field must not be empty: {0}")]
    EmptyField(&'static str),
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > built-in defaults.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Backend registry / api key / usage store.
    pub dsn: String,
    /// Static backend used when the registry is empty.
    pub fallback_base_url: String,
    pub fallback_api_key: String,
    /// System-wide default model, also the fallback backend's default.
    pub default_model: String,
    pub timeout_secs: u64,
    pub max_input_tokens: u32,
    pub max_output_tokens: u32,
    pub debug: bool,
    /// When false, requests without a key are served anonymously.
    pub require_api_key: bool,
}

impl std::fmt::Debug for GlobalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dsn", &self.dsn)
            .field("fallback_base_url", &self.fallback_base_url)
            .field("fallback_api_key", &"<redacted>")
            .field("default_model", &self.default_model)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_input_tokens", &self.max_input_tokens)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("debug", &self.debug)
            .field("require_api_key", &self.require_api_key)
            .finish()
    }
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub fallback_base_url: Option<String>,
    pub fallback_api_key: Option<String>,
    pub default_model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_input_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub debug: Option<bool>,
    pub require_api_key: Option<bool>,
}

macro_rules! overlay_fields {
    ($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $(
            if $other.$field.is_some() {
                $self.$field = $other.$field;
            }
        )+
    };
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        overlay_fields!(
            self,
            other,
            host,
            port,
            dsn,
            fallback_base_url,
            fallback_api_key,
            default_model,
            timeout_secs,
            max_input_tokens,
            max_output_tokens,
            debug,
            require_api_key,
        );
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let fallback_api_key = self
            .fallback_api_key
            .ok_or(GlobalConfigError::MissingField("fallback_api_key"))?;
        let fallback_base_url = self
            .fallback_base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let default_model = self
            .default_model
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        for (name, value) in [
            ("fallback_api_key", &fallback_api_key),
            ("fallback_base_url", &fallback_base_url),
            ("default_model", &default_model),
        ] {
            if value.trim().is_empty() {
                return Err(GlobalConfigError::EmptyField(name));
            }
        }

        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            fallback_base_url,
            fallback_api_key,
            default_model,
            timeout_secs: self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            max_input_tokens: self.max_input_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            max_output_tokens: self.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            debug: self.debug.unwrap_or(false),
            require_api_key: self.require_api_key.unwrap_or(true),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            fallback_base_url: Some(value.fallback_base_url),
            fallback_api_key: Some(value.fallback_api_key),
            default_model: Some(value.default_model),
            timeout_secs: Some(value.timeout_secs),
            max_input_tokens: Some(value.max_input_tokens),
            max_output_tokens: Some(value.max_output_tokens),
            debug: Some(value.debug),
            require_api_key: Some(value.require_api_key),
        }
    }
}
