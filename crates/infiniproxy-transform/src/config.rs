/// Server-side limits and defaults applied while translating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatorConfig {
    /// Placeholder model written into translated requests until resolution runs.
    pub default_model: String,
    pub max_input_tokens: u32,
    /// Ceiling applied to the caller's `max_tokens` (and used when it is absent).
    pub max_output_tokens: u32,
}

impl TranslatorConfig {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            ..Self::default()
        }
    }

    pub fn clamp_max_tokens(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(requested) => requested.min(self.max_output_tokens),
            None => self.max_output_tokens,
        }
    }
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            default_model: "glm-4.6".to_string(),
            max_input_tokens: 200_000,
            max_output_tokens: 200_000,
        }
    }
}
