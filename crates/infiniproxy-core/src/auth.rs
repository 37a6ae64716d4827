use std::sync::Arc;

use http::HeaderMap;

use infiniproxy_provider_core::{CallerDirectory, CallerIdentity, hash_api_key};

use crate::error::GatewayError;

/// Maps request credentials to a caller. Keys are looked up by hash only.
pub struct Authenticator {
    directory: Arc<dyn CallerDirectory>,
    require_api_key: bool,
}

impl Authenticator {
    pub fn new(directory: Arc<dyn CallerDirectory>, require_api_key: bool) -> Self {
        Self {
            directory,
            require_api_key,
        }
    }

    /// `Ok(None)` is an anonymous caller, only possible when keys are optional.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<CallerIdentity>, GatewayError> {
        let Some(api_key) = extract_api_key(headers) else {
            if self.require_api_key {
                return Err(GatewayError::Unauthorized("missing api key".to_string()));
            }
            return Ok(None);
        };

        match self.directory.lookup_caller(&hash_api_key(&api_key)).await? {
            Some(caller) => Ok(Some(caller)),
            None if self.require_api_key => {
                Err(GatewayError::Unauthorized("invalid api key".to_string()))
            }
            None => Ok(None),
        }
    }
}

/// `x-api-key` wins over `authorization: Bearer`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value.trim().to_string()).filter(|value| !value.is_empty());
    }

    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
