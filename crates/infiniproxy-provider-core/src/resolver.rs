use std::sync::Arc;

use crate::backend::{BackendService, CallerIdentity};
use crate::store::{BackendStore, RegistryError};

/// Separator between backend short name and backend-local model name.
pub const BACKEND_MODEL_SEPARATOR: char = '/';

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown or inactive backend: {0}")]
    UnknownBackend(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub backend: BackendService,
    /// Concrete backend-local model name.
    pub model: String,
    /// The caller named a concrete model (as opposed to one picked for them).
    pub explicit_model: bool,
    /// Substitute used when the backend rejects `model`.
    pub fallback_model: String,
}

/// Chooses (backend, model) with a fixed precedence chain:
///
/// 1. `"<short_name>/<model>"` addresses a backend directly;
/// 2. otherwise the caller's preferred backend, if it is still active;
/// 3. otherwise the registry default, or the static fallback backend;
/// 4. an empty model becomes the caller's preferred model (rules 2-3 only),
///    the backend's default model, or the system-wide default.
pub struct ModelResolver {
    store: Arc<dyn BackendStore>,
    fallback_backend: BackendService,
    default_model: String,
}

impl ModelResolver {
    pub fn new(
        store: Arc<dyn BackendStore>,
        fallback_backend: BackendService,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            fallback_backend,
            default_model: default_model.into(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn fallback_backend(&self) -> &BackendService {
        &self.fallback_backend
    }

    pub async fn resolve(
        &self,
        requested: Option<&str>,
        caller: Option<&CallerIdentity>,
    ) -> Result<Resolution, ResolveError> {
        let requested = requested.map(str::trim).filter(|model| !model.is_empty());

        let (backend, model, addressed) = match requested
            .and_then(|model| model.split_once(BACKEND_MODEL_SEPARATOR))
        {
            Some((short_name, model)) => {
                let backend = self
                    .store
                    .get_backend_by_short_name(short_name.trim())
                    .await?
                    .ok_or_else(|| ResolveError::UnknownBackend(short_name.trim().to_string()))?;
                (backend, model.trim().to_string(), true)
            }
            None => {
                let backend = self.backend_for_caller(caller).await?;
                (backend, requested.unwrap_or_default().to_string(), false)
            }
        };

        let explicit_model = !model.is_empty();
        let model = if explicit_model {
            model
        } else {
            let preferred = if addressed {
                None
            } else {
                caller.and_then(CallerIdentity::preferred_model)
            };
            preferred
                .or_else(|| backend.default_model())
                .unwrap_or(self.default_model.as_str())
                .to_string()
        };
        let fallback_model = self.fallback_model_for(&backend);

        Ok(Resolution {
            backend,
            model,
            explicit_model,
            fallback_model,
        })
    }

    pub fn fallback_model_for(&self, backend: &BackendService) -> String {
        backend
            .default_model()
            .unwrap_or(self.default_model.as_str())
            .to_string()
    }

    async fn backend_for_caller(
        &self,
        caller: Option<&CallerIdentity>,
    ) -> Result<BackendService, ResolveError> {
        if let Some(backend_id) = caller.and_then(|caller| caller.preferred_backend_id)
            && let Some(backend) = self.store.get_backend(backend_id).await?
            && backend.is_active
        {
            return Ok(backend);
        }

        Ok(self
            .store
            .get_default_backend()
            .await?
            .unwrap_or_else(|| self.fallback_backend.clone()))
    }
}
