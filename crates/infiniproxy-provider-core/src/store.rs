use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::{BackendService, CallerIdentity};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("backend registry unavailable: {0}")]
    Unavailable(String),
}

/// Read side of the backend registry. Implementations are queried per request
/// and must not cache across requests.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Ordered default-first, then by short name.
    async fn list_backends(&self, active_only: bool)
    -> Result<Vec<BackendService>, RegistryError>;

    async fn get_backend(&self, id: i64) -> Result<Option<BackendService>, RegistryError>;

    /// Active backends only.
    async fn get_backend_by_short_name(
        &self,
        short_name: &str,
    ) -> Result<Option<BackendService>, RegistryError>;

    /// The flagged default if active, else the lowest-id active backend.
    async fn get_default_backend(&self) -> Result<Option<BackendService>, RegistryError>;
}

/// Caller lookup by hashed api key.
#[async_trait]
pub trait CallerDirectory: Send + Sync {
    async fn lookup_caller(&self, key_hash: &str)
    -> Result<Option<CallerIdentity>, RegistryError>;
}

pub(crate) fn sort_default_first(backends: &mut [BackendService]) {
    backends.sort_by(|a, b| {
        b.is_default
            .cmp(&a.is_default)
            .then_with(|| a.short_name.cmp(&b.short_name))
    });
}

#[derive(Debug, Default)]
pub struct MemoryBackendStore {
    backends: RwLock<Vec<BackendService>>,
}

impl MemoryBackendStore {
    pub fn new(backends: Vec<BackendService>) -> Self {
        Self {
            backends: RwLock::new(backends),
        }
    }

    pub async fn insert(&self, backend: BackendService) {
        let mut guard = self.backends.write().await;
        if backend.is_default {
            for existing in guard.iter_mut() {
                existing.is_default = false;
            }
        }
        guard.retain(|existing| existing.id != backend.id);
        guard.push(backend);
    }
}

#[async_trait]
impl BackendStore for MemoryBackendStore {
    async fn list_backends(
        &self,
        active_only: bool,
    ) -> Result<Vec<BackendService>, RegistryError> {
        let mut backends: Vec<BackendService> = self
            .backends
            .read()
            .await
            .iter()
            .filter(|backend| !active_only || backend.is_active)
            .cloned()
            .collect();
        sort_default_first(&mut backends);
        Ok(backends)
    }

    async fn get_backend(&self, id: i64) -> Result<Option<BackendService>, RegistryError> {
        Ok(self
            .backends
            .read()
            .await
            .iter()
            .find(|backend| backend.id == id)
            .cloned())
    }

    async fn get_backend_by_short_name(
        &self,
        short_name: &str,
    ) -> Result<Option<BackendService>, RegistryError> {
        Ok(self
            .backends
            .read()
            .await
            .iter()
            .find(|backend| backend.is_active && backend.short_name == short_name)
            .cloned())
    }

    async fn get_default_backend(&self) -> Result<Option<BackendService>, RegistryError> {
        let guard = self.backends.read().await;
        if let Some(backend) = guard
            .iter()
            .find(|backend| backend.is_active && backend.is_default)
        {
            return Ok(Some(backend.clone()));
        }
        Ok(guard
            .iter()
            .filter(|backend| backend.is_active)
            .min_by_key(|backend| backend.id)
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCallerDirectory {
    callers: RwLock<HashMap<String, CallerIdentity>>,
}

impl MemoryCallerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key_hash: impl Into<String>, caller: CallerIdentity) {
        self.callers.write().await.insert(key_hash.into(), caller);
    }
}

#[async_trait]
impl CallerDirectory for MemoryCallerDirectory {
    async fn lookup_caller(
        &self,
        key_hash: &str,
    ) -> Result<Option<CallerIdentity>, RegistryError> {
        Ok(self.callers.read().await.get(key_hash).cloned())
    }
}
