use std::sync::Arc;

use infiniproxy_provider_core::{
    BackendService, BackendStore, CallerIdentity, MemoryBackendStore, ModelResolver,
    ResolveError,
};

fn backend(id: i64, short_name: &str, default_model: Option<&str>) -> BackendService {
    BackendService {
        id,
        short_name: short_name.to_string(),
        name: short_name.to_uppercase(),
        base_url: format!("https://{short_name}.example.com/v1"),
        api_key: format!("sk-{short_name}"),
        default_model: default_model.map(str::to_string),
        is_active: true,
        is_default: false,
    }
}

fn static_fallback() -> BackendService {
    BackendService::fallback("https://fallback.example.com/v1", "sk-fallback", "glm-4.6")
}

fn resolver(backends: Vec<BackendService>) -> ModelResolver {
    ModelResolver::new(
        Arc::new(MemoryBackendStore::new(backends)),
        static_fallback(),
        "glm-4.6",
    )
}

fn caller(preferred_backend_id: Option<i64>, preferred_model: Option<&str>) -> CallerIdentity {
    CallerIdentity {
        caller_id: 1,
        user_id: 1,
        preferred_backend_id,
        preferred_model: preferred_model.map(str::to_string),
    }
}

#[tokio::test]
async fn addressed_model_beats_caller_preference() {
    let resolver = resolver(vec![
        backend(1, "zhipu", Some("glm-4.5")),
        backend(2, "acme", Some("gpt-x")),
    ]);
    let caller = caller(Some(2), Some("other"));

    let resolution = resolver
        .resolve(Some("zhipu/glm-4.6"), Some(&caller))
        .await
        .unwrap();
    assert_eq!(resolution.backend.short_name, "zhipu");
    assert_eq!(resolution.model, "glm-4.6");
    assert!(resolution.explicit_model);
    assert_eq!(resolution.fallback_model, "glm-4.5");
}

#[tokio::test]
async fn addressed_model_splits_once() {
    let resolver = resolver(vec![backend(1, "acme", None)]);
    let resolution = resolver
        .resolve(Some("acme/org/model-v2"), None)
        .await
        .unwrap();
    assert_eq!(resolution.model, "org/model-v2");
}

#[tokio::test]
async fn unknown_or_inactive_backend_is_a_client_error() {
    let mut inactive = backend(2, "sleepy", None);
    inactive.is_active = false;
    let resolver = resolver(vec![backend(1, "acme", None), inactive]);

    assert_eq!(
        resolver.resolve(Some("nobody/m"), None).await,
        Err(ResolveError::UnknownBackend("nobody".to_string()))
    );
    assert_eq!(
        resolver.resolve(Some("sleepy/m"), None).await,
        Err(ResolveError::UnknownBackend("sleepy".to_string()))
    );
}

#[tokio::test]
async fn empty_model_after_prefix_uses_backend_default() {
    let resolver = resolver(vec![backend(1, "acme", Some("gpt-x"))]);
    let caller = caller(None, Some("preferred"));
    let resolution = resolver.resolve(Some("acme/"), Some(&caller)).await.unwrap();
    assert_eq!(resolution.model, "gpt-x");
    assert!(!resolution.explicit_model);
}

#[tokio::test]
async fn caller_preference_beats_registry_default() {
    let mut default = backend(1, "main", Some("main-model"));
    default.is_default = true;
    let resolver = resolver(vec![default, backend(2, "acme", Some("gpt-x"))]);

    let resolution = resolver
        .resolve(None, Some(&caller(Some(2), None)))
        .await
        .unwrap();
    assert_eq!(resolution.backend.short_name, "acme");
    assert_eq!(resolution.model, "gpt-x");
    assert!(!resolution.explicit_model);
}

#[tokio::test]
async fn inactive_preference_falls_through_to_default() {
    let mut default = backend(1, "main", None);
    default.is_default = true;
    let mut preferred = backend(2, "acme", None);
    preferred.is_active = false;
    let resolver = resolver(vec![default, preferred]);

    let resolution = resolver
        .resolve(None, Some(&caller(Some(2), None)))
        .await
        .unwrap();
    assert_eq!(resolution.backend.short_name, "main");
    assert_eq!(resolution.model, "glm-4.6");
}

#[tokio::test]
async fn preferred_model_fills_empty_model() {
    let resolver = resolver(vec![backend(1, "main", Some("main-model"))]);
    let resolution = resolver
        .resolve(Some("  "), Some(&caller(None, Some("caller-model"))))
        .await
        .unwrap();
    assert_eq!(resolution.model, "caller-model");
    assert!(!resolution.explicit_model);
}

#[tokio::test]
async fn bare_model_goes_to_default_backend_as_explicit() {
    let mut default = backend(1, "main", Some("main-model"));
    default.is_default = true;
    let resolver = resolver(vec![backend(2, "acme", None), default]);

    let resolution = resolver.resolve(Some("claude-x"), None).await.unwrap();
    assert_eq!(resolution.backend.short_name, "main");
    assert_eq!(resolution.model, "claude-x");
    assert!(resolution.explicit_model);
    assert_eq!(resolution.fallback_model, "main-model");
}

#[tokio::test]
async fn lowest_id_active_backend_when_nothing_flagged() {
    let resolver = resolver(vec![backend(5, "later", None), backend(3, "earlier", None)]);
    let resolution = resolver.resolve(None, None).await.unwrap();
    assert_eq!(resolution.backend.short_name, "earlier");
}

#[tokio::test]
async fn empty_registry_returns_static_fallback() {
    let resolver = resolver(Vec::new());
    let resolution = resolver.resolve(None, Some(&caller(Some(9), None))).await.unwrap();
    assert_eq!(resolution.backend, static_fallback());
    assert_eq!(resolution.model, "glm-4.6");
    assert_eq!(resolution.fallback_model, "glm-4.6");
}

#[tokio::test]
async fn listing_is_default_first_then_by_short_name() {
    let mut default = backend(3, "zeta", None);
    default.is_default = true;
    let mut inactive = backend(4, "beta", None);
    inactive.is_active = false;
    let store = MemoryBackendStore::new(vec![
        backend(1, "gamma", None),
        default,
        inactive,
        backend(2, "alpha", None),
    ]);

    let names = |list: Vec<BackendService>| -> Vec<String> {
        list.into_iter().map(|backend| backend.short_name).collect()
    };
    assert_eq!(
        names(store.list_backends(false).await.unwrap()),
        vec!["zeta", "alpha", "beta", "gamma"]
    );
    assert_eq!(
        names(store.list_backends(true).await.unwrap()),
        vec!["zeta", "alpha", "gamma"]
    );
}

#[tokio::test]
async fn inserting_a_default_clears_the_previous_one() {
    let mut first = backend(1, "first", None);
    first.is_default = true;
    let store = MemoryBackendStore::new(vec![first]);
    let mut second = backend(2, "second", None);
    second.is_default = true;
    store.insert(second).await;

    let defaults: Vec<_> = store
        .list_backends(false)
        .await
        .unwrap()
        .into_iter()
        .filter(|backend| backend.is_default)
        .map(|backend| backend.short_name)
        .collect();
    assert_eq!(defaults, vec!["second"]);
}
