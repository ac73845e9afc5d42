// Credential manager invariants: suspension windows, quota arithmetic,
// group propagation, and selection behaviour.

use llmux::provider::{
    Auth, AuthError, AuthStatus, ExecResult, FileTokenStore, Manager, ManagerConfig, TokenStore,
};
use llmux::registry::{ModelInfo, ModelRegistry};
use std::sync::Arc;
use std::time::Duration;

fn registry_with_group() -> Arc<ModelRegistry> {
    let registry = ModelRegistry::empty();
    for id in ["model-a", "model-a-thinking"] {
        registry.register_model(ModelInfo {
            id: id.to_string(),
            provider: "prov".to_string(),
            display_name: id.to_string(),
            output_token_limit: 1000,
            max_completion_tokens: 1000,
            thinking: None,
            quota_group: Some("model-a".to_string()),
        });
    }
    Arc::new(registry)
}

fn new_manager(registry: Arc<ModelRegistry>) -> (Manager, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(dir.path()));
    (
        Manager::new(store, registry, None, ManagerConfig::default()),
        dir,
    )
}

fn key_auth(id: &str, provider: &str) -> Auth {
    let mut auth = Auth::new(id, provider);
    auth.attributes
        .insert("api_key".to_string(), "sk-test".to_string());
    auth
}

fn quota_error() -> AuthError {
    AuthError {
        http_status: 429,
        message: "rate limited".to_string(),
    }
}

/// Wait until the async worker has applied at least one result to `id`.
async fn wait_for<F: Fn(&Auth) -> bool>(manager: &Manager, id: &str, pred: F) {
    for _ in 0..200 {
        if manager.get(id).map(|a| pred(&a)).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached for auth {id}");
}

#[tokio::test]
async fn test_success_clears_unavailability_and_retry() {
    let (manager, _dir) = new_manager(registry_with_group());
    manager.register(key_auth("a", "prov"));

    manager
        .mark_result(ExecResult::failure("a", "prov", "model-a", quota_error()))
        .await;
    wait_for(&manager, "a", |a| {
        a.model_states
            .get("model-a")
            .map(|s| s.unavailable)
            .unwrap_or(false)
    })
    .await;

    manager
        .mark_result(ExecResult::success("a", "prov", "model-a"))
        .await;
    wait_for(&manager, "a", |a| {
        a.model_states
            .get("model-a")
            .map(|s| !s.unavailable)
            .unwrap_or(false)
    })
    .await;

    let auth = manager.get("a").unwrap();
    let state = &auth.model_states["model-a"];
    assert!(state.next_retry_after.is_none());
    assert!(!state.quota.exceeded);
    assert_eq!(auth.status, AuthStatus::Active);
}

#[tokio::test]
async fn test_retry_after_sets_recover_instant() {
    let (manager, _dir) = new_manager(registry_with_group());
    manager.register(key_auth("a", "prov"));

    let before = chrono::Utc::now();
    let mut result = ExecResult::failure("a", "prov", "model-a", quota_error());
    result.retry_after = Some(Duration::from_secs(60));
    manager.mark_result(result).await;

    wait_for(&manager, "a", |a| a.model_states.contains_key("model-a")).await;
    let after = chrono::Utc::now();

    let auth = manager.get("a").unwrap();
    let recover = auth.model_states["model-a"]
        .quota
        .next_recover_at
        .unwrap();
    // next_recover_at = t_mark + 60s, within the processing window.
    assert!(recover >= before + chrono::Duration::seconds(60));
    assert!(recover <= after + chrono::Duration::seconds(60));
}

#[tokio::test]
async fn test_quota_cascade_scenario() {
    // Two auths for provider prov, both serving the model-a quota group.
    // A 429 on A suspends A's whole group until t+60s; pick returns B;
    // success on A clears the group.
    let registry = registry_with_group();
    let (manager, _dir) = new_manager(Arc::clone(&registry));
    manager.register(key_auth("A", "prov"));
    manager.register(key_auth("B", "prov"));

    let mut result = ExecResult::failure("A", "prov", "model-a", quota_error());
    result.retry_after = Some(Duration::from_secs(60));
    manager.mark_result(result).await;
    wait_for(&manager, "A", |a| {
        a.model_states
            .get("model-a-thinking")
            .map(|s| s.quota.exceeded)
            .unwrap_or(false)
    })
    .await;

    let a = manager.get("A").unwrap();
    assert!(a.model_states["model-a"].quota.exceeded);
    assert_eq!(
        a.model_states["model-a"].quota.next_recover_at,
        a.model_states["model-a-thinking"].quota.next_recover_at
    );

    // Only B remains pickable for the group's models.
    for _ in 0..4 {
        let picked = manager.pick("prov", "model-a").unwrap();
        assert_eq!(picked.id, "B");
    }
    assert!(manager.pick("prov", "model-a-thinking").map(|p| p.id) == Some("B".to_string()));

    manager
        .mark_result(ExecResult::success("A", "prov", "model-a-thinking"))
        .await;
    wait_for(&manager, "A", |a| {
        !a.model_states["model-a"].quota.exceeded
    })
    .await;

    assert!(!registry.is_model_quota_exceeded("A", "model-a"));
    assert!(!registry.is_model_quota_exceeded("A", "model-a-thinking"));
}

#[tokio::test]
async fn test_fully_suspended_auth_never_picked() {
    let (manager, _dir) = new_manager(registry_with_group());
    manager.register(key_auth("a", "prov"));

    manager
        .mark_result(ExecResult::failure(
            "a",
            "prov",
            "model-a",
            AuthError {
                http_status: 401,
                message: "invalid api key".to_string(),
            },
        ))
        .await;
    wait_for(&manager, "a", |a| a.status == AuthStatus::Unauthorized).await;

    assert!(manager.pick("prov", "model-a").is_none());
    // The auth-level error also blocks untouched models until retry time.
    assert!(manager.pick("prov", "other-model").is_none());
}

#[tokio::test]
async fn test_user_error_does_not_mark_credential() {
    let (manager, _dir) = new_manager(registry_with_group());
    manager.register(key_auth("a", "prov"));

    manager
        .mark_result(ExecResult::failure(
            "a",
            "prov",
            "model-a",
            AuthError {
                http_status: 400,
                message: "invalid request: prompt is too long".to_string(),
            },
        ))
        .await;
    // Give the worker a moment; nothing should change.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let auth = manager.get("a").unwrap();
    assert_eq!(auth.status, AuthStatus::Active);
    assert!(auth.last_error.is_none());
    assert!(auth.model_states.is_empty());
    assert!(manager.pick("prov", "model-a").is_some());
    manager.stop().await;
}

#[tokio::test]
async fn test_successful_result_persists_credential() {
    let registry = registry_with_group();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTokenStore::new(dir.path()));
    let manager = Manager::new(
        Arc::clone(&store) as Arc<dyn TokenStore>,
        registry,
        None,
        ManagerConfig::default(),
    );
    manager.register(key_auth("a", "prov"));

    manager
        .mark_result(ExecResult::success("a", "prov", "model-a"))
        .await;
    wait_for(&manager, "a", |a| a.model_states.contains_key("model-a")).await;
    manager.stop().await;

    let persisted = store.load("a").unwrap().expect("credential persisted");
    assert!(persisted.model_states.contains_key("model-a"));
}

#[tokio::test]
async fn test_unregister_clears_registry_state() {
    let registry = registry_with_group();
    let (manager, _dir) = new_manager(Arc::clone(&registry));
    manager.register(key_auth("a", "prov"));

    manager
        .mark_result(ExecResult::failure("a", "prov", "model-a", quota_error()))
        .await;
    wait_for(&manager, "a", |a| a.model_states.contains_key("model-a")).await;
    assert!(registry.is_model_suspended("a", "model-a"));

    manager.unregister("a");
    assert!(manager.get("a").is_none());
    assert!(!registry.is_model_suspended("a", "model-a"));
    manager.stop().await;
}
