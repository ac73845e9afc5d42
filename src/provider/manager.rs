// The credential manager: owns the auth pool, dispatches selection, and
// records results asynchronously. Reads hand out clones; the selector is
// never invoked under the manager lock.

use super::auth::{Auth, AuthStatus};
use super::result::{apply_result, ExecResult};
use super::selector::{AuthSnapshot, RoundRobinSelector, Selector};
use super::store::TokenStore;
use crate::executor::Executor;
use crate::metrics;
use crate::registry::ModelRegistry;
use crate::stream::recorder::{RecorderConfig, ResultRecorder};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

pub type ResultHook = Arc<dyn Fn(&ExecResult) + Send + Sync>;

#[derive(Clone)]
pub struct ManagerConfig {
    pub recorder: RecorderConfig,
    pub quota_ladder: Vec<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            recorder: RecorderConfig {
                queue_size: 2048,
                workers: 4,
            },
            quota_ladder: [1u64, 5, 15, 60, 360]
                .iter()
                .map(|m| Duration::from_secs(m * 60))
                .collect(),
        }
    }
}

struct ManagerInner {
    auths: RwLock<HashMap<String, Auth>>,
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
    selector: Arc<dyn Selector>,
    store: Arc<dyn TokenStore>,
    registry: Arc<ModelRegistry>,
    ladder: Vec<Duration>,
    hook: RwLock<Option<ResultHook>>,
}

pub struct Manager {
    inner: Arc<ManagerInner>,
    recorder: ResultRecorder<ExecResult>,
}

impl Manager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        registry: Arc<ModelRegistry>,
        selector: Option<Arc<dyn Selector>>,
        cfg: ManagerConfig,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            auths: RwLock::new(HashMap::new()),
            executors: RwLock::new(HashMap::new()),
            selector: selector.unwrap_or_else(|| Arc::new(RoundRobinSelector::new())),
            store,
            registry,
            ladder: cfg.quota_ladder.clone(),
            hook: RwLock::new(None),
        });

        let worker_inner = Arc::clone(&inner);
        let recorder = ResultRecorder::new(
            cfg.recorder,
            Arc::new(move |result| worker_inner.process_result(result)),
        );

        Self { inner, recorder }
    }

    /// Adds or replaces a credential. Idempotent by id.
    pub fn register(&self, auth: Auth) {
        let mut auths = self.inner.auths.write().unwrap();
        auths.insert(auth.id.clone(), auth);
    }

    pub fn unregister(&self, id: &str) {
        let removed = {
            let mut auths = self.inner.auths.write().unwrap();
            auths.remove(id)
        };
        if removed.is_some() {
            self.inner.registry.remove_client(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Auth> {
        self.inner.auths.read().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Auth> {
        let mut auths: Vec<Auth> = self.inner.auths.read().unwrap().values().cloned().collect();
        auths.sort_by(|a, b| a.id.cmp(&b.id));
        auths
    }

    pub fn register_executor(&self, executor: Arc<dyn Executor>) {
        let mut executors = self.inner.executors.write().unwrap();
        executors.insert(executor.identifier().to_string(), executor);
    }

    pub fn executor_for(&self, provider: &str) -> Option<Arc<dyn Executor>> {
        self.inner.executors.read().unwrap().get(provider).cloned()
    }

    /// Providers that currently have at least one enabled credential.
    pub fn available_providers(&self) -> Vec<String> {
        let auths = self.inner.auths.read().unwrap();
        let mut providers: Vec<String> = auths
            .values()
            .filter(|a| a.status != AuthStatus::Disabled)
            .map(|a| a.provider.clone())
            .collect();
        providers.sort();
        providers.dedup();
        providers
    }

    /// Two-phase selection: snapshot eligible credentials under the read
    /// lock, run the selector outside any manager lock, then re-look-up the
    /// winner and hand back a clone.
    pub fn pick(&self, provider: &str, model: &str) -> Option<Auth> {
        let now = Utc::now();
        let mut candidates: Vec<AuthSnapshot> = {
            let auths = self.inner.auths.read().unwrap();
            auths
                .values()
                .filter(|a| a.provider == provider && a.available_for(model, now))
                .map(|a| AuthSnapshot {
                    id: a.id.clone(),
                    updated_at: a.updated_at,
                })
                .collect()
        };
        // Stable ordering keeps the round-robin cursor meaningful.
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        if candidates.is_empty() {
            debug!(provider, model, "no credentials available");
            return None;
        }

        let chosen = self.inner.selector.pick(provider, model, &candidates)?;
        self.inner.auths.read().unwrap().get(&chosen).cloned()
    }

    /// Queues a result for async processing. Fire-and-forget on the hot
    /// path; a full queue blocks briefly rather than dropping, because a
    /// dropped result corrupts quota accounting.
    pub async fn mark_result(&self, result: ExecResult) {
        if result.auth_id.is_empty() {
            return;
        }
        if !self.recorder.record(result).await {
            warn!("result recorder stopped; result discarded");
        }
    }

    pub fn persist(&self, auth: &Auth) -> Result<(), crate::error::GatewayError> {
        self.inner.store.save(auth)
    }

    /// Refreshes a credential through its executor, re-registers the result,
    /// and persists it.
    pub async fn refresh(&self, id: &str) -> Result<Auth, crate::error::GatewayError> {
        let auth = self
            .get(id)
            .ok_or_else(|| crate::error::GatewayError::Internal(format!("unknown auth: {id}")))?;
        let executor = self.executor_for(&auth.provider).ok_or_else(|| {
            crate::error::GatewayError::Internal(format!("no executor for {}", auth.provider))
        })?;
        let refreshed = executor
            .refresh(tokio_util::sync::CancellationToken::new(), &auth)
            .await?;
        self.register(refreshed.clone());
        self.inner.store.save(&refreshed)?;
        Ok(refreshed)
    }

    pub fn set_on_result(&self, hook: ResultHook) {
        *self.inner.hook.write().unwrap() = Some(hook);
    }

    /// Closes the result queue and drains pending items.
    pub async fn stop(&self) {
        self.recorder.stop().await;
    }

    #[cfg(test)]
    pub(crate) fn process_now(&self, result: ExecResult) {
        self.inner.process_result(result);
    }
}

impl ManagerInner {
    /// Runs on a recorder worker: mutate auth state under the write lock,
    /// then do registry callbacks, persistence, and the user hook outside it.
    fn process_result(&self, result: ExecResult) {
        if result.auth_id.is_empty() {
            return;
        }
        let group = self.registry.quota_group_members(&result.model);
        let now = Utc::now();

        let (effects, snapshot) = {
            let mut auths = self.auths.write().unwrap();
            let Some(auth) = auths.get_mut(&result.auth_id) else {
                return;
            };
            let effects = apply_result(auth, &result, &group, &self.ladder, now);
            let snapshot = effects.persist.then(|| auth.clone());
            (effects, snapshot)
        };

        if !result.model.is_empty() {
            if result.success {
                self.registry
                    .clear_model_quota_exceeded(&result.auth_id, &result.model);
                self.registry
                    .resume_client_model(&result.auth_id, &result.model);
                for model in &effects.group_models {
                    self.registry
                        .clear_model_quota_exceeded(&result.auth_id, model);
                    self.registry.resume_client_model(&result.auth_id, model);
                }
            } else {
                if effects.set_quota {
                    self.registry
                        .set_model_quota_exceeded(&result.auth_id, &result.model);
                }
                if let Some(reason) = effects.suspend_reason {
                    self.registry
                        .suspend_client_model(&result.auth_id, &result.model, reason);
                    metrics::record_cooldown(&result.provider, reason);
                }
                for model in &effects.group_models {
                    self.registry
                        .set_model_quota_exceeded(&result.auth_id, model);
                    self.registry
                        .suspend_client_model(&result.auth_id, model, "quota_group");
                }
            }
        }

        if let Some(auth) = snapshot {
            if let Err(e) = self.store.save(&auth) {
                warn!(auth_id = %auth.id, error = %e, "failed to persist credential");
            }
        }

        let hook = self.hook.read().unwrap().clone();
        if let Some(hook) = hook {
            hook(&result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::auth::AuthError;
    use crate::provider::store::FileTokenStore;

    fn manager_with(registry: Arc<ModelRegistry>) -> (Manager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileTokenStore::new(dir.path()));
        let manager = Manager::new(store, registry, None, ManagerConfig::default());
        (manager, dir)
    }

    fn auth(id: &str, provider: &str) -> Auth {
        let mut auth = Auth::new(id, provider);
        auth.attributes
            .insert("api_key".to_string(), "k".to_string());
        auth
    }

    #[tokio::test]
    async fn test_register_and_pick_round_robin() {
        let registry = Arc::new(ModelRegistry::empty());
        let (manager, _dir) = manager_with(registry);
        manager.register(auth("a", "gemini"));
        manager.register(auth("b", "gemini"));
        manager.register(auth("c", "openai"));

        let first = manager.pick("gemini", "m").unwrap();
        let second = manager.pick("gemini", "m").unwrap();
        assert_ne!(first.id, second.id);
        assert!(manager.pick("anthropic", "m").is_none());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_get_returns_clone() {
        let registry = Arc::new(ModelRegistry::empty());
        let (manager, _dir) = manager_with(registry);
        manager.register(auth("a", "gemini"));

        let mut copy = manager.get("a").unwrap();
        copy.provider = "mutated".to_string();
        assert_eq!(manager.get("a").unwrap().provider, "gemini");
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_failure_suspends_then_pick_skips() {
        let registry = Arc::new(ModelRegistry::empty());
        let (manager, _dir) = manager_with(Arc::clone(&registry));
        manager.register(auth("a", "gemini"));

        manager.process_now(ExecResult::failure(
            "a",
            "gemini",
            "m",
            AuthError {
                http_status: 401,
                message: "bad key".to_string(),
            },
        ));

        assert!(manager.pick("gemini", "m").is_none());
        assert!(registry.is_model_suspended("a", "m"));
        assert_eq!(manager.get("a").unwrap().status, AuthStatus::Unauthorized);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_quota_cascade_and_failover() {
        // Two auths for the same provider; a 429 on one leaves the other
        // pickable, and a later success clears the whole quota group.
        let registry = Arc::new(ModelRegistry::empty());
        registry.register_model(crate::registry::ModelInfo {
            id: "m".to_string(),
            provider: "x".to_string(),
            display_name: "m".to_string(),
            output_token_limit: 100,
            max_completion_tokens: 100,
            thinking: None,
            quota_group: Some("g".to_string()),
        });
        registry.register_model(crate::registry::ModelInfo {
            id: "m2".to_string(),
            provider: "x".to_string(),
            display_name: "m2".to_string(),
            output_token_limit: 100,
            max_completion_tokens: 100,
            thinking: None,
            quota_group: Some("g".to_string()),
        });

        let (manager, _dir) = manager_with(Arc::clone(&registry));
        manager.register(auth("a", "x"));
        manager.register(auth("b", "x"));

        let mut result = ExecResult::failure(
            "a",
            "x",
            "m",
            AuthError {
                http_status: 429,
                message: "quota".to_string(),
            },
        );
        result.retry_after = Some(Duration::from_secs(60));
        manager.process_now(result);

        // Both group members on auth a are out; b still serves.
        let a = manager.get("a").unwrap();
        assert!(a.model_states["m"].quota.exceeded);
        assert!(a.model_states["m2"].quota.exceeded);
        assert_eq!(
            a.model_states["m"].quota.next_recover_at,
            a.model_states["m2"].quota.next_recover_at
        );
        assert!(registry.is_model_quota_exceeded("a", "m2"));

        let picked = manager.pick("x", "m").unwrap();
        assert_eq!(picked.id, "b");

        // Success on any group member clears all of them.
        manager.process_now(ExecResult::success("a", "x", "m2"));
        let a = manager.get("a").unwrap();
        assert!(!a.model_states["m"].quota.exceeded);
        assert!(!a.model_states["m2"].quota.exceeded);
        assert!(!registry.is_model_quota_exceeded("a", "m"));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_user_error_leaves_auth_untouched() {
        let registry = Arc::new(ModelRegistry::empty());
        let (manager, _dir) = manager_with(Arc::clone(&registry));
        manager.register(auth("a", "openai"));

        manager.process_now(ExecResult::failure(
            "a",
            "openai",
            "m",
            AuthError {
                http_status: 400,
                message: "invalid request: bad role".to_string(),
            },
        ));

        let a = manager.get("a").unwrap();
        assert_eq!(a.status, AuthStatus::Active);
        assert!(a.last_error.is_none());
        assert!(!registry.is_model_suspended("a", "m"));
        assert!(manager.pick("openai", "m").is_some());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_mark_result_async_path() {
        let registry = Arc::new(ModelRegistry::empty());
        let (manager, _dir) = manager_with(registry);
        manager.register(auth("a", "gemini"));

        manager
            .mark_result(ExecResult::success("a", "gemini", "m"))
            .await;

        // The async worker applies the update shortly after.
        for _ in 0..100 {
            if manager
                .get("a")
                .map(|a| a.model_states.contains_key("m"))
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.get("a").unwrap().model_states.contains_key("m"));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_result_hook_runs() {
        let registry = Arc::new(ModelRegistry::empty());
        let (manager, _dir) = manager_with(registry);
        manager.register(auth("a", "gemini"));

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        manager.set_on_result(Arc::new(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        manager.process_now(ExecResult::success("a", "gemini", "m"));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
        manager.stop().await;
    }
}
