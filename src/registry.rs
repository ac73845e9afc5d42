// Model registry: static model metadata, family routing tables, and the
// process-wide model health state used for routing decisions. Constructed in
// main and shared via Arc so tests can inject a fresh instance.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Thinking budget range supported by a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThinkingRange {
    pub min: i32,
    pub max: i32,
    pub zero_allowed: bool,
    pub dynamic_allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    pub output_token_limit: i32,
    pub max_completion_tokens: i32,
    pub thinking: Option<ThinkingRange>,
    /// Models sharing an upstream quota bucket carry the same group name.
    pub quota_group: Option<String>,
}

/// A provider-specific model inside a canonical family. Priority 1 is best;
/// equal priorities are load balanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyMember {
    pub provider: String,
    pub model_id: String,
    pub priority: u8,
}

#[derive(Default)]
struct RegistryState {
    models: HashMap<String, ModelInfo>,
    families: HashMap<String, Vec<FamilyMember>>,
    /// Per-credential suspended (model -> reason) pairs.
    suspended: HashMap<String, HashMap<String, String>>,
    /// Per-credential models with an exceeded quota flag.
    quota_exceeded: HashMap<String, HashSet<String>>,
}

pub struct ModelRegistry {
    state: RwLock<RegistryState>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// A registry pre-loaded with the builtin model and family tables.
    pub fn new() -> Self {
        let mut state = RegistryState::default();
        for model in builtin_models() {
            state.models.insert(model.id.clone(), model);
        }
        for (canonical, members) in builtin_families() {
            state.families.insert(canonical, members);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// An empty registry for tests.
    pub fn empty() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn register_model(&self, model: ModelInfo) {
        let mut state = self.state.write().unwrap();
        state.models.insert(model.id.clone(), model);
    }

    pub fn register_family(&self, canonical: &str, members: Vec<FamilyMember>) {
        let mut state = self.state.write().unwrap();
        state.families.insert(canonical.to_string(), members);
    }

    pub fn model_info(&self, id: &str) -> Option<ModelInfo> {
        let state = self.state.read().unwrap();
        state
            .models
            .get(id)
            .or_else(|| state.models.get(&id.to_lowercase()))
            .cloned()
    }

    pub fn is_canonical(&self, id: &str) -> bool {
        self.state.read().unwrap().families.contains_key(id)
    }

    /// Reverse lookup: canonical family name for a provider-specific model id.
    pub fn canonical_for(&self, provider_model_id: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        for (canonical, members) in &state.families {
            if members.iter().any(|m| m.model_id == provider_model_id) {
                return Some(canonical.clone());
            }
        }
        None
    }

    /// Resolve a canonical model to the ordered candidate list the selector
    /// walks: members are filtered by provider availability, shuffled within
    /// each priority tier to spread load, and concatenated best-tier first so
    /// lower tiers remain as fallback.
    pub fn resolve_family(&self, canonical: &str, available: &[String]) -> Vec<FamilyMember> {
        let state = self.state.read().unwrap();
        let Some(family) = state.families.get(canonical) else {
            return Vec::new();
        };

        let available: HashSet<&str> = available.iter().map(String::as_str).collect();
        let mut tiers: HashMap<u8, Vec<FamilyMember>> = HashMap::new();
        for member in family {
            if available.contains(member.provider.as_str()) {
                tiers.entry(member.priority).or_default().push(member.clone());
            }
        }

        let mut priorities: Vec<u8> = tiers.keys().copied().collect();
        priorities.sort_unstable();

        let mut rng = rand::thread_rng();
        let mut ordered = Vec::new();
        for priority in priorities {
            let mut tier = tiers.remove(&priority).unwrap_or_default();
            tier.shuffle(&mut rng);
            ordered.extend(tier);
        }
        ordered
    }

    /// All models in the same quota group as `model`, including itself.
    pub fn quota_group_members(&self, model: &str) -> Vec<String> {
        let state = self.state.read().unwrap();
        let Some(group) = state.models.get(model).and_then(|m| m.quota_group.clone()) else {
            return vec![model.to_string()];
        };
        let mut members: Vec<String> = state
            .models
            .values()
            .filter(|m| m.quota_group.as_deref() == Some(group.as_str()))
            .map(|m| m.id.clone())
            .collect();
        members.sort();
        members
    }

    pub fn models_for_provider(&self, provider: &str) -> Vec<ModelInfo> {
        let state = self.state.read().unwrap();
        let mut models: Vec<ModelInfo> = state
            .models
            .values()
            .filter(|m| m.provider == provider)
            .cloned()
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        let state = self.state.read().unwrap();
        let mut models: Vec<ModelInfo> = state.models.values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn list_canonical(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        let mut names: Vec<String> = state.families.keys().cloned().collect();
        names.sort();
        names
    }

    // Health bookkeeping, driven by the credential manager's result worker.

    pub fn suspend_client_model(&self, auth_id: &str, model: &str, reason: &str) {
        let mut state = self.state.write().unwrap();
        state
            .suspended
            .entry(auth_id.to_string())
            .or_default()
            .insert(model.to_string(), reason.to_string());
    }

    pub fn resume_client_model(&self, auth_id: &str, model: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(models) = state.suspended.get_mut(auth_id) {
            models.remove(model);
        }
    }

    pub fn is_model_suspended(&self, auth_id: &str, model: &str) -> bool {
        let state = self.state.read().unwrap();
        state
            .suspended
            .get(auth_id)
            .map(|m| m.contains_key(model))
            .unwrap_or(false)
    }

    pub fn set_model_quota_exceeded(&self, auth_id: &str, model: &str) {
        let mut state = self.state.write().unwrap();
        state
            .quota_exceeded
            .entry(auth_id.to_string())
            .or_default()
            .insert(model.to_string());
    }

    pub fn clear_model_quota_exceeded(&self, auth_id: &str, model: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(models) = state.quota_exceeded.get_mut(auth_id) {
            models.remove(model);
        }
    }

    pub fn is_model_quota_exceeded(&self, auth_id: &str, model: &str) -> bool {
        let state = self.state.read().unwrap();
        state
            .quota_exceeded
            .get(auth_id)
            .map(|m| m.contains(model))
            .unwrap_or(false)
    }

    pub fn remove_client(&self, auth_id: &str) {
        let mut state = self.state.write().unwrap();
        state.suspended.remove(auth_id);
        state.quota_exceeded.remove(auth_id);
    }

    /// Drop all per-credential health state. For tests.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap();
        state.suspended.clear();
        state.quota_exceeded.clear();
    }
}

fn claude_thinking() -> Option<ThinkingRange> {
    Some(ThinkingRange {
        min: 1024,
        max: 32_000,
        zero_allowed: false,
        dynamic_allowed: false,
    })
}

fn gemini_thinking(max: i32) -> Option<ThinkingRange> {
    Some(ThinkingRange {
        min: 0,
        max,
        zero_allowed: true,
        dynamic_allowed: true,
    })
}

fn model(
    id: &str,
    provider: &str,
    display_name: &str,
    output_token_limit: i32,
    thinking: Option<ThinkingRange>,
    quota_group: Option<&str>,
) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        provider: provider.to_string(),
        display_name: display_name.to_string(),
        output_token_limit,
        max_completion_tokens: output_token_limit,
        thinking,
        quota_group: quota_group.map(String::from),
    }
}

fn builtin_models() -> Vec<ModelInfo> {
    vec![
        model(
            "claude-sonnet-4-5",
            "anthropic",
            "Claude Sonnet 4.5",
            64_000,
            None,
            Some("claude-sonnet-4-5"),
        ),
        model(
            "claude-sonnet-4-5-thinking",
            "anthropic",
            "Claude Sonnet 4.5 (thinking)",
            64_000,
            claude_thinking(),
            Some("claude-sonnet-4-5"),
        ),
        model(
            "claude-sonnet-4-5-20250929",
            "anthropic",
            "Claude Sonnet 4.5",
            64_000,
            claude_thinking(),
            Some("claude-sonnet-4-5"),
        ),
        model(
            "claude-opus-4-5",
            "anthropic",
            "Claude Opus 4.5",
            32_000,
            None,
            Some("claude-opus-4-5"),
        ),
        model(
            "claude-opus-4-5-thinking",
            "anthropic",
            "Claude Opus 4.5 (thinking)",
            32_000,
            claude_thinking(),
            Some("claude-opus-4-5"),
        ),
        model(
            "gemini-2.5-pro",
            "gemini",
            "Gemini 2.5 Pro",
            65_536,
            gemini_thinking(32_768),
            Some("gemini"),
        ),
        model(
            "gemini-2.5-flash",
            "gemini",
            "Gemini 2.5 Flash",
            65_536,
            gemini_thinking(24_576),
            Some("gemini"),
        ),
        model(
            "gemini-2.5-flash-lite",
            "gemini",
            "Gemini 2.5 Flash Lite",
            65_536,
            gemini_thinking(24_576),
            Some("gemini"),
        ),
        model("gpt-4o", "openai", "GPT-4o", 16_384, None, None),
        model(
            "gpt-5",
            "openai",
            "GPT-5",
            128_000,
            Some(ThinkingRange {
                min: 0,
                max: 128_000,
                zero_allowed: true,
                dynamic_allowed: true,
            }),
            None,
        ),
    ]
}

fn builtin_families() -> Vec<(String, Vec<FamilyMember>)> {
    fn member(provider: &str, model_id: &str, priority: u8) -> FamilyMember {
        FamilyMember {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            priority,
        }
    }

    vec![
        (
            "claude-sonnet-4-5".to_string(),
            vec![
                member("anthropic", "claude-sonnet-4-5-20250929", 1),
                member("openai", "gpt-4o", 2),
            ],
        ),
        (
            "claude-sonnet-4-5-thinking".to_string(),
            vec![member("anthropic", "claude-sonnet-4-5-20250929", 1)],
        ),
        (
            "gemini-2.5-pro".to_string(),
            vec![member("gemini", "gemini-2.5-pro", 1)],
        ),
        (
            "gemini-2.5-flash".to_string(),
            vec![member("gemini", "gemini-2.5-flash", 1)],
        ),
    ]
}
