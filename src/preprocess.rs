// Request preprocessing: ordered passes applied to a parsed IR request
// before family resolution and emission. The whole pipeline is idempotent.

use crate::ir::types::*;
use crate::registry::{ModelInfo, ModelRegistry};

const MAX_CANDIDATES: i32 = 8;

pub fn apply(request: &mut IRRequest, registry: &ModelRegistry) {
    apply_claude_defaults(request);
    let info = registry.model_info(&request.model);
    clamp_max_tokens(request, info.as_ref());
    clamp_candidate_count(request);
    normalize_thinking(request, registry);
}

fn apply_claude_defaults(request: &mut IRRequest) {
    if !is_claude_model(&request.model) {
        return;
    }
    if request.max_tokens.unwrap_or(0) == 0 {
        request.max_tokens = Some(CLAUDE_DEFAULT_MAX_TOKENS);
    }
}

fn clamp_max_tokens(request: &mut IRRequest, info: Option<&ModelInfo>) {
    let (Some(max_tokens), Some(info)) = (request.max_tokens, info) else {
        return;
    };
    let mut limit = info.output_token_limit;
    if limit == 0 {
        limit = info.max_completion_tokens;
    }
    if limit > 0 && max_tokens > limit {
        request.max_tokens = Some(limit);
    }
}

fn clamp_candidate_count(request: &mut IRRequest) {
    if let Some(count) = request.candidate_count {
        request.candidate_count = Some(count.clamp(1, MAX_CANDIDATES));
    }
}

fn normalize_thinking(request: &mut IRRequest, registry: &ModelRegistry) {
    if request.thinking.is_none() {
        return;
    }

    promote_to_thinking_model(request, registry);

    let info = registry.model_info(&request.model);
    let Some(range) = info.and_then(|i| i.thinking) else {
        return;
    };
    let Some(thinking) = request.thinking.as_mut() else {
        return;
    };
    let Some(budget) = thinking.budget else {
        return;
    };

    let mut budget = budget;
    if budget == -1 && !range.dynamic_allowed {
        budget = (range.min + range.max) / 2;
        if budget <= 0 {
            budget = if range.zero_allowed { 0 } else { range.min };
        }
    }
    if budget == 0 && !range.zero_allowed {
        budget = range.min;
    }
    if budget > 0 {
        budget = budget.clamp(range.min.max(0), range.max);
    }
    thinking.budget = Some(budget);
}

/// Claude requests carrying a thinking config are promoted onto the model's
/// `-thinking` variant when the registry knows one. Requests already on a
/// thinking model get the default budget applied.
fn promote_to_thinking_model(request: &mut IRRequest, registry: &ModelRegistry) {
    if !is_claude_model(&request.model) {
        return;
    }

    if !request.model.ends_with("-thinking") {
        let promoted = format!("{}-thinking", request.model);
        if registry.model_info(&promoted).is_none() {
            return;
        }
        request.model = promoted;
    }

    if let Some(thinking) = request.thinking.as_mut() {
        if thinking.budget.is_none() {
            thinking.budget = Some(DEFAULT_THINKING_BUDGET);
        }
        thinking.include_thoughts = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModelRegistry, ThinkingRange};

    fn registry() -> ModelRegistry {
        ModelRegistry::new()
    }

    fn request(model: &str) -> IRRequest {
        IRRequest {
            model: model.to_string(),
            messages: vec![IRMessage::text(IRRole::User, "hi")],
            ..Default::default()
        }
    }

    #[test]
    fn test_max_tokens_clamped_to_limit() {
        let registry = registry();
        let limit = registry.model_info("gemini-2.5-flash").unwrap().output_token_limit;
        let mut req = request("gemini-2.5-flash");
        req.max_tokens = Some(limit + 1);
        apply(&mut req, &registry);
        assert_eq!(req.max_tokens, Some(limit));
    }

    #[test]
    fn test_candidate_count_boundaries() {
        let registry = registry();
        let mut req = request("gemini-2.5-flash");
        req.candidate_count = Some(0);
        apply(&mut req, &registry);
        assert_eq!(req.candidate_count, Some(1));

        req.candidate_count = Some(100);
        apply(&mut req, &registry);
        assert_eq!(req.candidate_count, Some(8));
    }

    #[test]
    fn test_thinking_promotion() {
        let registry = registry();
        let mut req = request("claude-sonnet-4-5");
        req.thinking = Some(IRThinkingConfig {
            include_thoughts: true,
            budget: Some(2000),
            summary: None,
            effort: None,
        });
        apply(&mut req, &registry);
        assert_eq!(req.model, "claude-sonnet-4-5-thinking");
        // 2000 lies inside the thinking model's range and stays put.
        assert_eq!(req.thinking.as_ref().unwrap().budget, Some(2000));
    }

    #[test]
    fn test_thinking_model_gets_default_budget() {
        let registry = registry();
        let mut req = request("claude-sonnet-4-5-thinking");
        req.thinking = Some(IRThinkingConfig::default());
        apply(&mut req, &registry);
        let thinking = req.thinking.as_ref().unwrap();
        assert_eq!(thinking.budget, Some(DEFAULT_THINKING_BUDGET));
        assert!(thinking.include_thoughts);
    }

    #[test]
    fn test_dynamic_budget_resolution() {
        let registry = registry();
        // Claude thinking range forbids dynamic: -1 resolves to the midpoint.
        let mut req = request("claude-sonnet-4-5-thinking");
        req.thinking = Some(IRThinkingConfig {
            include_thoughts: true,
            budget: Some(-1),
            summary: None,
            effort: None,
        });
        apply(&mut req, &registry);
        let range = registry
            .model_info("claude-sonnet-4-5-thinking")
            .unwrap()
            .thinking
            .unwrap();
        assert_eq!(
            req.thinking.as_ref().unwrap().budget,
            Some((range.min + range.max) / 2)
        );

        // Gemini allows dynamic: -1 passes through.
        let mut req = request("gemini-2.5-flash");
        req.thinking = Some(IRThinkingConfig {
            include_thoughts: true,
            budget: Some(-1),
            summary: None,
            effort: None,
        });
        apply(&mut req, &registry);
        assert_eq!(req.thinking.as_ref().unwrap().budget, Some(-1));
    }

    #[test]
    fn test_zero_budget_resolution() {
        let registry = ModelRegistry::empty();
        registry.register_model(crate::registry::ModelInfo {
            id: "claude-test-thinking".to_string(),
            provider: "anthropic".to_string(),
            display_name: "t".to_string(),
            output_token_limit: 1000,
            max_completion_tokens: 1000,
            thinking: Some(ThinkingRange {
                min: 128,
                max: 512,
                zero_allowed: false,
                dynamic_allowed: false,
            }),
            quota_group: None,
        });
        let mut req = request("claude-test-thinking");
        req.thinking = Some(IRThinkingConfig {
            include_thoughts: true,
            budget: Some(0),
            summary: None,
            effort: None,
        });
        apply(&mut req, &registry);
        assert_eq!(req.thinking.as_ref().unwrap().budget, Some(128));
    }

    #[test]
    fn test_claude_default_max_tokens() {
        let registry = registry();
        let mut req = request("claude-sonnet-4-5");
        apply(&mut req, &registry);
        assert_eq!(req.max_tokens, Some(CLAUDE_DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn test_preprocess_idempotent() {
        let registry = registry();
        let mut req = request("claude-sonnet-4-5");
        req.max_tokens = Some(1_000_000);
        req.candidate_count = Some(50);
        req.thinking = Some(IRThinkingConfig {
            include_thoughts: false,
            budget: Some(-1),
            summary: None,
            effort: None,
        });

        apply(&mut req, &registry);
        let once = req.clone();
        apply(&mut req, &registry);

        assert_eq!(req.model, once.model);
        assert_eq!(req.max_tokens, once.max_tokens);
        assert_eq!(req.candidate_count, once.candidate_count);
        assert_eq!(req.thinking, once.thinking);
    }
}
