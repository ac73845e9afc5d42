// Result recording: error categorisation, the quota backoff ladder, and the
// per-status state transitions applied by the async result worker.

use super::auth::{Auth, AuthError, AuthStatus, QuotaState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// The outcome of one upstream call, queued via `Manager::mark_result`.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub auth_id: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub error: Option<AuthError>,
    /// Upstream Retry-After, when it sent one.
    pub retry_after: Option<Duration>,
    pub latency: Option<Duration>,
    pub bytes: u64,
}

impl ExecResult {
    pub fn success(auth_id: &str, provider: &str, model: &str) -> Self {
        Self {
            auth_id: auth_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            success: true,
            error: None,
            retry_after: None,
            latency: None,
            bytes: 0,
        }
    }

    pub fn failure(auth_id: &str, provider: &str, model: &str, error: AuthError) -> Self {
        Self {
            auth_id: auth_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            success: false,
            error: Some(error),
            retry_after: None,
            latency: None,
            bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caused by the client's request; never held against the credential.
    UserError,
    Auth,
    NotFound,
    Quota,
    Transient,
    Unknown,
}

/// Message fragments that mark a failure as user-caused regardless of
/// status. The status table is authoritative; these are best-effort hints.
const USER_ERROR_PATTERNS: &[&str] = &[
    "invalid request",
    "invalid role",
    "malformed",
    "context length",
    "context_length_exceeded",
    "maximum context",
    "prompt is too long",
    "exceeds the maximum",
    "unsupported parameter",
    "invalid schema",
    "violates our usage policy",
];

pub fn categorize_error(status: u16, message: &str) -> ErrorCategory {
    if (400..500).contains(&status) {
        let lower = message.to_lowercase();
        if USER_ERROR_PATTERNS.iter().any(|p| lower.contains(p)) {
            return ErrorCategory::UserError;
        }
    }
    match status {
        400 | 413 | 422 => ErrorCategory::UserError,
        401 | 402 | 403 => ErrorCategory::Auth,
        404 => ErrorCategory::NotFound,
        429 => ErrorCategory::Quota,
        408 | 500 | 502 | 503 | 504 => ErrorCategory::Transient,
        _ => ErrorCategory::Unknown,
    }
}

/// Next cooldown for a repeated 429 without a Retry-After header. Returns
/// the cooldown for the current level and the (saturating) next level.
pub fn next_quota_cooldown(level: u8, ladder: &[Duration]) -> (Duration, u8) {
    if ladder.is_empty() {
        return (Duration::from_secs(60), level);
    }
    let index = (level as usize).min(ladder.len() - 1);
    let next = (level as usize + 1).min(ladder.len() - 1) as u8;
    (ladder[index], next)
}

/// Side effects to apply outside the manager lock after a state update.
#[derive(Debug, Default)]
pub(crate) struct ResultEffects {
    pub resume_model: bool,
    pub suspend_reason: Option<&'static str>,
    pub set_quota: bool,
    pub clear_quota: bool,
    /// Other models in the quota group that were set or cleared with this one.
    pub group_models: Vec<String>,
    pub persist: bool,
}

/// Applies one result to the credential. Runs under the manager write lock;
/// everything it schedules in the returned effects happens outside it.
pub(crate) fn apply_result(
    auth: &mut Auth,
    result: &ExecResult,
    group: &[String],
    ladder: &[Duration],
    now: DateTime<Utc>,
) -> ResultEffects {
    let mut effects = ResultEffects::default();
    if result.model.is_empty() {
        return effects;
    }

    if result.success {
        apply_success(auth, result, group, now, &mut effects);
    } else {
        apply_failure(auth, result, group, ladder, now, &mut effects);
    }
    effects
}

fn apply_success(
    auth: &mut Auth,
    result: &ExecResult,
    group: &[String],
    now: DateTime<Utc>,
    effects: &mut ResultEffects,
) {
    auth.model_state_mut(&result.model, now).reset(now);

    // Success on any group member clears the whole group's quota flags.
    for member in group {
        if member == &result.model {
            continue;
        }
        if let Some(state) = auth.model_states.get_mut(member) {
            if state.quota.exceeded {
                state.reset(now);
                effects.group_models.push(member.clone());
            }
        }
    }

    auth.recompute_status(now);
    if !auth.has_model_error(now) {
        auth.last_error = None;
        auth.status_message.clear();
        auth.next_retry_after = None;
        if auth.status != AuthStatus::Disabled {
            auth.status = AuthStatus::Active;
        }
    }
    auth.updated_at = now;

    effects.resume_model = true;
    effects.clear_quota = true;
    effects.persist = true;
}

fn apply_failure(
    auth: &mut Auth,
    result: &ExecResult,
    group: &[String],
    ladder: &[Duration],
    now: DateTime<Utc>,
    effects: &mut ResultEffects,
) {
    let status_code = result.error.as_ref().map(|e| e.http_status).unwrap_or(0);
    let message = result
        .error
        .as_ref()
        .map(|e| e.message.as_str())
        .unwrap_or("");
    let category = categorize_error(status_code, message);

    // User errors are the client's fault and leave credential health alone.
    if category == ErrorCategory::UserError {
        return;
    }

    {
        let state = auth.model_state_mut(&result.model, now);
        state.unavailable = true;
        state.status = AuthStatus::Error;
        state.updated_at = now;
        if let Some(error) = &result.error {
            state.last_error = Some(error.clone());
            state.status_message = error.message.clone();
        }
    }

    match status_code {
        401 => {
            let state = auth.model_state_mut(&result.model, now);
            state.next_retry_after = Some(now + ChronoDuration::minutes(30));
            // Bad credentials fail every model, so the whole auth cools down.
            auth.next_retry_after = Some(now + ChronoDuration::minutes(30));
            effects.suspend_reason = Some("unauthorized");
        }
        402 | 403 => {
            let state = auth.model_state_mut(&result.model, now);
            state.next_retry_after = Some(now + ChronoDuration::minutes(30));
            auth.next_retry_after = Some(now + ChronoDuration::minutes(30));
            effects.suspend_reason = Some("payment_required");
        }
        404 => {
            let state = auth.model_state_mut(&result.model, now);
            state.next_retry_after = Some(now + ChronoDuration::hours(12));
            effects.suspend_reason = Some("not_found");
        }
        429 => {
            let quota = {
                let state = auth.model_state_mut(&result.model, now);
                let level = state.quota.backoff_level;
                let (cooldown, next_level) = match result.retry_after {
                    Some(retry_after) => (retry_after, level),
                    None => next_quota_cooldown(level, ladder),
                };
                let recover_at = now
                    + ChronoDuration::from_std(cooldown)
                        .unwrap_or_else(|_| ChronoDuration::minutes(1));
                state.next_retry_after = Some(recover_at);
                state.quota = QuotaState {
                    exceeded: true,
                    reason: "quota".to_string(),
                    next_recover_at: Some(recover_at),
                    backoff_level: next_level,
                };
                state.quota.clone()
            };
            effects.suspend_reason = Some("quota");
            effects.set_quota = true;

            // Propagate to every model sharing the quota bucket.
            for member in group {
                if member == &result.model {
                    continue;
                }
                let member_state = auth.model_state_mut(member, now);
                member_state.unavailable = true;
                member_state.status = AuthStatus::Error;
                member_state.next_retry_after = quota.next_recover_at;
                member_state.quota = quota.clone();
                member_state.updated_at = now;
                effects.group_models.push(member.clone());
            }
        }
        408 | 500 | 502 | 503 | 504 => {
            let state = auth.model_state_mut(&result.model, now);
            state.next_retry_after = Some(now + ChronoDuration::minutes(1));
        }
        _ => {
            let state = auth.model_state_mut(&result.model, now);
            state.next_retry_after = Some(now + ChronoDuration::seconds(30));
        }
    }

    if let Some(error) = &result.error {
        auth.last_error = Some(error.clone());
        auth.status_message = error.message.clone();
    }
    auth.status = if status_code == 401 {
        AuthStatus::Unauthorized
    } else {
        AuthStatus::Error
    };
    auth.updated_at = now;
    auth.recompute_status(now);
    if auth.last_error.is_some() && auth.status == AuthStatus::Active {
        // An auth-level error keeps the aggregate out of Active until a
        // success clears it.
        auth.status = AuthStatus::Error;
    }

    effects.persist = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> Vec<Duration> {
        [1u64, 5, 15, 60, 360]
            .iter()
            .map(|m| Duration::from_secs(m * 60))
            .collect()
    }

    fn failure(status: u16, message: &str) -> ExecResult {
        ExecResult::failure(
            "auth-1",
            "gemini",
            "m",
            AuthError {
                http_status: status,
                message: message.to_string(),
            },
        )
    }

    #[test]
    fn test_categorize_status_table() {
        assert_eq!(categorize_error(400, "bad"), ErrorCategory::UserError);
        assert_eq!(categorize_error(401, ""), ErrorCategory::Auth);
        assert_eq!(categorize_error(403, ""), ErrorCategory::Auth);
        assert_eq!(categorize_error(404, ""), ErrorCategory::NotFound);
        assert_eq!(categorize_error(429, ""), ErrorCategory::Quota);
        assert_eq!(categorize_error(503, ""), ErrorCategory::Transient);
        assert_eq!(categorize_error(418, ""), ErrorCategory::Unknown);
    }

    #[test]
    fn test_categorize_message_patterns() {
        assert_eq!(
            categorize_error(429, "prompt is too long: 210000 tokens"),
            ErrorCategory::UserError
        );
        assert_eq!(
            categorize_error(403, "request context length exceeded"),
            ErrorCategory::UserError
        );
        // Patterns only apply to 4xx.
        assert_eq!(
            categorize_error(500, "malformed upstream reply"),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_backoff_ladder_saturates() {
        let ladder = ladder();
        let (d0, l1) = next_quota_cooldown(0, &ladder);
        assert_eq!(d0, Duration::from_secs(60));
        assert_eq!(l1, 1);
        let (d4, l5) = next_quota_cooldown(4, &ladder);
        assert_eq!(d4, Duration::from_secs(360 * 60));
        assert_eq!(l5, 4);
        let (d9, _) = next_quota_cooldown(9, &ladder);
        assert_eq!(d9, Duration::from_secs(360 * 60));
    }

    #[test]
    fn test_success_clears_state() {
        let now = Utc::now();
        let mut auth = Auth::new("auth-1", "gemini");
        apply_result(&mut auth, &failure(500, "boom"), &[], &ladder(), now);
        assert!(auth.model_states["m"].unavailable);

        let later = now + ChronoDuration::seconds(5);
        apply_result(
            &mut auth,
            &ExecResult::success("auth-1", "gemini", "m"),
            &[],
            &ladder(),
            later,
        );
        let state = &auth.model_states["m"];
        assert!(!state.unavailable);
        assert!(state.next_retry_after.is_none());
        assert_eq!(auth.status, AuthStatus::Active);
        assert!(auth.last_error.is_none());
        assert_eq!(auth.updated_at, later);
    }

    #[test]
    fn test_updated_at_monotone() {
        let now = Utc::now();
        let mut auth = Auth::new("auth-1", "gemini");
        let mut last = auth.updated_at;
        for i in 1..5 {
            let t = now + ChronoDuration::seconds(i);
            apply_result(
                &mut auth,
                &ExecResult::success("auth-1", "gemini", "m"),
                &[],
                &ladder(),
                t,
            );
            assert!(auth.updated_at >= last);
            last = auth.updated_at;
        }
    }

    #[test]
    fn test_429_with_retry_after() {
        let now = Utc::now();
        let mut auth = Auth::new("auth-1", "gemini");
        let mut result = failure(429, "quota exhausted");
        result.retry_after = Some(Duration::from_secs(60));
        apply_result(&mut auth, &result, &[], &ladder(), now);

        let state = &auth.model_states["m"];
        assert!(state.quota.exceeded);
        assert_eq!(
            state.quota.next_recover_at.unwrap(),
            now + ChronoDuration::seconds(60)
        );
        // Header-provided cooldowns do not consume a ladder step.
        assert_eq!(state.quota.backoff_level, 0);
    }

    #[test]
    fn test_429_ladder_escalation() {
        let now = Utc::now();
        let mut auth = Auth::new("auth-1", "gemini");
        let ladder = ladder();

        apply_result(&mut auth, &failure(429, "quota"), &[], &ladder, now);
        assert_eq!(auth.model_states["m"].quota.backoff_level, 1);
        assert_eq!(
            auth.model_states["m"].quota.next_recover_at.unwrap(),
            now + ChronoDuration::minutes(1)
        );

        let later = now + ChronoDuration::minutes(2);
        apply_result(&mut auth, &failure(429, "quota"), &[], &ladder, later);
        assert_eq!(auth.model_states["m"].quota.backoff_level, 2);
        assert_eq!(
            auth.model_states["m"].quota.next_recover_at.unwrap(),
            later + ChronoDuration::minutes(5)
        );
    }

    #[test]
    fn test_quota_group_propagation_and_clear() {
        let now = Utc::now();
        let mut auth = Auth::new("auth-1", "anthropic");
        let group = vec!["m".to_string(), "m-thinking".to_string()];

        let mut result = failure(429, "quota");
        result.retry_after = Some(Duration::from_secs(60));
        let effects = apply_result(&mut auth, &result, &group, &ladder(), now);
        assert_eq!(effects.group_models, vec!["m-thinking".to_string()]);

        let sibling = &auth.model_states["m-thinking"];
        assert!(sibling.quota.exceeded);
        assert_eq!(
            sibling.quota.next_recover_at,
            auth.model_states["m"].quota.next_recover_at
        );

        // Success on any member clears the whole group.
        let later = now + ChronoDuration::seconds(90);
        let effects = apply_result(
            &mut auth,
            &ExecResult::success("auth-1", "anthropic", "m"),
            &group,
            &ladder(),
            later,
        );
        assert_eq!(effects.group_models, vec!["m-thinking".to_string()]);
        assert!(!auth.model_states["m-thinking"].quota.exceeded);
        assert!(!auth.model_states["m"].quota.exceeded);
    }

    #[test]
    fn test_user_error_not_recorded() {
        let now = Utc::now();
        let mut auth = Auth::new("auth-1", "openai");
        let effects = apply_result(
            &mut auth,
            &failure(400, "invalid request: messages cannot be empty"),
            &[],
            &ladder(),
            now,
        );
        assert!(!effects.persist);
        assert!(auth.model_states.is_empty());
        assert_eq!(auth.status, AuthStatus::Active);
        assert!(auth.last_error.is_none());
    }

    #[test]
    fn test_401_suspends_thirty_minutes() {
        let now = Utc::now();
        let mut auth = Auth::new("auth-1", "openai");
        let effects = apply_result(&mut auth, &failure(401, "bad key"), &[], &ladder(), now);
        assert_eq!(effects.suspend_reason, Some("unauthorized"));
        assert_eq!(
            auth.model_states["m"].next_retry_after.unwrap(),
            now + ChronoDuration::minutes(30)
        );
        assert_eq!(auth.status, AuthStatus::Unauthorized);
    }

    #[test]
    fn test_transient_cooldown_is_one_minute() {
        let now = Utc::now();
        let mut auth = Auth::new("auth-1", "openai");
        apply_result(&mut auth, &failure(503, "overloaded"), &[], &ladder(), now);
        assert_eq!(
            auth.model_states["m"].next_retry_after.unwrap(),
            now + ChronoDuration::minutes(1)
        );
    }
}
