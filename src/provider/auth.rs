use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Active,
    Error,
    Unauthorized,
    Disabled,
}

impl Default for AuthStatus {
    fn default() -> Self {
        AuthStatus::Active
    }
}

/// An upstream failure attributed to a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthError {
    pub http_status: u16,
    pub message: String,
}

/// Quota cooldown state for one (auth, model) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaState {
    pub exceeded: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_recover_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backoff_level: u8,
}

/// Health of one provider model under one credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelState {
    pub unavailable: bool,
    pub status: AuthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<AuthError>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    #[serde(default)]
    pub quota: QuotaState,
    pub updated_at: DateTime<Utc>,
}

impl ModelState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            unavailable: false,
            status: AuthStatus::Active,
            next_retry_after: None,
            last_error: None,
            status_message: String::new(),
            quota: QuotaState::default(),
            updated_at: now,
        }
    }

    /// Clears error and quota state after a successful call. The backoff
    /// ladder resets with it.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.unavailable = false;
        self.status = AuthStatus::Active;
        self.next_retry_after = None;
        self.last_error = None;
        self.status_message.clear();
        self.quota = QuotaState::default();
        self.updated_at = now;
    }

    /// Whether this model is usable at `now`.
    pub fn available_at(&self, now: DateTime<Utc>) -> bool {
        if self.quota.exceeded {
            if let Some(recover) = self.quota.next_recover_at {
                if now < recover {
                    return false;
                }
            }
        }
        if self.unavailable {
            match self.next_retry_after {
                Some(retry) => now >= retry,
                None => false,
            }
        } else {
            true
        }
    }
}

/// An authenticated upstream account with per-model health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub status: AuthStatus,
    /// Provider-specific secrets and knobs (api_key, refresh_token,
    /// endpoint, ...).
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub model_states: HashMap<String, ModelState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<AuthError>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Auth {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            provider: provider.into(),
            label: None,
            status: AuthStatus::Active,
            attributes: HashMap::new(),
            proxy_url: None,
            model_states: HashMap::new(),
            last_error: None,
            status_message: String::new(),
            next_retry_after: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn model_state_mut(&mut self, model: &str, now: DateTime<Utc>) -> &mut ModelState {
        self.model_states
            .entry(model.to_string())
            .or_insert_with(|| ModelState::new(now))
    }

    /// Whether the credential can serve `model` at `now`. An auth-level
    /// suspension (unauthorized, payment required) blocks every model until
    /// its retry time; otherwise only the model's own state counts.
    pub fn available_for(&self, model: &str, now: DateTime<Utc>) -> bool {
        if self.status == AuthStatus::Disabled {
            return false;
        }
        if matches!(self.status, AuthStatus::Error | AuthStatus::Unauthorized) {
            if let Some(retry) = self.next_retry_after {
                if now < retry {
                    return false;
                }
            }
            // Every known model suspended blocks unknown ones too.
            if !self.model_states.is_empty()
                && self.model_states.values().all(|s| !s.available_at(now))
            {
                return false;
            }
        }
        match self.model_states.get(model) {
            Some(state) => state.available_at(now),
            None => true,
        }
    }

    pub fn has_model_error(&self, now: DateTime<Utc>) -> bool {
        self.model_states
            .values()
            .any(|s| s.unavailable && !s.available_at(now))
    }

    /// Recomputes the aggregated status: Active iff at least one model is
    /// usable and the auth-level error is clear.
    pub fn recompute_status(&mut self, now: DateTime<Utc>) {
        if self.status == AuthStatus::Disabled {
            return;
        }
        let any_usable = self.model_states.is_empty()
            || self.model_states.values().any(|s| s.available_at(now));
        if any_usable && self.last_error.is_none() {
            self.status = AuthStatus::Active;
        } else if !any_usable {
            self.status = AuthStatus::Error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_model_state_reset_clears_backoff() {
        let now = Utc::now();
        let mut state = ModelState::new(now);
        state.unavailable = true;
        state.quota = QuotaState {
            exceeded: true,
            reason: "quota".to_string(),
            next_recover_at: Some(now + Duration::minutes(5)),
            backoff_level: 3,
        };
        state.reset(now);
        assert!(!state.unavailable);
        assert!(!state.quota.exceeded);
        assert_eq!(state.quota.backoff_level, 0);
        assert!(state.next_retry_after.is_none());
    }

    #[test]
    fn test_availability_respects_quota_window() {
        let now = Utc::now();
        let mut auth = Auth::new("a", "gemini");
        let state = auth.model_state_mut("m", now);
        state.quota = QuotaState {
            exceeded: true,
            reason: "quota".to_string(),
            next_recover_at: Some(now + Duration::seconds(60)),
            backoff_level: 0,
        };
        assert!(!auth.available_for("m", now));
        assert!(auth.available_for("m", now + Duration::seconds(61)));
        // Other models on the same auth are unaffected.
        assert!(auth.available_for("other", now));
    }

    #[test]
    fn test_aggregated_status() {
        let now = Utc::now();
        let mut auth = Auth::new("a", "gemini");
        let state = auth.model_state_mut("m", now);
        state.unavailable = true;
        state.status = AuthStatus::Error;
        state.next_retry_after = Some(now + Duration::minutes(30));
        auth.last_error = Some(AuthError {
            http_status: 401,
            message: "unauthorized".to_string(),
        });
        auth.recompute_status(now);
        assert_eq!(auth.status, AuthStatus::Error);

        // One healthy model plus a cleared error makes it Active again.
        auth.model_state_mut("m2", now);
        auth.last_error = None;
        auth.recompute_status(now);
        assert_eq!(auth.status, AuthStatus::Active);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut auth = Auth::new("auth-1", "anthropic");
        auth.attributes
            .insert("api_key".to_string(), "sk-test".to_string());
        let json = serde_json::to_string(&auth).unwrap();
        let back: Auth = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "auth-1");
        assert_eq!(back.attribute("api_key"), Some("sk-test"));
    }
}
