// Selection strategies. The manager snapshots candidates under its read
// lock, then invokes the selector with no manager lock held; selectors own
// only their cursor state.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// The candidate view handed to selectors.
#[derive(Debug, Clone)]
pub struct AuthSnapshot {
    pub id: String,
    pub updated_at: DateTime<Utc>,
}

pub trait Selector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Picks one of the (already filtered, non-empty) candidates and returns
    /// its auth id.
    fn pick(&self, provider: &str, model: &str, candidates: &[AuthSnapshot]) -> Option<String>;
}

/// Round-robin over the filtered slice, one cursor per (provider, model).
pub struct RoundRobinSelector {
    cursors: Mutex<HashMap<(String, String), usize>>,
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
        }
    }
}

impl Selector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn pick(&self, provider: &str, model: &str, candidates: &[AuthSnapshot]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors
            .entry((provider.to_string(), model.to_string()))
            .or_insert(0);
        let chosen = &candidates[*cursor % candidates.len()];
        *cursor = cursor.wrapping_add(1);
        Some(chosen.id.clone())
    }
}

/// Picks the credential that served least recently.
pub struct LeastRecentSelector;

impl Selector for LeastRecentSelector {
    fn name(&self) -> &'static str {
        "least_recent"
    }

    fn pick(&self, _provider: &str, _model: &str, candidates: &[AuthSnapshot]) -> Option<String> {
        candidates
            .iter()
            .min_by_key(|c| c.updated_at)
            .map(|c| c.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshots(ids: &[&str]) -> Vec<AuthSnapshot> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| AuthSnapshot {
                id: id.to_string(),
                updated_at: Utc::now() - chrono::Duration::seconds(i as i64),
            })
            .collect()
    }

    #[test]
    fn test_round_robin_cycles() {
        let selector = RoundRobinSelector::new();
        let candidates = snapshots(&["a", "b", "c"]);
        let picks: Vec<String> = (0..6)
            .map(|_| selector.pick("p", "m", &candidates).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_cursor_is_per_model() {
        let selector = RoundRobinSelector::new();
        let candidates = snapshots(&["a", "b"]);
        assert_eq!(selector.pick("p", "m1", &candidates).unwrap(), "a");
        assert_eq!(selector.pick("p", "m2", &candidates).unwrap(), "a");
        assert_eq!(selector.pick("p", "m1", &candidates).unwrap(), "b");
    }

    #[test]
    fn test_round_robin_empty() {
        let selector = RoundRobinSelector::new();
        assert!(selector.pick("p", "m", &[]).is_none());
    }

    #[test]
    fn test_least_recent_picks_oldest() {
        let selector = LeastRecentSelector;
        let candidates = snapshots(&["a", "b", "c"]);
        // snapshots() makes later entries older.
        assert_eq!(selector.pick("p", "m", &candidates).unwrap(), "c");
    }
}
