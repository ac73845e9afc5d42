// Credential pool: authenticated upstream accounts, per-(auth, model)
// health, and the selection engine the orchestrator picks from.

pub mod auth;
pub mod manager;
pub mod result;
pub mod selector;
pub mod store;

pub use auth::{Auth, AuthError, AuthStatus, ModelState, QuotaState};
pub use manager::{Manager, ManagerConfig};
pub use result::{categorize_error, next_quota_cooldown, ErrorCategory, ExecResult};
pub use selector::{AuthSnapshot, LeastRecentSelector, RoundRobinSelector, Selector};
pub use store::{FileTokenStore, TokenStore};
