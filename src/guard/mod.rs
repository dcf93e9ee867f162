// Request storm guards.
// Per-key cooldown and the global rate-limit pause.

pub mod cooldown;
pub mod rate_limit;

pub use cooldown::{CooldownGuard, DEFAULT_COOLDOWN};
pub use rate_limit::{DEFAULT_RETRY_AFTER, MAX_RETRY_AFTER, RateLimitGuard};
