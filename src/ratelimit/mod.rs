//! Rate limiting for rule matches
//!
//! - `limiter` - a single token bucket with allow/drop counters
//! - `registry` - group → id namespace of limiters with group defaults
//!
//! # Example
//!
//! ```ignore
//! use runtime_guard::ratelimit::{Limit, RateLimiterRegistry};
//!
//! let registry = RateLimiterRegistry::new(Limit::new(1.0, 40));
//! registry.set_group_limiters("rules", &["deny_shadow", "kill_miner"]);
//! registry.update_limit("rules", "kill_miner", 0.2, 1)?; // every=5s
//!
//! if registry.allow("rules", "kill_miner")? {
//!     // deliver the match
//! }
//! ```

pub mod limiter;
pub mod registry;

pub use limiter::{LimiterStats, TokenBucket};
pub use registry::{Limit, RateLimiterError, RateLimiterRegistry};
