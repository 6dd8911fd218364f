//! runtime-guard - rule matching and enforcement for host intrusion detection
//!
//! Kernel events decoded by a collector are evaluated against a ruleset.
//! Matching rules are rate limited per rule, may read and write scoped
//! variables, and run enforcement actions (kill, hash, network filter)
//! guarded by disarmers against kill storms.
//!
//! # Modules
//!
//! - `ratelimit` - token buckets and the group → id limiter registry
//! - `variables` - global/process/container/cgroup scoped variables
//! - `disarmer` - kill-storm containment per executable and container
//! - `actions` - kill, hash, set and network filter actions
//! - `dispatcher` - rule-match, discarder, custom-event and send-event listeners
//! - `engine` - the evaluation path tying it all together
//! - `event`, `rules` - the event model and compiled rules
//! - `config`, `metrics`, `telemetry`, `tracing` - ambient plumbing
//!
//! # Quick Start
//!
//! ```ignore
//! use runtime_guard::{EngineConfig, Policy, RuleEngine};
//!
//! let policy = Policy::load("policy.json")?;
//! let engine = RuleEngine::builder(policy.config).build()?;
//! engine.load_rules(&policy.rules)?;
//!
//! for matched in engine.process_event(&event) {
//!     println!("{}", serde_json::to_string(&matched)?);
//! }
//! ```

pub mod actions;
pub mod config;
pub mod disarmer;
pub mod dispatcher;
pub mod engine;
pub mod event;
pub mod metrics;
pub mod ratelimit;
pub mod rules;
pub mod telemetry;
pub mod tracing;
pub mod variables;

pub use actions::{ActionError, ActionReport, ActionStatus, HashScheduler};
pub use config::{ConfigError, EngineConfig, Policy};
pub use dispatcher::{Delivery, Dispatcher, MatchedEvent};
pub use engine::{EngineError, LifecycleEvent, RuleEngine};
pub use event::{Event, EventType, ProcessContext, Value};
pub use ratelimit::{RateLimiterError, RateLimiterRegistry};
pub use rules::{Rule, RuleDefinition};
pub use variables::{Scope, VariableStore};
