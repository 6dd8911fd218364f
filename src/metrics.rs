//! Prometheus metrics for the rule engine
//!
//! All metrics live in the default prometheus registry; `gather()` renders
//! them in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, CounterVec, Encoder, TextEncoder};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Rate limiter
    // ─────────────────────────────────────────────────────────────────────────────

    /// Rule matches let through by the per-rule limiter.
    ///
    /// Labels:
    /// - rule_id: Rule identifier
    pub static ref RULE_RATE_LIMITER_ALLOW: CounterVec = register_counter_vec!(
        "runtime_guard_rule_rate_limiter_allow_total",
        "Rule matches allowed by the rate limiter",
        &["rule_id"]
    ).expect("failed to register RULE_RATE_LIMITER_ALLOW metric");

    /// Rule matches dropped by the per-rule limiter.
    pub static ref RULE_RATE_LIMITER_DROP: CounterVec = register_counter_vec!(
        "runtime_guard_rule_rate_limiter_drop_total",
        "Rule matches dropped by the rate limiter",
        &["rule_id"]
    ).expect("failed to register RULE_RATE_LIMITER_DROP metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Actions
    // ─────────────────────────────────────────────────────────────────────────────

    /// Executed actions by kind and final status.
    ///
    /// Labels:
    /// - action: kill, hash, set, network_filter
    /// - status: performed, partially_performed, disarmed, failed, pending, done
    pub static ref ACTIONS: CounterVec = register_counter_vec!(
        "runtime_guard_action_total",
        "Rule actions executed, by kind and status",
        &["action", "status"]
    ).expect("failed to register ACTIONS metric");

    /// Disarmer state transitions.
    ///
    /// Labels:
    /// - kind: executable, container
    /// - state: disarmed, rearmed
    pub static ref DISARM_TRANSITIONS: CounterVec = register_counter_vec!(
        "runtime_guard_disarm_transitions_total",
        "Kill disarmer state transitions",
        &["kind", "state"]
    ).expect("failed to register DISARM_TRANSITIONS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Dispatcher
    // ─────────────────────────────────────────────────────────────────────────────

    /// Discarders pushed, per event type.
    pub static ref DISCARDERS: CounterVec = register_counter_vec!(
        "runtime_guard_discarders_total",
        "Discarders pushed to listeners",
        &["event_type"]
    ).expect("failed to register DISCARDERS metric");

    /// Matches a waiter dropped because one was already in flight.
    pub static ref WAITER_DROPS: CounterVec = register_counter_vec!(
        "runtime_guard_waiter_drops_total",
        "Rule matches skipped by waiters with one delivery in flight",
        &["rule_id"]
    ).expect("failed to register WAITER_DROPS metric");
}

/// Render every registered metric in the prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
