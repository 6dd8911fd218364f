//! Kill-storm containment
//!
//! A disarmer counts kill triggers per scope key (executable path, or
//! container/cgroup id) and stops letting them through once a key has been
//! triggered more than `max_allowed` times inside a rolling `period`.
//!
//! ```text
//!            trigger (count ≤ max)                 period elapsed since
//!           ┌──────────────┐                       last counted trigger
//!           ▼              │                      ┌────────────────────┐
//!       ┌───────┐  count > max_allowed  ┌──────────┴┐                   │
//!  ───► │ ARMED │ ────────────────────► │ DISARMED  │ ◄─── triggers     │
//!       └───────┘                       └───────────┘      suppressed   │
//!           ▲                                                           │
//!           └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The trigger that pushes the count over the threshold still executes;
//! the ones after it are suppressed. Suppressed triggers do not extend the
//! period. Expiry is checked lazily, on the next access to the key; keys
//! that are never touched again are swept once per period.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DisarmerConfig;
use crate::metrics::DISARM_TRANSITIONS;

/// What a disarmer is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisarmerKind {
    Executable,
    Container,
}

impl DisarmerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisarmerKind::Executable => "executable",
            DisarmerKind::Container => "container",
        }
    }
}

/// State change caused by an access to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Disarmed,
    Rearmed,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Disarmed => "disarmed",
            Transition::Rearmed => "rearmed",
        }
    }
}

/// Result of recording one trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerDecision {
    /// Whether the action should still execute
    pub armed: bool,
    pub transition: Option<Transition>,
}

#[derive(Debug)]
struct DisarmEntry {
    count: u64,
    last_trigger: Instant,
    disarmed: bool,
}

/// Tables smaller than this are only swept once per period
const SWEEP_THRESHOLD: usize = 1024;

struct DisarmState {
    entries: HashMap<String, DisarmEntry>,
    sweep_at: usize,
    last_sweep: Instant,
}

pub struct Disarmer {
    kind: DisarmerKind,
    max_allowed: u64,
    period: Duration,
    state: Mutex<DisarmState>,
}

impl Disarmer {
    pub fn new(kind: DisarmerKind, max_allowed: u64, period: Duration) -> Self {
        Self {
            kind,
            max_allowed,
            period,
            state: Mutex::new(DisarmState {
                entries: HashMap::new(),
                sweep_at: SWEEP_THRESHOLD,
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn kind(&self) -> DisarmerKind {
        self.kind
    }

    /// Record one trigger; returns whether the action should still execute.
    pub fn record_trigger(&self, key: &str) -> bool {
        self.record(key, Instant::now()).armed
    }

    pub fn record(&self, key: &str, now: Instant) -> TriggerDecision {
        let mut state = self.state.lock();
        let rearmed = self.expire(&mut state, key, now);
        self.sweep(&mut state, now);
        if self.disarmed(&state, key) {
            return TriggerDecision {
                armed: false,
                transition: rearmed,
            };
        }
        TriggerDecision {
            armed: true,
            transition: self.count(&mut state, key, now).or(rearmed),
        }
    }

    pub fn is_disarmed(&self, key: &str) -> bool {
        self.is_disarmed_at(key, Instant::now())
    }

    pub fn is_disarmed_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.last_trigger) >= self.period => {
                state.entries.remove(key);
                false
            }
            Some(entry) => entry.disarmed,
            None => false,
        }
    }

    /// Forget a key whose owner went away
    pub fn release(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Number of keys currently tracked (expired ones included until swept)
    pub fn tracked(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Drop expired keys once per period, or sooner when the table has doubled.
    fn sweep(&self, state: &mut DisarmState, now: Instant) {
        let due = now.saturating_duration_since(state.last_sweep) >= self.period;
        if !due && state.entries.len() < state.sweep_at {
            return;
        }
        let before = state.entries.len();
        let period = self.period;
        state
            .entries
            .retain(|_, e| now.saturating_duration_since(e.last_trigger) < period);
        state.sweep_at = (state.entries.len() * 2).max(SWEEP_THRESHOLD);
        state.last_sweep = now;
        if before != state.entries.len() {
            debug!(
                kind = self.kind.as_str(),
                swept = before - state.entries.len(),
                tracked = state.entries.len(),
                "expired disarmer keys swept"
            );
        }
    }

    /// Reset a key whose period elapsed since its last counted trigger
    fn expire(&self, state: &mut DisarmState, key: &str, now: Instant) -> Option<Transition> {
        let entry = state.entries.get_mut(key)?;
        if entry.count == 0 || now.saturating_duration_since(entry.last_trigger) < self.period {
            return None;
        }
        let was_disarmed = entry.disarmed;
        entry.count = 0;
        entry.disarmed = false;
        if !was_disarmed {
            return None;
        }
        info!(kind = self.kind.as_str(), key, "disarmer re-armed");
        self.transitioned(Transition::Rearmed);
        Some(Transition::Rearmed)
    }

    fn disarmed(&self, state: &DisarmState, key: &str) -> bool {
        state.entries.get(key).is_some_and(|e| e.disarmed)
    }

    /// Count a trigger that is going to execute
    fn count(&self, state: &mut DisarmState, key: &str, now: Instant) -> Option<Transition> {
        let entry = state.entries.entry(key.to_string()).or_insert(DisarmEntry {
            count: 0,
            last_trigger: now,
            disarmed: false,
        });
        entry.count += 1;
        entry.last_trigger = now;
        if entry.count <= self.max_allowed {
            return None;
        }
        entry.disarmed = true;
        warn!(
            kind = self.kind.as_str(),
            key,
            count = entry.count,
            max_allowed = self.max_allowed,
            period_ms = self.period.as_millis() as u64,
            "disarmer tripped, further triggers suppressed"
        );
        self.transitioned(Transition::Disarmed);
        Some(Transition::Disarmed)
    }

    fn transitioned(&self, t: Transition) {
        DISARM_TRANSITIONS
            .with_label_values(&[self.kind.as_str(), t.as_str()])
            .inc();
    }
}

/// Outcome of checking a kill against both disarmers of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisarmVerdict {
    pub armed: bool,
    /// Which disarmer suppressed the kill
    pub suppressed_by: Option<DisarmerKind>,
    pub transitions: Vec<(DisarmerKind, String, Transition)>,
}

/// The two disarmers guarding one rule's kill action
pub struct KillDisarmer {
    executable: Option<Disarmer>,
    container: Option<Disarmer>,
}

impl KillDisarmer {
    pub fn new(executable: &DisarmerConfig, container: &DisarmerConfig) -> Self {
        let build = |kind, cfg: &DisarmerConfig| {
            cfg.enabled
                .then(|| Disarmer::new(kind, cfg.max_allowed, Duration::from_millis(cfg.period_ms)))
        };
        Self {
            executable: build(DisarmerKind::Executable, executable),
            container: build(DisarmerKind::Container, container),
        }
    }

    /// Record a kill trigger against the container key (container id, else
    /// cgroup id) and the executable key. A trigger is counted on either side
    /// only when both are armed. Either key may be `None` to skip that side.
    pub fn check(&self, executable: Option<&str>, container: Option<&str>, now: Instant) -> DisarmVerdict {
        let mut verdict = DisarmVerdict {
            armed: true,
            suppressed_by: None,
            transitions: Vec::new(),
        };

        // container side first; both locks are held so the two counts agree
        let sides: Vec<(&Disarmer, &str)> = [
            (self.container.as_ref(), container),
            (self.executable.as_ref(), executable),
        ]
        .into_iter()
        .filter_map(|(disarmer, key)| Some((disarmer?, key?)))
        .collect();
        let mut states: Vec<_> = sides.iter().map(|(d, _)| d.state.lock()).collect();

        for ((disarmer, key), state) in sides.iter().zip(states.iter_mut()) {
            if let Some(t) = disarmer.expire(state, key, now) {
                verdict.transitions.push((disarmer.kind(), key.to_string(), t));
            }
            disarmer.sweep(state, now);
            if verdict.armed && disarmer.disarmed(state, key) {
                verdict.armed = false;
                verdict.suppressed_by = Some(disarmer.kind());
            }
        }
        if !verdict.armed {
            return verdict;
        }

        for ((disarmer, key), state) in sides.iter().zip(states.iter_mut()) {
            if let Some(t) = disarmer.count(state, key, now) {
                verdict.transitions.push((disarmer.kind(), key.to_string(), t));
            }
        }
        verdict
    }

    /// Forget the container-side state of a container or cgroup
    pub fn release_container(&self, key: &str) -> bool {
        self.container.as_ref().is_some_and(|d| d.release(key))
    }
}
