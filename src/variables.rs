//! Scoped variables written by `set` actions and read back by rule conditions
//!
//! Storage is striped by owner: one `DashMap` shard entry per
//! (scope, owner key), so writers on different processes or containers never
//! contend. Entries of a process/container/cgroup live until the engine is
//! told that owner went away.
//!
//! ```text
//! (global,    "")        → { allowed_users: ["root"] }
//! (process,   "4242")    → { opened: ["/etc/shadow", "/etc/passwd"] }
//! (container, "abc123")  → { tainted: true }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::{Event, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Global,
    Process,
    Container,
    Cgroup,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Process => "process",
            Scope::Container => "container",
            Scope::Cgroup => "cgroup",
        }
    }

    /// Owner key of this scope for an event, `None` when the event has no such owner
    pub fn owner_key(&self, event: &Event) -> Option<String> {
        match self {
            Scope::Global => Some(String::new()),
            Scope::Process => Some(event.process.pid.to_string()),
            Scope::Container => event.container_id().map(str::to_string),
            Scope::Cgroup => event.cgroup_id().map(str::to_string),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Scope::Global),
            "process" => Some(Scope::Process),
            "container" => Some(Scope::Container),
            "cgroup" => Some(Scope::Cgroup),
            _ => None,
        }
    }
}

/// Write options of a `set` action
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// Accumulate into an ordered sequence instead of overwriting
    pub append: bool,
    /// Entry disappears this long after its last write
    pub ttl: Option<Duration>,
    /// Maximum length of an appended sequence, oldest values go first
    pub size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OwnerKey {
    scope: Scope,
    owner: String,
}

impl OwnerKey {
    fn new(scope: Scope, owner: &str) -> Self {
        // Global variables have a single owner
        let owner = if scope == Scope::Global { "" } else { owner };
        Self {
            scope,
            owner: owner.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| now >= t).unwrap_or(false)
    }
}

#[derive(Default)]
pub struct VariableStore {
    entries: DashMap<OwnerKey, HashMap<String, Slot>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, scope: Scope, owner: &str, name: &str, value: Value, append: bool) {
        self.set_with(
            scope,
            owner,
            name,
            value,
            &SetOptions {
                append,
                ..SetOptions::default()
            },
        )
    }

    pub fn set_with(&self, scope: Scope, owner: &str, name: &str, value: Value, opts: &SetOptions) {
        let now = Instant::now();
        let mut slots = self.entries.entry(OwnerKey::new(scope, owner)).or_default();

        let previous = slots
            .remove(name)
            .filter(|slot| !slot.expired(now))
            .map(|slot| slot.value);

        let value = if opts.append {
            let mut items = match previous {
                Some(Value::List(items)) => items,
                Some(other) => vec![other],
                None => Vec::new(),
            };
            match value {
                Value::List(more) => items.extend(more),
                single => items.push(single),
            }
            if let Some(size) = opts.size {
                let excess = items.len().saturating_sub(size);
                items.drain(..excess);
            }
            Value::List(items)
        } else {
            value
        };

        slots.insert(
            name.to_string(),
            Slot {
                value,
                expires_at: opts.ttl.map(|ttl| now + ttl),
            },
        );
    }

    /// Current value, or `None` when unset or expired
    pub fn get(&self, scope: Scope, owner: &str, name: &str) -> Option<Value> {
        let key = OwnerKey::new(scope, owner);
        let now = Instant::now();

        {
            let slots = self.entries.get(&key)?;
            let slot = slots.get(name)?;
            if !slot.expired(now) {
                return Some(slot.value.clone());
            }
        }

        // Expired: prune the owner's dead slots now that the read guard is gone
        if let Some(mut slots) = self.entries.get_mut(&key) {
            slots.retain(|_, slot| !slot.expired(now));
        }
        self.entries.remove_if(&key, |_, slots| slots.is_empty());
        None
    }

    /// Snapshot of every live variable.
    ///
    /// Keys are `<scope>.<name>.<owner>`, global variables use the bare name.
    pub fn get_all(&self) -> BTreeMap<String, Value> {
        let now = Instant::now();
        let mut out = BTreeMap::new();
        for entry in self.entries.iter() {
            let key = entry.key();
            for (name, slot) in entry.value().iter().filter(|(_, s)| !s.expired(now)) {
                let composite = match key.scope {
                    Scope::Global => name.clone(),
                    scope => format!("{}.{}.{}", scope.as_str(), name, key.owner),
                };
                out.insert(composite, slot.value.clone());
            }
        }
        out
    }

    /// Drop every variable owned by an exited process / removed container or cgroup.
    /// Returns how many variables were dropped.
    pub fn release(&self, scope: Scope, owner: &str) -> usize {
        if scope == Scope::Global {
            return 0;
        }
        match self.entries.remove(&OwnerKey::new(scope, owner)) {
            Some((_, slots)) => {
                debug!(scope = scope.as_str(), owner, count = slots.len(), "scoped variables released");
                slots.len()
            }
            None => 0,
        }
    }

    /// Number of owners holding at least one variable
    pub fn owners(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_round_trip() {
        let store = VariableStore::new();
        store.set(Scope::Container, "cid-1", "x", Value::from("v"), false);

        assert_eq!(store.get(Scope::Container, "cid-1", "x"), Some(Value::from("v")));
        assert_eq!(store.get(Scope::Container, "cid-2", "x"), None);
        assert_eq!(store.get(Scope::Process, "cid-1", "x"), None);
    }

    #[test]
    fn test_overwrite() {
        let store = VariableStore::new();
        store.set(Scope::Global, "", "level", Value::Int(1), false);
        store.set(Scope::Global, "", "level", Value::Int(2), false);
        assert_eq!(store.get(Scope::Global, "", "level"), Some(Value::Int(2)));
    }

    #[test]
    fn test_global_ignores_owner() {
        let store = VariableStore::new();
        store.set(Scope::Global, "whatever", "g", Value::Bool(true), false);
        assert_eq!(store.get(Scope::Global, "", "g"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_append_accumulates_in_order() {
        let store = VariableStore::new();
        store.set(Scope::Process, "10", "paths", Value::from("/a"), true);
        store.set(Scope::Process, "10", "paths", Value::from("/b"), true);

        assert_eq!(
            store.get(Scope::Process, "10", "paths"),
            Some(Value::List(vec![Value::from("/a"), Value::from("/b")]))
        );
    }

    #[test]
    fn test_concurrent_appends() {
        let store = VariableStore::new();
        std::thread::scope(|s| {
            for t in 0..8i64 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..100 {
                        store.set(Scope::Container, "c1", "seen", Value::Int(t * 100 + i), true);
                        store.set(Scope::Process, &t.to_string(), "last", Value::Int(i), false);
                        let _ = store.get(Scope::Container, "c1", "seen");
                    }
                });
            }
        });

        match store.get(Scope::Container, "c1", "seen") {
            Some(Value::List(items)) => assert_eq!(items.len(), 800),
            other => panic!("expected a list, got {:?}", other),
        }
        for t in 0..8 {
            assert_eq!(store.get(Scope::Process, &t.to_string(), "last"), Some(Value::Int(99)));
        }
    }

    #[test]
    fn test_append_size_drops_oldest() {
        let store = VariableStore::new();
        let opts = SetOptions {
            append: true,
            size: Some(2),
            ..SetOptions::default()
        };
        for i in 0..4 {
            store.set_with(Scope::Global, "", "recent", Value::Int(i), &opts);
        }
        assert_eq!(
            store.get(Scope::Global, "", "recent"),
            Some(Value::List(vec![Value::Int(2), Value::Int(3)]))
        );
    }

    #[test]
    fn test_ttl_expires_lazily() {
        let store = VariableStore::new();
        let opts = SetOptions {
            ttl: Some(Duration::from_millis(20)),
            ..SetOptions::default()
        };
        store.set_with(Scope::Cgroup, "cg", "seen", Value::Bool(true), &opts);
        assert_eq!(store.get(Scope::Cgroup, "cg", "seen"), Some(Value::Bool(true)));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get(Scope::Cgroup, "cg", "seen"), None);
        assert_eq!(store.owners(), 0);
    }

    #[test]
    fn test_get_all_composite_names() {
        let store = VariableStore::new();
        store.set(Scope::Global, "", "g", Value::Int(1), false);
        store.set(Scope::Process, "77", "p", Value::Int(2), false);
        store.set(Scope::Container, "c1", "c", Value::Int(3), false);

        let all = store.get_all();
        assert_eq!(all.get("g"), Some(&Value::Int(1)));
        assert_eq!(all.get("process.p.77"), Some(&Value::Int(2)));
        assert_eq!(all.get("container.c.c1"), Some(&Value::Int(3)));
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_release_owner() {
        let store = VariableStore::new();
        store.set(Scope::Process, "1", "a", Value::Int(1), false);
        store.set(Scope::Process, "1", "b", Value::Int(2), false);
        store.set(Scope::Process, "2", "a", Value::Int(3), false);

        assert_eq!(store.release(Scope::Process, "1"), 2);
        assert_eq!(store.get(Scope::Process, "1", "a"), None);
        assert_eq!(store.get(Scope::Process, "2", "a"), Some(Value::Int(3)));
        assert_eq!(store.release(Scope::Global, ""), 0);
    }
}
