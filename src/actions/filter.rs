//! Network filter action
//!
//! Rules can isolate a process or a cgroup by installing a packet filter
//! (a BPF-style expression) with a drop or allow policy. Compiling and
//! attaching the filter is the job of a `PacketFilterInstaller`; the default
//! installer only keeps a table of what was requested, which is what the
//! engine reports on and what lifecycle cleanup removes.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::report::ActionError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterPolicy {
    #[default]
    Drop,
    Allow,
}

impl FilterPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterPolicy::Drop => "drop",
            FilterPolicy::Allow => "allow",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterScope {
    #[default]
    Process,
    Cgroup,
}

impl FilterScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterScope::Process => "process",
            FilterScope::Cgroup => "cgroup",
        }
    }
}

/// What a filter is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterTarget {
    Process(u32),
    Cgroup(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledFilter {
    pub target: FilterTarget,
    pub expression: String,
    pub policy: FilterPolicy,
}

/// Attaches packet filters to processes or cgroups
pub trait PacketFilterInstaller: Send + Sync {
    fn install(&self, target: &FilterTarget, expression: &str, policy: FilterPolicy) -> Result<(), ActionError>;

    /// Remove every filter of `target`, returning how many were removed
    fn remove(&self, target: &FilterTarget) -> usize;
}

/// In-memory installer
#[derive(Default)]
pub struct FilterTable {
    filters: RwLock<Vec<InstalledFilter>>,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed(&self) -> Vec<InstalledFilter> {
        self.filters.read().clone()
    }
}

impl PacketFilterInstaller for FilterTable {
    fn install(&self, target: &FilterTarget, expression: &str, policy: FilterPolicy) -> Result<(), ActionError> {
        validate_expression(expression)?;

        let mut filters = self.filters.write();
        let duplicate = filters
            .iter()
            .any(|f| &f.target == target && f.expression == expression && f.policy == policy);
        if !duplicate {
            filters.push(InstalledFilter {
                target: target.clone(),
                expression: expression.to_string(),
                policy,
            });
            info!(?target, expression, policy = policy.as_str(), "network filter installed");
        }
        Ok(())
    }

    fn remove(&self, target: &FilterTarget) -> usize {
        let mut filters = self.filters.write();
        let before = filters.len();
        filters.retain(|f| &f.target != target);
        let removed = before - filters.len();
        if removed > 0 {
            debug!(?target, removed, "network filters removed");
        }
        removed
    }
}

/// Cheap sanity check; the installer that compiles the filter has the final say
fn validate_expression(expression: &str) -> Result<(), ActionError> {
    if expression.trim().is_empty() {
        return Err(ActionError::Filter("empty filter expression".to_string()));
    }
    let mut depth: i32 = 0;
    for c in expression.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ActionError::Filter(format!("unbalanced parentheses in '{}'", expression)));
    }
    Ok(())
}
