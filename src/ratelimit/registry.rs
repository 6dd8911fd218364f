//! Two-level (group → id) registry of token bucket limiters
//!
//! Groups carry a default limit that newly listed ids pick up. An id that is
//! listed again by `set_group_limiters` keeps its limiter, including a limit
//! set through `add_new_limiter` or `update_limit`.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::limiter::{LimiterStats, TokenBucket};

/// Rate (events/sec, may be infinite) and burst of a limiter
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Limit {
    pub rate: f64,
    pub burst: u64,
}

impl Limit {
    pub fn new(rate: f64, burst: u64) -> Self {
        Self { rate, burst }
    }

    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY, 0)
    }

    /// Validate caller-supplied values, rejecting a negative burst or rate.
    pub fn checked(rate: f64, burst: i64) -> Result<Self, RateLimiterError> {
        if burst < 0 {
            return Err(RateLimiterError::InvalidArgument(format!(
                "burst must be >= 0, got {}",
                burst
            )));
        }
        if rate.is_nan() || rate < 0.0 {
            return Err(RateLimiterError::InvalidArgument(format!(
                "rate must be >= 0, got {}",
                rate
            )));
        }
        Ok(Self::new(rate, burst as u64))
    }
}

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimiterError {
    /// Group or (group, id) is not registered
    NotFound { group: String, id: Option<String> },
    /// (group, id) is already registered
    AlreadyExists { group: String, id: String },
    /// Negative burst, negative or NaN rate
    InvalidArgument(String),
}

impl RateLimiterError {
    /// The errno this error corresponds to
    pub fn errno(&self) -> i32 {
        match self {
            RateLimiterError::NotFound { .. } => libc::ENOENT,
            RateLimiterError::AlreadyExists { .. } => libc::EEXIST,
            RateLimiterError::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

impl std::fmt::Display for RateLimiterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimiterError::NotFound { group, id: Some(id) } => {
                write!(f, "ENOENT: no limiter {}/{}", group, id)
            }
            RateLimiterError::NotFound { group, id: None } => {
                write!(f, "ENOENT: no limiter group {}", group)
            }
            RateLimiterError::AlreadyExists { group, id } => {
                write!(f, "EEXIST: limiter {}/{} already exists", group, id)
            }
            RateLimiterError::InvalidArgument(msg) => write!(f, "EINVAL: {}", msg),
        }
    }
}

impl std::error::Error for RateLimiterError {}

struct Group {
    default: Limit,
    limiters: HashMap<String, TokenBucket>,
}

impl Group {
    fn new(default: Limit) -> Self {
        Self {
            default,
            limiters: HashMap::new(),
        }
    }
}

/// Registry of limiters keyed by group then id.
///
/// Every mutating call takes the write lock for its whole check-then-act
/// sequence, so a failed call never leaves a partial update behind.
pub struct RateLimiterRegistry {
    groups: RwLock<HashMap<String, Group>>,
    /// Default for groups created implicitly
    default_limit: Limit,
}

impl RateLimiterRegistry {
    pub fn new(default_limit: Limit) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            default_limit,
        }
    }

    /// Register a group (or rewrite its default) without touching its limiters.
    pub fn register_group(&self, group: &str, rate: f64, burst: i64) -> Result<(), RateLimiterError> {
        let limit = Limit::checked(rate, burst)?;
        let mut groups = self.groups.write();
        groups
            .entry(group.to_string())
            .or_insert_with(|| Group::new(limit))
            .default = limit;
        Ok(())
    }

    pub fn add_new_limiter(
        &self,
        group: &str,
        id: &str,
        rate: f64,
        burst: i64,
    ) -> Result<(), RateLimiterError> {
        let limit = Limit::checked(rate, burst)?;
        let mut groups = self.groups.write();
        let entry = groups
            .entry(group.to_string())
            .or_insert_with(|| Group::new(self.default_limit));

        if entry.limiters.contains_key(id) {
            return Err(RateLimiterError::AlreadyExists {
                group: group.to_string(),
                id: id.to_string(),
            });
        }

        entry
            .limiters
            .insert(id.to_string(), TokenBucket::new(limit.rate, limit.burst));
        debug!(group, id, rate = limit.rate, burst = limit.burst, "limiter added");
        Ok(())
    }

    pub fn remove_limiter(&self, group: &str, id: &str) -> Result<(), RateLimiterError> {
        let mut groups = self.groups.write();
        let removed = groups
            .get_mut(group)
            .and_then(|g| g.limiters.remove(id))
            .is_some();

        if !removed {
            return Err(not_found(group, Some(id)));
        }
        debug!(group, id, "limiter removed");
        Ok(())
    }

    /// Replace the id-set of `group` with exactly `ids`.
    ///
    /// Ids already present keep their limiter (and its counters), new ids get
    /// the group default, ids not listed are dropped.
    pub fn set_group_limiters<S: AsRef<str>>(&self, group: &str, ids: &[S]) {
        let mut groups = self.groups.write();
        let entry = groups
            .entry(group.to_string())
            .or_insert_with(|| Group::new(self.default_limit));

        let mut next = HashMap::with_capacity(ids.len());
        for id in ids {
            let id = id.as_ref();
            if next.contains_key(id) {
                continue;
            }
            let kept = entry
                .limiters
                .remove(id)
                .unwrap_or_else(|| TokenBucket::new(entry.default.rate, entry.default.burst));
            next.insert(id.to_string(), kept);
        }

        let dropped = entry.limiters.len();
        entry.limiters = next;
        info!(group, limiters = entry.limiters.len(), dropped, "group limiters set");
    }

    pub fn update_limit(
        &self,
        group: &str,
        id: &str,
        rate: f64,
        burst: i64,
    ) -> Result<(), RateLimiterError> {
        let limit = Limit::checked(rate, burst)?;
        let groups = self.groups.write();
        let bucket = groups
            .get(group)
            .and_then(|g| g.limiters.get(id))
            .ok_or_else(|| not_found(group, Some(id)))?;

        bucket.set_limit(limit.rate, limit.burst);
        Ok(())
    }

    /// Rewrite the group default and every limiter in the group.
    pub fn update_group_limit(&self, group: &str, rate: f64, burst: i64) -> Result<(), RateLimiterError> {
        let limit = Limit::checked(rate, burst)?;
        let mut groups = self.groups.write();
        let entry = groups.get_mut(group).ok_or_else(|| not_found(group, None))?;

        entry.default = limit;
        for bucket in entry.limiters.values() {
            bucket.set_limit(limit.rate, limit.burst);
        }
        Ok(())
    }

    /// Whether one more event may pass. A zero-burst limiter simply denies.
    pub fn allow(&self, group: &str, id: &str) -> Result<bool, RateLimiterError> {
        let groups = self.groups.read();
        let bucket = groups
            .get(group)
            .and_then(|g| g.limiters.get(id))
            .ok_or_else(|| not_found(group, Some(id)))?;
        Ok(bucket.allow())
    }

    pub fn get_limit(&self, group: &str, id: &str) -> Result<Limit, RateLimiterError> {
        self.with_bucket(group, id, |b| Limit::new(b.rate(), b.burst()))
    }

    pub fn get_limiter_stats(&self, group: &str, id: &str, reset: bool) -> Result<LimiterStats, RateLimiterError> {
        self.with_bucket(group, id, |b| b.stats(reset))
    }

    /// Sum of the counters of every id in the group
    pub fn get_global_group_stats(&self, group: &str, reset: bool) -> Result<LimiterStats, RateLimiterError> {
        let groups = self.groups.read();
        let entry = groups.get(group).ok_or_else(|| not_found(group, None))?;

        let mut total = LimiterStats::default();
        for bucket in entry.limiters.values() {
            total.merge(bucket.stats(reset));
        }
        Ok(total)
    }

    /// Per-id counters; always resets them.
    pub fn get_all_group_stats(&self, group: &str) -> Result<BTreeMap<String, LimiterStats>, RateLimiterError> {
        let groups = self.groups.read();
        let entry = groups.get(group).ok_or_else(|| not_found(group, None))?;

        Ok(entry
            .limiters
            .iter()
            .map(|(id, bucket)| (id.clone(), bucket.stats(true)))
            .collect())
    }

    /// Ids currently registered in `group`, sorted
    pub fn ids(&self, group: &str) -> Vec<String> {
        let groups = self.groups.read();
        let mut ids: Vec<String> = groups
            .get(group)
            .map(|g| g.limiters.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn with_bucket<T>(
        &self,
        group: &str,
        id: &str,
        f: impl FnOnce(&TokenBucket) -> T,
    ) -> Result<T, RateLimiterError> {
        let groups = self.groups.read();
        groups
            .get(group)
            .and_then(|g| g.limiters.get(id))
            .map(f)
            .ok_or_else(|| not_found(group, Some(id)))
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(Limit::unlimited())
    }
}

fn not_found(group: &str, id: Option<&str>) -> RateLimiterError {
    RateLimiterError::NotFound {
        group: group.to_string(),
        id: id.map(str::to_string),
    }
}
