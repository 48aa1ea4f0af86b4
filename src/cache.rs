//! Time-bounded memoization of computed views.
//!
//! Entries are never deleted on their own: a stale entry is ignored by
//! [`CacheLayer::get`] and replaced by the next [`CacheLayer::set`] for the
//! same key. Writes are last-writer-wins.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::Grade;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    StudentHistory(Uuid),
    Dashboard(Grade),
    ClassReport(Grade),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Grade-level aggregates that change often.
    Short,
    /// A single student's history.
    Long,
}

impl CacheKey {
    pub fn ttl_class(&self) -> TtlClass {
        match self {
            CacheKey::StudentHistory(_) => TtlClass::Long,
            CacheKey::Dashboard(_) | CacheKey::ClassReport(_) => TtlClass::Short,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::StudentHistory(id) => write!(f, "student:{}", id),
            CacheKey::Dashboard(grade) => write!(f, "dashboard:{}", grade),
            CacheKey::ClassReport(grade) => write!(f, "report:{}", grade),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub short: Duration,
    pub long: Duration,
}

impl TtlPolicy {
    pub fn ttl(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Short => self.short,
            TtlClass::Long => self.long,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            short: Duration::seconds(60),
            long: Duration::seconds(300),
        }
    }
}

struct CacheEntry<V> {
    payload: V,
    last_updated: DateTime<Utc>,
    stale: bool,
}

pub struct CacheLayer<V> {
    entries: Mutex<HashMap<CacheKey, CacheEntry<V>>>,
    policy: TtlPolicy,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> CacheLayer<V> {
    pub fn new(policy: TtlPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
            clock,
        }
    }

    pub fn with_system_clock(policy: TtlPolicy) -> Self {
        Self::new(policy, Arc::new(SystemClock))
    }

    /// The cached payload if it is younger than its key's TTL and has not
    /// been invalidated since it was stored.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        let age = self.clock.now() - entry.last_updated;

        if entry.stale || age >= self.policy.ttl(key.ttl_class()) {
            log::debug!("Cache stale for {key}");
            return None;
        }

        log::debug!("Cache hit for {key}");
        Some(entry.payload.clone())
    }

    pub fn set(&self, key: CacheKey, payload: V) {
        let entry = CacheEntry {
            payload,
            last_updated: self.clock.now(),
            stale: false,
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    pub fn invalidate(&self, key: &CacheKey) {
        if let Some(entry) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(key)
        {
            entry.stale = true;
        }
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.values_mut() {
            entry.stale = true;
        }
        log::debug!("Marked {} cache entries stale", entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn policy(&self) -> TtlPolicy {
        self.policy
    }
}
