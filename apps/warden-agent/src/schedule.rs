//! Time-window rules driving the outbound network block.
//!
//! The engine owns the rule list and the current block state behind one
//! mutex; add/remove/list/evaluate are mutually exclusive, so evaluation
//! always observes a consistent snapshot. A dedicated background task
//! re-evaluates on a fixed tick for the lifetime of the process.

use crate::policy::{NetworkPolicy, PolicyError};
use chrono::{Local, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    Recurring,
    Specific,
}

impl ScheduleKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Recurring" => Some(ScheduleKind::Recurring),
            "Specific" => Some(ScheduleKind::Specific),
            _ => None,
        }
    }
}

/// One time-window rule. `selector` is a weekday name or `"All"` for
/// recurring rules, an ISO date for specific ones. Windows are same-day
/// only; a rule cannot wrap across midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    #[serde(rename = "date_or_day")]
    pub selector: String,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl ScheduleEntry {
    fn matches(&self, now: NaiveDateTime) -> bool {
        let time = now.time();
        if time < self.start || time > self.end {
            return false;
        }
        match self.kind {
            ScheduleKind::Recurring => {
                self.selector == "All" || self.selector == now.format("%A").to_string()
            }
            ScheduleKind::Specific => self.selector == now.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Wire format for times of day, matching the controller's `"08:00"` form.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let value = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&value, FORMAT).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Unblocked,
    Blocked,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockState::Unblocked => f.write_str("unblocked"),
            BlockState::Blocked => f.write_str("blocked"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid schedule index.")]
    InvalidIndex,
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

struct SchedulerInner {
    entries: Vec<ScheduleEntry>,
    state: BlockState,
}

pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
    policy: Arc<dyn NetworkPolicy>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(policy: Arc<dyn NetworkPolicy>, tick: Duration) -> Self {
        Self {
            inner: Mutex::new(SchedulerInner {
                entries: Vec::new(),
                state: BlockState::Unblocked,
            }),
            policy,
            tick,
        }
    }

    /// Appends a rule and re-evaluates immediately. Returns the updated
    /// rule snapshot.
    pub fn add(&self, entry: ScheduleEntry) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let mut inner = self.inner.lock();
        info!(?entry, "schedule rule added");
        inner.entries.push(entry);
        self.evaluate_locked(&mut inner, Local::now().naive_local())?;
        Ok(inner.entries.clone())
    }

    /// Removes the rule at `index` and re-evaluates. Indices are advisory:
    /// they are revalidated here under the lock, and a stale index leaves
    /// the list unchanged.
    pub fn remove(&self, index: usize) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let mut inner = self.inner.lock();
        if index >= inner.entries.len() {
            warn!(index, len = inner.entries.len(), "invalid schedule index");
            return Err(ScheduleError::InvalidIndex);
        }
        let removed = inner.entries.remove(index);
        info!(?removed, "schedule rule removed");
        self.evaluate_locked(&mut inner, Local::now().naive_local())?;
        Ok(inner.entries.clone())
    }

    /// Snapshot copy of the rule list, in insertion order.
    pub fn list(&self) -> Vec<ScheduleEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn block_state(&self) -> BlockState {
        self.inner.lock().state
    }

    /// Evaluates the rules against the current wall-clock time and applies
    /// any resulting transition.
    pub fn evaluate(&self) -> Result<(), ScheduleError> {
        self.evaluate_at(Local::now().naive_local())
    }

    pub fn evaluate_at(&self, now: NaiveDateTime) -> Result<(), ScheduleError> {
        let mut inner = self.inner.lock();
        self.evaluate_locked(&mut inner, now)
    }

    /// Forces a block or unblock outside of schedule evaluation. Shares the
    /// same idempotent transition logic, so forcing the current state is a
    /// no-op.
    pub fn force(&self, desired: BlockState) -> Result<(), ScheduleError> {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, desired)
    }

    fn evaluate_locked(
        &self,
        inner: &mut SchedulerInner,
        now: NaiveDateTime,
    ) -> Result<(), ScheduleError> {
        // First matching rule wins; later rules are not consulted.
        let desired = if inner.entries.iter().any(|entry| entry.matches(now)) {
            BlockState::Blocked
        } else {
            BlockState::Unblocked
        };
        self.transition(inner, desired)
    }

    fn transition(
        &self,
        inner: &mut SchedulerInner,
        desired: BlockState,
    ) -> Result<(), ScheduleError> {
        if inner.state == desired {
            return Ok(());
        }
        match desired {
            BlockState::Blocked => self.policy.block()?,
            BlockState::Unblocked => self.policy.unblock()?,
        }
        info!(from = %inner.state, to = %desired, "network block state changed");
        inner.state = desired;
        Ok(())
    }

    /// Spawns the fixed-interval evaluation task. It runs for the lifetime
    /// of the process and is not cancellable by any client request.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut interval = tokio::time::interval(self.tick);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                if let Err(err) = scheduler.evaluate() {
                    warn!(error = %err, "schedule evaluation failed");
                }
            }
        })
    }
}
