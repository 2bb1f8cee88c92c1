//! Shared state of one region: its work queue, refill lock and counters.
//!
//! All servers of a region hold the same `Arc<RegionState>`; nothing outside
//! the region can reach it. Guards are short and never held across `.await`.
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

use super::stats::{StatsReport, StatsTracker};
use crate::config::Region;
use crate::models::PlayerId;

/// Refill lock of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Fetching,
    /// Backlog was exhausted; refills are suppressed until the window ends.
    Cooldown,
}

#[derive(Debug)]
struct FetchSlot {
    state: FetchState,
    /// Bumped on every cooldown entry so a stale reset cannot end a newer window.
    cooldown_epoch: u64,
}

#[derive(Debug)]
pub struct RegionState {
    region: Region,
    queue: Mutex<VecDeque<PlayerId>>,
    fetch: Mutex<FetchSlot>,
    stats: Mutex<StatsTracker>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RegionState {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            queue: Mutex::new(VecDeque::new()),
            fetch: Mutex::new(FetchSlot {
                state: FetchState::Idle,
                cooldown_epoch: 0,
            }),
            stats: Mutex::new(StatsTracker::default()),
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn push(&self, id: PlayerId) {
        lock(&self.queue).push_back(id);
    }

    /// Pops up to `n` ids from the front.
    pub fn take_batch(&self, n: usize) -> Vec<PlayerId> {
        let mut queue = lock(&self.queue);
        let n = n.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn fetch_state(&self) -> FetchState {
        lock(&self.fetch).state
    }

    /// Idle regions may refill; so may a cooling-down region whose queue ran dry.
    pub fn refill_allowed(&self) -> bool {
        match self.fetch_state() {
            FetchState::Idle => true,
            FetchState::Cooldown => self.queue_len() == 0,
            FetchState::Fetching => false,
        }
    }

    /// Takes the refill lock. `false` when another refill is running or the
    /// region is cooling down with work still queued.
    pub fn try_begin_fetch(&self) -> bool {
        // Queue length first: the two locks are never held together.
        let queue_empty = self.queue_len() == 0;
        let mut slot = lock(&self.fetch);
        let allowed = match slot.state {
            FetchState::Idle => true,
            FetchState::Cooldown => queue_empty,
            FetchState::Fetching => false,
        };
        if allowed {
            slot.state = FetchState::Fetching;
        }
        allowed
    }

    pub fn finish_fetch(&self) {
        lock(&self.fetch).state = FetchState::Idle;
    }

    /// Enters cooldown and returns the epoch the matching reset must present.
    pub fn enter_cooldown(&self) -> u64 {
        let mut slot = lock(&self.fetch);
        slot.cooldown_epoch += 1;
        slot.state = FetchState::Cooldown;
        slot.cooldown_epoch
    }

    /// Ends the cooldown started at `epoch`, unless the state moved on since.
    pub fn end_cooldown(&self, epoch: u64) -> bool {
        let mut slot = lock(&self.fetch);
        if slot.state == FetchState::Cooldown && slot.cooldown_epoch == epoch {
            slot.state = FetchState::Idle;
            true
        } else {
            false
        }
    }

    pub fn record_success(&self) {
        lock(&self.stats).record_success();
    }

    pub fn record_failure(&self, error: Value) {
        lock(&self.stats).record_failure(error);
    }

    pub fn take_report(&self) -> Option<StatsReport> {
        lock(&self.stats).take_report(Instant::now())
    }

    /// (success, fail) since the last report.
    pub fn counts(&self) -> (u64, u64) {
        lock(&self.stats).counts()
    }

    pub fn last_error(&self) -> Option<Value> {
        lock(&self.stats).last_error().cloned()
    }
}
