//! Scheduling Primitives - Wait/Wakeup and Event Management
//!
//! Tasks block on a [`WaitEvent`] (any kernel-chosen 64-bit key, typically an
//! object address) and are woken by `notify`/`broadcast` on the same key, or
//! by their deadline passing.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::types::TaskId;

// ============================================================================
// Wait Results
// ============================================================================

/// Outcome of a blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by a notification or handoff
    Normal,
    /// Deadline passed before a wakeup arrived
    TimedOut,
    /// Still blocked; no wakeup has been delivered yet
    Waiting,
}

/// Event that tasks can wait on
pub type WaitEvent = u64;

/// Why a Blocked task is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// `sleep`; only the deadline ends it
    Sleep,
    /// `wait_for` on an event
    Event(WaitEvent),
    /// Waiting on the semaphore or mutex with this key
    Sync(WaitEvent),
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Tasks waiting on events, FIFO per event
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: BTreeMap<WaitEvent, VecDeque<TaskId>>,
    count: usize,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: BTreeMap::new(),
            count: 0,
        }
    }

    /// Add `task` behind the current waiters on `event`
    pub fn add(&mut self, event: WaitEvent, task: TaskId) {
        self.waiters.entry(event).or_default().push_back(task);
        self.count += 1;
    }

    /// Remove `task` from `event`'s waiters
    pub fn remove(&mut self, event: WaitEvent, task: TaskId) -> bool {
        let Some(waiters) = self.waiters.get_mut(&event) else {
            return false;
        };
        let Some(pos) = waiters.iter().position(|&t| t == task) else {
            return false;
        };
        waiters.remove(pos);
        self.count -= 1;
        if waiters.is_empty() {
            self.waiters.remove(&event);
        }
        true
    }

    /// Take the longest-waiting task on `event`
    pub fn wakeup_one(&mut self, event: WaitEvent) -> Option<TaskId> {
        let waiters = self.waiters.get_mut(&event)?;
        let task = waiters.pop_front()?;
        self.count -= 1;
        if waiters.is_empty() {
            self.waiters.remove(&event);
        }
        Some(task)
    }

    /// Take every task waiting on `event`, oldest first
    pub fn wakeup_all(&mut self, event: WaitEvent) -> Vec<TaskId> {
        match self.waiters.remove(&event) {
            Some(waiters) => {
                self.count -= waiters.len();
                waiters.into()
            }
            None => Vec::new(),
        }
    }

    /// Total waiters across all events
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn has_waiters(&self, event: WaitEvent) -> bool {
        self.waiters.get(&event).is_some_and(|w| !w.is_empty())
    }
}
