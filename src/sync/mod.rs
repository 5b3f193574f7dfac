//! Synchronization primitives
//!
//! - [`Spinlock`] / [`RawSpinlock`]: busy-wait lock tagged with its owner
//! - [`Semaphore`]: counting semaphore whose waiters block
//! - [`Mutex`]: recursive sleeping lock
//!
//! The primitives never reach for the scheduler themselves. Callers pass the
//! task context in: [`CurrentTask`] for ownership tags, [`WaitHost`] for
//! anything that can block. [`crate::scheduler::Scheduler`] implements both.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::kern::sched_prim::{WaitEvent, WaitResult};
use crate::types::TaskId;

pub mod mutex;
pub mod semaphore;
pub mod spinlock;

pub use mutex::Mutex;
pub use semaphore::Semaphore;
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

/// Identifies the task on whose behalf a primitive is used
pub trait CurrentTask {
    fn current_task_id(&self) -> TaskId;
}

/// Blocking support for semaphores and mutexes
///
/// A wait is two steps so the primitive can publish the waiter under its own
/// lock before giving up the processor:
///
/// 1. [`WaitHost::prepare_to_block`] marks the running task Blocked on `key`
/// 2. [`WaitHost::block`] switches away and reports how the wait ended
///
/// A [`WaitHost::wake`] that lands between the two steps is not lost; the
/// task is simply Ready again by the time it would have switched away.
pub trait WaitHost: CurrentTask {
    /// Mark the running task Blocked on `key`, optionally with a deadline
    fn prepare_to_block(&self, key: WaitEvent, timeout_ms: Option<u32>) -> Result<TaskId>;

    /// Switch away from the prepared task and return its wait outcome
    fn block(&self, id: TaskId) -> WaitResult;

    /// Ready `id` if it is still blocked on `key`
    fn wake(&self, id: TaskId, key: WaitEvent, result: WaitResult) -> bool;
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Lazily assigned identity of a blocking primitive
///
/// Waiters are matched on this key, so a task is only ever woken by the
/// object it is waiting on.
#[derive(Debug)]
pub(crate) struct ObjectKey(AtomicU64);

impl ObjectKey {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) fn get(&self) -> WaitEvent {
        let key = self.0.load(Ordering::Acquire);
        if key != 0 {
            return key;
        }
        let fresh = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        match self
            .0
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(existing) => existing,
        }
    }
}
