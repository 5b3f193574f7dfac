//! Run Queue Management
//!
//! Ready tasks wait in one FIFO queue per priority level. A task enters at the
//! tail of its level and is dispatched from the head; the running task is not
//! a member of any queue.
//!
//! ## Bitmap Optimization
//!
//! An 8-bit bitmap tracks which of the five levels hold tasks, so the highest
//! occupied level is found with a single leading-zero count.

use crate::kern::queue::{Chains, QueueHead, Slot};
use crate::task::Priority;

/// Number of priority levels
pub const NRQS: usize = Priority::COUNT;

/// Per-priority ready queues over the `L` chains of an arena
#[derive(Debug)]
pub struct RunQueue<L> {
    /// Indexed by [`Priority::level`]; higher index runs first
    queues: [QueueHead<L>; NRQS],
    /// Bit `n` set while level `n` is non-empty
    bitmap: u8,
    count: usize,
}

impl<L> RunQueue<L> {
    pub fn new() -> Self {
        Self {
            queues: core::array::from_fn(|_| QueueHead::new()),
            bitmap: 0,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total number of queued tasks
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of tasks queued at `priority`
    pub fn level_len(&self, priority: Priority) -> usize {
        self.queues[priority.level()].len()
    }

    /// Add `slot` at the tail of its priority level
    pub fn enqueue<S: Chains<L> + ?Sized>(
        &mut self,
        store: &mut S,
        slot: Slot,
        priority: Priority,
    ) -> bool {
        let level = priority.level();
        if !self.queues[level].enqueue_tail(store, slot) {
            return false;
        }
        self.bitmap |= 1 << level;
        self.count += 1;
        true
    }

    /// Remove the head of the highest occupied level
    pub fn dequeue<S: Chains<L> + ?Sized>(&mut self, store: &mut S) -> Option<Slot> {
        let priority = self.highest_priority()?;
        let level = priority.level();
        let slot = self.queues[level].dequeue_head(store)?;
        self.count -= 1;
        if self.queues[level].is_empty() {
            self.bitmap &= !(1 << level);
        }
        Some(slot)
    }

    /// Unlink `slot` from the level it was queued at
    pub fn remove<S: Chains<L> + ?Sized>(
        &mut self,
        store: &mut S,
        slot: Slot,
        priority: Priority,
    ) -> bool {
        let level = priority.level();
        if !self.queues[level].remove(store, slot) {
            return false;
        }
        self.count -= 1;
        if self.queues[level].is_empty() {
            self.bitmap &= !(1 << level);
        }
        true
    }

    /// Head of the highest occupied level, without removing it
    pub fn peek(&self) -> Option<Slot> {
        let priority = self.highest_priority()?;
        self.queues[priority.level()].first()
    }

    /// Highest priority level with queued tasks
    pub fn highest_priority(&self) -> Option<Priority> {
        if self.bitmap == 0 {
            return None;
        }
        let level = 7 - self.bitmap.leading_zeros() as usize;
        Priority::from_level(level)
    }

    /// Tasks queued at `priority`, in dispatch order
    pub fn iter_level<'a, S: Chains<L> + ?Sized>(
        &self,
        store: &'a S,
        priority: Priority,
    ) -> impl Iterator<Item = Slot> + 'a
    where
        L: 'a,
    {
        self.queues[priority.level()].iter(store)
    }
}

impl<L> Default for RunQueue<L> {
    fn default() -> Self {
        Self::new()
    }
}
