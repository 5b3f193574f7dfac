//! Counting semaphore
//!
//! Waiters queue in arrival order. `post` hands the unit straight to the
//! oldest waiter that can still take it; the count only grows when nobody
//! is waiting.

use alloc::collections::VecDeque;

use super::spinlock::Spinlock;
use super::{CurrentTask, ObjectKey, WaitHost};
use crate::arch;
use crate::error::Result;
use crate::kern::sched_prim::WaitResult;
use crate::types::TaskId;

#[derive(Debug)]
struct SemState {
    count: u32,
    waiters: VecDeque<TaskId>,
}

#[derive(Debug)]
pub struct Semaphore {
    state: Spinlock<SemState>,
    key: ObjectKey,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Self {
            state: Spinlock::new(SemState {
                count,
                waiters: VecDeque::new(),
            }),
            key: ObjectKey::new(),
        }
    }

    /// Take one unit, blocking the running task while none is available
    pub fn wait<H: WaitHost + ?Sized>(&self, host: &H) -> Result<WaitResult> {
        self.acquire(host, None)
    }

    /// As [`Semaphore::wait`], giving up after `timeout_ms`
    pub fn wait_timeout<H: WaitHost + ?Sized>(&self, host: &H, timeout_ms: u32) -> Result<WaitResult> {
        if timeout_ms == 0 {
            return Ok(if self.try_wait(host) {
                WaitResult::Normal
            } else {
                WaitResult::TimedOut
            });
        }
        self.acquire(host, Some(timeout_ms))
    }

    fn acquire<H: WaitHost + ?Sized>(&self, host: &H, timeout_ms: Option<u32>) -> Result<WaitResult> {
        let key = self.key.get();
        let queued = arch::without_interrupts(|| -> Result<Option<TaskId>> {
            let mut st = self.state.lock(host);
            if st.count > 0 {
                st.count -= 1;
                return Ok(None);
            }
            let id = host.prepare_to_block(key, timeout_ms)?;
            st.waiters.push_back(id);
            Ok(Some(id))
        })?;

        let Some(id) = queued else {
            return Ok(WaitResult::Normal);
        };
        let result = host.block(id);
        if result == WaitResult::TimedOut {
            arch::without_interrupts(|| {
                let mut st = self.state.lock(host);
                st.waiters.retain(|&w| w != id);
            });
        }
        Ok(result)
    }

    /// Take one unit if available
    pub fn try_wait<C: CurrentTask + ?Sized>(&self, ctx: &C) -> bool {
        arch::without_interrupts(|| {
            let mut st = self.state.lock(ctx);
            if st.count == 0 {
                return false;
            }
            st.count -= 1;
            true
        })
    }

    /// Release one unit, waking the oldest waiter if there is one
    pub fn post<H: WaitHost + ?Sized>(&self, host: &H) {
        let key = self.key.get();
        arch::without_interrupts(|| {
            let mut st = self.state.lock(host);
            while let Some(next) = st.waiters.pop_front() {
                // Skips waiters that timed out or were destroyed
                if host.wake(next, key, WaitResult::Normal) {
                    return;
                }
            }
            st.count += 1;
        });
    }

    pub fn count<C: CurrentTask + ?Sized>(&self, ctx: &C) -> u32 {
        arch::without_interrupts(|| self.state.lock(ctx).count)
    }

    /// Tasks queued on the semaphore, oldest first
    pub fn waiting<C: CurrentTask + ?Sized>(&self, ctx: &C) -> usize {
        arch::without_interrupts(|| self.state.lock(ctx).waiters.len())
    }
}
