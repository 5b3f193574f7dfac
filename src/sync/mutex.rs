//! Recursive sleeping mutex
//!
//! The owner may lock again without blocking; the mutex is free once it has
//! been unlocked as many times as it was locked. On the final unlock the
//! oldest waiter becomes the owner directly.

use alloc::collections::VecDeque;

use super::spinlock::Spinlock;
use super::{CurrentTask, ObjectKey, WaitHost};
use crate::arch;
use crate::error::{Result, SchedError};
use crate::kern::sched_prim::WaitResult;
use crate::types::TaskId;

#[derive(Debug)]
struct MutexState {
    locked: bool,
    owner: Option<TaskId>,
    recursion: u32,
    waiters: VecDeque<TaskId>,
}

#[derive(Debug)]
pub struct Mutex {
    state: Spinlock<MutexState>,
    key: ObjectKey,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: Spinlock::new(MutexState {
                locked: false,
                owner: None,
                recursion: 0,
                waiters: VecDeque::new(),
            }),
            key: ObjectKey::new(),
        }
    }

    /// Lock for the running task, blocking while another task owns it
    ///
    /// When the wait ends with [`WaitResult::Normal`] the caller owns the
    /// mutex.
    pub fn lock<H: WaitHost + ?Sized>(&self, host: &H) -> Result<WaitResult> {
        self.acquire(host, None)
    }

    /// As [`Mutex::lock`], giving up after `timeout_ms`
    pub fn lock_timeout<H: WaitHost + ?Sized>(&self, host: &H, timeout_ms: u32) -> Result<WaitResult> {
        if timeout_ms == 0 {
            return Ok(if self.try_lock(host) {
                WaitResult::Normal
            } else {
                WaitResult::TimedOut
            });
        }
        self.acquire(host, Some(timeout_ms))
    }

    fn acquire<H: WaitHost + ?Sized>(&self, host: &H, timeout_ms: Option<u32>) -> Result<WaitResult> {
        let me = host.current_task_id();
        let key = self.key.get();
        let queued = arch::without_interrupts(|| -> Result<Option<TaskId>> {
            let mut st = self.state.lock(host);
            if st.take(me) {
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

    /// Lock without blocking
    pub fn try_lock<C: CurrentTask + ?Sized>(&self, ctx: &C) -> bool {
        let me = ctx.current_task_id();
        arch::without_interrupts(|| self.state.lock(ctx).take(me))
    }

    /// Drop one level of ownership; `Forbidden` unless the caller owns it
    pub fn unlock<H: WaitHost + ?Sized>(&self, host: &H) -> Result<()> {
        let me = host.current_task_id();
        let key = self.key.get();
        arch::without_interrupts(|| {
            let mut st = self.state.lock(host);
            if !st.locked || st.owner != Some(me) {
                return Err(SchedError::Forbidden);
            }
            st.recursion -= 1;
            if st.recursion > 0 {
                return Ok(());
            }
            while let Some(next) = st.waiters.pop_front() {
                if host.wake(next, key, WaitResult::Normal) {
                    st.owner = Some(next);
                    st.recursion = 1;
                    return Ok(());
                }
            }
            st.locked = false;
            st.owner = None;
            Ok(())
        })
    }

    /// Advisory: the answer may be stale by the time it is used
    pub fn is_held<C: CurrentTask + ?Sized>(&self, ctx: &C) -> bool {
        arch::without_interrupts(|| self.state.lock(ctx).locked)
    }

    pub fn owner<C: CurrentTask + ?Sized>(&self, ctx: &C) -> Option<TaskId> {
        arch::without_interrupts(|| self.state.lock(ctx).owner)
    }

    pub fn recursion<C: CurrentTask + ?Sized>(&self, ctx: &C) -> u32 {
        arch::without_interrupts(|| self.state.lock(ctx).recursion)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexState {
    /// Take or re-enter the lock for `me`
    fn take(&mut self, me: TaskId) -> bool {
        if !self.locked {
            self.locked = true;
            self.owner = Some(me);
            self.recursion = 1;
            true
        } else if self.owner == Some(me) {
            self.recursion += 1;
            true
        } else {
            false
        }
    }
}
