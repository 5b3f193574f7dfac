//! Blocking waits on events and synchronization objects

use log::trace;

use super::{SchedState, Scheduler};
use crate::error::{Result, SchedError};
use crate::kern::sched_prim::{BlockReason, WaitEvent, WaitResult};
use crate::kern::timer::ms_to_ticks;
use crate::sync::{CurrentTask, WaitHost};
use crate::task::TaskState;
use crate::types::TaskId;

impl Scheduler {
    /// Block the running task until `event` is notified or `timeout_ms` passes
    ///
    /// Returns [`WaitResult::Normal`] when notified and
    /// [`WaitResult::TimedOut`] when the deadline passed first. A zero
    /// timeout polls and reports `TimedOut` without blocking. On the simulated
    /// backend the call returns right after switching away, reporting
    /// [`WaitResult::Waiting`].
    pub fn wait_for(&self, event: WaitEvent, timeout_ms: Option<u32>) -> Result<WaitResult> {
        if timeout_ms == Some(0) {
            self.with_state(|st| st.running_slot())?;
            return Ok(WaitResult::TimedOut);
        }
        let id = self.block_current(BlockReason::Event(event), timeout_ms)?;
        Ok(self.block(id))
    }

    /// Wake the longest waiter on `event`
    pub fn notify(&self, event: WaitEvent) -> bool {
        self.with_state(|st| {
            while let Some(id) = st.events.wakeup_one(event) {
                if st.wake_blocked(id, BlockReason::Event(event), WaitResult::Normal) {
                    return true;
                }
            }
            false
        })
    }

    /// Wake every waiter on `event`, oldest first; returns how many woke
    pub fn broadcast(&self, event: WaitEvent) -> usize {
        self.with_state(|st| {
            st.events
                .wakeup_all(event)
                .into_iter()
                .filter(|&id| st.wake_blocked(id, BlockReason::Event(event), WaitResult::Normal))
                .count()
        })
    }

    /// Mark the running task Blocked for `reason` without switching yet
    fn block_current(&self, reason: BlockReason, timeout_ms: Option<u32>) -> Result<TaskId> {
        let now = self.clock.now();
        let hz = self.clock.frequency();
        self.with_state(|st| {
            let slot = st.running_slot()?;
            if slot == st.idle {
                return Err(SchedError::Forbidden);
            }
            let task = st.tasks.get_mut(slot).ok_or(SchedError::NotRunning)?;
            task.state = TaskState::Blocked;
            task.block = Some(reason);
            task.wake_at = timeout_ms.map(|ms| now.saturating_add(ms_to_ticks(u64::from(ms), hz)));
            task.wait_result = WaitResult::Waiting;
            let id = task.id;
            if let BlockReason::Event(event) = reason {
                st.events.add(event, id);
            }
            trace!(target: "sched", "task {} blocked on {:?}", id, reason);
            Ok(id)
        })
    }
}

impl SchedState {
    /// Ready `id` if it is Blocked for exactly `reason`
    fn wake_blocked(&mut self, id: TaskId, reason: BlockReason, result: WaitResult) -> bool {
        let Some(slot) = self.tasks.slot_of(id) else {
            return false;
        };
        let matches = self
            .tasks
            .get(slot)
            .is_some_and(|t| t.state == TaskState::Blocked && t.block == Some(reason));
        matches && self.make_ready(slot, result)
    }
}

impl CurrentTask for Scheduler {
    /// The running task, or the idle task's ID before the first dispatch
    fn current_task_id(&self) -> TaskId {
        self.current_id().unwrap_or(TaskId::IDLE)
    }
}

impl WaitHost for Scheduler {
    fn prepare_to_block(&self, key: WaitEvent, timeout_ms: Option<u32>) -> Result<TaskId> {
        self.block_current(BlockReason::Sync(key), timeout_ms)
    }

    fn block(&self, id: TaskId) -> WaitResult {
        self.reschedule();
        self.with_state(|st| {
            st.tasks
                .by_id(id)
                .map_or(WaitResult::Normal, |t| t.wait_result)
        })
    }

    fn wake(&self, id: TaskId, key: WaitEvent, result: WaitResult) -> bool {
        self.with_state(|st| st.wake_blocked(id, BlockReason::Sync(key), result))
    }
}
