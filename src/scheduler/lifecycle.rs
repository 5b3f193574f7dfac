//! Task lifecycle: creation, teardown and state changes requested by tasks

use log::{debug, info, warn};

use super::{SchedState, Scheduler};
use crate::arch::{CpuState, FpuState};
use crate::config::validate_quantum;
use crate::error::{Result, SchedError};
use crate::kern::queue::Slot;
use crate::kern::sched_prim::{BlockReason, WaitResult};
use crate::kern::timer::ms_to_ticks;
use crate::memory::{KBox, SharedAllocator, StackRegion};
use crate::task::{Priority, Task, TaskEntry, TaskFlags, TaskState, TaskTable};
use crate::types::{AddressSpace, TaskId};

/// Place `task` in allocator memory with its stack and initial context
///
/// The TCB is allocated before the stack; if anything after it fails the
/// TCB is released with it. Queue membership is left to the caller.
pub(super) fn build_task(
    tasks: &mut TaskTable,
    task: Task,
    entry: TaskEntry,
    parent: Option<TaskId>,
    space: AddressSpace,
    stack_size: usize,
    alloc: &SharedAllocator,
) -> Result<Slot> {
    let id = task.id;
    let Some(mut tcb) = KBox::try_new(task, alloc) else {
        warn!(target: "sched", "no memory for TCB of task {}", id);
        return Err(SchedError::OutOfMemory);
    };
    let Some(stack) = StackRegion::allocate(stack_size, alloc) else {
        warn!(target: "sched", "no memory for {} byte stack of task {}", stack_size, id);
        return Err(SchedError::OutOfMemory);
    };
    if tcb.flags.contains(TaskFlags::FPU) {
        let Some(area) = KBox::try_new(FpuState::initial(), alloc) else {
            warn!(target: "sched", "no memory for FPU area of task {}", id);
            return Err(SchedError::OutOfMemory);
        };
        tcb.fpu = Some(area);
    }

    tcb.context = CpuState::for_entry(entry as usize, stack.top(), tcb.privilege(), space);
    tcb.address_space = space;
    tcb.parent = parent;
    tcb.stack = Some(stack);
    Ok(tasks.insert(tcb))
}

impl Scheduler {
    /// Create a Ready task that starts at `entry`
    ///
    /// The task inherits the running task's address space, or the kernel
    /// space before the first dispatch, and joins the tail of its ready
    /// queue. It does not preempt the caller.
    pub fn create(
        &self,
        name: &str,
        entry: TaskEntry,
        priority: Priority,
        flags: TaskFlags,
    ) -> Result<TaskId> {
        let now = self.clock.now();
        self.with_state(|st| {
            if st.tasks.len() >= st.config.max_tasks {
                warn!(target: "sched", "task limit {} reached, cannot create '{}'", st.config.max_tasks, name);
                return Err(SchedError::OutOfMemory);
            }

            let id = st.next_id;
            let (parent, space) = match st.current_task() {
                Some(parent) => (Some(parent.id), parent.address_space),
                None => (None, self.kernel_space),
            };
            let task = Task::new(id, name, priority, flags, st.quantum, now);
            let slot = build_task(
                &mut st.tasks,
                task,
                entry,
                parent,
                space,
                st.config.stack_size,
                &self.alloc,
            )?;

            st.next_id = id.next();
            st.all.enqueue_tail(&mut st.tasks, slot);
            st.runq.enqueue(&mut st.tasks, slot, priority);
            info!(target: "sched", "created task {} '{}' priority {:?}", id, name, priority);
            Ok(id)
        })
    }

    /// `create` with Normal priority as a kernel system task
    pub fn kernel_task(&self, name: &str, entry: TaskEntry) -> Result<TaskId> {
        self.create(
            name,
            entry,
            Priority::Normal,
            TaskFlags::KERNEL | TaskFlags::SYSTEM,
        )
    }

    /// Remove a task that is not running and release its memory
    pub fn destroy(&self, id: TaskId) -> Result<()> {
        if id.is_idle() {
            return Err(SchedError::Forbidden);
        }
        let tcb = self.with_state(|st| {
            let slot = st.tasks.slot_of(id).ok_or(SchedError::NotFound(id))?;
            st.detach(slot)?;
            st.all.remove(&mut st.tasks, slot);
            st.tasks.remove(slot).ok_or(SchedError::NotFound(id))
        })?;
        info!(target: "sched", "destroyed task {} '{}'", id, tcb.name());
        // Stack, FPU area and TCB are released here
        drop(tcb);
        Ok(())
    }

    /// Destroy every Terminated task; returns how many were reaped
    pub fn reap_terminated(&self) -> usize {
        let dead: alloc::vec::Vec<TaskId> = self.with_state(|st| {
            st.tasks
                .iter()
                .filter(|t| t.state == TaskState::Terminated)
                .map(Task::id)
                .collect()
        });
        dead.into_iter()
            .filter(|&id| self.destroy(id).is_ok())
            .count()
    }

    /// Stop a Ready or Running task until `resume`
    ///
    /// Suspending the running task switches away from it at once.
    pub fn suspend(&self, id: TaskId) -> Result<()> {
        if id.is_idle() {
            return Err(SchedError::Forbidden);
        }
        let was_current = self.with_state(|st| {
            let slot = st.tasks.slot_of(id).ok_or(SchedError::NotFound(id))?;
            let (state, priority) = st
                .tasks
                .get(slot)
                .map(|t| (t.state, t.priority))
                .ok_or(SchedError::NotFound(id))?;
            match state {
                TaskState::Ready => {
                    st.runq.remove(&mut st.tasks, slot, priority);
                }
                TaskState::Running => {}
                other => return Err(SchedError::InvalidState(other)),
            }
            if let Some(task) = st.tasks.get_mut(slot) {
                task.state = TaskState::Suspended;
            }
            Ok(st.current == Some(slot))
        })?;

        debug!(target: "sched", "suspended task {}", id);
        if was_current {
            self.reschedule();
        }
        Ok(())
    }

    /// Return a Suspended task to the tail of its ready queue
    pub fn resume(&self, id: TaskId) -> Result<()> {
        self.with_state(|st| {
            let slot = st.tasks.slot_of(id).ok_or(SchedError::NotFound(id))?;
            let state = st.task(id)?.state;
            if state != TaskState::Suspended {
                return Err(SchedError::InvalidState(state));
            }
            st.make_ready(slot, WaitResult::Normal);
            Ok(())
        })?;
        debug!(target: "sched", "resumed task {}", id);
        Ok(())
    }

    /// Terminate the running task and switch away
    ///
    /// The TCB stays until someone calls [`Scheduler::destroy`]. On hardware
    /// this does not return.
    pub fn exit(&self, code: i32) -> Result<()> {
        let id = self.with_state(|st| {
            let slot = st.running_slot()?;
            if slot == st.idle {
                return Err(SchedError::Forbidden);
            }
            let task = st.tasks.get_mut(slot).ok_or(SchedError::NotRunning)?;
            task.state = TaskState::Terminated;
            task.exit_code = Some(code);
            Ok(task.id)
        })?;
        debug!(target: "sched", "task {} exited with code {}", id, code);
        self.reschedule();
        Ok(())
    }

    /// Block the running task for at least `ms` milliseconds
    ///
    /// The deadline is `now + ceil(ms * hz / 1000)` ticks, saturating at the
    /// end of time. `sleep(0)` yields.
    pub fn sleep(&self, ms: u64) -> Result<()> {
        let now = self.clock.now();
        let ticks = ms_to_ticks(ms, self.clock.frequency());
        let blocked = self.with_state(|st| {
            let slot = st.running_slot()?;
            if slot == st.idle {
                return Err(SchedError::Forbidden);
            }
            if ticks == 0 {
                return Ok(false);
            }
            let task = st.tasks.get_mut(slot).ok_or(SchedError::NotRunning)?;
            task.state = TaskState::Blocked;
            task.block = Some(BlockReason::Sleep);
            task.wake_at = Some(now.saturating_add(ticks));
            task.wait_result = WaitResult::Waiting;
            Ok(true)
        })?;

        if blocked {
            self.reschedule();
        } else {
            self.yield_now();
        }
        Ok(())
    }

    /// Give up the rest of the time slice
    ///
    /// The slice is refilled and the task goes to the tail of its level, so
    /// it keeps the processor only if nothing of equal or higher priority is
    /// ready. Before the first dispatch this does nothing.
    pub fn yield_now(&self) {
        let running = self.with_state(|st| {
            let Some(slot) = st.current else {
                return false;
            };
            let Some(task) = st.tasks.get_mut(slot) else {
                return false;
            };
            task.slice_remaining = task.time_slice;
            true
        });
        if running {
            self.reschedule();
        }
    }

    /// Change a task's priority; a Ready task moves to the tail of its new level
    pub fn set_priority(&self, id: TaskId, priority: Priority) -> Result<()> {
        if id.is_idle() {
            return Err(SchedError::Forbidden);
        }
        self.with_state(|st| {
            let slot = st.tasks.slot_of(id).ok_or(SchedError::NotFound(id))?;
            let task = st.task(id)?;
            let (state, old) = (task.state, task.priority);
            if state == TaskState::Ready {
                st.runq.remove(&mut st.tasks, slot, old);
            }
            if let Some(task) = st.tasks.get_mut(slot) {
                task.priority = priority;
            }
            if state == TaskState::Ready {
                st.runq.enqueue(&mut st.tasks, slot, priority);
            }
            debug!(target: "sched", "task {} priority {:?} -> {:?}", id, old, priority);
            Ok(())
        })
    }

    /// Time slice, in ticks, for tasks created from now on
    pub fn set_quantum(&self, ticks: u32) -> Result<()> {
        validate_quantum(ticks)?;
        self.with_state(|st| st.quantum = ticks);
        Ok(())
    }

    pub fn quantum(&self) -> u32 {
        self.with_state(|st| st.quantum)
    }

    /// Move a task that is not running to another address space
    ///
    /// The handle takes effect when the task is next dispatched.
    pub fn set_address_space(&self, id: TaskId, space: AddressSpace) -> Result<()> {
        self.with_state(|st| {
            let slot = st.tasks.slot_of(id).ok_or(SchedError::NotFound(id))?;
            let task = st.tasks.get_mut(slot).ok_or(SchedError::NotFound(id))?;
            if st.current == Some(slot) {
                return Err(SchedError::InvalidState(task.state));
            }
            task.address_space = space;
            task.context.cr3 = space.raw();
            Ok(())
        })
    }

    /// Give a task an FPU area and switch its FPU state from now on
    pub fn enable_fpu(&self, id: TaskId) -> Result<()> {
        self.with_state(|st| {
            let task = st.tasks.by_id_mut(id).ok_or(SchedError::NotFound(id))?;
            if task.fpu.is_none() {
                let Some(area) = KBox::try_new(FpuState::initial(), &self.alloc) else {
                    warn!(target: "sched", "no memory for FPU area of task {}", id);
                    return Err(SchedError::OutOfMemory);
                };
                task.fpu = Some(area);
            }
            task.flags.insert(TaskFlags::FPU);
            Ok(())
        })
    }

    /// Drop a task's FPU area
    pub fn disable_fpu(&self, id: TaskId) -> Result<()> {
        self.with_state(|st| {
            let task = st.tasks.by_id_mut(id).ok_or(SchedError::NotFound(id))?;
            task.flags.remove(TaskFlags::FPU);
            task.fpu = None;
            Ok(())
        })
    }
}

impl SchedState {
    /// Take a task off the ready or event queues ahead of removal
    fn detach(&mut self, slot: Slot) -> Result<()> {
        let Some(task) = self.tasks.get(slot) else {
            return Ok(());
        };
        if self.current == Some(slot) {
            return Err(SchedError::InvalidState(task.state));
        }
        let (id, state, priority, block) = (task.id, task.state, task.priority, task.block);
        match state {
            TaskState::Ready => {
                self.runq.remove(&mut self.tasks, slot, priority);
            }
            TaskState::Blocked => {
                if let Some(BlockReason::Event(event)) = block {
                    self.events.remove(event, id);
                }
            }
            _ => {}
        }
        Ok(())
    }
}
