//! Task scheduler
//!
//! Preemptive priority scheduling over five levels, round-robin within a
//! level. The [`Scheduler`] owns every TCB, the global task list, the ready
//! queues and the event wait queue, all behind one spin lock that is only
//! taken with interrupts masked.
//!
//! Processor state is never touched directly: dispatch builds a switch plan
//! under the lock, drops the lock, then hands raw snapshot pointers to the
//! [`ContextSwitch`] backend. On hardware that call returns only when the
//! suspended task is dispatched again; on the simulated backend it returns
//! at once with the new task recorded as current.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{warn, Level};
use spin::{Mutex, Once};

use crate::arch::{self, ContextSwitch, CpuState, FpuState, Privilege};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedError};
use crate::kern::queue::{QueueHead, Slot};
use crate::kern::runq::RunQueue;
use crate::kern::sched_prim::{BlockReason, WaitQueue, WaitResult};
use crate::kern::timer::{self, TickSource};
use crate::memory::SharedAllocator;
use crate::panic::fatal;
use crate::task::{
    GlobalLink, Priority, RunLink, Task, TaskFlags, TaskInfo, TaskName, TaskState, TaskTable,
};
use crate::types::{AddressSpace, TaskId};

mod lifecycle;
mod wait;

#[cfg(test)]
mod tests;

/// Services the scheduler is built on
pub struct Platform {
    /// Context save/restore backend
    pub cpu: Arc<dyn ContextSwitch>,
    /// Source of TCBs, stacks and FPU areas
    pub alloc: SharedAllocator,
    /// Monotonic tick counter
    pub clock: Arc<dyn TickSource>,
    /// Address space for tasks created without a parent
    pub kernel_space: AddressSpace,
}

/// Point-in-time scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_tasks: usize,
    pub running: usize,
    pub ready: usize,
    pub blocked: usize,
    pub suspended: usize,
    pub terminated: usize,
    pub context_switches: u64,
    pub idle_ticks: u64,
    pub total_ticks: u64,
}

/// Everything guarded by the scheduler lock
struct SchedState {
    tasks: TaskTable,
    /// Every live task in creation order
    all: QueueHead<GlobalLink>,
    runq: RunQueue<RunLink>,
    events: WaitQueue,
    /// None until the first dispatch
    current: Option<Slot>,
    idle: Slot,
    next_id: TaskId,
    quantum: u32,
    config: SchedulerConfig,
    context_switches: u64,
    idle_ticks: u64,
    total_ticks: u64,
}

/// Snapshot pointers for one context switch
///
/// The pointers target TCBs held in allocator blocks, which do not move
/// while the task lives.
struct SwitchPlan {
    old: Option<*mut CpuState>,
    old_fpu: Option<*mut FpuState>,
    new: *const CpuState,
    new_fpu: Option<*const FpuState>,
    privilege: Privilege,
}

/// The scheduler
pub struct Scheduler {
    state: Mutex<SchedState>,
    cpu: Arc<dyn ContextSwitch>,
    alloc: SharedAllocator,
    clock: Arc<dyn TickSource>,
    kernel_space: AddressSpace,
    in_tick: AtomicBool,
}

/// Idle task body
extern "C" fn idle_main() -> ! {
    loop {
        arch::wait_for_interrupt();
    }
}

impl Scheduler {
    /// Build a scheduler and its idle task
    ///
    /// The idle task takes ID 0 and sits in the Idle ready queue. No task
    /// runs until [`Scheduler::start`].
    pub fn new(config: SchedulerConfig, platform: Platform) -> Result<Self> {
        config.validate()?;
        let Platform {
            cpu,
            alloc,
            clock,
            kernel_space,
        } = platform;

        let now = clock.now();
        let task = Task::new(
            TaskId::IDLE,
            "idle",
            Priority::Idle,
            TaskFlags::KERNEL | TaskFlags::SYSTEM,
            config.quantum_ticks,
            now,
        );
        let mut tasks = TaskTable::new();
        let idle = lifecycle::build_task(
            &mut tasks,
            task,
            idle_main,
            None,
            kernel_space,
            config.stack_size,
            &alloc,
        )?;

        let mut state = SchedState {
            tasks,
            all: QueueHead::new(),
            runq: RunQueue::new(),
            events: WaitQueue::new(),
            current: None,
            idle,
            next_id: TaskId::FIRST,
            quantum: config.quantum_ticks,
            config,
            context_switches: 0,
            idle_ticks: 0,
            total_ticks: 0,
        };
        state.all.enqueue_tail(&mut state.tasks, idle);
        state.runq.enqueue(&mut state.tasks, idle, Priority::Idle);

        log::info!(target: "sched", "scheduler ready: quantum {} ticks, stack {} bytes, max {} tasks",
            config.quantum_ticks, config.stack_size, config.max_tasks);

        Ok(Self {
            state: Mutex::new(state),
            cpu,
            alloc,
            clock,
            kernel_space,
            in_tick: AtomicBool::new(false),
        })
    }

    /// Run `f` on the locked state with interrupts masked
    fn with_state<R>(&self, f: impl FnOnce(&mut SchedState) -> R) -> R {
        arch::without_interrupts(|| f(&mut self.state.lock()))
    }

    /// Dispatch the first task
    ///
    /// Does not return on hardware. Calling it again is a no-op.
    pub fn start(&self) {
        if self.with_state(|st| st.current.is_some()) {
            warn!(target: "sched", "scheduler already started");
            return;
        }
        log::info!(target: "sched", "starting scheduler");
        self.reschedule();
    }

    pub fn is_started(&self) -> bool {
        self.with_state(|st| st.current.is_some())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Pick the next task and switch to it
    ///
    /// A current task that is still Running goes back to the tail of its
    /// level first. A current task that already left Running (blocked,
    /// suspended, exited) is simply switched away from.
    fn reschedule(&self) {
        arch::without_interrupts(|| {
            let now = self.clock.now();
            let plan = self.state.lock().plan_switch(now);
            if let Some(plan) = plan {
                // SAFETY: plan pointers target live TCBs and the lock is released
                unsafe { self.perform(plan) };
            }
        });
    }

    unsafe fn perform(&self, plan: SwitchPlan) {
        if let Some(area) = plan.old_fpu {
            self.cpu.save_fpu(area);
        }
        if let Some(area) = plan.new_fpu {
            self.cpu.restore_fpu(area);
        }
        self.cpu.switch(plan.old, plan.new, plan.privilege);
    }

    /// Timer entry, called once per timer interrupt
    ///
    /// Charges the tick to the running task, wakes every task whose deadline
    /// has passed, then preempts the running task if its slice ran out or a
    /// higher-priority task is ready.
    pub fn tick(&self) {
        if self.in_tick.swap(true, Ordering::Acquire) {
            warn!(target: "sched", "tick re-entered, ignoring");
            return;
        }
        let now = self.clock.now();
        let preempt = self.with_state(|st| st.account_tick(now));
        self.in_tick.store(false, Ordering::Release);

        if preempt {
            self.reschedule();
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// ID of the running task, None before the first dispatch
    pub fn current_id(&self) -> Option<TaskId> {
        self.with_state(|st| st.current_task().map(Task::id))
    }

    pub fn state(&self, id: TaskId) -> Result<TaskState> {
        self.with_state(|st| st.task(id).map(Task::state))
    }

    pub fn priority(&self, id: TaskId) -> Result<Priority> {
        self.with_state(|st| st.task(id).map(Task::priority))
    }

    pub fn name(&self, id: TaskId) -> Result<TaskName> {
        self.with_state(|st| st.task(id).map(|t| t.name.clone()))
    }

    pub fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        self.with_state(|st| st.tasks.by_id(id).map(Task::info))
    }

    /// Every live task in creation order
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.with_state(|st| {
            st.all
                .iter(&st.tasks)
                .filter_map(|slot| st.tasks.get(slot))
                .map(Task::info)
                .collect()
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        self.with_state(|st| st.stats())
    }

    pub fn config(&self) -> SchedulerConfig {
        self.with_state(|st| st.config)
    }

    /// Log the task table
    pub fn dump_tasks(&self) {
        self.with_state(|st| st.dump(Level::Info));
    }
}

// ============================================================================
// Locked state
// ============================================================================

impl SchedState {
    fn task(&self, id: TaskId) -> Result<&Task> {
        self.tasks.by_id(id).ok_or(SchedError::NotFound(id))
    }

    fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current?)
    }

    /// Running task's slot, or `NotRunning` before the first dispatch
    fn running_slot(&self) -> Result<Slot> {
        self.current.ok_or(SchedError::NotRunning)
    }

    /// Move a Blocked or Suspended task to the tail of its ready queue
    fn make_ready(&mut self, slot: Slot, result: WaitResult) -> bool {
        let Some(task) = self.tasks.get_mut(slot) else {
            return false;
        };
        if let Some(BlockReason::Event(event)) = task.block {
            self.events.remove(event, task.id);
        }
        task.state = TaskState::Ready;
        task.block = None;
        task.wake_at = None;
        task.wait_result = result;
        let priority = task.priority;
        self.runq.enqueue(&mut self.tasks, slot, priority)
    }

    /// Ready every Blocked task whose deadline is at or before `now`
    fn wake_expired(&mut self, now: u64) {
        let mut cursor = self.all.first();
        while let Some(slot) = cursor {
            let Some(task) = self.tasks.get(slot) else {
                break;
            };
            cursor = task.all_link.next();

            let due = task.state == TaskState::Blocked && task.wake_at.is_some_and(|at| at <= now);
            if due {
                let result = match task.block {
                    Some(BlockReason::Sleep) => WaitResult::Normal,
                    _ => WaitResult::TimedOut,
                };
                self.make_ready(slot, result);
            }
        }
    }

    /// Per-tick accounting; returns whether the running task must yield
    fn account_tick(&mut self, now: u64) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        self.total_ticks += 1;
        if current == self.idle {
            self.idle_ticks += 1;
        }
        if let Some(task) = self.tasks.get_mut(current) {
            task.cpu_ticks += 1;
        }

        // Wakeups first so a task due this tick can win the preemption check
        self.wake_expired(now);

        let (expired, priority) = match self.tasks.get_mut(current) {
            Some(task) if task.state == TaskState::Running => {
                task.slice_remaining = task.slice_remaining.saturating_sub(1);
                (task.slice_remaining == 0, task.priority)
            }
            _ => return false,
        };
        let outranked = self
            .runq
            .highest_priority()
            .is_some_and(|ready| ready > priority);

        if !(expired || outranked) {
            return false;
        }
        if let Some(task) = self.tasks.get_mut(current) {
            task.slice_remaining = task.time_slice;
        }
        true
    }

    /// Update bookkeeping for a dispatch and return what to switch, if anything
    fn plan_switch(&mut self, now: u64) -> Option<SwitchPlan> {
        let prev = self.current;
        if let Some(slot) = prev {
            let requeue = self
                .tasks
                .get(slot)
                .filter(|t| t.state == TaskState::Running)
                .map(Task::priority);
            if let Some(priority) = requeue {
                if let Some(task) = self.tasks.get_mut(slot) {
                    task.state = TaskState::Ready;
                }
                self.runq.enqueue(&mut self.tasks, slot, priority);
            }
        }

        let Some(next) = self.runq.dequeue(&mut self.tasks) else {
            fatal("ready queues empty", || self.dump(Level::Error));
        };
        match self.tasks.get(next).map(|t| t.context.is_initialized()) {
            Some(true) => {}
            Some(false) => fatal("switch to uninitialized context", || self.dump(Level::Error)),
            None => fatal("ready queue holds a dead slot", || self.dump(Level::Error)),
        }

        if prev == Some(next) {
            if let Some(task) = self.tasks.get_mut(next) {
                task.state = TaskState::Running;
            }
            return None;
        }

        let old_task = match prev {
            Some(slot) => self.tasks.get_mut(slot),
            None => None,
        };
        let (old, old_fpu) = match old_task {
            Some(task) => (
                Some(&mut task.context as *mut CpuState),
                task.fpu.as_deref_mut().map(|f| f as *mut FpuState),
            ),
            None => (None, None),
        };

        let task = self.tasks.get_mut(next)?;
        task.state = TaskState::Running;
        task.last_run = now;
        task.context_switches += 1;
        let plan = SwitchPlan {
            old,
            old_fpu,
            new: &task.context as *const CpuState,
            new_fpu: task.fpu.as_deref().map(|f| f as *const FpuState),
            privilege: task.privilege(),
        };

        self.current = Some(next);
        self.context_switches += 1;
        Some(plan)
    }

    fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            total_tasks: self.tasks.len(),
            context_switches: self.context_switches,
            idle_ticks: self.idle_ticks,
            total_ticks: self.total_ticks,
            ..SchedulerStats::default()
        };
        for task in self.tasks.iter() {
            match task.state {
                TaskState::Running => stats.running += 1,
                TaskState::Ready => stats.ready += 1,
                TaskState::Blocked => stats.blocked += 1,
                TaskState::Suspended => stats.suspended += 1,
                TaskState::Terminated => stats.terminated += 1,
            }
        }
        stats
    }

    fn dump(&self, level: Level) {
        log::log!(target: "sched", level, "  ID    NAME                              STATE      PRIO      TICKS");
        for slot in self.all.iter(&self.tasks) {
            if let Some(task) = self.tasks.get(slot) {
                log::log!(target: "sched", level, "  {:<5} {:<33} {:<10} {:<9} {}",
                    task.id.0,
                    task.name.as_str(),
                    alloc::format!("{:?}", task.state),
                    alloc::format!("{:?}", task.priority),
                    task.cpu_ticks);
            }
        }
        log::log!(target: "sched", level, "  ready: {}, waiting on events: {}, switches: {}",
            self.runq.count(), self.events.count(), self.context_switches);
    }
}

// ============================================================================
// Global scheduler
// ============================================================================

static SCHEDULER: Once<Scheduler> = Once::new();

/// Make `scheduler` the system scheduler reached by the timer interrupt
///
/// Only the first call installs; a later scheduler is dropped.
pub fn install(scheduler: Scheduler) -> &'static Scheduler {
    let mut fresh = false;
    let installed = SCHEDULER.call_once(|| {
        fresh = true;
        scheduler
    });
    if !fresh {
        warn!(target: "sched", "scheduler already installed");
    }
    installed
}

pub fn global() -> Option<&'static Scheduler> {
    SCHEDULER.get()
}

/// Timer interrupt body: advance the system clock, then tick the scheduler
pub fn timer_interrupt() {
    if let Some(clock) = timer::system_timer() {
        clock.advance();
    }
    if let Some(scheduler) = global() {
        scheduler.tick();
    }
}
