//! Task control blocks
//!
//! A [`Task`] is the scheduler's record of one schedulable flow of execution:
//! its identity, state, priority, saved registers, stack, optional FPU area,
//! timing and accounting. Tasks live in a [`TaskTable`] arena and are linked
//! into queues by slot index:
//!
//! - every live task is on the global list ([`GlobalLink`] chain)
//! - a task is on a ready queue ([`RunLink`] chain) exactly while it is Ready

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::mem::align_of;
use static_assertions::const_assert;

use crate::arch::{CpuState, FpuState, Privilege};
use crate::config::TASK_NAME_MAX;
use crate::kern::queue::{Chains, QueueChain, Slot};
use crate::kern::sched_prim::{BlockReason, WaitResult};
use crate::memory::{KBox, StackRegion, MIN_ALIGN};
use crate::types::{AddressSpace, TaskId};

/// Task entry point
pub type TaskEntry = extern "C" fn() -> !;

/// Bounded task name
pub type TaskName = heapless::String<TASK_NAME_MAX>;

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Executing on the processor
    Running,
    /// Waiting in a ready queue
    Ready,
    /// Sleeping or waiting for an event or lock
    Blocked,
    /// Stopped until explicitly resumed
    Suspended,
    /// Exited; kept until destroyed
    Terminated,
}

/// Scheduling priority, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Idle,
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const COUNT: usize = 5;

    /// All levels, lowest first
    pub const ALL: [Priority; Self::COUNT] = [
        Priority::Idle,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Ready-queue index; higher runs first
    pub const fn level(self) -> usize {
        self as usize
    }

    pub fn from_level(level: usize) -> Option<Self> {
        Self::ALL.get(level).copied()
    }
}

bitflags! {
    /// Origin and capability flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaskFlags: u32 {
        const KERNEL = 1 << 0;
        const USER = 1 << 1;
        const SYSTEM = 1 << 2;
        const DAEMON = 1 << 3;
        /// The task uses the FPU; its FPU area is switched with it
        const FPU = 1 << 4;
    }
}

impl TaskFlags {
    /// Privilege level the task's context runs at
    pub fn privilege(self) -> Privilege {
        if self.contains(TaskFlags::USER) {
            Privilege::User
        } else {
            Privilege::Kernel
        }
    }
}

/// Copy `name` into a bounded name, truncating on a char boundary
pub fn task_name(name: &str) -> TaskName {
    let mut out = TaskName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Marker for the global task list chain
#[derive(Debug)]
pub enum GlobalLink {}

/// Marker for the ready queue chain
#[derive(Debug)]
pub enum RunLink {}

// ============================================================================
// Task control block
// ============================================================================

/// Task control block
#[derive(Debug)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: TaskName,
    pub(crate) state: TaskState,
    pub(crate) priority: Priority,
    pub(crate) flags: TaskFlags,
    /// Valid only while the task is not Running
    pub(crate) context: CpuState,
    pub(crate) fpu: Option<KBox<FpuState>>,
    pub(crate) stack: Option<StackRegion>,
    pub(crate) address_space: AddressSpace,
    /// Creating task; informational only
    pub(crate) parent: Option<TaskId>,

    pub(crate) created_at: u64,
    pub(crate) cpu_ticks: u64,
    pub(crate) last_run: u64,
    pub(crate) context_switches: u64,
    /// Configured slice length in ticks
    pub(crate) time_slice: u32,
    /// Never exceeds `time_slice`
    pub(crate) slice_remaining: u32,

    /// Deadline of a sleep or timed wait
    pub(crate) wake_at: Option<u64>,
    pub(crate) block: Option<BlockReason>,
    /// Outcome of the last blocking wait
    pub(crate) wait_result: WaitResult,
    pub(crate) exit_code: Option<i32>,

    pub(crate) all_link: QueueChain,
    pub(crate) run_link: QueueChain,
}

// TCBs are placed in allocator blocks
const_assert!(align_of::<Task>() <= MIN_ALIGN);

impl Task {
    /// A Ready TCB without stack or context; the scheduler fills those in
    pub(crate) fn new(
        id: TaskId,
        name: &str,
        priority: Priority,
        flags: TaskFlags,
        time_slice: u32,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            name: task_name(name),
            state: TaskState::Ready,
            priority,
            flags,
            context: CpuState::zeroed(),
            fpu: None,
            stack: None,
            address_space: AddressSpace::default(),
            parent: None,
            created_at,
            cpu_ticks: 0,
            last_run: 0,
            context_switches: 0,
            time_slice,
            slice_remaining: time_slice,
            wake_at: None,
            block: None,
            wait_result: WaitResult::Normal,
            exit_code: None,
            all_link: QueueChain::new(),
            run_link: QueueChain::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn privilege(&self) -> Privilege {
        self.flags.privilege()
    }

    /// Saved register snapshot
    pub fn context(&self) -> &CpuState {
        &self.context
    }

    /// Snapshot of the task's bookkeeping
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            priority: self.priority,
            flags: self.flags,
            parent: self.parent,
            address_space: self.address_space,
            created_at: self.created_at,
            cpu_ticks: self.cpu_ticks,
            last_run: self.last_run,
            context_switches: self.context_switches,
            time_slice: self.time_slice,
            slice_remaining: self.slice_remaining,
            wake_at: self.wake_at,
            wait_result: self.wait_result,
            exit_code: self.exit_code,
            stack_base: self.stack.as_ref().map_or(0, StackRegion::base),
            stack_size: self.stack.as_ref().map_or(0, StackRegion::size),
            has_fpu: self.fpu.is_some(),
        }
    }
}

/// Point-in-time view of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: TaskName,
    pub state: TaskState,
    pub priority: Priority,
    pub flags: TaskFlags,
    pub parent: Option<TaskId>,
    pub address_space: AddressSpace,
    pub created_at: u64,
    pub cpu_ticks: u64,
    pub last_run: u64,
    pub context_switches: u64,
    pub time_slice: u32,
    pub slice_remaining: u32,
    pub wake_at: Option<u64>,
    /// Outcome of the last blocking wait
    pub wait_result: WaitResult,
    pub exit_code: Option<i32>,
    pub stack_base: usize,
    pub stack_size: usize,
    pub has_fpu: bool,
}

// ============================================================================
// Task arena
// ============================================================================

/// Arena of TCBs addressed by [`Slot`]
///
/// Slots of destroyed tasks are reused; task IDs never are.
#[derive(Debug, Default)]
pub struct TaskTable {
    slots: Vec<Option<KBox<Task>>>,
    free: Vec<Slot>,
    index: BTreeMap<TaskId, Slot>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn insert(&mut self, task: KBox<Task>) -> Slot {
        let id = task.id;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot.0] = Some(task);
                slot
            }
            None => {
                self.slots.push(Some(task));
                Slot(self.slots.len() - 1)
            }
        };
        self.index.insert(id, slot);
        slot
    }

    /// Take the TCB out of the arena; dropping it releases its memory
    pub fn remove(&mut self, slot: Slot) -> Option<KBox<Task>> {
        let task = self.slots.get_mut(slot.0)?.take()?;
        self.index.remove(&task.id);
        self.free.push(slot);
        Some(task)
    }

    pub fn slot_of(&self, id: TaskId) -> Option<Slot> {
        self.index.get(&id).copied()
    }

    pub fn get(&self, slot: Slot) -> Option<&Task> {
        self.slots.get(slot.0)?.as_deref()
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut Task> {
        self.slots.get_mut(slot.0)?.as_deref_mut()
    }

    pub fn by_id(&self, id: TaskId) -> Option<&Task> {
        self.get(self.slot_of(id)?)
    }

    pub fn by_id_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let slot = self.slot_of(id)?;
        self.get_mut(slot)
    }

    /// Live tasks in ID order
    pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.index.values().filter_map(|&slot| self.get(slot))
    }
}

impl Chains<GlobalLink> for TaskTable {
    fn chain(&self, slot: Slot) -> Option<&QueueChain> {
        self.get(slot).map(|t| &t.all_link)
    }

    fn chain_mut(&mut self, slot: Slot) -> Option<&mut QueueChain> {
        self.get_mut(slot).map(|t| &mut t.all_link)
    }
}

impl Chains<RunLink> for TaskTable {
    fn chain(&self, slot: Slot) -> Option<&QueueChain> {
        self.get(slot).map(|t| &t.run_link)
    }

    fn chain_mut(&mut self, slot: Slot) -> Option<&mut QueueChain> {
        self.get_mut(slot).map(|t| &mut t.run_link)
    }
}
