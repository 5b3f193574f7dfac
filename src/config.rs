//! Scheduler configuration
//!
//! Boot-time tunables for the scheduler. Values are validated once when the
//! scheduler is built; the quantum can be changed later through
//! [`crate::scheduler::Scheduler::set_quantum`].

use crate::error::{Result, SchedError};

/// Maximum task name length in bytes (longer names are truncated)
pub const TASK_NAME_MAX: usize = 32;

/// Default time slice, in ticks
pub const DEFAULT_QUANTUM_TICKS: u32 = 50;

/// Upper bound for the time slice, in ticks
pub const MAX_QUANTUM_TICKS: u32 = 1000;

/// Default per-task stack size (8KB)
pub const DEFAULT_STACK_SIZE: usize = 8192;

/// Smallest stack accepted by the configuration
pub const MIN_STACK_SIZE: usize = 1024;

/// Default upper bound on live tasks, idle task included
pub const DEFAULT_MAX_TASKS: usize = 256;

/// Default timer frequency
pub const DEFAULT_TICK_HZ: u32 = 1000;

/// Scheduler configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time slice given to each task, in ticks
    pub quantum_ticks: u32,
    /// Stack size allocated for each task
    pub stack_size: usize,
    /// Maximum number of live tasks, idle task included
    pub max_tasks: usize,
}

impl SchedulerConfig {
    pub const fn new() -> Self {
        Self {
            quantum_ticks: DEFAULT_QUANTUM_TICKS,
            stack_size: DEFAULT_STACK_SIZE,
            max_tasks: DEFAULT_MAX_TASKS,
        }
    }

    pub const fn with_quantum(mut self, ticks: u32) -> Self {
        self.quantum_ticks = ticks;
        self
    }

    pub const fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub const fn with_max_tasks(mut self, count: usize) -> Self {
        self.max_tasks = count;
        self
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<()> {
        validate_quantum(self.quantum_ticks)?;
        if self.stack_size < MIN_STACK_SIZE || self.stack_size % 16 != 0 {
            return Err(SchedError::InvalidArgument("stack size"));
        }
        // Idle plus at least one created task
        if self.max_tasks < 2 {
            return Err(SchedError::InvalidArgument("max tasks"));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a time slice length
pub fn validate_quantum(ticks: u32) -> Result<()> {
    if ticks == 0 || ticks > MAX_QUANTUM_TICKS {
        Err(SchedError::InvalidArgument("quantum"))
    } else {
        Ok(())
    }
}
