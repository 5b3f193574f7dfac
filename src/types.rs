//! Common types used across the kernel
//!
//! This module defines shared types to avoid circular dependencies.

use core::fmt;

/// Task identifier
///
/// Identifiers are handed out by the scheduler in increasing order and are
/// never reused while the system is up. `TaskId(0)` is reserved for the idle
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskId(pub u32);

impl TaskId {
    /// The idle task
    pub const IDLE: Self = TaskId(0);

    /// First identifier issued to a created task
    pub const FIRST: Self = TaskId(1);

    /// Is this the idle task?
    pub const fn is_idle(self) -> bool {
        self.0 == 0
    }

    /// The identifier that follows this one
    pub(crate) const fn next(self) -> Self {
        TaskId(self.0 + 1)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque address-space handle
///
/// The scheduler stores and swaps it on context switch but never looks inside.
/// On x86_64 it carries the page-table root loaded into CR3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AddressSpace(pub u64);

impl AddressSpace {
    /// Raw handle value
    pub const fn raw(self) -> u64 {
        self.0
    }
}
