//! MyOS kernel - preemptive multitasking core
//!
//! Task control blocks, the five-level priority scheduler, execution-context
//! switching and the synchronization primitives built on top of them.

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Kernel code often needs explicit casts for register images
#![allow(clippy::unnecessary_cast)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Platform
pub mod arch;
pub mod console;
pub mod memory;
pub mod panic;

// Scheduling
pub mod kern;
pub mod scheduler;
pub mod sync;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SchedError};
pub use scheduler::{Platform, Scheduler, SchedulerStats};
pub use task::{Priority, TaskFlags, TaskInfo, TaskState};
pub use types::{AddressSpace, TaskId};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "MyOS";

/// Bring up the services the scheduler depends on
///
/// Console and logging first so later steps can report, then the kernel heap.
pub fn init(level: log::LevelFilter) {
    console::init();
    console::init_logging(level);
    memory::init();
    log::info!(target: "init", "{} v{}", NAME, VERSION);
}
