//! Kern subsystem - Core scheduling primitives
//!
//! Queues, run queues, wait/wakeup bookkeeping and the tick source that the
//! scheduler is built from.

pub mod queue;
pub mod runq;
pub mod sched_prim;
pub mod timer;

pub use queue::{Chains, QueueChain, QueueHead, Slot};
pub use runq::RunQueue;
pub use sched_prim::{BlockReason, WaitEvent, WaitQueue, WaitResult};
pub use timer::{SystemTimer, TickSource};
