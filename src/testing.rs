//! Test fixtures: a scheduler on the simulated CPU with a hand-driven clock

use alloc::sync::Arc;

use crate::arch::sim::SimulatedCpu;
use crate::arch::ContextSwitch;
use crate::config::SchedulerConfig;
use crate::kern::timer::{SystemTimer, TickSource};
use crate::memory::{KernelHeap, QuotaAllocator, SharedAllocator};
use crate::scheduler::{Platform, Scheduler};
use crate::task::{Priority, TaskFlags};
use crate::types::{AddressSpace, TaskId};

/// Address space handed to tasks created before the first dispatch
pub(crate) const KERNEL_SPACE: AddressSpace = AddressSpace(0x0010_0000);

/// Byte budget of the fixture allocator
pub(crate) const QUOTA: usize = 1024 * 1024;

/// Body for test tasks; never actually entered on the simulated CPU
pub(crate) extern "C" fn spin_entry() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

pub(crate) struct Fixture {
    pub sched: Scheduler,
    pub cpu: Arc<SimulatedCpu>,
    pub timer: Arc<SystemTimer>,
    pub quota: Arc<QuotaAllocator<KernelHeap>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::new())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::with_quota(config, QUOTA)
    }

    pub fn with_quota(config: SchedulerConfig, bytes: usize) -> Self {
        let cpu = Arc::new(SimulatedCpu::new());
        let timer = Arc::new(SystemTimer::new(crate::config::DEFAULT_TICK_HZ));
        let quota = Arc::new(QuotaAllocator::new(KernelHeap, bytes));

        let switch: Arc<dyn ContextSwitch> = cpu.clone();
        let clock: Arc<dyn TickSource> = timer.clone();
        let alloc: SharedAllocator = quota.clone();
        let sched = Scheduler::new(
            config,
            Platform {
                cpu: switch,
                alloc,
                clock,
                kernel_space: KERNEL_SPACE,
            },
        )
        .expect("fixture scheduler");

        Self {
            sched,
            cpu,
            timer,
            quota,
        }
    }

    /// Create a kernel task running `spin_entry`
    pub fn spawn(&self, name: &str, priority: Priority) -> TaskId {
        self.sched
            .create(name, spin_entry, priority, TaskFlags::KERNEL)
            .expect("spawn")
    }

    /// One timer interrupt
    pub fn tick(&self) {
        self.timer.advance();
        self.sched.tick();
    }

    pub fn tick_n(&self, n: u64) {
        for _ in 0..n {
            self.tick();
        }
    }
}
