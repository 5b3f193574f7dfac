//! MyOS kernel binary entry point
//!
//! On bare-metal x86_64 this boots the scheduler with a few demo kernel
//! tasks. Hosted builds produce an empty binary; the library is exercised by
//! its unit tests.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod kernel {
    use alloc::sync::Arc;
    use core::panic::PanicInfo;
    use myos_kernel::arch::x86_64::{self as cpu, X86Switch};
    use myos_kernel::config::{SchedulerConfig, DEFAULT_TICK_HZ};
    use myos_kernel::kern::timer;
    use myos_kernel::scheduler::{self, Platform, Scheduler};
    use myos_kernel::{println, Priority, TaskFlags};

    /// Kernel entry point for x86_64
    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        myos_kernel::init(log::LevelFilter::Info);
        println!("\n=== {} v{} ===", myos_kernel::NAME, myos_kernel::VERSION);

        cpu::init();
        let clock = timer::init(DEFAULT_TICK_HZ);

        let platform = Platform {
            cpu: Arc::new(X86Switch),
            alloc: Arc::new(myos_kernel::memory::KernelHeap),
            clock,
            kernel_space: cpu::current_address_space(),
        };
        let sched = match Scheduler::new(SchedulerConfig::default(), platform) {
            Ok(sched) => scheduler::install(sched),
            Err(e) => panic!("scheduler: {}", e),
        };

        for (name, entry, priority) in [
            ("ping", ping as extern "C" fn() -> !, Priority::Normal),
            ("pong", pong, Priority::Normal),
            ("reporter", reporter, Priority::Normal),
        ] {
            if let Err(e) = sched.create(name, entry, priority, TaskFlags::KERNEL) {
                log::warn!(target: "init", "could not start {}: {}", name, e);
            }
        }
        sched.dump_tasks();

        sched.start();

        // Only reached if the first dispatch fails to leave the boot flow
        myos_kernel::arch::halt()
    }

    fn sched() -> &'static Scheduler {
        match scheduler::global() {
            Some(sched) => sched,
            None => myos_kernel::arch::halt(),
        }
    }

    extern "C" fn ping() -> ! {
        let mut round = 0u64;
        loop {
            println!("ping {}", round);
            round += 1;
            sched().yield_now();
        }
    }

    extern "C" fn pong() -> ! {
        let mut round = 0u64;
        loop {
            println!("pong {}", round);
            round += 1;
            sched().yield_now();
        }
    }

    extern "C" fn reporter() -> ! {
        let sched = sched();
        let stats = sched.stats();
        println!(
            "{} tasks, {} context switches",
            stats.total_tasks, stats.context_switches
        );
        if let Err(e) = sched.exit(0) {
            log::warn!(target: "init", "reporter could not exit: {}", e);
        }
        myos_kernel::arch::halt()
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        myos_kernel::panic::kernel_panic(info)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
