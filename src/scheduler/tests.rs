use super::*;
use crate::arch::RFLAGS_IF;
use crate::config::TASK_NAME_MAX;
use crate::testing::{spin_entry, Fixture, KERNEL_SPACE};

fn running(fx: &Fixture) -> Vec<TaskId> {
    fx.sched
        .tasks()
        .into_iter()
        .filter(|t| t.state == TaskState::Running)
        .map(|t| t.id)
        .collect()
}

// ============================================================================
// Construction and dispatch
// ============================================================================

#[test]
fn test_new_scheduler_has_only_idle() {
    let fx = Fixture::new();
    assert!(!fx.sched.is_started());
    assert_eq!(fx.sched.current_id(), None);

    let idle = fx.sched.task_info(TaskId::IDLE).unwrap();
    assert_eq!(idle.state, TaskState::Ready);
    assert_eq!(idle.priority, Priority::Idle);
    assert!(idle.flags.contains(TaskFlags::KERNEL | TaskFlags::SYSTEM));
    assert_eq!(fx.sched.stats().total_tasks, 1);
}

#[test]
fn test_rejects_invalid_config() {
    let cpu: Arc<dyn ContextSwitch> = Arc::new(crate::arch::sim::SimulatedCpu::new());
    let clock: Arc<dyn TickSource> = Arc::new(crate::kern::timer::SystemTimer::new(1000));
    let platform = Platform {
        cpu,
        alloc: Arc::new(crate::memory::KernelHeap),
        clock,
        kernel_space: KERNEL_SPACE,
    };
    let result = Scheduler::new(SchedulerConfig::new().with_quantum(0), platform);
    assert_eq!(result.err(), Some(SchedError::InvalidArgument("quantum")));
}

#[test]
fn test_start_dispatches_idle_when_alone() {
    let fx = Fixture::new();
    fx.sched.start();
    assert_eq!(fx.sched.current_id(), Some(TaskId::IDLE));
    assert_eq!(fx.cpu.stats().switches, 1);
    // First dispatch has nothing to save
    assert_eq!(fx.cpu.stats().saves, 0);

    fx.sched.start();
    assert_eq!(fx.cpu.stats().switches, 1);
}

#[test]
fn test_highest_priority_runs_first() {
    let fx = Fixture::new();
    fx.spawn("normal", Priority::Normal);
    let critical = fx.spawn("critical", Priority::Critical);
    fx.spawn("low", Priority::Low);
    fx.sched.start();
    assert_eq!(fx.sched.current_id(), Some(critical));
}

#[test]
fn test_round_robin_within_level() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    let c = fx.spawn("c", Priority::Normal);
    fx.sched.start();

    let mut order = Vec::new();
    for _ in 0..6 {
        order.push(fx.sched.current_id().unwrap());
        fx.sched.yield_now();
    }
    assert_eq!(order, [a, b, c, a, b, c]);
}

#[test]
fn test_yield_keeps_cpu_without_peers() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    fx.sched.start();
    let switches = fx.sched.stats().context_switches;

    fx.sched.yield_now();
    assert_eq!(fx.sched.current_id(), Some(a));
    assert_eq!(fx.sched.stats().context_switches, switches);
    assert_eq!(fx.sched.state(TaskId::IDLE), Ok(TaskState::Ready));
}

#[test]
fn test_exactly_one_running_task() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::High);
    fx.sched.start();
    assert_eq!(running(&fx), [b]);

    fx.sched.suspend(b).unwrap();
    assert_eq!(running(&fx), [a]);
    fx.sched.sleep(10).unwrap();
    assert_eq!(running(&fx), [TaskId::IDLE]);
}

// ============================================================================
// Tick
// ============================================================================

#[test]
fn test_slice_expiry_preempts_after_exact_ticks() {
    let fx = Fixture::with_config(SchedulerConfig::new().with_quantum(5));
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    fx.sched.start();

    fx.tick_n(4);
    assert_eq!(fx.sched.current_id(), Some(a));
    assert_eq!(fx.sched.task_info(a).unwrap().slice_remaining, 1);

    fx.tick();
    assert_eq!(fx.sched.current_id(), Some(b));
    let info = fx.sched.task_info(a).unwrap();
    assert_eq!(info.state, TaskState::Ready);
    assert_eq!(info.slice_remaining, 5);
    assert_eq!(info.cpu_ticks, 5);
}

#[test]
fn test_tick_accounting() {
    let fx = Fixture::new();
    fx.sched.tick();
    // Nothing runs before start
    assert_eq!(fx.sched.stats().total_ticks, 0);

    fx.sched.start();
    fx.tick_n(3);
    let stats = fx.sched.stats();
    assert_eq!(stats.total_ticks, 3);
    assert_eq!(stats.idle_ticks, 3);
    assert_eq!(fx.sched.task_info(TaskId::IDLE).unwrap().cpu_ticks, 3);
}

#[test]
fn test_ready_higher_priority_preempts_on_tick() {
    let fx = Fixture::new();
    let low = fx.spawn("low", Priority::Low);
    let high = fx.spawn("high", Priority::High);
    fx.sched.suspend(high).unwrap();
    fx.sched.start();
    assert_eq!(fx.sched.current_id(), Some(low));

    // Resume alone does not preempt
    fx.sched.resume(high).unwrap();
    assert_eq!(fx.sched.current_id(), Some(low));

    fx.tick();
    assert_eq!(fx.sched.current_id(), Some(high));
    assert_eq!(fx.sched.state(low), Ok(TaskState::Ready));
}

#[test]
fn test_equal_priority_does_not_preempt() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    fx.spawn("b", Priority::Normal);
    fx.sched.start();
    fx.tick_n(10);
    assert_eq!(fx.sched.current_id(), Some(a));
}

#[test]
fn test_reentered_tick_is_ignored() {
    let fx = Fixture::new();
    fx.sched.start();
    fx.sched.in_tick.store(true, Ordering::SeqCst);
    fx.tick();
    assert_eq!(fx.sched.stats().total_ticks, 0);

    fx.sched.in_tick.store(false, Ordering::SeqCst);
    fx.tick();
    assert_eq!(fx.sched.stats().total_ticks, 1);
}

// ============================================================================
// Sleep and waits
// ============================================================================

#[test]
fn test_sleep_wakes_exactly_at_deadline() {
    let fx = Fixture::new();
    let sleeper = fx.spawn("sleeper", Priority::High);
    fx.spawn("worker", Priority::Normal);
    fx.sched.start();
    fx.tick_n(7);

    assert_eq!(fx.sched.current_id(), Some(sleeper));
    fx.sched.sleep(100).unwrap();
    let info = fx.sched.task_info(sleeper).unwrap();
    assert_eq!(info.state, TaskState::Blocked);
    assert_eq!(info.wake_at, Some(107));

    fx.tick_n(99);
    assert_eq!(fx.sched.state(sleeper), Ok(TaskState::Blocked));

    fx.tick();
    assert_eq!(fx.timer.now(), 107);
    // Woken and, being the highest priority, dispatched in the same tick
    assert_eq!(fx.sched.current_id(), Some(sleeper));
    let info = fx.sched.task_info(sleeper).unwrap();
    assert_eq!(info.wake_at, None);
    assert_eq!(info.wait_result, WaitResult::Normal);

    for _ in 0..200 {
        fx.tick();
        assert_ne!(fx.sched.state(sleeper), Ok(TaskState::Blocked));
    }
}

#[test]
fn test_sleep_rounds_up_to_ticks() {
    let fx = Fixture::new();
    fx.timer.set_frequency(100);
    let a = fx.spawn("a", Priority::Normal);
    fx.sched.start();

    fx.sched.sleep(15).unwrap();
    // 15ms at 100Hz is 1.5 ticks
    assert_eq!(fx.sched.task_info(a).unwrap().wake_at, Some(2));
}

#[test]
fn test_sleep_saturates_long_duration() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    fx.sched.start();
    fx.tick_n(3);

    fx.sched.sleep(u64::MAX).unwrap();
    let info = fx.sched.task_info(a).unwrap();
    assert_eq!(info.state, TaskState::Blocked);
    assert_eq!(info.wake_at, Some(3 + u64::MAX / 1000 + 1));

    fx.tick_n(10);
    assert_eq!(fx.sched.state(a), Ok(TaskState::Blocked));
}

#[test]
fn test_sleep_zero_yields() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    fx.sched.start();

    fx.sched.sleep(0).unwrap();
    assert_eq!(fx.sched.state(a), Ok(TaskState::Ready));
    assert_eq!(fx.sched.current_id(), Some(b));
}

#[test]
fn test_sleep_preconditions() {
    let fx = Fixture::new();
    assert_eq!(fx.sched.sleep(10), Err(SchedError::NotRunning));
    fx.sched.start();
    assert_eq!(fx.sched.sleep(10), Err(SchedError::Forbidden));
    assert_eq!(fx.sched.state(TaskId::IDLE), Ok(TaskState::Running));
}

#[test]
fn test_wait_for_notify() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    let c = fx.spawn("c", Priority::Normal);
    fx.sched.start();

    assert_eq!(fx.sched.wait_for(0x40, None), Ok(WaitResult::Waiting));
    assert_eq!(fx.sched.wait_for(0x40, None), Ok(WaitResult::Waiting));
    assert_eq!(fx.sched.current_id(), Some(c));
    assert!(!fx.sched.notify(0x41));

    assert!(fx.sched.notify(0x40));
    assert_eq!(fx.sched.state(a), Ok(TaskState::Ready));
    assert_eq!(fx.sched.state(b), Ok(TaskState::Blocked));
    assert_eq!(fx.sched.task_info(a).unwrap().wait_result, WaitResult::Normal);

    assert!(fx.sched.notify(0x40));
    assert!(!fx.sched.notify(0x40));
}

#[test]
fn test_broadcast_wakes_all() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    fx.spawn("c", Priority::Normal);
    fx.sched.start();

    fx.sched.wait_for(9, None).unwrap();
    fx.sched.wait_for(9, Some(1000)).unwrap();
    assert_eq!(fx.sched.broadcast(9), 2);
    assert_eq!(fx.sched.state(a), Ok(TaskState::Ready));
    assert_eq!(fx.sched.state(b), Ok(TaskState::Ready));
    assert_eq!(fx.sched.task_info(b).unwrap().wake_at, None);
    assert_eq!(fx.sched.broadcast(9), 0);
}

#[test]
fn test_wait_for_times_out() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    fx.sched.start();

    fx.sched.wait_for(5, Some(20)).unwrap();
    assert_eq!(fx.sched.current_id(), Some(TaskId::IDLE));
    fx.tick_n(19);
    assert_eq!(fx.sched.state(a), Ok(TaskState::Blocked));
    fx.tick();
    assert_eq!(fx.sched.current_id(), Some(a));
    assert_eq!(fx.sched.task_info(a).unwrap().wait_result, WaitResult::TimedOut);

    // Already off the event queue
    assert!(!fx.sched.notify(5));
}

#[test]
fn test_wait_for_zero_timeout_polls() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    assert_eq!(fx.sched.wait_for(1, Some(0)), Err(SchedError::NotRunning));
    fx.sched.start();
    assert_eq!(fx.sched.wait_for(1, Some(0)), Ok(WaitResult::TimedOut));
    assert_eq!(fx.sched.current_id(), Some(a));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_create_initializes_context() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let info = fx.sched.task_info(a).unwrap();
    assert_eq!(a, TaskId::FIRST);
    assert_eq!(info.state, TaskState::Ready);
    assert_eq!(info.address_space, KERNEL_SPACE);
    assert_eq!(info.parent, None);
    assert_eq!(info.stack_size, SchedulerConfig::new().stack_size);

    let ctx = fx.sched.with_state(|st| *st.tasks.by_id(a).unwrap().context());
    assert_eq!(ctx.rip, spin_entry as usize as u64);
    assert!(ctx.rsp > info.stack_base as u64);
    assert!(ctx.rsp < (info.stack_base + info.stack_size) as u64);
    assert_eq!(ctx.rsp % 16, 0);
    assert_ne!(ctx.rflags & RFLAGS_IF, 0);
    assert_eq!(ctx.cr3, KERNEL_SPACE.raw());
    assert_eq!(ctx.cs, Privilege::Kernel.code_selector());
}

#[test]
fn test_user_task_gets_user_selectors() {
    let fx = Fixture::new();
    let id = fx
        .sched
        .create("shell", spin_entry, Priority::Normal, TaskFlags::USER)
        .unwrap();
    let ctx = fx.sched.with_state(|st| *st.tasks.by_id(id).unwrap().context());
    assert_eq!(ctx.cs, Privilege::User.code_selector());
    assert_eq!(ctx.ss, Privilege::User.data_selector());
}

#[test]
fn test_children_inherit_address_space() {
    let fx = Fixture::new();
    let parent = fx.spawn("parent", Priority::Normal);
    let space = AddressSpace(0x0080_0000);
    fx.sched.set_address_space(parent, space).unwrap();
    fx.sched.start();
    assert_eq!(fx.cpu.address_space(), space);
    assert_eq!(
        fx.sched.set_address_space(parent, KERNEL_SPACE),
        Err(SchedError::InvalidState(TaskState::Running))
    );

    let child = fx.spawn("child", Priority::Normal);
    let info = fx.sched.task_info(child).unwrap();
    assert_eq!(info.address_space, space);
    assert_eq!(info.parent, Some(parent));
}

#[test]
fn test_ids_are_never_reused() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    fx.sched.destroy(a).unwrap();
    let b = fx.spawn("b", Priority::Normal);
    assert_ne!(a, b);
    assert!(b > a);
}

#[test]
fn test_kernel_task_defaults() {
    let fx = Fixture::new();
    let id = fx.sched.kernel_task("logger", spin_entry).unwrap();
    let info = fx.sched.task_info(id).unwrap();
    assert_eq!(info.priority, Priority::Normal);
    assert_eq!(info.flags, TaskFlags::KERNEL | TaskFlags::SYSTEM);
}

#[test]
fn test_long_names_are_truncated() {
    let fx = Fixture::new();
    let id = fx.spawn(&"n".repeat(80), Priority::Normal);
    assert_eq!(fx.sched.name(id).unwrap().len(), TASK_NAME_MAX);
}

#[test]
fn test_create_out_of_memory_leaks_nothing() {
    let config = SchedulerConfig::new().with_stack_size(64 * 1024);
    let fx = Fixture::with_quota(config, 100 * 1024);
    let before = fx.quota.used();

    // The TCB fits; the stack does not
    let result = fx
        .sched
        .create("big", spin_entry, Priority::Normal, TaskFlags::KERNEL);
    assert_eq!(result, Err(SchedError::OutOfMemory));
    assert_eq!(fx.quota.used(), before);
    assert_eq!(fx.sched.stats().total_tasks, 1);
}

/// Quota that holds the idle task plus one plain task, with `spare` bytes over
fn one_task_quota(spare: usize) -> usize {
    let sizing = Fixture::new();
    sizing.spawn("plain", Priority::Normal);
    sizing.quota.used() + spare
}

#[test]
fn test_create_fpu_task_out_of_memory_leaks_nothing() {
    // TCB and stack fit; the 512 byte FPU area does not
    let fx = Fixture::with_quota(SchedulerConfig::new(), one_task_quota(256));
    let before = fx.quota.used();

    let result = fx.sched.create(
        "fpu",
        spin_entry,
        Priority::Normal,
        TaskFlags::KERNEL | TaskFlags::FPU,
    );
    assert_eq!(result, Err(SchedError::OutOfMemory));
    assert_eq!(fx.quota.used(), before);
    assert_eq!(fx.sched.stats().total_tasks, 1);

    // The same budget still takes a task without an FPU area
    assert!(fx.sched.kernel_task("plain", spin_entry).is_ok());
}

#[test]
fn test_enable_fpu_out_of_memory() {
    let fx = Fixture::with_quota(SchedulerConfig::new(), one_task_quota(256));
    let a = fx.spawn("a", Priority::Normal);
    let used = fx.quota.used();

    assert_eq!(fx.sched.enable_fpu(a), Err(SchedError::OutOfMemory));
    assert_eq!(fx.quota.used(), used);
    let info = fx.sched.task_info(a).unwrap();
    assert!(!info.has_fpu);
    assert!(!info.flags.contains(TaskFlags::FPU));
}

#[test]
fn test_task_limit_is_enforced() {
    let fx = Fixture::with_config(SchedulerConfig::new().with_max_tasks(3));
    fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    assert_eq!(
        fx.sched.kernel_task("c", spin_entry),
        Err(SchedError::OutOfMemory)
    );

    fx.sched.destroy(b).unwrap();
    assert!(fx.sched.kernel_task("c", spin_entry).is_ok());
}

#[test]
fn test_destroy_errors() {
    let fx = Fixture::new();
    assert_eq!(fx.sched.destroy(TaskId(42)), Err(SchedError::NotFound(TaskId(42))));
    assert_eq!(fx.sched.destroy(TaskId::IDLE), Err(SchedError::Forbidden));

    let a = fx.spawn("a", Priority::Normal);
    fx.sched.start();
    assert_eq!(
        fx.sched.destroy(a),
        Err(SchedError::InvalidState(TaskState::Running))
    );
}

#[test]
fn test_destroy_suspended_releases_memory() {
    let fx = Fixture::new();
    let baseline = fx.quota.used();
    let a = fx
        .sched
        .create("fpu", spin_entry, Priority::Normal, TaskFlags::KERNEL | TaskFlags::FPU)
        .unwrap();
    assert!(fx.sched.task_info(a).unwrap().has_fpu);
    assert!(fx.quota.used() > baseline);

    fx.sched.suspend(a).unwrap();
    fx.sched.destroy(a).unwrap();
    assert_eq!(fx.quota.used(), baseline);
    assert!(fx.sched.task_info(a).is_none());
    assert!(fx.sched.tasks().iter().all(|t| t.id != a));
    assert_eq!(fx.sched.state(a), Err(SchedError::NotFound(a)));
}

#[test]
fn test_destroy_ready_and_blocked() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    fx.sched.start();

    fx.sched.wait_for(3, None).unwrap();
    assert_eq!(fx.sched.current_id(), Some(b));
    fx.sched.destroy(a).unwrap();
    assert!(!fx.sched.notify(3));

    fx.sched.yield_now();
    assert_eq!(fx.sched.current_id(), Some(b));
}

#[test]
fn test_suspend_and_resume() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);

    fx.sched.suspend(b).unwrap();
    assert_eq!(fx.sched.state(b), Ok(TaskState::Suspended));
    assert_eq!(
        fx.sched.suspend(b),
        Err(SchedError::InvalidState(TaskState::Suspended))
    );
    assert_eq!(
        fx.sched.resume(a),
        Err(SchedError::InvalidState(TaskState::Ready))
    );
    assert_eq!(fx.sched.suspend(TaskId::IDLE), Err(SchedError::Forbidden));

    fx.sched.start();
    fx.sched.suspend(a).unwrap();
    assert_eq!(fx.sched.current_id(), Some(TaskId::IDLE));

    fx.sched.resume(b).unwrap();
    assert_eq!(fx.sched.state(b), Ok(TaskState::Ready));
    fx.tick();
    assert_eq!(fx.sched.current_id(), Some(b));
}

#[test]
fn test_suspend_blocked_is_rejected() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    fx.sched.start();
    fx.sched.sleep(50).unwrap();
    assert_eq!(
        fx.sched.suspend(a),
        Err(SchedError::InvalidState(TaskState::Blocked))
    );
}

#[test]
fn test_exit_then_reap() {
    let fx = Fixture::new();
    let baseline = fx.quota.used();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    fx.sched.start();

    fx.sched.exit(3).unwrap();
    let info = fx.sched.task_info(a).unwrap();
    assert_eq!(info.state, TaskState::Terminated);
    assert_eq!(info.exit_code, Some(3));
    assert_eq!(fx.sched.current_id(), Some(b));
    assert_eq!(fx.sched.stats().terminated, 1);

    // Terminated tasks are never dispatched again
    fx.sched.yield_now();
    assert_eq!(fx.sched.current_id(), Some(b));

    fx.sched.exit(0).unwrap();
    assert_eq!(fx.sched.current_id(), Some(TaskId::IDLE));
    assert_eq!(fx.sched.reap_terminated(), 2);
    assert_eq!(fx.quota.used(), baseline);
}

#[test]
fn test_exit_preconditions() {
    let fx = Fixture::new();
    assert_eq!(fx.sched.exit(0), Err(SchedError::NotRunning));
    fx.sched.start();
    assert_eq!(fx.sched.exit(0), Err(SchedError::Forbidden));
}

#[test]
fn test_idle_always_schedulable() {
    let fx = Fixture::new();
    let ids: Vec<_> = (0..4)
        .map(|i| fx.spawn("t", Priority::ALL[1 + i % 4]))
        .collect();
    fx.sched.start();

    let check = |fx: &Fixture| {
        let idle = fx.sched.state(TaskId::IDLE).unwrap();
        assert!(matches!(idle, TaskState::Ready | TaskState::Running));
        assert_eq!(running(fx).len(), 1);
    };

    fx.sched.suspend(ids[0]).unwrap();
    check(&fx);
    fx.sched.sleep(5).unwrap();
    check(&fx);
    for &id in &ids[1..] {
        let _ = fx.sched.suspend(id);
        check(&fx);
    }
    fx.tick_n(10);
    check(&fx);
    let _ = fx.sched.exit(1);
    check(&fx);
    for &id in &ids {
        let _ = fx.sched.suspend(id);
        let _ = fx.sched.destroy(id);
        check(&fx);
    }
    assert_eq!(fx.sched.current_id(), Some(TaskId::IDLE));
}

#[test]
fn test_set_priority_requeues() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Low);
    assert_eq!(fx.sched.set_priority(TaskId::IDLE, Priority::High), Err(SchedError::Forbidden));

    fx.sched.set_priority(b, Priority::High).unwrap();
    assert_eq!(fx.sched.priority(b), Ok(Priority::High));
    fx.sched.start();
    assert_eq!(fx.sched.current_id(), Some(b));

    fx.sched.set_priority(b, Priority::Low).unwrap();
    fx.sched.yield_now();
    assert_eq!(fx.sched.current_id(), Some(a));
}

#[test]
fn test_quantum_applies_to_new_tasks() {
    let fx = Fixture::new();
    let before = fx.spawn("before", Priority::Normal);
    assert_eq!(fx.sched.set_quantum(0), Err(SchedError::InvalidArgument("quantum")));
    fx.sched.set_quantum(7).unwrap();
    assert_eq!(fx.sched.quantum(), 7);

    let after = fx.spawn("after", Priority::Normal);
    assert_eq!(fx.sched.task_info(before).unwrap().time_slice, 50);
    assert_eq!(fx.sched.task_info(after).unwrap().time_slice, 7);
}

// ============================================================================
// Context switching
// ============================================================================

#[test]
fn test_switch_round_trip_preserves_registers() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    fx.sched.start();
    assert_eq!(fx.sched.current_id(), Some(a));

    // a runs for a while and dirties its registers
    let mut live = fx.cpu.registers();
    live.rax = 0xAAAA;
    live.rbx = 0xBBBB;
    live.r15 = 0x1515;
    live.rip = 0x0040_1234;
    fx.cpu.set_registers(live);

    fx.sched.yield_now();
    assert_eq!(fx.sched.current_id(), Some(b));
    let b_entry = fx.sched.with_state(|st| *st.tasks.by_id(b).unwrap().context());
    assert_eq!(fx.cpu.rip(), b_entry.rip);

    fx.sched.yield_now();
    assert_eq!(fx.sched.current_id(), Some(a));
    assert_eq!(fx.cpu.registers().general_purpose(), live.general_purpose());
    assert_eq!(fx.cpu.rip(), 0x0040_1234);
    assert_eq!(fx.cpu.resumed().last(), Some(&0x0040_1234));
}

#[test]
fn test_fpu_state_follows_task() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    fx.sched.enable_fpu(a).unwrap();
    fx.sched.start();
    assert_eq!(fx.cpu.stats().fpu_restores, 1);
    assert_eq!(fx.cpu.fpu().control_word(), 0x037F);

    fx.sched.yield_now();
    assert_eq!(fx.sched.current_id(), Some(b));
    assert_eq!(fx.cpu.stats().fpu_saves, 1);

    fx.sched.disable_fpu(a).unwrap();
    assert!(!fx.sched.task_info(a).unwrap().has_fpu);
    fx.sched.yield_now();
    assert_eq!(fx.cpu.stats().fpu_restores, 1);
}

#[test]
fn test_context_switch_counters() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    fx.spawn("b", Priority::Normal);
    fx.sched.start();
    fx.sched.yield_now();
    fx.sched.yield_now();

    assert_eq!(fx.sched.stats().context_switches, 3);
    assert_eq!(fx.cpu.stats().switches, 3);
    assert_eq!(fx.sched.task_info(a).unwrap().context_switches, 2);
}

#[test]
fn test_stats_by_state() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    let b = fx.spawn("b", Priority::Normal);
    fx.spawn("c", Priority::Normal);
    fx.sched.suspend(b).unwrap();
    fx.sched.start();
    assert_eq!(fx.sched.current_id(), Some(a));
    fx.sched.sleep(10).unwrap();

    let stats = fx.sched.stats();
    assert_eq!(stats.total_tasks, 4);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.blocked, 1);
    assert_eq!(stats.suspended, 1);
    assert_eq!(stats.terminated, 0);

    fx.sched.dump_tasks();
}

// ============================================================================
// Fatal paths
// ============================================================================

#[test]
#[should_panic(expected = "fatal: ready queues empty")]
fn test_empty_ready_queues_halt() {
    let fx = Fixture::new();
    fx.sched.start();
    fx.sched.with_state(|st| {
        let idle = st.idle;
        if let Some(task) = st.tasks.get_mut(idle) {
            task.state = TaskState::Blocked;
        }
    });
    fx.sched.yield_now();
}

#[test]
#[should_panic(expected = "fatal: switch to uninitialized context")]
fn test_uninitialized_context_halts() {
    let fx = Fixture::new();
    let a = fx.spawn("a", Priority::Normal);
    fx.sched.with_state(|st| {
        if let Some(task) = st.tasks.by_id_mut(a) {
            task.context = CpuState::zeroed();
        }
    });
    fx.sched.start();
}

// ============================================================================
// Global handle
// ============================================================================

#[test]
fn test_timer_interrupt_drives_installed_scheduler() {
    let clock = timer::init(1000);
    let cpu: Arc<dyn ContextSwitch> = Arc::new(crate::arch::sim::SimulatedCpu::new());
    let tick_source: Arc<dyn TickSource> = clock.clone();
    let sched = Scheduler::new(
        SchedulerConfig::new(),
        Platform {
            cpu,
            alloc: Arc::new(crate::memory::KernelHeap),
            clock: tick_source,
            kernel_space: KERNEL_SPACE,
        },
    )
    .unwrap();

    let installed = install(sched);
    assert!(core::ptr::eq(installed, global().unwrap()));
    installed.start();

    let before = clock.now();
    timer_interrupt();
    timer_interrupt();
    assert_eq!(clock.now(), before + 2);
    assert_eq!(installed.stats().total_ticks, 2);
}
