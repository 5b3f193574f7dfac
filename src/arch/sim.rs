//! Software register file backend
//!
//! `SimulatedCpu` implements [`ContextSwitch`] against an in-memory register
//! file instead of the processor. "Resuming" a snapshot loads it into the
//! register file and returns, which lets the whole scheduler run on the host:
//! whatever the register file holds after a switch is the task that would now
//! be executing.
//!
//! Every operation is counted and each restore records the order in which it
//! loaded state, so tests can check the restore discipline.

use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::{ContextSwitch, CpuState, FpuState, Privilege};
use crate::types::AddressSpace;

/// One phase of a restore, in the order performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    AddressSpace,
    Selectors,
    Extended,
    Scratch,
    Resume,
}

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub saves: u64,
    pub restores: u64,
    pub switches: u64,
    pub fast_switches: u64,
    pub fpu_saves: u64,
    pub fpu_restores: u64,
    /// Restores that had to substitute selectors
    pub sanitized: u64,
}

struct SimInner {
    regs: CpuState,
    fpu: FpuState,
    stats: SimStats,
    last_restore: Vec<RestoreStep>,
    /// Resume address of every restore, oldest first
    resumed: Vec<u64>,
}

/// Simulated processor
pub struct SimulatedCpu {
    inner: Mutex<SimInner>,
}

impl SimulatedCpu {
    pub fn new() -> Self {
        Self::with_registers(CpuState::zeroed())
    }

    /// Start with `regs` loaded, as if the boot flow were running
    pub fn with_registers(regs: CpuState) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                regs,
                fpu: FpuState::new(),
                stats: SimStats::default(),
                last_restore: Vec::new(),
                resumed: Vec::new(),
            }),
        }
    }

    /// Current register file
    pub fn registers(&self) -> CpuState {
        self.inner.lock().regs
    }

    /// Overwrite the register file, modelling the running task's work
    pub fn set_registers(&self, regs: CpuState) {
        self.inner.lock().regs = regs;
    }

    /// Resume address currently loaded
    pub fn rip(&self) -> u64 {
        self.inner.lock().regs.rip
    }

    pub fn address_space(&self) -> AddressSpace {
        AddressSpace(self.inner.lock().regs.cr3)
    }

    pub fn fpu(&self) -> FpuState {
        self.inner.lock().fpu.clone()
    }

    pub fn set_fpu(&self, fpu: FpuState) {
        self.inner.lock().fpu = fpu;
    }

    pub fn stats(&self) -> SimStats {
        self.inner.lock().stats
    }

    /// Phases of the most recent restore
    pub fn last_restore(&self) -> Vec<RestoreStep> {
        self.inner.lock().last_restore.clone()
    }

    /// Resume addresses of all restores so far
    pub fn resumed(&self) -> Vec<u64> {
        self.inner.lock().resumed.clone()
    }
}

impl Default for SimulatedCpu {
    fn default() -> Self {
        Self::new()
    }
}

fn load(inner: &mut SimInner, src: &CpuState, privilege: Privilege) {
    let regs = &mut inner.regs;
    let steps = &mut inner.last_restore;
    steps.clear();

    regs.cr3 = src.cr3;
    steps.push(RestoreStep::AddressSpace);

    let mut selectors = *src;
    if selectors.sanitize(privilege) {
        inner.stats.sanitized += 1;
    }
    regs.cs = selectors.cs;
    regs.ds = selectors.ds;
    regs.es = selectors.es;
    regs.fs = selectors.fs;
    regs.gs = selectors.gs;
    regs.ss = selectors.ss;
    steps.push(RestoreStep::Selectors);

    regs.r8 = src.r8;
    regs.r9 = src.r9;
    regs.r10 = src.r10;
    regs.r11 = src.r11;
    regs.r12 = src.r12;
    regs.r13 = src.r13;
    regs.r14 = src.r14;
    regs.r15 = src.r15;
    regs.rbx = src.rbx;
    regs.rbp = src.rbp;
    regs.rcx = src.rcx;
    regs.rdx = src.rdx;
    regs.rsi = src.rsi;
    regs.rsp = src.rsp;
    regs.rflags = src.rflags;
    steps.push(RestoreStep::Extended);

    regs.rax = src.rax;
    regs.rdi = src.rdi;
    steps.push(RestoreStep::Scratch);

    regs.rip = src.rip;
    steps.push(RestoreStep::Resume);

    inner.stats.restores += 1;
    inner.resumed.push(src.rip);
}

impl ContextSwitch for SimulatedCpu {
    unsafe fn save(&self, dest: *mut CpuState) {
        let mut inner = self.inner.lock();
        *dest = inner.regs;
        inner.stats.saves += 1;
    }

    unsafe fn restore(&self, src: *const CpuState, privilege: Privilege) {
        let mut inner = self.inner.lock();
        load(&mut inner, &*src, privilege);
    }

    unsafe fn switch(&self, old: Option<*mut CpuState>, new: *const CpuState, privilege: Privilege) {
        // Copy first: `new` may be read while `old` is written on real hardware
        let target = *new;
        let mut inner = self.inner.lock();
        if let Some(old) = old {
            *old = inner.regs;
            inner.stats.saves += 1;
        }
        load(&mut inner, &target, privilege);
        inner.stats.switches += 1;
    }

    unsafe fn fast_switch(&self, old: *mut CpuState, new: *const CpuState) {
        let target = *new;
        let mut inner = self.inner.lock();
        let old = &mut *old;
        let regs = &mut inner.regs;

        old.rbx = regs.rbx;
        old.rbp = regs.rbp;
        old.r12 = regs.r12;
        old.r13 = regs.r13;
        old.r14 = regs.r14;
        old.r15 = regs.r15;
        old.rsp = regs.rsp;
        old.rip = regs.rip;

        regs.rbx = target.rbx;
        regs.rbp = target.rbp;
        regs.r12 = target.r12;
        regs.r13 = target.r13;
        regs.r14 = target.r14;
        regs.r15 = target.r15;
        regs.rsp = target.rsp;
        regs.rip = target.rip;

        inner.stats.fast_switches += 1;
    }

    unsafe fn save_fpu(&self, area: *mut FpuState) {
        let mut inner = self.inner.lock();
        (*area).region = inner.fpu.region;
        inner.stats.fpu_saves += 1;
    }

    unsafe fn restore_fpu(&self, area: *const FpuState) {
        let mut inner = self.inner.lock();
        inner.fpu.region = (*area).region;
        inner.stats.fpu_restores += 1;
    }
}
