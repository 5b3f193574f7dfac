//! Execution context for task switching
//!
//! A [`CpuState`] is a complete register snapshot of a suspended task: the
//! general purpose registers, the resume address, flags, segment selectors and
//! the address-space root. The scheduler never touches registers directly; it
//! hands snapshots to a [`ContextSwitch`] backend:
//!
//! - [`x86_64::X86Switch`] on bare metal, implemented in assembly
//! - [`sim::SimulatedCpu`] everywhere else, a software register file used to
//!   run and test the scheduler on the host
//!
//! Selector values follow the boot GDT layout: null, kernel code, kernel data,
//! user code, user data.

use core::mem::{align_of, offset_of, size_of};
use static_assertions::const_assert_eq;

use crate::types::AddressSpace;

pub mod sim;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

/// Kernel code segment selector
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data segment selector
pub const KERNEL_DS: u64 = 0x10;
/// User code segment selector (RPL 3)
pub const USER_CS: u64 = 0x1B;
/// User data segment selector (RPL 3)
pub const USER_DS: u64 = 0x23;

/// Interrupt enable flag
pub const RFLAGS_IF: u64 = 1 << 9;
/// Reserved bit 1 is always set in RFLAGS
pub const RFLAGS_RESERVED: u64 = 1 << 1;
/// Flags a fresh task starts with
pub const RFLAGS_DEFAULT: u64 = RFLAGS_IF | RFLAGS_RESERVED;

/// Bytes left free above the initial stack pointer of a new task
pub const STACK_HEADROOM: usize = 16;

/// Privilege level a task executes at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Kernel,
    User,
}

impl Privilege {
    /// Code segment selector for this privilege level
    pub const fn code_selector(self) -> u64 {
        match self {
            Privilege::Kernel => KERNEL_CS,
            Privilege::User => USER_CS,
        }
    }

    /// Data/stack segment selector for this privilege level
    pub const fn data_selector(self) -> u64 {
        match self {
            Privilege::Kernel => KERNEL_DS,
            Privilege::User => USER_DS,
        }
    }
}

// ============================================================================
// Register snapshot
// ============================================================================

/// Saved register state of a suspended task
///
/// The layout is shared with the assembly backend; offsets are pinned below.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Resume address
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub ss: u64,
    /// Address-space root, loaded before anything else on restore
    pub cr3: u64,
}

const_assert_eq!(offset_of!(CpuState, rax), 0);
const_assert_eq!(offset_of!(CpuState, rbx), 8);
const_assert_eq!(offset_of!(CpuState, rcx), 16);
const_assert_eq!(offset_of!(CpuState, rdx), 24);
const_assert_eq!(offset_of!(CpuState, rsi), 32);
const_assert_eq!(offset_of!(CpuState, rdi), 40);
const_assert_eq!(offset_of!(CpuState, rbp), 48);
const_assert_eq!(offset_of!(CpuState, rsp), 56);
const_assert_eq!(offset_of!(CpuState, r8), 64);
const_assert_eq!(offset_of!(CpuState, r12), 96);
const_assert_eq!(offset_of!(CpuState, r15), 120);
const_assert_eq!(offset_of!(CpuState, rip), 128);
const_assert_eq!(offset_of!(CpuState, rflags), 136);
const_assert_eq!(offset_of!(CpuState, cs), 144);
const_assert_eq!(offset_of!(CpuState, ds), 152);
const_assert_eq!(offset_of!(CpuState, es), 160);
const_assert_eq!(offset_of!(CpuState, fs), 168);
const_assert_eq!(offset_of!(CpuState, gs), 176);
const_assert_eq!(offset_of!(CpuState, ss), 184);
const_assert_eq!(offset_of!(CpuState, cr3), 192);
const_assert_eq!(size_of::<CpuState>(), 200);

impl CpuState {
    /// An all-zero snapshot; not resumable until initialized
    pub const fn zeroed() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
            cr3: 0,
        }
    }

    /// Snapshot that starts executing `entry` on a fresh stack
    ///
    /// The stack pointer is placed [`STACK_HEADROOM`] bytes below `stack_top`
    /// and kept 16-byte aligned. Interrupts are enabled in the saved flags.
    pub fn for_entry(
        entry: usize,
        stack_top: usize,
        privilege: Privilege,
        space: AddressSpace,
    ) -> Self {
        let sp = (stack_top.saturating_sub(STACK_HEADROOM) & !0xF) as u64;
        let data = privilege.data_selector();
        Self {
            rip: entry as u64,
            rsp: sp,
            rbp: sp,
            rflags: RFLAGS_DEFAULT,
            cs: privilege.code_selector(),
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            cr3: space.raw(),
            ..Self::zeroed()
        }
    }

    /// Whether the snapshot has a resume address
    pub fn is_initialized(&self) -> bool {
        self.rip != 0
    }

    pub fn address_space(&self) -> AddressSpace {
        AddressSpace(self.cr3)
    }

    /// Whether every selector matches `privilege`
    ///
    /// FS and GS may also be null.
    pub fn selectors_valid(&self, privilege: Privilege) -> bool {
        let data = privilege.data_selector();
        self.cs == privilege.code_selector()
            && self.ss == data
            && self.ds == data
            && self.es == data
            && (self.fs == data || self.fs == 0)
            && (self.gs == data || self.gs == 0)
    }

    /// Replace inconsistent selectors with the defaults for `privilege`
    ///
    /// Returns `true` if anything was substituted.
    pub fn sanitize(&mut self, privilege: Privilege) -> bool {
        if self.selectors_valid(privilege) {
            return false;
        }
        log::warn!(
            target: "arch",
            "corrupt selectors (cs={:#x} ss={:#x}) for {:?} context, using defaults",
            self.cs,
            self.ss,
            privilege
        );
        let data = privilege.data_selector();
        self.cs = privilege.code_selector();
        self.ds = data;
        self.es = data;
        self.fs = data;
        self.gs = data;
        self.ss = data;
        true
    }

    /// General purpose registers in layout order
    pub fn general_purpose(&self) -> [u64; 16] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.rbp, self.rsp,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
        ]
    }
}

// ============================================================================
// FPU area
// ============================================================================

/// Legacy FXSAVE area: x87, MMX and SSE state
#[repr(C, align(16))]
#[derive(Clone, PartialEq, Eq)]
pub struct FpuState {
    pub region: [u8; 512],
}

const_assert_eq!(size_of::<FpuState>(), 512);
const_assert_eq!(align_of::<FpuState>(), 16);

/// Default x87 control word: all exceptions masked, round to nearest
const FCW_DEFAULT: u16 = 0x037F;
/// Default MXCSR: all SSE exceptions masked
const MXCSR_DEFAULT: u32 = 0x1F80;

impl FpuState {
    pub const fn new() -> Self {
        Self { region: [0; 512] }
    }

    /// State a task starts with when it first enables the FPU
    pub fn initial() -> Self {
        let mut state = Self::new();
        state.region[0..2].copy_from_slice(&FCW_DEFAULT.to_le_bytes());
        state.region[24..28].copy_from_slice(&MXCSR_DEFAULT.to_le_bytes());
        state
    }

    pub fn control_word(&self) -> u16 {
        u16::from_le_bytes([self.region[0], self.region[1]])
    }

    pub fn mxcsr(&self) -> u32 {
        u32::from_le_bytes([
            self.region[24],
            self.region[25],
            self.region[26],
            self.region[27],
        ])
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FpuState")
            .field("fcw", &format_args!("{:#06x}", self.control_word()))
            .field("mxcsr", &format_args!("{:#010x}", self.mxcsr()))
            .finish()
    }
}

// ============================================================================
// Platform boundary
// ============================================================================

/// Save/restore primitive used by the scheduler
///
/// All methods transfer control or touch processor state and are `unsafe`.
/// Callers guarantee that snapshot pointers are valid, that no other code
/// reads a snapshot while it is being saved, and that the scheduler lock is
/// not held across the call.
pub trait ContextSwitch: Send + Sync {
    /// Write the current register state to `dest`
    ///
    /// Resuming from the snapshot looks like a return from this call.
    ///
    /// # Safety
    ///
    /// `dest` must be valid for writes.
    unsafe fn save(&self, dest: *mut CpuState);

    /// Resume execution from `src`
    ///
    /// The address space is switched first, then selectors are checked
    /// against `privilege`, then registers are loaded with the scratch
    /// registers last. On hardware this does not return.
    ///
    /// # Safety
    ///
    /// `src` must hold an initialized snapshot.
    unsafe fn restore(&self, src: *const CpuState, privilege: Privilege);

    /// Save into `old` (skipped when `None`) and restore `new`
    ///
    /// # Safety
    ///
    /// As for [`ContextSwitch::save`] and [`ContextSwitch::restore`]; `old`
    /// and `new` must not alias.
    unsafe fn switch(&self, old: Option<*mut CpuState>, new: *const CpuState, privilege: Privilege);

    /// Callee-saved-only switch between two kernel flows
    ///
    /// # Safety
    ///
    /// Both sides must have been suspended by an ordinary call, never from
    /// inside an interrupt handler, and run at the same privilege level.
    unsafe fn fast_switch(&self, old: *mut CpuState, new: *const CpuState);

    /// Store FPU/SSE state into `area`
    ///
    /// # Safety
    ///
    /// `area` must be valid for writes.
    unsafe fn save_fpu(&self, area: *mut FpuState);

    /// Load FPU/SSE state from `area`
    ///
    /// # Safety
    ///
    /// `area` must hold state produced by `save_fpu` or [`FpuState::initial`].
    unsafe fn restore_fpu(&self, area: *const FpuState);
}

// ============================================================================
// Processor control
// ============================================================================

/// Run `f` with interrupts masked, restoring the previous state afterwards
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::without_interrupts(f)
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        f()
    }
}

/// Idle until the next interrupt
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: enabling interrupts and halting is the idle loop's whole job
    unsafe {
        core::arch::asm!("sti", "hlt", options(nomem, nostack));
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    core::hint::spin_loop();
}

/// Stop the processor for good
pub fn halt() -> ! {
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: masking interrupts and halting has no memory effects
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }

        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        core::hint::spin_loop();
    }
}
