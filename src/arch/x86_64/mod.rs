//! x86_64 context switch backend
//!
//! Assembly implementation of [`ContextSwitch`] over the [`CpuState`] layout.
//! Restores go through `iretq` so the selectors, flags and stack pointer are
//! loaded atomically with the resume address.

use core::arch::{asm, global_asm};
use core::mem::offset_of;

use crate::arch::{ContextSwitch, CpuState, FpuState, Privilege, KERNEL_CS, KERNEL_DS, RFLAGS_IF};
use crate::types::AddressSpace;

// ============================================================================
// GDT
// ============================================================================

// Null, kernel code, kernel data, user code, user data. Indices match the
// selector constants in `arch`.
global_asm!(
    ".section .rodata",
    ".align 16",
    "sched_gdt:",
    "    .quad 0",                  // Null descriptor
    "    .quad 0x00AF9A000000FFFF", // Kernel code (64-bit, DPL 0)
    "    .quad 0x00AF92000000FFFF", // Kernel data (DPL 0)
    "    .quad 0x00AFFA000000FFFF", // User code (64-bit, DPL 3)
    "    .quad 0x00AFF2000000FFFF", // User data (DPL 3)
    "sched_gdt_end:",
    ".align 8",
    "sched_gdt_pointer:",
    "    .short sched_gdt_end - sched_gdt - 1",
    "    .quad sched_gdt",
);

global_asm!(
    ".section .text",
    ".global sched_gdt_load",
    "sched_gdt_load:",
    "    lgdt [rip + sched_gdt_pointer]",
    "    mov ax, {kds}",
    "    mov ds, ax",
    "    mov es, ax",
    "    mov ss, ax",
    "    mov fs, ax",
    "    mov gs, ax",
    // Reload CS with a far return
    "    pop rax",
    "    push {kcs}",
    "    push rax",
    "    retfq",
    kcs = const KERNEL_CS,
    kds = const KERNEL_DS,
);

// ============================================================================
// Save / restore
// ============================================================================

global_asm!(
    ".section .text",
    // ctx_save(dest: *mut CpuState)
    ".global ctx_save",
    "ctx_save:",
    "    mov [rdi + {rax}], rax",
    "    mov [rdi + {rbx}], rbx",
    "    mov [rdi + {rcx}], rcx",
    "    mov [rdi + {rdx}], rdx",
    "    mov [rdi + {rsi}], rsi",
    "    mov [rdi + {rdi}], rdi",
    "    mov [rdi + {rbp}], rbp",
    "    mov [rdi + {r8}], r8",
    "    mov [rdi + {r9}], r9",
    "    mov [rdi + {r10}], r10",
    "    mov [rdi + {r11}], r11",
    "    mov [rdi + {r12}], r12",
    "    mov [rdi + {r13}], r13",
    "    mov [rdi + {r14}], r14",
    "    mov [rdi + {r15}], r15",
    // Resume as a return from this call
    "    lea rax, [rsp + 8]",
    "    mov [rdi + {rsp}], rax",
    "    mov rax, [rsp]",
    "    mov [rdi + {rip}], rax",
    "    pushfq",
    "    pop qword ptr [rdi + {rflags}]",
    "    xor eax, eax",
    "    mov ax, cs",
    "    mov [rdi + {cs}], rax",
    "    mov ax, ds",
    "    mov [rdi + {ds}], rax",
    "    mov ax, es",
    "    mov [rdi + {es}], rax",
    "    mov ax, fs",
    "    mov [rdi + {fs}], rax",
    "    mov ax, gs",
    "    mov [rdi + {gs}], rax",
    "    mov ax, ss",
    "    mov [rdi + {ss}], rax",
    "    mov rax, cr3",
    "    mov [rdi + {cr3}], rax",
    "    mov rax, [rdi + {rax}]",
    "    ret",
    "",
    // ctx_restore(src: *const CpuState) -> !
    ".global ctx_restore",
    "ctx_restore:",
    // Address space before anything that may depend on it
    "    mov rax, [rdi + {cr3}]",
    "    test rax, rax",
    "    jz .Lctx_restore_segments",
    "    mov rdx, cr3",
    "    cmp rax, rdx",
    "    je .Lctx_restore_segments",
    "    mov cr3, rax",
    ".Lctx_restore_segments:",
    "    mov rax, [rdi + {ds}]",
    "    mov ds, ax",
    "    mov rax, [rdi + {es}]",
    "    mov es, ax",
    "    mov rax, [rdi + {fs}]",
    "    mov fs, ax",
    "    mov rax, [rdi + {gs}]",
    "    mov gs, ax",
    // iretq frame: ss, rsp, rflags, cs, rip
    "    push qword ptr [rdi + {ss}]",
    "    push qword ptr [rdi + {rsp}]",
    "    push qword ptr [rdi + {rflags}]",
    "    push qword ptr [rdi + {cs}]",
    "    push qword ptr [rdi + {rip}]",
    // Extended registers, then the two used as scratch here
    "    mov r8, [rdi + {r8}]",
    "    mov r9, [rdi + {r9}]",
    "    mov r10, [rdi + {r10}]",
    "    mov r11, [rdi + {r11}]",
    "    mov r12, [rdi + {r12}]",
    "    mov r13, [rdi + {r13}]",
    "    mov r14, [rdi + {r14}]",
    "    mov r15, [rdi + {r15}]",
    "    mov rbx, [rdi + {rbx}]",
    "    mov rbp, [rdi + {rbp}]",
    "    mov rcx, [rdi + {rcx}]",
    "    mov rdx, [rdi + {rdx}]",
    "    mov rsi, [rdi + {rsi}]",
    "    mov rax, [rdi + {rax}]",
    "    mov rdi, [rdi + {rdi}]",
    "    iretq",
    "",
    // ctx_switch(old: *mut CpuState or null, new: *const CpuState)
    ".global ctx_switch",
    "ctx_switch:",
    "    test rdi, rdi",
    "    jz .Lctx_switch_restore",
    "    push rsi",
    "    call ctx_save",
    "    pop rsi",
    // The snapshot must resume after ctx_switch, not inside it
    "    lea rax, [rsp + 8]",
    "    mov [rdi + {rsp}], rax",
    "    mov rax, [rsp]",
    "    mov [rdi + {rip}], rax",
    ".Lctx_switch_restore:",
    "    mov rdi, rsi",
    "    jmp ctx_restore",
    "",
    // ctx_fast_switch(old: *mut CpuState, new: *const CpuState)
    ".global ctx_fast_switch",
    "ctx_fast_switch:",
    "    mov [rdi + {rbx}], rbx",
    "    mov [rdi + {rbp}], rbp",
    "    mov [rdi + {r12}], r12",
    "    mov [rdi + {r13}], r13",
    "    mov [rdi + {r14}], r14",
    "    mov [rdi + {r15}], r15",
    "    lea rax, [rsp + 8]",
    "    mov [rdi + {rsp}], rax",
    "    mov rax, [rsp]",
    "    mov [rdi + {rip}], rax",
    "    mov rbx, [rsi + {rbx}]",
    "    mov rbp, [rsi + {rbp}]",
    "    mov r12, [rsi + {r12}]",
    "    mov r13, [rsi + {r13}]",
    "    mov r14, [rsi + {r14}]",
    "    mov r15, [rsi + {r15}]",
    "    mov rsp, [rsi + {rsp}]",
    "    jmp qword ptr [rsi + {rip}]",
    rax = const offset_of!(CpuState, rax),
    rbx = const offset_of!(CpuState, rbx),
    rcx = const offset_of!(CpuState, rcx),
    rdx = const offset_of!(CpuState, rdx),
    rsi = const offset_of!(CpuState, rsi),
    rdi = const offset_of!(CpuState, rdi),
    rbp = const offset_of!(CpuState, rbp),
    rsp = const offset_of!(CpuState, rsp),
    r8 = const offset_of!(CpuState, r8),
    r9 = const offset_of!(CpuState, r9),
    r10 = const offset_of!(CpuState, r10),
    r11 = const offset_of!(CpuState, r11),
    r12 = const offset_of!(CpuState, r12),
    r13 = const offset_of!(CpuState, r13),
    r14 = const offset_of!(CpuState, r14),
    r15 = const offset_of!(CpuState, r15),
    rip = const offset_of!(CpuState, rip),
    rflags = const offset_of!(CpuState, rflags),
    cs = const offset_of!(CpuState, cs),
    ds = const offset_of!(CpuState, ds),
    es = const offset_of!(CpuState, es),
    fs = const offset_of!(CpuState, fs),
    gs = const offset_of!(CpuState, gs),
    ss = const offset_of!(CpuState, ss),
    cr3 = const offset_of!(CpuState, cr3),
);

extern "sysv64" {
    fn sched_gdt_load();
    fn ctx_save(dest: *mut CpuState);
    fn ctx_restore(src: *const CpuState) -> !;
    fn ctx_switch(old: *mut CpuState, new: *const CpuState);
    fn ctx_fast_switch(old: *mut CpuState, new: *const CpuState);
}

/// Hardware context switch backend
#[derive(Debug, Default)]
pub struct X86Switch;

impl X86Switch {
    pub const fn new() -> Self {
        Self
    }
}

/// Validated copy of `src` for the restore path
///
/// # Safety
///
/// `src` must be valid for reads.
unsafe fn checked(src: *const CpuState, privilege: Privilege) -> CpuState {
    let mut state = *src;
    state.sanitize(privilege);
    state
}

impl ContextSwitch for X86Switch {
    unsafe fn save(&self, dest: *mut CpuState) {
        ctx_save(dest);
    }

    unsafe fn restore(&self, src: *const CpuState, privilege: Privilege) {
        let state = checked(src, privilege);
        ctx_restore(&state)
    }

    unsafe fn switch(&self, old: Option<*mut CpuState>, new: *const CpuState, privilege: Privilege) {
        let state = checked(new, privilege);
        ctx_switch(old.unwrap_or(core::ptr::null_mut()), &state);
    }

    unsafe fn fast_switch(&self, old: *mut CpuState, new: *const CpuState) {
        ctx_fast_switch(old, new);
    }

    unsafe fn save_fpu(&self, area: *mut FpuState) {
        asm!("fxsave64 [{}]", in(reg) area, options(nostack, preserves_flags));
    }

    unsafe fn restore_fpu(&self, area: *const FpuState) {
        asm!("fxrstor64 [{}]", in(reg) area, options(nostack, preserves_flags));
    }
}

// ============================================================================
// Processor control
// ============================================================================

/// Load the scheduler GDT, mask the legacy PICs and enable SSE for
/// FXSAVE/FXRSTOR
///
/// PIC lines stay masked until the interrupt layer installs its IDT and
/// routes the timer to [`crate::scheduler::timer_interrupt`].
pub fn init() {
    // SAFETY: early boot, single flow; the GDT keeps the boot selector values
    unsafe {
        sched_gdt_load();

        asm!("out 0x21, al", "out 0xA1, al", in("al") 0xFFu8, options(nomem, nostack));

        let mut cr0: u64;
        asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
        cr0 &= !(1 << 2); // Clear EM
        cr0 |= 1 << 1; // Set MP
        asm!("mov cr0, {}", in(reg) cr0, options(nomem, nostack));

        let mut cr4: u64;
        asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack));
        cr4 |= 3 << 9; // OSFXSR | OSXMMEXCPT
        asm!("mov cr4, {}", in(reg) cr4, options(nomem, nostack));
    }
}

/// Address space the kernel booted with
pub fn current_address_space() -> AddressSpace {
    let cr3: u64;
    // SAFETY: reading CR3 has no side effects
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
    }
    AddressSpace(cr3)
}

pub fn enable_interrupts() {
    // SAFETY: unrouted PIC lines are masked by `init`
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let flags: u64;
    // SAFETY: pushfq/pop only touch the stack
    unsafe {
        asm!("pushfq", "pop {}", "cli", out(reg) flags, options(nomem));
    }
    let result = f();
    if flags & RFLAGS_IF != 0 {
        enable_interrupts();
    }
    result
}
