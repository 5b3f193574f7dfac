//! Panic and fatal-halt paths

use core::panic::PanicInfo;

/// Halt on a broken scheduler invariant
///
/// Logs `reason`, lets the caller print its diagnostic state, then panics. On
/// bare metal the panic handler prints the location and stops the processor.
#[cold]
pub fn fatal(reason: &str, diagnostics: impl FnOnce()) -> ! {
    log::error!(target: "panic", "FATAL: {}", reason);
    diagnostics();
    panic!("fatal: {}", reason);
}

pub fn kernel_panic(info: &PanicInfo) -> ! {
    crate::println!("\n!!! KERNEL PANIC !!!");

    if let Some(location) = info.location() {
        crate::println!("Location: {}:{}", location.file(), location.line());
    }

    crate::println!("Message: {}", info.message());
    crate::println!("System halted.");

    crate::arch::halt()
}
