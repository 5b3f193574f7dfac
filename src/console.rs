//! Console output and kernel logging
//!
//! Provides basic text output for kernel diagnostics and the backend for the
//! `log` facade. On bare metal the console writes to the COM1 serial port; in
//! test builds output is captured in a fixed buffer instead.

use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// COM1 data port
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const COM1: u16 = 0x3F8;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
struct Serial {
    port: u16,
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl Serial {
    const fn new(port: u16) -> Self {
        Self { port }
    }

    fn line_status(&self) -> u8 {
        let value: u8;
        // SAFETY: reading the line status register has no side effects
        unsafe {
            core::arch::asm!("in al, dx", out("al") value, in("dx") self.port + 5, options(nomem, nostack));
        }
        value
    }

    fn putc(&self, c: u8) {
        // Wait for the transmit holding register to drain
        while self.line_status() & 0x20 == 0 {
            core::hint::spin_loop();
        }
        // SAFETY: COM1 is owned by the console
        unsafe {
            core::arch::asm!("out dx, al", in("dx") self.port, in("al") c, options(nomem, nostack));
        }
    }
}

/// Console writer interface
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<4096>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() {
                let _ = self.buffer.push(byte as char);
            }
        }

        #[cfg(all(not(test), target_arch = "x86_64", target_os = "none"))]
        Serial::new(COM1).putc(byte);

        #[cfg(all(not(test), not(all(target_arch = "x86_64", target_os = "none"))))]
        let _ = byte;
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }

    /// Clear the console
    pub fn clear(&mut self) {
        #[cfg(test)]
        self.buffer.clear();
    }

    /// Captured output (test builds only)
    #[cfg(test)]
    pub fn captured(&self) -> &str {
        &self.buffer
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Initialize the console subsystem
pub fn init() {
    CONSOLE.lock().clear();
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    // Console::write_str never fails
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// ============================================================================
// Logging backend
// ============================================================================

/// `log` backend writing level-tagged lines to the console
pub struct KernelLogger {
    level: LevelFilter,
}

impl KernelLogger {
    const fn new(level: LevelFilter) -> Self {
        Self { level }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        print(format_args!(
            "[{}] {}: {}\n",
            tag,
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: Once<KernelLogger> = Once::new();

/// Install the console logger
///
/// Only the first call installs a logger; later calls just adjust the level.
pub fn init_logging(level: LevelFilter) {
    let logger = LOGGER.call_once(|| KernelLogger::new(level));
    // Another logger may already be installed (e.g. by a test harness)
    let _ = log::set_logger(logger);
    log::set_max_level(level);
}
