//! Kernel tick source
//!
//! The scheduler reads time through [`TickSource`]. [`SystemTimer`] is the
//! concrete source: a monotonic counter advanced once per timer interrupt.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Once;

/// Monotonic tick counter consumed by the scheduler
pub trait TickSource: Send + Sync {
    /// Ticks since boot
    fn now(&self) -> u64;

    /// Ticks per second
    fn frequency(&self) -> u32;
}

/// Tick counter driven by the timer interrupt
#[derive(Debug)]
pub struct SystemTimer {
    ticks: AtomicU64,
    frequency: AtomicU32,
}

impl SystemTimer {
    pub const fn new(frequency: u32) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            frequency: AtomicU32::new(frequency),
        }
    }

    /// Count one tick; returns the new tick value
    pub fn advance(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count `n` ticks at once
    pub fn advance_by(&self, n: u64) -> u64 {
        self.ticks.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn set_frequency(&self, hz: u32) {
        self.frequency.store(hz, Ordering::SeqCst);
    }
}

impl TickSource for SystemTimer {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> u32 {
        self.frequency.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Global timer
// ============================================================================

static SYSTEM_TIMER: Once<Arc<SystemTimer>> = Once::new();

/// Create the system timer (first call only) and return it
pub fn init(frequency: u32) -> Arc<SystemTimer> {
    Arc::clone(SYSTEM_TIMER.call_once(|| Arc::new(SystemTimer::new(frequency))))
}

/// The system timer, once initialized
pub fn system_timer() -> Option<&'static Arc<SystemTimer>> {
    SYSTEM_TIMER.get()
}

/// Convert milliseconds to ticks, rounding up
///
/// A non-zero duration is never shorter than one tick. Durations too long
/// to represent saturate.
pub const fn ms_to_ticks(ms: u64, frequency: u32) -> u64 {
    ms.saturating_mul(frequency as u64).div_ceil(1000)
}
