//! Memory for task control blocks, stacks and FPU areas
//!
//! The scheduler does not manage memory itself. It consumes an [`Allocator`]
//! that hands out 16-byte aligned [`Block`]s and takes them back, and wraps
//! every block it obtains in an owning type ([`KBox`], [`StackRegion`]) that
//! returns the block on drop, so a task's memory cannot outlive the task or
//! leak on a failed creation.

use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every block handed out by an [`Allocator`]
pub const MIN_ALIGN: usize = 16;

// ============================================================================
// Blocks and the allocator contract
// ============================================================================

/// A region of memory owned by whoever holds it
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: a Block is exclusively owned; moving it between contexts moves the
// ownership of the memory with it.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// Wrap a raw region
    ///
    /// # Safety
    ///
    /// `ptr` must point to `size` bytes aligned to [`MIN_ALIGN`] that nobody
    /// else owns.
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte
    pub fn end(&self) -> usize {
        self.addr() + self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

/// Source of task memory
pub trait Allocator: Send + Sync {
    /// Allocate `size` bytes aligned to [`MIN_ALIGN`]
    fn allocate(&self, size: usize) -> Option<Block>;

    /// Return a block obtained from [`Allocator::allocate`] on this allocator
    fn free(&self, block: Block);
}

/// Allocator handle shared by the scheduler and the blocks it owns
pub type SharedAllocator = Arc<dyn Allocator>;

// ============================================================================
// Kernel heap
// ============================================================================

/// Allocator backed by the kernel's global heap
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelHeap;

impl Allocator for KernelHeap {
    fn allocate(&self, size: usize) -> Option<Block> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, MIN_ALIGN).ok()?;
        // SAFETY: layout has a non-zero size
        let ptr = NonNull::new(unsafe { alloc::alloc::alloc(layout) })?;
        // SAFETY: freshly allocated, `size` bytes, MIN_ALIGN aligned
        Some(unsafe { Block::from_raw(ptr, size) })
    }

    fn free(&self, block: Block) {
        if let Ok(layout) = Layout::from_size_align(block.size, MIN_ALIGN) {
            // SAFETY: the block was allocated above with this exact layout
            unsafe { alloc::alloc::dealloc(block.as_ptr(), layout) };
        }
    }
}

/// Allocator that caps the number of live bytes taken from `inner`
pub struct QuotaAllocator<A> {
    inner: A,
    limit: usize,
    used: AtomicUsize,
}

impl<A: Allocator> QuotaAllocator<A> {
    pub const fn new(inner: A, limit: usize) -> Self {
        Self {
            inner,
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated through this quota
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    fn reserve(&self, size: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= self.limit)
            })
            .is_ok()
    }
}

impl<A: Allocator> Allocator for QuotaAllocator<A> {
    fn allocate(&self, size: usize) -> Option<Block> {
        if !self.reserve(size) {
            log::warn!(target: "memory", "quota exhausted: {} bytes requested, {} available", size, self.available());
            return None;
        }
        let block = self.inner.allocate(size);
        if block.is_none() {
            self.used.fetch_sub(size, Ordering::AcqRel);
        }
        block
    }

    fn free(&self, block: Block) {
        self.used.fetch_sub(block.size(), Ordering::AcqRel);
        self.inner.free(block);
    }
}

// ============================================================================
// Owning wrappers
// ============================================================================

/// A value living in an allocator block, returned to the allocator on drop
pub struct KBox<T> {
    ptr: NonNull<T>,
    block: Option<Block>,
    alloc: SharedAllocator,
}

impl<T> KBox<T> {
    /// Move `value` into a block from `alloc`
    ///
    /// Returns `None` (dropping `value`) if the allocator is exhausted.
    pub fn try_new(value: T, alloc: &SharedAllocator) -> Option<Self> {
        if align_of::<T>() > MIN_ALIGN {
            return None;
        }
        let block = alloc.allocate(size_of::<T>().max(1))?;
        let ptr = block.ptr.cast::<T>();
        // SAFETY: the block holds at least size_of::<T>() bytes and
        // MIN_ALIGN >= align_of::<T>(); nothing else references it yet.
        unsafe { ptr.as_ptr().write(value) };
        Some(Self {
            ptr,
            block: Some(block),
            alloc: Arc::clone(alloc),
        })
    }

    /// Address of the backing block
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T> Deref for KBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: initialized in try_new, uniquely owned by self
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for KBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: initialized in try_new, uniquely owned by self
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for KBox<T> {
    fn drop(&mut self) {
        // SAFETY: the value is initialized and dropped exactly once
        unsafe { core::ptr::drop_in_place(self.ptr.as_ptr()) };
        if let Some(block) = self.block.take() {
            self.alloc.free(block);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for KBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// SAFETY: KBox owns its T exactly like Box does
unsafe impl<T: Send> Send for KBox<T> {}
unsafe impl<T: Sync> Sync for KBox<T> {}

/// A task stack, returned to the allocator on drop
pub struct StackRegion {
    block: Option<Block>,
    alloc: SharedAllocator,
}

impl StackRegion {
    pub fn allocate(size: usize, alloc: &SharedAllocator) -> Option<Self> {
        let block = alloc.allocate(size)?;
        Some(Self {
            block: Some(block),
            alloc: Arc::clone(alloc),
        })
    }

    /// Lowest address of the stack
    pub fn base(&self) -> usize {
        self.block.as_ref().map_or(0, Block::addr)
    }

    pub fn size(&self) -> usize {
        self.block.as_ref().map_or(0, Block::size)
    }

    /// One past the highest address; the stack grows down from here
    pub fn top(&self) -> usize {
        self.base() + self.size()
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.alloc.free(block);
        }
    }
}

impl fmt::Debug for StackRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackRegion")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size())
            .finish()
    }
}

// ============================================================================
// Global heap (bare metal)
// ============================================================================

#[cfg(target_os = "none")]
const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(target_os = "none")]
static mut HEAP_AREA: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[cfg(target_os = "none")]
#[global_allocator]
static HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Initialize memory management
///
/// Hands the static heap area to the global allocator. Must run before
/// anything allocates.
pub fn init() {
    #[cfg(target_os = "none")]
    // SAFETY: called once during early boot; HEAP_AREA is used for nothing else
    unsafe {
        HEAP.lock()
            .init(core::ptr::addr_of_mut!(HEAP_AREA).cast::<u8>(), HEAP_SIZE);
    }
}
