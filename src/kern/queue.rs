//! Index-linked queues for kernel data structures
//!
//! Doubly-linked lists whose linkage is embedded in the queued objects, as in
//! the classic kernel queue, but with arena slot indices in place of raw
//! pointers. An object can sit on several queues at once by carrying one
//! [`QueueChain`] per queue kind; the kind is a marker type `L`, so a queue
//! can only ever walk the chain field it owns.
//!
//! The arena implements [`Chains<L>`] for every chain kind it embeds.
//!
//! ```ignore
//! struct Item {
//!     all: QueueChain,
//!     run: QueueChain,
//! }
//!
//! let mut queue: QueueHead<RunLink> = QueueHead::new();
//! queue.enqueue_tail(&mut arena, slot);
//! ```

use core::marker::PhantomData;

/// Index of an object in its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub usize);

// ============================================================================
// Queue Entry
// ============================================================================

/// Queue linkage embedded in a queued object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueChain {
    next: Option<Slot>,
    prev: Option<Slot>,
    linked: bool,
}

impl QueueChain {
    pub const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            linked: false,
        }
    }

    /// Check if this entry is linked into a queue
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn next(&self) -> Option<Slot> {
        self.next
    }

    pub fn prev(&self) -> Option<Slot> {
        self.prev
    }

    fn unlink(&mut self) {
        *self = Self::new();
    }
}

/// Arena access to the `L` chain of each object
pub trait Chains<L> {
    fn chain(&self, slot: Slot) -> Option<&QueueChain>;
    fn chain_mut(&mut self, slot: Slot) -> Option<&mut QueueChain>;
}

// ============================================================================
// Queue Head
// ============================================================================

/// A queue over the `L` chains of an arena
#[derive(Debug)]
pub struct QueueHead<L> {
    first: Option<Slot>,
    last: Option<Slot>,
    len: usize,
    _kind: PhantomData<L>,
}

impl<L> QueueHead<L> {
    pub const fn new() -> Self {
        Self {
            first: None,
            last: None,
            len: 0,
            _kind: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn first(&self) -> Option<Slot> {
        self.first
    }

    pub fn last(&self) -> Option<Slot> {
        self.last
    }

    /// Append `slot`; returns `false` if it is missing or already linked
    pub fn enqueue_tail<S: Chains<L> + ?Sized>(&mut self, store: &mut S, slot: Slot) -> bool {
        match store.chain_mut(slot) {
            Some(chain) if !chain.linked => {
                chain.linked = true;
                chain.prev = self.last;
                chain.next = None;
            }
            _ => return false,
        }
        match self.last.and_then(|last| store.chain_mut(last)) {
            Some(last) => last.next = Some(slot),
            None => self.first = Some(slot),
        }
        self.last = Some(slot);
        self.len += 1;
        true
    }

    /// Remove and return the first entry
    pub fn dequeue_head<S: Chains<L> + ?Sized>(&mut self, store: &mut S) -> Option<Slot> {
        let slot = self.first?;
        self.remove(store, slot);
        Some(slot)
    }

    /// Unlink `slot` from anywhere in the queue
    ///
    /// The caller guarantees that a linked `slot` is linked into this queue.
    pub fn remove<S: Chains<L> + ?Sized>(&mut self, store: &mut S, slot: Slot) -> bool {
        let (prev, next) = match store.chain_mut(slot) {
            Some(chain) if chain.linked => {
                let links = (chain.prev, chain.next);
                chain.unlink();
                links
            }
            _ => return false,
        };

        match prev.and_then(|p| store.chain_mut(p)) {
            Some(p) => p.next = next,
            None => self.first = next,
        }
        match next.and_then(|n| store.chain_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.last = prev,
        }
        self.len -= 1;
        true
    }

    /// Walk the queue front to back
    pub fn iter<'a, S: Chains<L> + ?Sized>(&self, store: &'a S) -> QueueIter<'a, L, S> {
        QueueIter {
            store,
            next: self.first,
            _kind: PhantomData,
        }
    }
}

impl<L> Default for QueueHead<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Front-to-back iterator over a queue
pub struct QueueIter<'a, L, S: ?Sized> {
    store: &'a S,
    next: Option<Slot>,
    _kind: PhantomData<L>,
}

impl<L, S: Chains<L> + ?Sized> Iterator for QueueIter<'_, L, S> {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        let slot = self.next?;
        self.next = self.store.chain(slot).and_then(QueueChain::next);
        Some(slot)
    }
}

#[cfg(test)]
impl<L> Chains<L> for alloc::vec::Vec<QueueChain> {
    fn chain(&self, slot: Slot) -> Option<&QueueChain> {
        self.get(slot.0)
    }

    fn chain_mut(&mut self, slot: Slot) -> Option<&mut QueueChain> {
        self.get_mut(slot.0)
    }
}
