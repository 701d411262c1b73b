//! A bounded pool of buffers an [`Output`](crate::backend::drm::output::Output)
//! cycles through across commits, with buffer-age tracking so a renderer can
//! do incremental damage instead of repainting whole frames.
//!
//! Grounded on `smithay`'s `allocator::swapchain::{Swapchain, Slot}`:
//! acquired-state lives in an `Arc<AtomicBool>` cloned into every handle out
//! of a slot, so dropping the last handle releases the slot automatically
//! (no separate release call to forget). This version narrows the slot
//! count to three (the triple-buffering bound named in this crate's data
//! model, rather than `smithay`'s four) and adds per-slot age tracking.

use std::ops::Deref;
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc, Mutex, MutexGuard,
};

use crate::backend::allocator::{Allocator, Buffer, Format, Fourcc, Modifier};

/// Maximum number of buffers a swapchain will keep alive at once.
pub const SLOT_CAP: usize = 3;

/// A pool of up to [`SLOT_CAP`] buffers of a fixed size/format, allocated
/// lazily and recycled as they're released.
pub struct Swapchain<A: Allocator> {
    allocator: A,
    width: u32,
    height: u32,
    fourcc: Fourcc,
    modifiers: Vec<Modifier>,
    slots: [Slot<A::Buffer>; SLOT_CAP],
}

/// A handle to one buffer in a [`Swapchain`]. Clones share the same
/// acquired/age/userdata state; once every clone is dropped the slot becomes
/// available for [`Swapchain::acquire`] again.
pub struct Slot<B> {
    buffer: Arc<Option<B>>,
    acquired: Arc<AtomicBool>,
    age: Arc<AtomicU8>,
    userdata: Arc<Mutex<Option<Box<dyn std::any::Any + Send>>>>,
}

impl<B> Slot<B> {
    /// Frames elapsed since this slot's buffer was last the one committed to
    /// the output; `0` means it holds the most recently displayed contents,
    /// `255` (the saturating cap) means "treat as never shown, repaint fully".
    pub fn age(&self) -> u8 {
        self.age.load(Ordering::Acquire)
    }

    /// Attach arbitrary caller state to this slot (e.g. a cached framebuffer id).
    pub fn set_userdata<U: Send + 'static>(&self, data: U) {
        *self.userdata.lock().unwrap() = Some(Box::new(data));
    }

    /// Read back previously attached userdata of type `U`, if any and if the type matches.
    pub fn userdata<U: Send + 'static>(&self) -> Option<MutexGuard<'_, Option<Box<dyn std::any::Any + Send>>>> {
        let guard = self.userdata.lock().unwrap();
        if guard.as_ref().is_some_and(|b| b.is::<U>()) {
            Some(guard)
        } else {
            None
        }
    }

    /// Discard any attached userdata.
    pub fn clear_userdata(&self) {
        *self.userdata.lock().unwrap() = None;
    }
}

impl<B> Clone for Slot<B> {
    fn clone(&self) -> Self {
        Slot {
            buffer: self.buffer.clone(),
            acquired: self.acquired.clone(),
            age: self.age.clone(),
            userdata: self.userdata.clone(),
        }
    }
}

impl<B> Default for Slot<B> {
    fn default() -> Self {
        Slot {
            buffer: Arc::new(None),
            acquired: Arc::new(AtomicBool::new(false)),
            age: Arc::new(AtomicU8::new(0)),
            userdata: Arc::new(Mutex::new(None)),
        }
    }
}

impl<B: Buffer> Deref for Slot<B> {
    type Target = B;
    fn deref(&self) -> &B {
        self.buffer.as_ref().as_ref().expect("slot handed out without a buffer")
    }
}

impl<B> Drop for Slot<B> {
    fn drop(&mut self) {
        self.acquired.store(false, Ordering::Release);
    }
}

/// Errors from [`Swapchain::acquire`].
#[derive(Debug, thiserror::Error)]
pub enum SwapchainError<E1>
where
    E1: std::error::Error + 'static,
{
    /// The allocator failed to produce a new buffer.
    #[error("failed to allocate a new buffer: {0}")]
    AllocationError(#[source] E1),
}

impl<A: Allocator> Swapchain<A> {
    /// Create a new, empty swapchain. No buffers are allocated until the
    /// first [`acquire`](Self::acquire).
    pub fn new(allocator: A, width: u32, height: u32, fourcc: Fourcc, modifiers: Vec<Modifier>) -> Self {
        Swapchain {
            allocator,
            width,
            height,
            fourcc,
            modifiers,
            slots: Default::default(),
        }
    }

    /// Access the underlying allocator.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The modifiers buffers are currently being allocated with.
    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    /// Current width, height and pixel format.
    pub fn geometry(&self) -> (u32, u32, Fourcc) {
        (self.width, self.height, self.fourcc)
    }

    /// Drop the explicit modifier list, falling back to the implicit
    /// modifier on the next allocation, and discard every existing slot so
    /// the next [`acquire`](Self::acquire) allocates fresh.
    pub fn clear_modifiers(&mut self) {
        self.modifiers.clear();
        self.slots = Default::default();
    }

    /// Acquire a free slot, allocating its buffer lazily on first use.
    /// Returns `Ok(None)` if all [`SLOT_CAP`] slots are currently acquired
    /// (the swapchain is exhausted, not an error condition by itself).
    pub fn acquire(&mut self) -> Result<Option<Slot<A::Buffer>>, SwapchainError<A::Error>> {
        let free_index = self
            .slots
            .iter()
            .position(|s| !s.acquired.load(Ordering::Acquire));
        let Some(free_index) = free_index else {
            return Ok(None);
        };

        if self.slots[free_index].buffer.is_none() {
            let buffer = self
                .allocator
                .create_buffer(self.width, self.height, self.fourcc, &self.modifiers)
                .map_err(SwapchainError::AllocationError)?;
            self.slots[free_index].buffer = Arc::new(Some(buffer));
        }

        for (i, slot) in self.slots.iter().enumerate() {
            if i == free_index {
                slot.age.store(0, Ordering::Release);
            } else if slot.acquired.load(Ordering::Acquire) {
                slot.age.fetch_add(1, Ordering::AcqRel);
            }
        }

        self.slots[free_index].acquired.store(true, Ordering::Release);
        Ok(Some(self.slots[free_index].clone()))
    }

    /// Resize (and reformat) the swapchain, dropping every existing slot.
    /// A no-op if the requested geometry already matches.
    pub fn resize(&mut self, width: u32, height: u32, fourcc: Fourcc) {
        if self.width == width && self.height == height && self.fourcc == fourcc {
            return;
        }
        self.width = width;
        self.height = height;
        self.fourcc = fourcc;
        self.slots = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::Format;

    #[derive(Debug, Default)]
    struct CountingBuffer {
        w: u32,
        h: u32,
    }

    impl Buffer for CountingBuffer {
        fn width(&self) -> u32 {
            self.w
        }
        fn height(&self) -> u32 {
            self.h
        }
        fn format(&self) -> Format {
            Format {
                code: Fourcc::Argb8888,
                modifier: Modifier::Linear,
            }
        }
    }

    #[derive(Default)]
    struct CountingAllocator {
        allocations: usize,
    }

    impl Allocator for CountingAllocator {
        type Buffer = CountingBuffer;
        type Error = std::convert::Infallible;

        fn create_buffer(
            &mut self,
            width: u32,
            height: u32,
            _fourcc: Fourcc,
            _modifiers: &[Modifier],
        ) -> Result<CountingBuffer, Self::Error> {
            self.allocations += 1;
            Ok(CountingBuffer { w: width, h: height })
        }
    }

    #[test]
    fn bounded_by_slot_cap() {
        let mut chain = Swapchain::new(CountingAllocator::default(), 100, 100, Fourcc::Argb8888, vec![]);
        let mut held = Vec::new();
        for _ in 0..SLOT_CAP {
            held.push(chain.acquire().unwrap().expect("slot should be free"));
        }
        assert!(chain.acquire().unwrap().is_none(), "swapchain must not exceed SLOT_CAP");
    }

    #[test]
    fn releasing_a_slot_frees_it_for_reuse() {
        let mut chain = Swapchain::new(CountingAllocator::default(), 100, 100, Fourcc::Argb8888, vec![]);
        let slot = chain.acquire().unwrap().unwrap();
        drop(slot);
        assert!(chain.acquire().unwrap().is_some());
    }

    #[test]
    fn reuses_allocated_buffers_instead_of_reallocating() {
        let mut chain = Swapchain::new(CountingAllocator::default(), 100, 100, Fourcc::Argb8888, vec![]);
        for _ in 0..10 {
            let slot = chain.acquire().unwrap().unwrap();
            drop(slot);
        }
        assert!(chain.allocator().allocations <= SLOT_CAP, "should not reallocate once slots are warm");
    }

    #[test]
    fn fresh_slot_reports_zero_age_after_acquire() {
        let mut chain = Swapchain::new(CountingAllocator::default(), 100, 100, Fourcc::Argb8888, vec![]);
        let slot = chain.acquire().unwrap().unwrap();
        assert_eq!(slot.age(), 0);
    }

    #[test]
    fn resize_clears_all_slots() {
        let mut chain = Swapchain::new(CountingAllocator::default(), 100, 100, Fourcc::Argb8888, vec![]);
        let slot = chain.acquire().unwrap().unwrap();
        drop(slot);
        chain.resize(200, 200, Fourcc::Argb8888);
        let slot = chain.acquire().unwrap().unwrap();
        assert_eq!(slot.width(), 200);
    }
}
