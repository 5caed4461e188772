//! Memory Management.
//!
//! This module implements functionality for memory management operations such
//! as allocating and deallocating physical memory. The core abstraction is the
//! [`Page`], which represents a single physical page frame.
//!
//! Memory allocation and deallocation in KeOS is closely tied to Rust's
//! ownership and lifetime system: A page is allocated by asking the
//! [`PhysicalAllocator`] for one. Once the [`Page`] instance is dropped, the
//! page is automatically returned to its allocator, ensuring proper memory
//! management and preventing memory leaks.
//!
//! The allocator manages a fixed pool of frames (the physical memory handed
//! to it at boot) with a bitmap, exactly like the per-region arenas of the
//! kernel boot allocator. Running out of frames is not an error of the
//! allocator: [`PhysicalAllocator::alloc`] simply returns `None` and the
//! caller decides whether to evict.
pub mod page_table;

use crate::{
    addressing::{PAGE_SHIFT, PAGE_SIZE, Pa},
    sync::SpinLock,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cell::UnsafeCell;

/// The physical address where the frames of an allocator start.
const PHYS_BASE: usize = 0x10_0000;

/// A pool of physical page frames tracked by a bitmap.
///
/// Each bit of the bitmap represents a frame; `1` means unused and `0` means
/// used. The tail of the last bitmap word is padded with used bits so that the
/// search never hands out a frame that does not exist.
pub struct PhysicalAllocator {
    base: Pa,
    frames: Box<[UnsafeCell<[u8; PAGE_SIZE]>]>,
    // 0: used, 1: unused
    bitmap: SpinLock<Vec<u64>>,
}

unsafe impl Send for PhysicalAllocator {}
unsafe impl Sync for PhysicalAllocator {}

impl PhysicalAllocator {
    /// Creates an allocator that manages `nr_frames` physical frames.
    pub fn new(nr_frames: usize) -> Arc<Self> {
        let mut bitmap = alloc::vec![u64::MAX; nr_frames.div_ceil(64)];
        // Pad back.
        for i in nr_frames..((nr_frames + 63) & !63) {
            bitmap[i / 64] &= !(1 << (i % 64));
        }
        info!(
            "Memory: {} frames at 0x{:016x}~0x{:016x}",
            nr_frames,
            PHYS_BASE,
            PHYS_BASE + (nr_frames << PAGE_SHIFT)
        );
        Arc::new(Self {
            base: Pa::ZERO + PHYS_BASE,
            frames: (0..nr_frames)
                .map(|_| UnsafeCell::new([0; PAGE_SIZE]))
                .collect(),
            bitmap: SpinLock::new(bitmap),
        })
    }

    /// Allocates a zero-filled page.
    ///
    /// # Returns
    /// - `Some(Page)` on success.
    /// - `None` if every frame of this allocator is in use.
    pub fn alloc(self: &Arc<Self>) -> Option<Page> {
        let mut bitmap = self.bitmap.lock();
        let found = bitmap.iter_mut().enumerate().find_map(|(pos, word)| {
            if *word != 0 {
                let ofs = word.trailing_zeros() as usize;
                *word &= !(1 << ofs);
                Some(pos * 64 + ofs)
            } else {
                None
            }
        });
        bitmap.unlock();

        found.map(|index| {
            let mut page = Page {
                allocator: self.clone(),
                index,
            };
            page.inner_mut().fill(0);
            page
        })
    }

    /// Returns the total number of frames managed by this allocator.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of frames that are not allocated.
    pub fn nr_free(&self) -> usize {
        let bitmap = self.bitmap.lock();
        let free = bitmap.iter().map(|w| w.count_ones() as usize).sum();
        bitmap.unlock();
        free
    }

    /// Get a reference of the frame at `pa`.
    ///
    /// This is how the hardware (and a test harness emulating it) reaches the
    /// memory behind a translated address.
    ///
    /// # Safety
    /// The frame at [`Pa`] must be held by another object, and no other
    /// reference to its contents may be alive while the returned
    /// [`PageRef`] is used.
    pub unsafe fn page_ref(&self, pa: Pa) -> Option<PageRef<'_>> {
        self.index_of(pa).map(|index| PageRef {
            allocator: self,
            index,
        })
    }

    fn index_of(&self, pa: Pa) -> Option<usize> {
        let index = pa.into_usize().checked_sub(self.base.into_usize())? >> PAGE_SHIFT;
        (index < self.frames.len()).then_some(index)
    }

    fn dealloc(&self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        let mut bitmap = self.bitmap.lock();
        debug_assert_eq!(bitmap[pos] & (1 << ofs), 0);
        bitmap[pos] |= 1 << ofs;
        bitmap.unlock();
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn frame(&self, index: usize) -> &mut [u8; PAGE_SIZE] {
        unsafe { &mut *self.frames[index].get() }
    }
}

/// A representation of a memory page.
///
/// The [`Page`] struct encapsulates a single physical page frame, providing
/// methods to access and manipulate the underlying page's contents. The frame
/// is returned to its [`PhysicalAllocator`] when the page is dropped.
pub struct Page {
    allocator: Arc<PhysicalAllocator>,
    index: usize,
}

impl Page {
    /// Get the physical address of this page.
    ///
    /// # Returns
    /// - The physical address ([`Pa`]) of the page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.allocator.base + (self.index << PAGE_SHIFT)
    }

    /// Get a reference to the underlying slice of the page (read-only).
    ///
    /// # Returns
    /// - A reference to the byte array representing the contents of the page.
    pub fn inner(&self) -> &[u8; PAGE_SIZE] {
        unsafe { self.allocator.frame(self.index) }
    }

    /// Get a mutable reference to the underlying slice of the page.
    ///
    /// # Returns
    /// - A mutable reference to the byte array representing the contents of
    ///   the page.
    pub fn inner_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        unsafe { self.allocator.frame(self.index) }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.allocator.dealloc(self.index);
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:?})", self.pa())
    }
}

/// A reference of a memory page.
///
/// `PageRef` represents a borrowed reference to a frame that is owned by
/// some other object. The lifetime parameter `'a` ensures that the reference
/// does not outlive the allocator it points into.
pub struct PageRef<'a> {
    allocator: &'a PhysicalAllocator,
    index: usize,
}

impl PageRef<'_> {
    /// Get the physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.allocator.base + (self.index << PAGE_SHIFT)
    }

    /// Get a reference to the underlying slice of the page (read-only).
    pub fn inner(&self) -> &[u8; PAGE_SIZE] {
        unsafe { self.allocator.frame(self.index) }
    }

    /// Get a mutable reference to the underlying slice of the page.
    pub fn inner_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        unsafe { self.allocator.frame(self.index) }
    }
}
