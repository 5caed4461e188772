//! Frame table and page replacement.
//!
//! User pages occupy physical frames drawn from the [`PhysicalAllocator`] of
//! the [`Vm`]. Every frame that currently holds a user page is recorded in
//! the system-wide [`FrameTable`], together with the virtual address and page
//! table it is mapped through and a weak reference to the [`Page`] that owns
//! it. Once the allocator runs dry, the table picks a victim, pushes its
//! contents to the backing store of the page, and hands the freed frame to the
//! page that needs it.
//!
//! ## The clock algorithm
//!
//! The victim is selected with the clock (second-chance) algorithm. The
//! registered frames form a ring with a *hand* pointing at the next
//! candidate. Starting at the hand, for each entry:
//!
//! 1. If the owning page is gone, the stale entry is dropped.
//! 2. If the hardware set the accessed bit of the page since the last visit,
//!    the bit is cleared and the page gets a second chance.
//! 3. If the page is busy (its lock is held by someone else), it is passed
//!    over.
//! 4. Otherwise the page is the victim.
//!
//! Frames are kept in registration order: a newly registered frame is appended
//! to the ring and the hand stays where it is. The scan stops after two full
//! turns: the first turn may only clear accessed bits, the second one must
//! find a victim unless every page is busy.
//!
//! [`PhysicalAllocator`]: keos::mm::PhysicalAllocator
//! [`Page`]: crate::page::Page

use crate::{
    Vm,
    page::{Page, PageHandle},
};
use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    mm::page_table::PageTable,
    sync::SpinLock,
};

/// A physical frame holding a user page.
///
/// The frame is returned to the physical allocator when dropped.
pub struct Frame {
    page: keos::mm::Page,
}

impl Frame {
    /// The physical address of the frame.
    pub fn pa(&self) -> Pa {
        self.page.pa()
    }

    /// The contents of the frame.
    pub fn inner(&self) -> &[u8; PAGE_SIZE] {
        self.page.inner()
    }

    /// The contents of the frame, mutably.
    pub fn inner_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.page.inner_mut()
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame({:?})", self.pa())
    }
}

struct FrameEntry {
    pa: Pa,
    va: Va,
    page_table: Arc<dyn PageTable>,
    owner: Weak<SpinLock<Page>>,
}

struct Inner {
    frames: Vec<FrameEntry>,
    hand: Option<usize>,
}

impl Inner {
    fn remove(&mut self, idx: usize) -> FrameEntry {
        let entry = self.frames.remove(idx);
        self.hand = match self.hand {
            _ if self.frames.is_empty() => None,
            Some(hand) if idx < hand => Some(hand - 1),
            Some(hand) => Some(hand % self.frames.len()),
            None => None,
        };
        entry
    }
}

/// The system-wide registry of frames holding user pages.
pub struct FrameTable {
    inner: SpinLock<Inner>,
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTable {
    /// Creates an empty frame table.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                frames: Vec::new(),
                hand: None,
            }),
        }
    }

    /// Number of registered frames.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let len = inner.frames.len();
        inner.unlock();
        len
    }

    /// Returns true if no frame is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the frame at `pa` is registered.
    pub fn contains(&self, pa: Pa) -> bool {
        let inner = self.inner.lock();
        let found = inner.frames.iter().any(|e| e.pa == pa);
        inner.unlock();
        found
    }

    /// Records that the frame at `pa` holds `owner`, mapped at `va` through
    /// `page_table`. A stale entry for the same frame is replaced.
    pub fn register(
        &self,
        pa: Pa,
        va: Va,
        page_table: Arc<dyn PageTable>,
        owner: Weak<SpinLock<Page>>,
    ) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.frames.iter().position(|e| e.pa == pa) {
            inner.remove(idx);
        }
        let entry = FrameEntry {
            pa,
            va,
            page_table,
            owner,
        };
        inner.frames.push(entry);
        inner.unlock();
    }

    /// Forgets the frame at `pa`. Unknown frames are ignored.
    pub fn unregister(&self, pa: Pa) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.frames.iter().position(|e| e.pa == pa) {
            inner.remove(idx);
        }
        inner.unlock();
    }

    /// Obtains a zero-filled frame, evicting a page if physical memory is
    /// exhausted.
    ///
    /// # Returns
    /// - `Err(KernelError::NoMemory)` if there is no free frame and no page
    ///   can be evicted.
    /// - Any error of the eviction itself, such as running out of swap slots.
    pub fn get_frame(&self, vm: &Vm) -> Result<Frame, KernelError> {
        match vm.palloc().alloc() {
            Some(page) => Ok(Frame { page }),
            None => self.evict(vm),
        }
    }

    /// Evicts a page with the clock algorithm and returns its frame.
    ///
    /// The victim is swapped out while the table is locked; its mapping is
    /// removed and its contents moved to its backing store. If the swap-out
    /// fails, the victim stays resident and registered.
    pub fn evict(&self, vm: &Vm) -> Result<Frame, KernelError> {
        let mut inner = self.inner.lock();
        let mut steps = 2 * inner.frames.len() + 1;
        while steps > 0 && !inner.frames.is_empty() {
            steps -= 1;
            let len = inner.frames.len();
            let idx = inner.hand.unwrap_or(0) % len;
            let (va, page_table, owner) = {
                let entry = &inner.frames[idx];
                (entry.va, entry.page_table.clone(), entry.owner.upgrade())
            };
            let Some(owner) = owner else {
                inner.remove(idx);
                continue;
            };
            inner.hand = Some((idx + 1) % len);
            if page_table.is_accessed(va) {
                page_table.set_accessed(va, false);
                continue;
            }
            let Ok(mut page) = owner.try_lock() else {
                continue;
            };
            match page.swap_out(vm) {
                Ok(mut frame) => {
                    debug!("VM: evicted {:?} of pid {} from {:?}", va, page.pid(), frame);
                    inner.remove(idx);
                    page.unlock();
                    inner.unlock();
                    frame.inner_mut().fill(0);
                    return Ok(frame);
                }
                Err(e) => {
                    page.unlock();
                    inner.unlock();
                    return Err(e);
                }
            }
        }
        inner.unlock();
        Err(KernelError::NoMemory)
    }
}

impl Vm {
    /// Brings the page behind `handle` into memory and maps it.
    ///
    /// A frame is obtained from the frame table, the page's contents are
    /// produced into it (loading an uninitialized page, reading a swap slot or
    /// reading the file), and the frame is mapped at the page's address with
    /// the page's permission. Claiming a resident page does nothing.
    ///
    /// # Returns
    /// - `Err(KernelError::NoMemory)` or `Err(KernelError::NoSpace)` if no
    ///   frame can be obtained.
    /// - `Err(KernelError::IOError)` if the contents cannot be read.
    pub fn claim_page(&self, handle: &PageHandle) -> Result<(), KernelError> {
        let mut page = handle.lock();
        let result = self.do_claim(handle, &mut page);
        page.unlock();
        self.check_exhaustion(result)
    }

    /// Claims `page`, which the caller locked through `handle`.
    pub(crate) fn do_claim(&self, handle: &PageHandle, page: &mut Page) -> Result<(), KernelError> {
        if page.is_resident() {
            return Ok(());
        }
        let frame = self.frames().get_frame(self)?;
        let (va, pa) = (page.va(), frame.pa());
        page.page_table().map(va, pa, page.permission())?;
        page.bind(frame);
        if let Err(e) = page.swap_in(self) {
            let _ = page.page_table().unmap(va);
            drop(page.unbind());
            return Err(e);
        }
        self.frames()
            .register(pa, va, page.page_table().clone(), Arc::downgrade(handle));
        Ok(())
    }
}
