//! Anonymous pages and the swap table.
//!
//! Anonymous pages (the heap, the stack, and the data segments of a program
//! once loaded) have no file to return to. When evicted, the page is written
//! to a *swap slot*: a run of [`SECTORS_PER_PAGE`] consecutive sectors of the
//! swap disk. Slot `i` occupies sectors `[i * SECTORS_PER_PAGE, (i + 1) *
//! SECTORS_PER_PAGE)`, and every sector of the disk belongs to some slot.
//!
//! The [`SwapTable`] tracks which slots are in use with a bitmap. A slot is
//! taken when a page is swapped out and released either when the page is
//! swapped back in or when the page is destroyed while swapped out. An
//! occupied slot belongs to exactly one page.

use crate::{Vm, frame::Frame};
use alloc::{vec, vec::Vec};
use keos::{
    KernelError,
    addressing::PAGE_SIZE,
    fs::{Disk, SECTOR_SIZE, Sector},
    sync::SpinLock,
    task::Pid,
};

/// Number of sectors that hold one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE.div_ceil(SECTOR_SIZE);

/// Index of a swap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    /// The first sector of the slot.
    pub fn sector(self) -> Sector {
        Sector(self.0 * SECTORS_PER_PAGE)
    }
}

/// Allocator of swap slots over the swap disk.
pub struct SwapTable {
    disk: Disk,
    nr_slots: usize,
    // 1: used, 0: free
    bitmap: SpinLock<Vec<u64>>,
}

impl SwapTable {
    /// Creates a table covering every whole slot of `disk`.
    pub fn new(disk: Disk) -> Self {
        let nr_slots = disk.nr_sectors() / SECTORS_PER_PAGE;
        Self {
            disk,
            nr_slots,
            bitmap: SpinLock::new(vec![0; nr_slots.div_ceil(64)]),
        }
    }

    /// Number of slots of the swap disk.
    pub fn nr_slots(&self) -> usize {
        self.nr_slots
    }

    /// Number of slots in use.
    pub fn nr_used(&self) -> usize {
        let bitmap = self.bitmap.lock();
        let used = bitmap.iter().map(|w| w.count_ones() as usize).sum();
        bitmap.unlock();
        used
    }

    /// Returns true if `slot` is in use.
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        let (pos, ofs) = (slot.0 / 64, slot.0 % 64);
        let bitmap = self.bitmap.lock();
        let used = bitmap.get(pos).is_some_and(|w| w & (1 << ofs) != 0);
        bitmap.unlock();
        used
    }

    /// Takes the lowest free slot.
    ///
    /// # Returns
    /// - `None` if every slot is in use.
    pub fn alloc(&self) -> Option<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        let mut found = None;
        for (pos, word) in bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let index = pos * 64 + word.trailing_ones() as usize;
                if index < self.nr_slots {
                    *word |= 1 << (index % 64);
                    found = Some(SwapSlot(index));
                }
                break;
            }
        }
        bitmap.unlock();
        found
    }

    /// Releases `slot`.
    pub fn free(&self, slot: SwapSlot) {
        let (pos, ofs) = (slot.0 / 64, slot.0 % 64);
        let mut bitmap = self.bitmap.lock();
        debug_assert_ne!(bitmap[pos] & (1 << ofs), 0, "{:?} is not in use", slot);
        bitmap[pos] &= !(1 << ofs);
        bitmap.unlock();
    }

    /// Writes a page into `slot`.
    pub fn write_page(&self, slot: SwapSlot, page: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let mut buf = [0; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            buf.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.disk.write(slot.sector() + i, &buf)?;
        }
        Ok(())
    }

    /// Reads the page stored in `slot`.
    pub fn read_page(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let mut buf = [0; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            self.disk.read(slot.sector() + i, &mut buf)?;
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
        Ok(())
    }
}

/// State of an anonymous page.
pub struct AnonPage {
    owner: Pid,
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub(crate) fn new(owner: Pid) -> Self {
        Self { owner, slot: None }
    }

    /// The process the page belongs to.
    pub fn owner(&self) -> Pid {
        self.owner
    }

    /// The slot holding the page while it is swapped out.
    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    /// Reads the page back from its slot into `frame` and frees the slot.
    pub(crate) fn swap_in(&mut self, frame: &mut Frame, vm: &Vm) -> Result<(), KernelError> {
        let slot = self.slot.ok_or(KernelError::InvalidArgument)?;
        vm.swap().read_page(slot, frame.inner_mut())?;
        vm.swap().free(slot);
        self.slot = None;
        Ok(())
    }

    /// Writes `frame` to a fresh slot.
    pub(crate) fn swap_out(&mut self, frame: &Frame, vm: &Vm) -> Result<(), KernelError> {
        let slot = vm.swap().alloc().ok_or(KernelError::NoSpace)?;
        if let Err(e) = vm.swap().write_page(slot, frame.inner()) {
            vm.swap().free(slot);
            return Err(e);
        }
        self.slot = Some(slot);
        Ok(())
    }

    pub(crate) fn destroy(&mut self, vm: &Vm) {
        if let Some(slot) = self.slot.take() {
            vm.swap().free(slot);
        }
    }
}
