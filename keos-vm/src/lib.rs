//! # KeOS Virtual Memory
//!
//! This crate implements demand-paged virtual memory for the user processes
//! of KeOS: lazy loading of program pages, anonymous memory for the heap and
//! the stack, memory-mapped files, on-demand physical frame allocation,
//! second-chance eviction and disk-backed swapping.
//!
//! ## Overview
//!
//! Every virtual page a process may touch is described by a [`Page`] that
//! lives in the process' [`SupplementalPageTable`]. A page starts its life
//! *uninitialized*: it only records how its contents can be produced (a
//! [`Loader`]) and what it will become once touched ([`VmType::Anon`] or
//! [`VmType::File`]). No physical memory is spent until the first page fault.
//!
//! When the user program touches the page, the CPU raises a page fault and
//! the trap handler calls [`MmStruct::handle_page_fault`]. The handler looks
//! up the page and *claims* it: the [`FrameTable`] hands out a physical frame
//! (evicting another page with the clock algorithm when memory is full), the
//! page's contents are produced into the frame, and the hardware translation
//! is installed. The user program then retries the faulting instruction.
//!
//! Under memory pressure the evictor swaps out a victim:
//! - an anonymous page is written to a slot of the swap disk, managed by the
//!   [`SwapTable`], and read back (freeing the slot) on its next fault;
//! - a file-backed page is written back to its file if it is dirty, and read
//!   again from the file on its next fault.
//!
//! ## Subsystem
//!
//! The frame table and the swap table are shared by every process. They live
//! in a [`Vm`] instance created once at boot by [`Vm::new`], which each
//! process' [`MmStruct`] refers to.
//!
//! ```text
//!   page fault ──> MmStruct::handle_page_fault
//!                     │ spt lookup / stack growth
//!                     v
//!                  Vm::claim_page ──> FrameTable::get_frame ──> evict ──> Page::swap_out
//!                     │
//!                     v
//!                  Page::swap_in (uninit load / swap slot / file) + map
//! ```
//!
//! ## Locking
//!
//! Each page is protected by its own [`SpinLock`]; the frame registry and its
//! clock hand, the swap bitmap, every supplemental page table and every mmap
//! registry have a lock of their own. A page lock may be held while taking
//! the frame table lock, never the other way around: the evictor only
//! `try_lock`s candidate pages and passes over busy ones.
//!
//! [`Page`]: page::Page
//! [`SupplementalPageTable`]: spt::SupplementalPageTable
//! [`Loader`]: uninit::Loader
//! [`VmType::Anon`]: page::VmType::Anon
//! [`VmType::File`]: page::VmType::File
//! [`MmStruct::handle_page_fault`]: mm_struct::MmStruct::handle_page_fault
//! [`MmStruct`]: mm_struct::MmStruct
//! [`FrameTable`]: frame::FrameTable
//! [`SwapTable`]: anon::SwapTable
//! [`SpinLock`]: keos::sync::SpinLock

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[macro_use]
extern crate keos;

pub mod anon;
pub mod fault;
pub mod file;
pub mod frame;
pub mod mm_struct;
pub mod page;
pub mod spt;
pub mod uninit;

use alloc::sync::Arc;
use anon::SwapTable;
use frame::FrameTable;
use keos::{KernelError, addressing::Va, fs::Disk, mm::PhysicalAllocator};

pub use fault::PageFaultReason;
pub use mm_struct::MmStruct;
pub use page::{Page, PageHandle, VmType};
pub use uninit::Loader;

/// Maximum size of the user stack, 1 MiB.
pub const STACK_LIMIT: usize = 1 << 20;

/// The top of the user stack. The stack grows down from here.
pub const USER_STACK: usize = 0x4748_0000;

const USER_STACK_TOP: Va = match Va::new(USER_STACK) {
    Some(va) => va,
    None => panic!("non-canonical user stack"),
};

/// The first kernel virtual address. User addresses lie below it.
pub const KERN_BASE: usize = 0x80_0400_0000;

/// The pages of `[start, end)`. Both ends are page aligned.
pub(crate) fn page_range(start: Va, end: Va) -> impl Iterator<Item = Va> {
    (0..(end - start) / keos::addressing::PAGE_SIZE)
        .map(move |i| start + i * keos::addressing::PAGE_SIZE)
}

/// What to do when the subsystem runs out of a resource it cannot reclaim:
/// a swap slot, or a frame with nothing left to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Fail the operation that needed the resource. The faulting process is
    /// killed by its caller; the kernel keeps running.
    #[default]
    Fail,
    /// Panic the kernel.
    Halt,
}

/// Configuration of the virtual memory subsystem.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// The top of every user stack.
    pub user_stack: Va,
    /// Maximum number of bytes a stack may grow to.
    pub stack_limit: usize,
    /// The first kernel virtual address.
    pub kern_base: usize,
    /// Policy on resource exhaustion.
    pub on_exhaustion: ExhaustionPolicy,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_stack: USER_STACK_TOP,
            stack_limit: STACK_LIMIT,
            kern_base: KERN_BASE,
            on_exhaustion: ExhaustionPolicy::Fail,
        }
    }
}

/// The virtual memory subsystem.
///
/// A [`Vm`] owns the state shared by every address space: the physical
/// allocator frames are drawn from, the system-wide [`FrameTable`] and the
/// [`SwapTable`] of the swap disk.
pub struct Vm {
    config: VmConfig,
    palloc: Arc<PhysicalAllocator>,
    frames: FrameTable,
    swap: SwapTable,
}

impl Vm {
    /// Initializes the virtual memory subsystem.
    ///
    /// # Parameters
    /// - `config`: the subsystem configuration.
    /// - `palloc`: the allocator user frames are taken from.
    /// - `swap_disk`: the disk used as swap space. Every sector of it is
    ///   usable.
    pub fn new(config: VmConfig, palloc: Arc<PhysicalAllocator>, swap_disk: Disk) -> Arc<Self> {
        let swap = SwapTable::new(swap_disk);
        info!(
            "VM: {} user frames, {} swap slots, stack limit {} KiB.",
            palloc.capacity(),
            swap.nr_slots(),
            config.stack_limit / 1024
        );
        Arc::new(Self {
            config,
            palloc,
            frames: FrameTable::new(),
            swap,
        })
    }

    /// The configuration the subsystem was initialized with.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The system-wide frame table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// The swap table.
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// The physical allocator user frames are taken from.
    pub fn palloc(&self) -> &Arc<PhysicalAllocator> {
        &self.palloc
    }

    /// Applies the exhaustion policy to the outcome of an operation.
    ///
    /// Running out of frames ([`KernelError::NoMemory`]) or of swap space
    /// ([`KernelError::NoSpace`]) is reported to the caller under
    /// [`ExhaustionPolicy::Fail`] and panics the kernel under
    /// [`ExhaustionPolicy::Halt`]. Must be called with no lock held.
    pub(crate) fn check_exhaustion<T>(
        &self,
        result: Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        let what = match result {
            Err(KernelError::NoMemory) => "frames",
            Err(KernelError::NoSpace) => "swap space",
            result => return result,
        };
        match self.config.on_exhaustion {
            ExhaustionPolicy::Halt => panic!("VM: {} exhausted.", what),
            ExhaustionPolicy::Fail => {
                warning!("VM: {} exhausted.", what);
                result
            }
        }
    }
}
