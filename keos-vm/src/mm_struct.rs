//! # Memory state of a process
//!
//! The memory state of a process is represented by the [`MmStruct`]
//! structure, similar to the Linux kernel's `struct mm_struct`. It ties
//! together everything the virtual memory subsystem knows about one address
//! space:
//!
//! - the hardware page table of the process, which the subsystem fills in as
//!   pages are claimed and clears as they are evicted,
//! - the [`SupplementalPageTable`], describing every page the process may
//!   touch,
//! - the registry of active memory-mapped files, and
//! - a reference to the shared [`Vm`] whose frames and swap slots the pages
//!   occupy.
//!
//! The process creates its memory state with [`MmStruct::new`] and populates
//! it lazily with [`MmStruct::alloc_page_with_initializer`] (the program
//! loader) and [`MmStruct::do_mmap`]. Page faults are resolved with
//! [`MmStruct::handle_page_fault`]. `fork` duplicates the state with
//! [`MmStruct::fork`], and process exit tears it down with
//! [`MmStruct::exit`].
//!
//! ## Validating user input
//!
//! System calls such as `read` and `write` receive buffer addresses from the
//! user. [`MmStruct::access_ok`] checks that such an address is backed by a
//! page the process is allowed to access in the requested way, before the
//! kernel touches it. **The kernel must never crash due to user input.**
//!
//! [`SupplementalPageTable`]: crate::spt::SupplementalPageTable

use crate::{
    Vm,
    file::MmapRegion,
    page::{AddressSpace, Page, PageState, VmType},
    spt::SupplementalPageTable,
    uninit::{Loader, Uninit},
};
use alloc::{sync::Arc, vec::Vec};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    mm::page_table::PageTable,
    sync::SpinLock,
    task::Pid,
};

/// The memory state of a process.
pub struct MmStruct {
    pub(crate) vm: Arc<Vm>,
    pub(crate) space: AddressSpace,
    pub(crate) spt: SupplementalPageTable,
    pub(crate) mmaps: SpinLock<Vec<MmapRegion>>,
}

impl MmStruct {
    /// Creates the empty memory state of process `pid`, whose translations
    /// live in `page_table`.
    pub fn new(vm: Arc<Vm>, pid: Pid, page_table: Arc<dyn PageTable>) -> Self {
        Self {
            vm,
            space: AddressSpace { pid, page_table },
            spt: SupplementalPageTable::new(),
            mmaps: SpinLock::new(Vec::new()),
        }
    }

    /// The process owning this memory state.
    pub fn pid(&self) -> Pid {
        self.space.pid
    }

    /// The hardware page table of the process.
    pub fn page_table(&self) -> &Arc<dyn PageTable> {
        &self.space.page_table
    }

    /// The supplemental page table of the process.
    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// The virtual memory subsystem this state belongs to.
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Returns true if `va` is a user address.
    pub fn is_user_addr(&self, va: Va) -> bool {
        va.into_usize() < self.vm.config().kern_base
    }

    /// Returns true if `[start, end)` is a non-empty range of user addresses.
    pub fn is_user_range(&self, start: Va, end: Va) -> bool {
        start < end && end.into_usize() <= self.vm.config().kern_base
    }

    /// Registers a new, uninitialized page at `va`.
    ///
    /// No memory is spent until the page is first touched; the contents are
    /// then produced by `loader` and the page becomes a page of type `ty`.
    ///
    /// # Parameters
    /// - `ty`: the type of the page once loaded, [`VmType::Anon`] or
    ///   [`VmType::File`].
    /// - `va`: the page-aligned address of the page.
    /// - `writable`: whether the user may write to the page.
    /// - `loader`: how to produce the initial contents.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if `va` is not page aligned, or
    ///   `ty` cannot be produced by `loader`.
    /// - `Err(KernelError::BadAddress)` if `va` is not a user address.
    /// - `Err(KernelError::FileExist)` if a page already exists at `va`.
    pub fn alloc_page_with_initializer(
        &self,
        ty: VmType,
        va: Va,
        writable: bool,
        loader: Loader,
    ) -> Result<(), KernelError> {
        if va.offset() != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if !self.is_user_range(va, va + PAGE_SIZE) {
            return Err(KernelError::BadAddress);
        }
        let state = PageState::Uninit(Uninit::new(loader, ty)?);
        self.spt
            .insert(Page::new(va, writable, self.space.clone(), state))
            .map(|_| ())
    }

    /// Registers a new zero-filled page of type `ty` at `va`.
    pub fn alloc_page(&self, ty: VmType, va: Va, writable: bool) -> Result<(), KernelError> {
        self.alloc_page_with_initializer(ty, va, writable, Loader::Zeroed)
    }

    /// Makes the page at `va` resident and mapped, as a fault on it would.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)` if there is no page at `va`.
    pub fn claim_page(&self, va: Va) -> Result<(), KernelError> {
        let page = self.spt.find(va).ok_or(KernelError::BadAddress)?;
        self.vm.claim_page(&page)
    }

    /// Removes the page at `va` and releases everything it holds.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)` if there is no page at `va`.
    pub fn remove_page(&self, va: Va) -> Result<(), KernelError> {
        if self.spt.remove(va, &self.vm) {
            Ok(())
        } else {
            Err(KernelError::BadAddress)
        }
    }

    /// Checks whether the user may access `va`, for writing if `is_write`.
    ///
    /// An address is accessible when a page covers it with the right
    /// permission, or, for a write, when it lies where the stack may grow.
    pub fn access_ok(&self, va: Va, is_write: bool) -> bool {
        if !self.is_user_addr(va) {
            return false;
        }
        match self.spt.find(va) {
            Some(page) => {
                let page = page.lock();
                let writable = page.writable();
                page.unlock();
                !is_write || writable
            }
            None => {
                let config = self.vm.config();
                let top = config.user_stack.into_usize();
                is_write
                    && va.into_usize() < top
                    && top - va.page_down().into_usize() <= config.stack_limit
            }
        }
    }

    /// Duplicates the memory state for the child process `pid`, whose
    /// translations go to `page_table`.
    ///
    /// Anonymous memory is copied eagerly, so the two processes never observe
    /// each other's writes. Pages that were never touched stay untouched in
    /// both processes. Memory-mapped pages are flushed to their files, and the
    /// child reads them again from the file.
    pub fn fork(&self, pid: Pid, page_table: Arc<dyn PageTable>) -> Result<MmStruct, KernelError> {
        let child = MmStruct::new(self.vm.clone(), pid, page_table);
        self.vm
            .check_exhaustion(child.spt.copy(&self.spt, &self.vm, &child.space))?;

        let mmaps = self.mmaps.lock();
        let regions = mmaps.clone();
        mmaps.unlock();
        let mut child_mmaps = child.mmaps.lock();
        *child_mmaps = regions;
        child_mmaps.unlock();

        info!(
            "VM: forked pid {} into pid {} ({} pages).",
            self.pid(),
            pid,
            child.spt.len()
        );
        Ok(child)
    }

    /// Tears down the memory state: every page is destroyed, dirty
    /// memory-mapped pages are written back, and every frame and swap slot
    /// is released.
    ///
    /// Exiting twice does nothing. The state is also torn down when dropped.
    pub fn exit(&self) {
        if self.spt.is_dead() {
            return;
        }
        let mut mmaps = self.mmaps.lock();
        mmaps.clear();
        mmaps.unlock();
        self.spt.kill(&self.vm);
        debug!("VM: pid {} exited.", self.pid());
    }
}

impl Drop for MmStruct {
    fn drop(&mut self) {
        self.exit();
    }
}
