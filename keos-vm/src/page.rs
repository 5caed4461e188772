//! Virtual pages.
//!
//! A [`Page`] describes one page of a user address space. What it takes to
//! bring the page into memory, and to push it back out, depends on where its
//! contents come from, which is captured by [`PageState`]:
//!
//! - [`PageState::Uninit`]: the page was never touched. It records a
//!   [`Loader`] that produces its initial contents and the [`VmType`] it turns
//!   into on its first fault.
//! - [`PageState::Anon`]: the page has no backing file. When evicted, its
//!   contents go to a swap slot.
//! - [`PageState::File`]: the page mirrors a range of a file. When evicted,
//!   it is written back to the file if it was modified.
//!
//! The transition out of [`PageState::Uninit`] happens once, on the first
//! successful swap-in of the page, and is never undone. A page whose first
//! load fails stays uninitialized and is loaded again on its next fault.
//!
//! [`Loader`]: crate::uninit::Loader

use crate::{Vm, anon::AnonPage, file::FilePage, frame::Frame, uninit::Uninit};
use alloc::sync::Arc;
use keos::{
    KernelError,
    addressing::Va,
    mm::page_table::{PageTable, Permission},
    sync::SpinLock,
    task::Pid,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Kind of a virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum VmType {
    /// Not yet initialized.
    Uninit = 0,
    /// Anonymous memory, swapped to the swap disk.
    Anon = 1,
    /// File-backed memory, written back to its file.
    File = 2,
}

/// The address space a page belongs to.
#[derive(Clone)]
pub struct AddressSpace {
    /// The owning process.
    pub pid: Pid,
    /// The hardware page table of the process.
    pub page_table: Arc<dyn PageTable>,
}

/// Variant-specific state of a [`Page`].
pub enum PageState {
    /// Lazily initialized page.
    Uninit(Uninit),
    /// Anonymous page.
    Anon(AnonPage),
    /// File-backed page.
    File(FilePage),
}

impl PageState {
    /// The [`VmType`] of the state itself.
    pub fn ty(&self) -> VmType {
        match self {
            PageState::Uninit(_) => VmType::Uninit,
            PageState::Anon(_) => VmType::Anon,
            PageState::File(_) => VmType::File,
        }
    }
}

/// A page shared between its supplemental page table and the frame table.
pub type PageHandle = Arc<SpinLock<Page>>;

/// A virtual page of a user address space.
pub struct Page {
    va: Va,
    writable: bool,
    space: AddressSpace,
    state: PageState,
    frame: Option<Frame>,
}

impl Page {
    pub(crate) fn new(va: Va, writable: bool, space: AddressSpace, state: PageState) -> Self {
        Self {
            va,
            writable,
            space,
            state,
            frame: None,
        }
    }

    /// The page-aligned virtual address of the page.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Whether the user may write to the page.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The process owning the page.
    pub fn pid(&self) -> Pid {
        self.space.pid
    }

    /// The type of the page.
    ///
    /// An uninitialized page reports the type it will become.
    pub fn ty(&self) -> VmType {
        match &self.state {
            PageState::Uninit(uninit) => uninit.target(),
            state => state.ty(),
        }
    }

    /// The variant-specific state.
    pub fn state(&self) -> &PageState {
        &self.state
    }

    /// Returns true if the page currently occupies a frame.
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// The frame holding the page, if resident.
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub(crate) fn frame_mut(&mut self) -> Option<&mut Frame> {
        self.frame.as_mut()
    }

    pub(crate) fn page_table(&self) -> &Arc<dyn PageTable> {
        &self.space.page_table
    }

    pub(crate) fn permission(&self) -> Permission {
        if self.writable {
            Permission::READ | Permission::WRITE | Permission::USER
        } else {
            Permission::READ | Permission::USER
        }
    }

    pub(crate) fn bind(&mut self, frame: Frame) {
        debug_assert!(self.frame.is_none());
        self.frame = Some(frame);
    }

    pub(crate) fn unbind(&mut self) -> Option<Frame> {
        self.frame.take()
    }

    /// Brings the contents of the page into its bound frame.
    pub(crate) fn swap_in(&mut self, vm: &Vm) -> Result<(), KernelError> {
        let Some(frame) = self.frame.as_mut() else {
            return Err(KernelError::InvalidArgument);
        };
        if matches!(self.state, PageState::Uninit(_)) {
            let empty = PageState::Anon(AnonPage::new(self.space.pid));
            if let PageState::Uninit(uninit) = core::mem::replace(&mut self.state, empty) {
                let (state, result) = uninit.initialize(self.va, &self.space, frame);
                self.state = state;
                return result;
            }
        }
        match &mut self.state {
            PageState::Anon(anon) => anon.swap_in(frame, vm),
            PageState::File(file) => file.swap_in(frame),
            PageState::Uninit(_) => Err(KernelError::InvalidArgument),
        }
    }

    /// Moves the contents of the page to its backing store and returns the
    /// frame it occupied. The hardware mapping is removed.
    pub(crate) fn swap_out(&mut self, vm: &Vm) -> Result<Frame, KernelError> {
        let Some(frame) = self.frame.as_ref() else {
            return Err(KernelError::InvalidArgument);
        };
        let pt = &*self.space.page_table;
        match &mut self.state {
            PageState::Anon(anon) => anon.swap_out(frame, vm)?,
            PageState::File(file) => file.writeback(self.va, pt, frame)?,
            PageState::Uninit(_) => return Err(KernelError::InvalidArgument),
        }
        pt.set_dirty(self.va, false);
        let unmapped = pt.unmap(self.va);
        debug_assert!(unmapped.is_ok(), "resident page {:?} is not mapped", self.va);
        self.frame.take().ok_or(KernelError::InvalidArgument)
    }

    /// Writes a resident file-backed page back to its file if it is dirty.
    /// Other pages are left untouched.
    pub(crate) fn writeback(&mut self) -> Result<(), KernelError> {
        match (&mut self.state, self.frame.as_ref()) {
            (PageState::File(file), Some(frame)) => {
                file.writeback(self.va, &*self.space.page_table, frame)
            }
            _ => Ok(()),
        }
    }

    /// Releases every resource held by the page: its swap slot, its frame
    /// and mapping. A dirty file-backed page is written back first.
    pub(crate) fn destroy(&mut self, vm: &Vm) {
        let pt = &*self.space.page_table;
        match &mut self.state {
            PageState::Uninit(_) => (),
            PageState::Anon(anon) => anon.destroy(vm),
            PageState::File(file) => {
                if let Some(frame) = self.frame.as_ref()
                    && let Err(e) = file.writeback(self.va, pt, frame)
                {
                    warning!("VM: writeback of {:?} failed: {:?}", self.va, e);
                }
            }
        }
        if let Some(frame) = self.frame.take() {
            vm.frames().unregister(frame.pa());
            let _ = pt.unmap(self.va);
        }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("va", &self.va)
            .field("pid", &self.space.pid)
            .field("ty", &self.state.ty())
            .field("writable", &self.writable)
            .field("frame", &self.frame.as_ref().map(|f| f.pa()))
            .finish()
    }
}
