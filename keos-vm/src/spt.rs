//! Supplemental page table.
//!
//! The hardware page table only describes the pages that are resident. The
//! supplemental page table of a process describes *every* page the process
//! may access, resident or not, keyed by the page-aligned virtual address.
//! The fault handler consults it to decide whether a fault is legitimate and
//! how to bring the page in.
//!
//! The table is torn down exactly once, when the process exits. After that,
//! lookups find nothing and insertions fail.

use crate::{
    Vm,
    page::{AddressSpace, Page, PageHandle, PageState, VmType},
    uninit::{Loader, Uninit},
};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    sync::SpinLock,
};

/// Per-process map from virtual page to [`Page`].
pub struct SupplementalPageTable {
    pages: SpinLock<Option<BTreeMap<Va, PageHandle>>>,
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

// What `copy` takes out of a parent page while holding its lock.
enum Snapshot {
    Page(Page),
    Anon {
        va: Va,
        writable: bool,
        contents: Box<[u8; PAGE_SIZE]>,
    },
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            pages: SpinLock::new(Some(BTreeMap::new())),
        }
    }

    /// Looks up the page containing `va`.
    pub fn find(&self, va: Va) -> Option<PageHandle> {
        let pages = self.pages.lock();
        let page = pages
            .as_ref()
            .and_then(|pages| pages.get(&va.page_down()).cloned());
        pages.unlock();
        page
    }

    /// Inserts `page`.
    ///
    /// # Returns
    /// - `Err(KernelError::FileExist)` if a page with the same address exists.
    /// - `Err(KernelError::BadAddress)` if the table is torn down.
    pub fn insert(&self, page: Page) -> Result<PageHandle, KernelError> {
        let va = page.va();
        let mut guard = self.pages.lock();
        let result = match guard.as_mut() {
            None => Err(KernelError::BadAddress),
            Some(pages) if pages.contains_key(&va) => Err(KernelError::FileExist),
            Some(pages) => {
                let handle = Arc::new(SpinLock::new(page));
                pages.insert(va, handle.clone());
                Ok(handle)
            }
        };
        guard.unlock();
        result
    }

    /// Removes the page containing `va` and destroys it.
    ///
    /// Returns false if there is no such page.
    pub fn remove(&self, va: Va, vm: &Vm) -> bool {
        let mut guard = self.pages.lock();
        let handle = guard
            .as_mut()
            .and_then(|pages| pages.remove(&va.page_down()));
        guard.unlock();

        match handle {
            Some(handle) => {
                let mut page = handle.lock();
                page.destroy(vm);
                page.unlock();
                true
            }
            None => false,
        }
    }

    /// A snapshot of every page, in address order.
    pub fn pages(&self) -> Vec<PageHandle> {
        let guard = self.pages.lock();
        let pages = guard
            .as_ref()
            .map(|pages| pages.values().cloned().collect())
            .unwrap_or_default();
        guard.unlock();
        pages
    }

    /// Number of pages in the table.
    pub fn len(&self) -> usize {
        let guard = self.pages.lock();
        let len = guard.as_ref().map_or(0, |pages| pages.len());
        guard.unlock();
        len
    }

    /// Returns true if the table holds no page.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every page of `src` into this table, for `space`.
    ///
    /// - An uninitialized page is copied as-is, with its loader duplicated;
    ///   neither copy has been loaded yet.
    /// - An anonymous page is copied eagerly: the child gets a fresh page and
    ///   frame holding the same bytes, wherever the parent's copy is (in a
    ///   frame or in a swap slot).
    /// - A file-backed page is flushed to its file if dirty, then copied as an
    ///   uninitialized page of the same file range. The child reads it from
    ///   the file on its first fault.
    ///
    /// On failure, the pages copied so far are left in this table.
    pub fn copy(
        &self,
        src: &SupplementalPageTable,
        vm: &Vm,
        space: &AddressSpace,
    ) -> Result<(), KernelError> {
        for handle in src.pages() {
            let mut page = handle.lock();
            let snapshot = Self::snapshot(&mut page, vm, space);
            page.unlock();

            match snapshot? {
                Snapshot::Page(page) => {
                    self.insert(page)?;
                }
                Snapshot::Anon {
                    va,
                    writable,
                    contents,
                } => {
                    let state = PageState::Uninit(Uninit::new(Loader::Zeroed, VmType::Anon)?);
                    let handle = self.insert(Page::new(va, writable, space.clone(), state))?;
                    let mut page = handle.lock();
                    let result = vm.do_claim(&handle, &mut page);
                    if let Some(frame) = page.frame_mut() {
                        frame.inner_mut().copy_from_slice(&contents[..]);
                    }
                    page.unlock();
                    result?;
                }
            }
        }
        Ok(())
    }

    fn snapshot(page: &mut Page, vm: &Vm, space: &AddressSpace) -> Result<Snapshot, KernelError> {
        let (va, writable) = (page.va(), page.writable());
        if matches!(page.state(), PageState::File(_)) {
            page.writeback()?;
        }
        let state = match page.state() {
            PageState::Uninit(uninit) => PageState::Uninit(uninit.duplicate()),
            PageState::Anon(anon) => {
                let mut contents = Box::new([0; PAGE_SIZE]);
                match (page.frame(), anon.slot()) {
                    (Some(frame), _) => contents.copy_from_slice(frame.inner()),
                    (None, Some(slot)) => vm.swap().read_page(slot, &mut contents)?,
                    (None, None) => return Err(KernelError::InvalidArgument),
                }
                return Ok(Snapshot::Anon {
                    va,
                    writable,
                    contents,
                });
            }
            PageState::File(file) => {
                let loader = Loader::FromFile {
                    file: file.file().duplicate(),
                    offset: file.offset(),
                    read_bytes: file.size(),
                };
                PageState::Uninit(Uninit::new(loader, VmType::File)?)
            }
        };
        Ok(Snapshot::Page(Page::new(va, writable, space.clone(), state)))
    }

    /// Destroys every page and tears the table down.
    ///
    /// Tearing down a table twice does nothing.
    pub fn kill(&self, vm: &Vm) {
        let mut guard = self.pages.lock();
        let pages = guard.take();
        guard.unlock();

        for handle in pages.into_iter().flat_map(BTreeMap::into_values) {
            let mut page = handle.lock();
            page.destroy(vm);
            page.unlock();
        }
    }

    /// Returns true if the table is torn down.
    pub fn is_dead(&self) -> bool {
        let guard = self.pages.lock();
        let dead = guard.is_none();
        guard.unlock();
        dead
    }
}
