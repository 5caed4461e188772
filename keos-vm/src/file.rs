//! Memory-mapped files.
//!
//! `mmap` maps a range of a file into the address space of a process: the
//! `n`-th page of the mapping mirrors the bytes `[offset + n * PAGE_SIZE,
//! offset + (n + 1) * PAGE_SIZE)` of the file. Like every other page, a mapped
//! page is created uninitialized and only read from the file on its first
//! fault. From then on it is a [`FilePage`] that remembers which part of the
//! file it mirrors, through its own handle on the file.
//!
//! A file-backed page never goes to swap. When it is evicted, unmapped or
//! destroyed, the page is written back to the file if the hardware marked it
//! dirty, and its frame is simply dropped; the next fault reads it again from
//! the file.
//!
//! Each process keeps the list of its active mappings as [`MmapRegion`]s, so
//! that `munmap` can find every page of the mapping starting at a given
//! address.

use crate::{
    frame::Frame,
    mm_struct::MmStruct,
    page::VmType,
    page_range,
    uninit::Loader,
};
use alloc::vec::Vec;
use keos::{
    KernelError,
    addressing::{PAGE_MASK, PAGE_SIZE, Va},
    fs::File,
    mm::page_table::PageTable,
};

/// State of a file-backed page.
pub struct FilePage {
    file: File,
    offset: usize,
    size: usize,
}

impl FilePage {
    pub(crate) fn new(file: File, offset: usize, size: usize) -> Self {
        Self { file, offset, size }
    }

    /// Offset of the page in its file.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes of the page backed by the file. The rest of the page
    /// reads as zero and is never written back.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The handle the page reads and writes through.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Reads the page from the file into `frame`.
    pub(crate) fn swap_in(&mut self, frame: &mut Frame) -> Result<(), KernelError> {
        let buf = frame.inner_mut();
        self.file.seek(self.offset);
        if self.file.read(&mut buf[..self.size])? != self.size {
            return Err(KernelError::IOError);
        }
        buf[self.size..].fill(0);
        Ok(())
    }

    /// Writes the page back to the file if it is dirty, then clears the
    /// dirty bit.
    pub(crate) fn writeback(
        &mut self,
        va: Va,
        page_table: &dyn PageTable,
        frame: &Frame,
    ) -> Result<(), KernelError> {
        if page_table.is_dirty(va) {
            self.file.seek(self.offset);
            if self.file.write(&frame.inner()[..self.size])? != self.size {
                return Err(KernelError::IOError);
            }
            page_table.set_dirty(va, false);
        }
        Ok(())
    }
}

/// An active memory mapping of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRegion {
    start: Va,
    end: Va,
}

impl MmapRegion {
    /// The address the mapping starts at, as returned by `mmap`.
    pub fn start(&self) -> Va {
        self.start
    }

    /// The page-aligned end of the mapping (exclusive).
    pub fn end(&self) -> Va {
        self.end
    }

    /// Returns true if `va` lies in the mapping.
    pub fn contains(&self, va: Va) -> bool {
        self.start <= va && va < self.end
    }

    /// Every page of the mapping.
    pub fn pages(&self) -> impl Iterator<Item = Va> {
        page_range(self.start, self.end)
    }
}

impl MmStruct {
    /// Maps `length` bytes of `file`, starting at `offset`, at `addr`.
    ///
    /// The mapping is lazy: one uninitialized file-backed page is created per
    /// page of the range, each with its own handle on the file. The length is
    /// clamped to the bytes the file holds past `offset`; the remainder of the
    /// last page reads as zero.
    ///
    /// # Parameters
    /// - `addr`: where to map the file. Must be non-zero and page aligned.
    /// - `length`: bytes to map. Must be non-zero.
    /// - `writable`: whether the user may write to the mapping.
    /// - `file`: the file to map.
    /// - `offset`: offset of the mapping in the file. Must be page aligned and
    ///   inside the file.
    ///
    /// # Returns
    /// - `Ok(addr)` on success.
    /// - `Err(KernelError::InvalidArgument)` on a bad argument, or if the range
    ///   overlaps an existing page.
    /// - `Err(KernelError::BadAddress)` if the range reaches the kernel.
    pub fn do_mmap(
        &self,
        addr: Va,
        length: usize,
        writable: bool,
        file: &File,
        offset: usize,
    ) -> Result<Va, KernelError> {
        if addr.into_usize() == 0 || addr.offset() != 0 || length == 0 || offset & PAGE_MASK != 0
        {
            return Err(KernelError::InvalidArgument);
        }
        let file_len = file.len();
        if offset >= file_len {
            return Err(KernelError::InvalidArgument);
        }
        let length = length.min(file_len - offset);
        let end = addr
            .into_usize()
            .checked_add(length)
            .and_then(Va::new)
            .map(Va::page_up)
            .filter(|end| self.is_user_range(addr, *end))
            .ok_or(KernelError::BadAddress)?;
        if page_range(addr, end).any(|va| self.spt.find(va).is_some()) {
            return Err(KernelError::InvalidArgument);
        }

        for (i, va) in page_range(addr, end).enumerate() {
            let loader = Loader::FromFile {
                file: file.duplicate(),
                offset: offset + i * PAGE_SIZE,
                read_bytes: (length - i * PAGE_SIZE).min(PAGE_SIZE),
            };
            if let Err(e) = self.alloc_page_with_initializer(VmType::File, va, writable, loader) {
                for va in page_range(addr, va) {
                    self.spt.remove(va, &self.vm);
                }
                return Err(e);
            }
        }

        let mut mmaps = self.mmaps.lock();
        mmaps.push(MmapRegion { start: addr, end });
        mmaps.unlock();
        info!(
            "mmap: pid {} {:?}..{:?} <- file[0x{:x}..0x{:x}]",
            self.pid(),
            addr,
            end,
            offset,
            offset + length
        );
        Ok(addr)
    }

    /// Unmaps the mapping that starts at `addr`.
    ///
    /// Every page of the mapping is removed from the address space; the ones
    /// modified by the user are written back to the file first.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if no mapping starts at `addr`.
    pub fn do_munmap(&self, addr: Va) -> Result<(), KernelError> {
        let mut mmaps = self.mmaps.lock();
        let region = mmaps
            .iter()
            .position(|region| region.start == addr)
            .map(|idx| mmaps.remove(idx));
        mmaps.unlock();

        let region = region.ok_or(KernelError::InvalidArgument)?;
        for va in region.pages() {
            self.spt.remove(va, &self.vm);
        }
        info!(
            "munmap: pid {} {:?}..{:?}",
            self.pid(),
            region.start,
            region.end
        );
        Ok(())
    }

    /// The active mappings of the process.
    pub fn mmaps(&self) -> Vec<MmapRegion> {
        let mmaps = self.mmaps.lock();
        let v = mmaps.clone();
        mmaps.unlock();
        v
    }
}
