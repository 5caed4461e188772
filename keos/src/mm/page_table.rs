//! Entries of Page Table and thier permissions.
//!
//! The virtual memory subsystem never touches page-table pages directly. It
//! drives the hardware translation through the [`PageTable`] capability:
//! install or remove the translation of one page, and query or clear the
//! accessed (`A`) and dirty (`D`) bits the MMU sets on access. The clock
//! evictor samples `A`; the file-backed pages consult `D` to decide whether a
//! write back is needed.
//!
//! [`SoftPageTable`] is a software MMU implementing the capability. It keeps
//! one [`Pte`] per mapped page and, through [`SoftPageTable::translate`],
//! behaves the way the hardware walker does on a user access: it raises a
//! fault for a missing or read-only translation, and otherwise sets the
//! accessed bit (and the dirty bit on a write).
use crate::{
    addressing::{PAGE_MASK, Pa, Va},
    sync::SpinLock,
};
use alloc::collections::BTreeMap;

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry
        const D = 1 << 6;
        /// If IA32_EFER.NXE = 1, execute-disable (if 1, instruction fetches are not allowed from the 4-KByte page controlled by this entry)
        const XD = 1 << 63;
    }
}

impl From<Permission> for PteFlags {
    fn from(perm: Permission) -> Self {
        let mut flags = PteFlags::empty();
        if perm.intersects(Permission::READ | Permission::WRITE | Permission::EXECUTABLE) {
            flags |= PteFlags::P;
        }
        if perm.contains(Permission::WRITE) {
            flags |= PteFlags::RW;
        }
        if perm.contains(Permission::USER) {
            flags |= PteFlags::US;
        }
        if !perm.contains(Permission::EXECUTABLE) {
            flags |= PteFlags::XD;
        }
        flags
    }
}

/// Page Table Entry (PTE).
///
/// A PTE maps one 4-KByte virtual page to a physical frame. The upper bits
/// hold the frame address and the low bits hold [`PteFlags`].
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pte({:016x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pte {
    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the PTE is present, containing the physical address.
    /// - `None` if the PTE is not present (i.e., the "P" flag is not set).
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PteFlags::all().bits())
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Set the physical address for this entry.
    ///
    /// # Parameters
    /// - `pa`: The new physical address to set for the entry.
    ///
    /// # Returns
    /// - `Ok(&mut Self)` if the address is valid and the update is successful.
    /// - `Err(PageTableMappingError::Unaligned)` if the provided physical
    ///   address is not aligned.
    ///
    /// # Warning
    /// This operation does not modify the flags of the entry.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, PageTableMappingError> {
        let pa = pa.into_usize();
        if pa & PAGE_MASK != 0 {
            Err(PageTableMappingError::Unaligned)
        } else {
            self.0 = pa | self.flags().bits() | PteFlags::P.bits();
            Ok(self)
        }
    }

    /// Set the flags for this entry, keeping the physical address.
    #[inline]
    pub fn set_flags(&mut self, perm: PteFlags) -> &mut Self {
        self.0 = self.pa().map(|n| n.into_usize()).unwrap_or(0) | perm.bits();
        self
    }

    /// Clears the entry.
    ///
    /// # Returns
    /// - `Some(Pa)`: The physical address that was previously stored in the
    ///   entry, if it existed.
    /// - `None`: If the entry did not contain a valid physical address.
    #[inline]
    pub fn clear(&mut self) -> Option<Pa> {
        self.pa().inspect(|_| {
            self.0 = 0;
        })
    }
}

/// Page Table Mapping Error.
///
/// This enum represents errors that can occur when working with page table
/// mappings in the virtual memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address provided for a page table entry
    /// is not properly aligned to the page size.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not exist
    /// or is invalid.
    NotExist,

    /// Duplicated mapping.
    ///
    /// This error is returned when an attempt is made to create a duplicate
    /// mapping for an address that already has an existing mapping.
    Duplicated,

    /// Invalid permission.
    ///
    /// This error is returned when an attempt is made to create a mapping with
    /// an invalid permission, or when an access violates the permission of an
    /// existing mapping.
    InvalidPermission,
}

impl From<PageTableMappingError> for crate::KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned => crate::KernelError::InvalidArgument,
            PageTableMappingError::NotExist => crate::KernelError::BadAddress,
            PageTableMappingError::Duplicated => crate::KernelError::FileExist,
            PageTableMappingError::InvalidPermission => crate::KernelError::InvalidAccess,
        }
    }
}

bitflags::bitflags! {
    /// Possible memory permissions for a page.
    ///
    /// This defines the various permissions that can be assigned
    /// to memory pages in a page table. Each permission is represented by a single bit,
    /// allowing for efficient bitwise operations to check or modify permissions.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;

        /// Page is writable.
        ///
        /// This permission allows write access to the page. The page can be
        /// modified by a process.
        const WRITE = 1 << 1;

        /// Page is executable.
        const EXECUTABLE = 1 << 2;

        /// Page can be referred by user application.
        ///
        /// This permission allows the page to be accessed by user-mode applications.
        /// Typically, the kernel uses this flag to differentiate between user-mode and
        /// kernel-mode access.
        const USER = 1 << 3;
    }
}

/// The hardware page table of an address space.
///
/// Implementors own the translation structures of one process. Every method
/// takes `&self`; the implementor serializes concurrent updates itself, so
/// that the frame table may clear the accessed bit of a page owned by another
/// process without holding that process' locks.
pub trait PageTable: Send + Sync {
    /// Maps `va` to the frame at `pa` with the permission `perm`.
    ///
    /// # Returns
    /// - `Err(PageTableMappingError::Unaligned)` if either address is not page
    ///   aligned.
    /// - `Err(PageTableMappingError::Duplicated)` if `va` is already mapped.
    fn map(&self, va: Va, pa: Pa, perm: Permission) -> Result<(), PageTableMappingError>;

    /// Removes the translation of `va`, returning the frame it pointed to.
    fn unmap(&self, va: Va) -> Result<Pa, PageTableMappingError>;

    /// Returns a copy of the entry that translates `va`.
    fn walk(&self, va: Va) -> Result<Pte, PageTableMappingError>;

    /// Applies `f` to the entry that translates `va`.
    fn update(&self, va: Va, f: &mut dyn FnMut(&mut Pte)) -> Result<(), PageTableMappingError>;

    /// Returns true if the hardware accessed the page since the bit was last
    /// cleared. An unmapped page is never accessed.
    fn is_accessed(&self, va: Va) -> bool {
        self.walk(va)
            .map(|pte| pte.flags().contains(PteFlags::A))
            .unwrap_or(false)
    }

    /// Sets or clears the accessed bit of `va`.
    fn set_accessed(&self, va: Va, accessed: bool) {
        let _ = self.update(va, &mut |pte| {
            let mut flags = pte.flags();
            flags.set(PteFlags::A, accessed);
            pte.set_flags(flags);
        });
    }

    /// Returns true if the page was written since the bit was last cleared.
    /// An unmapped page is never dirty.
    fn is_dirty(&self, va: Va) -> bool {
        self.walk(va)
            .map(|pte| pte.flags().contains(PteFlags::D))
            .unwrap_or(false)
    }

    /// Sets or clears the dirty bit of `va`.
    fn set_dirty(&self, va: Va, dirty: bool) {
        let _ = self.update(va, &mut |pte| {
            let mut flags = pte.flags();
            flags.set(PteFlags::D, dirty);
            pte.set_flags(flags);
        });
    }
}

/// A software implementation of the [`PageTable`] capability.
///
/// Translations are kept in an ordered map from page-aligned virtual address
/// to [`Pte`]. The intermediate levels of the x86_64 walk carry no
/// information the virtual memory subsystem uses, so they are not modeled.
#[derive(Default)]
pub struct SoftPageTable {
    entries: SpinLock<BTreeMap<Va, Pte>>,
}

impl SoftPageTable {
    /// Creates an empty page table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates a user access to `va` the way the MMU does.
    ///
    /// # Returns
    /// - `Ok(Pa)`: the physical address of the accessed byte. The accessed
    ///   bit, and for a write the dirty bit, of the entry is set.
    /// - `Err(PageTableMappingError::NotExist)`: a not-present page fault.
    /// - `Err(PageTableMappingError::InvalidPermission)`: a protection fault
    ///   (write to a read-only page, or a kernel-only page).
    pub fn translate(&self, va: Va, is_write: bool) -> Result<Pa, PageTableMappingError> {
        let mut entries = self.entries.lock();
        let result = match entries.get_mut(&va.page_down()) {
            Some(pte) => match pte.pa() {
                None => Err(PageTableMappingError::NotExist),
                Some(_) if !pte.flags().contains(PteFlags::US) => {
                    Err(PageTableMappingError::InvalidPermission)
                }
                Some(_) if is_write && !pte.flags().contains(PteFlags::RW) => {
                    Err(PageTableMappingError::InvalidPermission)
                }
                Some(pa) => {
                    let mut flags = pte.flags() | PteFlags::A;
                    if is_write {
                        flags |= PteFlags::D;
                    }
                    pte.set_flags(flags);
                    Ok(pa + va.offset())
                }
            },
            None => Err(PageTableMappingError::NotExist),
        };
        entries.unlock();
        result
    }

    /// Returns the number of mapped pages.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        let len = entries.len();
        entries.unlock();
        len
    }

    /// Returns true if no page is mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PageTable for SoftPageTable {
    fn map(&self, va: Va, pa: Pa, perm: Permission) -> Result<(), PageTableMappingError> {
        if va.offset() != 0 || pa.offset() != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        let flags = PteFlags::from(perm);
        if !flags.contains(PteFlags::P) {
            return Err(PageTableMappingError::InvalidPermission);
        }
        let mut entries = self.entries.lock();
        let result = if entries.contains_key(&va) {
            Err(PageTableMappingError::Duplicated)
        } else {
            let mut pte = Pte(0);
            pte.set_flags(flags);
            let result = pte.set_pa(pa).map(|_| ());
            if result.is_ok() {
                entries.insert(va, pte);
            }
            result
        };
        entries.unlock();
        result
    }

    fn unmap(&self, va: Va) -> Result<Pa, PageTableMappingError> {
        if va.offset() != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        let mut entries = self.entries.lock();
        let result = entries
            .remove(&va)
            .and_then(|mut pte| pte.clear())
            .ok_or(PageTableMappingError::NotExist);
        entries.unlock();
        result
    }

    fn walk(&self, va: Va) -> Result<Pte, PageTableMappingError> {
        let entries = self.entries.lock();
        let result = entries
            .get(&va.page_down())
            .copied()
            .ok_or(PageTableMappingError::NotExist);
        entries.unlock();
        result
    }

    fn update(&self, va: Va, f: &mut dyn FnMut(&mut Pte)) -> Result<(), PageTableMappingError> {
        let mut entries = self.entries.lock();
        let result = match entries.get_mut(&va.page_down()) {
            Some(pte) => {
                f(pte);
                Ok(())
            }
            None => Err(PageTableMappingError::NotExist),
        };
        entries.unlock();
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    fn pa(addr: usize) -> Pa {
        Pa::new(addr).unwrap()
    }

    #[test]
    fn permission_to_flags() {
        let rw = PteFlags::from(Permission::READ | Permission::WRITE | Permission::USER);
        assert_eq!(rw, PteFlags::P | PteFlags::RW | PteFlags::US | PteFlags::XD);
        let rx = PteFlags::from(Permission::READ | Permission::EXECUTABLE);
        assert_eq!(rx, PteFlags::P);
        assert!(!PteFlags::from(Permission::USER).contains(PteFlags::P));
    }

    #[test]
    fn map_unmap() {
        let pt = SoftPageTable::new();
        let perm = Permission::READ | Permission::USER;
        assert_eq!(pt.map(va(0x4000_0000), pa(0x20_0000), perm), Ok(()));
        assert_eq!(
            pt.map(va(0x4000_0000), pa(0x21_0000), perm),
            Err(PageTableMappingError::Duplicated)
        );
        assert_eq!(
            pt.map(va(0x4000_0010), pa(0x21_0000), perm),
            Err(PageTableMappingError::Unaligned)
        );
        assert_eq!(pt.walk(va(0x4000_0fff)).unwrap().pa(), Some(pa(0x20_0000)));
        assert_eq!(pt.unmap(va(0x4000_0000)), Ok(pa(0x20_0000)));
        assert_eq!(pt.unmap(va(0x4000_0000)), Err(PageTableMappingError::NotExist));
        assert!(pt.is_empty());
    }

    #[test]
    fn translate_sets_access_bits() {
        let pt = SoftPageTable::new();
        let page = va(0x4000_0000);
        pt.map(page, pa(0x20_0000), Permission::READ | Permission::USER)
            .unwrap();
        assert!(!pt.is_accessed(page));
        assert_eq!(pt.translate(page + 0x10, false), Ok(pa(0x20_0010)));
        assert!(pt.is_accessed(page));
        assert!(!pt.is_dirty(page));
        assert_eq!(
            pt.translate(page, true),
            Err(PageTableMappingError::InvalidPermission)
        );
        assert_eq!(
            pt.translate(page + 0x1000, false),
            Err(PageTableMappingError::NotExist)
        );
        pt.set_accessed(page, false);
        assert!(!pt.is_accessed(page));

        let writable = va(0x4000_1000);
        pt.map(
            writable,
            pa(0x20_1000),
            Permission::READ | Permission::WRITE | Permission::USER,
        )
        .unwrap();
        assert!(pt.translate(writable, true).is_ok());
        assert!(pt.is_dirty(writable));
        pt.set_dirty(writable, false);
        assert!(!pt.is_dirty(writable));
        assert_eq!(pt.walk(writable).unwrap().pa(), Some(pa(0x20_1000)));
    }
}
