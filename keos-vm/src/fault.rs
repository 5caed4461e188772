//! Page fault handling.
//!
//! A page fault is how a user process asks for a page that is not resident.
//! The trap handler decodes the hardware error code and the faulting address
//! (`cr2`) into a [`PageFaultReason`] and hands it to
//! [`MmStruct::handle_page_fault`] of the faulting process. When the handler
//! succeeds, the faulting instruction is simply restarted; when it fails, the
//! caller kills the process.
//!
//! The handler resolves a fault in a single pass:
//!
//! 1. A user access to a kernel address is an invalid access.
//! 2. A write just below the stack with no page there grows the stack, as
//!    long as the stack stays within [`VmConfig::stack_limit`].
//! 3. Otherwise the faulting page must be in the supplemental page table.
//! 4. A write to a present page, or to a read-only page, is an invalid
//!    access. There is no copy-on-write.
//! 5. Otherwise the page is claimed: it gets a frame, its contents, and a
//!    mapping.
//!
//! [`VmConfig::stack_limit`]: crate::VmConfig::stack_limit

use crate::{mm_struct::MmStruct, page::VmType, page_range};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    task::PFErrorCode,
};

/// Represents the reason for a page fault.
///
/// This struct is built from the error code pushed by the CPU and the value
/// of the `cr2` register.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultReason {
    /// The address of memory that caused the fault.
    pub fault_addr: Va,
    /// True if the fault was caused by a write access.
    pub is_write_access: bool,
    /// True if the fault hit a present page (a protection violation); false
    /// if the page was not present.
    pub is_present: bool,
    /// True if the access originated from user mode.
    pub is_user: bool,
}

impl PageFaultReason {
    /// Decodes the error code `ec` of a fault on `cr2`.
    pub fn new(ec: PFErrorCode, cr2: Va) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            is_user: ec.contains(PFErrorCode::USER),
        }
    }

    /// Returns true if the fault hit a page that is not present.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }

    /// Returns true if the fault is a write to a present, read-only mapping.
    #[inline]
    pub fn is_write_protect_fault(&self) -> bool {
        self.is_present && self.is_write_access
    }
}

impl MmStruct {
    /// Resolves the page fault described by `reason`.
    ///
    /// # Returns
    /// - `Ok(())` if the faulting page is now resident and mapped.
    /// - `Err(KernelError::InvalidAccess)` for a user access to the kernel, a
    ///   write-protect fault, a write to a read-only page, or a stack that
    ///   would outgrow its limit.
    /// - `Err(KernelError::BadAddress)` if no page covers the address.
    /// - Any error of the claim, such as `Err(KernelError::IOError)`.
    pub fn handle_page_fault(&self, reason: &PageFaultReason) -> Result<(), KernelError> {
        let addr = reason.fault_addr;
        if reason.is_user && !self.is_user_addr(addr) {
            return Err(KernelError::InvalidAccess);
        }

        let page = match self.spt.find(addr) {
            Some(page) => page,
            None if reason.is_write_access && self.in_stack_window(addr) => {
                return self.grow_stack(addr);
            }
            None => return Err(KernelError::BadAddress),
        };
        if reason.is_write_protect_fault() {
            return Err(KernelError::InvalidAccess);
        }

        let mut guard = page.lock();
        let result = if reason.is_write_access && !guard.writable() {
            Err(KernelError::InvalidAccess)
        } else {
            self.vm.do_claim(&page, &mut guard)
        };
        guard.unlock();
        self.vm.check_exhaustion(result)
    }

    fn in_stack_window(&self, addr: Va) -> bool {
        let config = self.vm.config();
        let top = config.user_stack.into_usize();
        let bottom = top.saturating_sub(config.stack_limit + PAGE_SIZE);
        (bottom..top).contains(&addr.into_usize())
    }

    /// Grows the stack down to the page containing `addr`.
    ///
    /// Every missing page between `addr` and the stack top is allocated as a
    /// writable anonymous page and claimed right away.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidAccess)` if the stack would exceed
    ///   [`VmConfig::stack_limit`], or `addr` is above the stack top.
    ///
    /// [`VmConfig::stack_limit`]: crate::VmConfig::stack_limit
    pub fn grow_stack(&self, addr: Va) -> Result<(), KernelError> {
        let config = self.vm.config();
        let (bottom, top) = (addr.page_down(), config.user_stack);
        if bottom >= top || top - bottom > config.stack_limit {
            warning!(
                "VM: pid {} stack growth to {:?} rejected (limit {} KiB).",
                self.pid(),
                addr,
                config.stack_limit / 1024
            );
            return Err(KernelError::InvalidAccess);
        }
        for va in page_range(bottom, top) {
            if self.spt.find(va).is_none() {
                self.alloc_page(VmType::Anon, va, true)?;
                self.claim_page(va)?;
            }
        }
        debug!(
            "VM: pid {} stack grown to {:?} ({} KiB).",
            self.pid(),
            bottom,
            (top - bottom) / 1024
        );
        Ok(())
    }
}
