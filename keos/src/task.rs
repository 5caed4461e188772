//! Interface between the trap handler and a user process.
//!
//! On a page fault the CPU pushes an error code describing the access and
//! stores the faulting address in `cr2`. The trap handler hands both to the
//! memory subsystem of the faulting process.

bitflags::bitflags! {
    /// Error code of a page fault.
    pub struct PFErrorCode: u64 {
        /// The fault was caused by a page-protection violation. When clear,
        /// the fault was caused by a non-present page.
        const PRESENT = 1 << 0;
        /// The fault was caused by a write access. When clear, by a read.
        const WRITE_ACCESS = 1 << 1;
        /// The fault was caused while the CPU was in user mode.
        const USER = 1 << 2;
        /// A reserved bit of a paging-structure entry was set.
        const RESERVED_WRITE = 1 << 3;
        /// The fault was caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Identifier of a user process.
pub type Pid = usize;
