//! # KeOS: KAIST Educational Operating System
//!
//! This crate is the foundation the KeOS virtual memory subsystem is built
//! on. It provides the kernel-wide vocabulary every memory-management
//! component speaks:
//!
//! - [`KernelError`], the error type returned by every fallible kernel
//!   operation and handed back to user programs as a negative errno.
//! - [`addressing`], the virtual ([`Va`]) and physical ([`Pa`]) address
//!   newtypes and the page-size constants.
//! - [`sync`], the SMP-supported [`SpinLock`] whose guard must be released
//!   explicitly.
//! - [`mm`], physical pages and the bitmap-backed physical page allocator,
//!   and [`mm::page_table`], the hardware page-table capability.
//! - [`fs`], block devices, disks and regular files.
//! - [`task`], the page-fault error code reported by the trap handler.
//!
//! The kernel prints through the [`info!`], [`warning!`] and [`debug!`]
//! macros, which forward to the [`log`] facade. The kernel (or a test
//! harness) installs whatever logger it wants.
//!
//! ## Implementation Notes
//!
//! Every device the memory subsystem talks to is consumed through a trait
//! ([`fs::traits::BlockDevice`], [`fs::traits::RegularFile`],
//! [`mm::page_table::PageTable`]). This crate also ships in-memory
//! implementations of them ([`fs::RamDisk`], [`fs::MemFile`],
//! [`mm::page_table::SoftPageTable`]) so that the memory subsystem can be
//! exercised outside of QEMU.
//!
//! [`Va`]: addressing::Va
//! [`Pa`]: addressing::Pa
//! [`SpinLock`]: sync::SpinLock

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

#[macro_use]
pub mod kprint;

pub mod addressing;
pub mod fs;
pub mod mm;
pub mod sync;
pub mod task;

#[doc(hidden)]
pub use log;

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by the kernel operation.
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a kernel operation. These errors can be
/// returned to the user program to indicate the nature of the failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// IO Error. (EIO)
    IOError,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::IOError => -5,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -5 => Ok(Self::IOError),
            -9 => Ok(Self::BadFileDescriptor),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -16 => Ok(Self::Busy),
            -17 => Ok(Self::FileExist),
            -22 => Ok(Self::InvalidArgument),
            -28 => Ok(Self::NoSpace),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}
