//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for virtual address and physical
//! address. A user process names memory with [`Va`]s; the hardware page table
//! translates each virtual page into a physical frame named by a [`Pa`].
//!
//! Both [`Pa`] and [`Va`] support arithmetic operations (addition,
//! subtraction, bitwise operations), which allow straightforward address
//! arithmetic without unwrapping the raw integer.
//!
//! ## Example Usage:
//!
//! ```
//! use keos::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(0x4000_1234).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x4000_1000);
//! assert_eq!((va.page_down() + PAGE_SIZE).into_usize(), 0x4000_2000);
//! ```

/// The size of a single page in memory, in bytes.
///
/// This constant represents the size of a memory page, which is 4 KiB
/// (kilobytes). It determines the unit of every virtual-to-physical
/// translation, of frame allocation and of swapping.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
///
/// ## Example:
/// ```
/// use keos::addressing::PAGE_MASK;
///
/// assert_eq!(0x1234_5678 & PAGE_MASK, 0x678);
/// ```
pub const PAGE_MASK: usize = 0xfff;

/// Represents a physical address.
///
/// The `Pa` (Physical Address) struct is a wrapper around the `usize` type,
/// which represents a physical address in memory. It is used to handle
/// addresses that correspond directly to the hardware memory locations in the
/// physical address space.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// The address must be less than `0xffff_0000_0000_0000`, which ensures it
    /// falls within the valid physical address range.
    ///
    /// # Arguments
    /// - `addr`: A `usize` representing the physical address.
    ///
    /// # Returns
    /// - `Some(Pa)` if the address is valid.
    /// - `None` if the address is outside the valid range.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the physical address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up to the physical address to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// The [`Va`] (Virtual Address) struct represents an address in the virtual
/// memory space used by the kernel or user-space applications.
///
/// This abstraction provides utility methods for validation, alignment, and
/// address manipulation, ensuring safe and consistent handling of virtual
/// addresses.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is valid.
    ///
    /// This method checks whether the given address is canonical, i.e. bits
    /// 48..64 all copy bit 47.
    ///
    /// # Arguments
    /// - `addr`: A `usize` representing the virtual address.
    ///
    /// # Returns
    /// - `Some(Va)`: If the address is within the valid virtual memory range.
    /// - `None`: If the address is invalid.
    ///
    /// # Example
    /// ```
    /// use keos::addressing::Va;
    ///
    /// assert!(Va::new(0xFFFF_8000_1234_5678).is_some());
    /// assert!(Va::new(0xFFFF_7000_1234_5678).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    ///
    /// # Example
    /// ```
    /// use keos::addressing::Va;
    ///
    /// let va = Va::new(0xFFFF_8000_1234_5678).unwrap();
    /// assert_eq!(va.page_down().into_usize(), 0xFFFF_8000_1234_5000);
    /// ```
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    ///
    /// # Example
    /// ```
    /// use keos::addressing::Va;
    ///
    /// let va = Va::new(0xFFFF_8000_1234_5678).unwrap();
    /// assert_eq!(va.page_up().into_usize(), 0xFFFF_8000_1234_6000);
    /// ```
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
