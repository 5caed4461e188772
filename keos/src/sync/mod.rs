//! Synchronization primitives.
//!
//! KeOS protects shared kernel state with [`SpinLock`]. Its guard does not
//! release the lock on drop; every critical section ends with an explicit
//! [`SpinLockGuard::unlock`].

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
