//! SMP-supported spinlock.
//!
//! To acquire a lock on multi-processor, a processor 1) polls a variable that
//! represents a value is locked or not 2) set the variable when a thread holds
//! the `lock`, and 3) unset the variable when the thread `unlock`.
//!
//! The step 1 and 2 must be executed ATOMICALLY with the atomic
//! read-modify-write instructions of the CPU.
//!
//! Unlike the standard library mutex, the guard of a KeOS spinlock is NOT
//! released on drop. Every critical section must end with an explicit
//! [`SpinLockGuard::unlock`], which makes the extent of each critical section
//! visible in the code. Dropping a guard that is still locked panics and
//! reports where the lock was taken.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::{Backoff, CachePadded};

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug)]
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data
///
/// This spinlock will block threads waiting for the lock to become available.
/// The spinlock can be created via a [`new`] constructor. Each spinlock has a
/// type parameter which represents the data that it is protecting. The data can
/// only be accessed through the guards returned from [`lock`] and
/// [`try_lock`], which guarantees that the data is only ever accessed when the
/// spinlock is locked.
///
/// [`new`]: Self::new
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```
/// use keos::sync::SpinLock;
///
/// let data = SpinLock::new(0);
///
/// let mut guard = data.lock();
/// *guard += 1;
/// // the lock must be "explicitly" unlocked before `guard` goes out of scope.
/// guard.unlock();
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: CachePadded<AtomicBool>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: CachePadded::new(AtomicBool::new(false)),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, blocking the current thread until it is able to do
    /// so.
    ///
    /// Upon returning, the thread is the only thread with the lock held. A
    /// guard is returned to allow scoped access of the lock. When the guard
    /// goes out of scope without [`SpinLockGuard::unlock`], panic occurs.
    ///
    /// The exact behavior on locking a spinlock in the thread which already
    /// holds the lock is left unspecified. However, this function will not
    /// return on the second call.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// If the lock could not be acquired at this time, then [`Err`] is
    /// returned. Otherwise, a guard is returned.
    ///
    /// This function does not block.
    ///
    /// # Errors
    ///
    /// If the spinlock could not be acquired because it is already locked, then
    /// this call will return the [`WouldBlock`] error.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Returns true if some thread currently holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for SpinLock<T> {
    /// Creates a `SpinLock<T>`, with the `Default` value for T.
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a spinlock. When this structure
/// is dropped (falls out of scope) without unlock, panic occurs.
///
/// The lock must be explicitly unlocked by [`unlock`] method.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`SpinLock`].
///
/// [`lock`]: SpinLock::lock
/// [`try_lock`]: SpinLock::try_lock
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    // The guard must be released on the cpu that acquired it.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    ///
    /// As the guard does **not** automatically release the lock on drop,
    /// the caller must explicitly invoke [`unlock`] to mark the lock
    /// as available again.
    ///
    /// [`unlock`]: Self::unlock
    pub fn unlock(self) {
        self.lock.locked.store(false, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        panic!(
            "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {:?}.",
            self.caller
        );
    }
}
