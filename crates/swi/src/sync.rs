//! Platform abstraction for synchronization primitives.
//!
//! The scheduler serializes every access to its shared state through one
//! [`Mutex`]; holding it is this port's stand-in for running with
//! interrupts disabled. The default backend is `std::sync::Mutex`; the
//! `lock-free` feature swaps in `spin::Mutex` for targets where blocking
//! on the OS is unacceptable.

pub use std::sync::Arc;

#[cfg(not(feature = "lock-free"))]
pub type MutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;
#[cfg(feature = "lock-free")]
pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Backend-switched mutex wrapper.
///
/// In `std` mode, panics if the mutex is poisoned: a callback that panicked
/// mid-dispatch leaves the scheduler state unreconstructable, so poisoning
/// is not recoverable here.
pub struct Mutex<T> {
    #[cfg(not(feature = "lock-free"))]
    inner: std::sync::Mutex<T>,
    #[cfg(feature = "lock-free")]
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex protecting the given value.
    pub fn new(value: T) -> Self {
        Self {
            #[cfg(not(feature = "lock-free"))]
            inner: std::sync::Mutex::new(value),
            #[cfg(feature = "lock-free")]
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquires the mutex, blocking until it becomes available.
    ///
    /// # Panics
    ///
    /// With the default backend, panics if the mutex has been poisoned.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        #[cfg(not(feature = "lock-free"))]
        {
            self.inner.lock().expect("mutex poisoned")
        }
        #[cfg(feature = "lock-free")]
        {
            self.inner.lock()
        }
    }
}
