//! Fiber-local storage.
//!
//! The fiber analogue of thread-local storage: a value set through a
//! [`FiberLocalStorage`] handle is visible only to the fiber that set it,
//! and follows the fiber when it resumes on a different OS thread.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Fiber;

static NEXT_KEY: AtomicUsize = AtomicUsize::new(0);

/// A typed per-fiber storage slot.
///
/// Each handle owns a distinct slot; every fiber (including the
/// per-thread root fiber) sees its own value, defaulting to
/// `T::default()` until set.
pub struct FiberLocalStorage<T> {
    key: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + Default + Send + 'static> FiberLocalStorage<T> {
    pub fn new() -> FiberLocalStorage<T> {
        FiberLocalStorage {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    /// The current fiber's value for this slot (default if unset).
    pub fn get(&self) -> T {
        Fiber::current().fls_get::<T>(self.key)
    }

    /// Set the current fiber's value for this slot.
    pub fn set(&self, value: T) {
        Fiber::current().fls_set(self.key, value);
    }
}

impl<T: Clone + Default + Send + 'static> Default for FiberLocalStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}
