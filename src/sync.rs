//! Locking primitives without lock poisoning.
//!
//! The state shared between a producer thread and its consumer lives behind a [`Mutex`] and is
//! signaled through [`Condvar`]s. If user code panics on either side while the lock is held, the
//! standard library would poison the lock and every later access would have to deal with a
//! `PoisonError`, even though the channel state itself is always left consistent (every mutation
//! is a single push, pop or flag store).
//!
//! Panics are already reported through the channel's terminal state and through [`Worker`]
//! joining, so poisoning would only turn one failure into a cascade of knock-on panics on the
//! other side. These wrappers recover the guard instead.
//!
//! [`Worker`]: crate::worker::Worker

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync,
    time::Duration,
};

#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        MutexGuard { inner: guard }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(sync::TryLockError::Poisoned(poison)) => poison.into_inner(),
            Err(sync::TryLockError::WouldBlock) => return None,
        };

        Some(MutexGuard { inner: guard })
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(val) => s.field("data", &&*val),
            None => s.field("data", &"<locked>"),
        }
        .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[derive(Debug, Default)]
pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    /// Waits for a notification or until `dur` has elapsed, whichever comes first.
    ///
    /// Spurious wakeups are possible; callers re-check their condition in a loop.
    pub fn wait_timeout<'a, T>(&self, guard: MutexGuard<'a, T>, dur: Duration) -> MutexGuard<'a, T> {
        let (guard, _) = match self.inner.wait_timeout(guard.inner, dur) {
            Ok(out) => out,
            Err(poison) => poison.into_inner(),
        };
        MutexGuard { inner: guard }
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}
