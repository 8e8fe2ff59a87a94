use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::MAX_LOCK_TIMEOUT_MS;

/// exclusive row lock with a bounded wait.
///
/// `held` is the lock itself; `row` is only touched by whoever set `held`,
/// so its mutex is never contended and exists to hand out `&mut T` safely.
pub(crate) struct RowLock<T> {
    held: Mutex<bool>,
    released: Condvar,
    row: Mutex<T>,
}

impl<T> RowLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
            row: Mutex::new(value),
        }
    }

    /// wait up to `timeout` for the row; `None` when it stayed held
    pub(crate) fn try_lock_for(self: &Arc<Self>, timeout: Duration) -> Option<RowGuard<T>> {
        let deadline = Instant::now() + timeout.min(Duration::from_millis(MAX_LOCK_TIMEOUT_MS));
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);

        while *held {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }

        *held = true;
        Some(RowGuard {
            lock: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        drop(held);
        self.released.notify_one();
    }

    fn row(&self) -> MutexGuard<'_, T> {
        self.row.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// proof of holding a row; released on drop
pub(crate) struct RowGuard<T> {
    lock: Arc<RowLock<T>>,
}

impl<T> RowGuard<T> {
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut row = self.lock.row();
        f(&mut row)
    }
}

impl<T> Drop for RowGuard<T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
