//! Concurrency utilities for strata.

use parking_lot::{Condvar, Mutex};

/// A reader/writer lock with opaque, unpaired acquire and release operations.
///
/// Partitions expose hold/release pairs that do not follow RAII guard scoping:
/// an iterator may acquire a hold in one call and release it in another, much
/// later call. `HoldLock` supports that protocol directly. Many concurrent
/// holders may coexist, or a single exclusive holder.
pub struct HoldLock {
    state: Mutex<HoldState>,
    cond: Condvar,
}

struct HoldState {
    holders: usize,
    exclusive: bool,
}

impl HoldLock {
    /// Creates an unheld lock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HoldState {
                holders: 0,
                exclusive: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquires a shared hold, blocking while an exclusive hold is active.
    pub fn hold(&self) {
        let mut state = self.state.lock();
        while state.exclusive {
            self.cond.wait(&mut state);
        }
        state.holders += 1;
    }

    /// Releases a shared hold previously acquired with [`HoldLock::hold`].
    pub fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.holders > 0, "release without a matching hold");
        state.holders = state.holders.saturating_sub(1);
        if state.holders == 0 {
            self.cond.notify_all();
        }
    }

    /// Acquires the exclusive hold, blocking until all shared holders release.
    pub fn exclusive_hold(&self) {
        let mut state = self.state.lock();
        while state.exclusive || state.holders > 0 {
            self.cond.wait(&mut state);
        }
        state.exclusive = true;
    }

    /// Releases the exclusive hold.
    pub fn exclusive_release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive, "exclusive release without exclusive hold");
        state.exclusive = false;
        self.cond.notify_all();
    }
}

impl Default for HoldLock {
    fn default() -> Self {
        Self::new()
    }
}
