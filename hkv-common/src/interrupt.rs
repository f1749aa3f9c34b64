//! # Thread Interruption
//!
//! Purpose: Let one thread tell another that it should stop waiting.
//! Blocking retrieval on a command handle observes the flag of the calling
//! thread and fails with `HkvError::Interrupted` instead of waiting on.
//!
//! ## Usage
//!
//! ```rust
//! use hkv_common::interrupt;
//!
//! let me = interrupt::current();
//! let handle = std::thread::spawn(move || me.interrupt());
//! handle.join().unwrap();
//! assert!(interrupt::current().is_interrupted());
//! interrupt::current().clear();
//! ```
//!
//! ## Notes
//! - Observing the flag inside a wait clears it, so a retry waits normally.
//! - A thread parks on at most one command at a time; `interrupt` wakes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Something a parked thread waits on and that can be woken from outside.
pub(crate) trait Unpark: Send + Sync {
    fn unpark(&self);
}

struct InterruptState {
    flag: AtomicBool,
    parked: Mutex<Option<Arc<dyn Unpark>>>,
}

/// Handle to the interrupt flag of one thread.
#[derive(Clone)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

thread_local! {
    static CURRENT: Interrupter = Interrupter::new();
}

/// Returns the interrupter of the calling thread.
pub fn current() -> Interrupter {
    CURRENT.with(Interrupter::clone)
}

impl Interrupter {
    fn new() -> Self {
        Interrupter {
            state: Arc::new(InterruptState {
                flag: AtomicBool::new(false),
                parked: Mutex::new(None),
            }),
        }
    }

    /// Sets the flag and wakes the thread if it is waiting on a command.
    pub fn interrupt(&self) {
        self.state.flag.store(true, Ordering::SeqCst);
        // Clone out of the lock: unpark takes the command's own lock.
        let parked = self.state.parked.lock().clone();
        if let Some(target) = parked {
            target.unpark();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.flag.load(Ordering::SeqCst)
    }

    /// Clears the flag and returns whether it was set.
    pub fn clear(&self) -> bool {
        self.state.flag.swap(false, Ordering::SeqCst)
    }

    /// Registers `target` as the thing this thread is waiting on until the
    /// guard is dropped.
    pub(crate) fn park_on(&self, target: Arc<dyn Unpark>) -> ParkGuard<'_> {
        *self.state.parked.lock() = Some(target);
        ParkGuard { interrupter: self }
    }
}

pub(crate) struct ParkGuard<'a> {
    interrupter: &'a Interrupter,
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        self.interrupter.state.parked.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_is_per_thread() {
        current().interrupt();
        let other = std::thread::spawn(|| current().is_interrupted()).join().unwrap();
        assert!(!other);
        assert!(current().clear());
        assert!(!current().is_interrupted());
    }
}
