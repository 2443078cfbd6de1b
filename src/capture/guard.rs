//! Single-in-flight capture guard.
//!
//! A tick that finds the guard `Capturing` is dropped, never queued. The
//! permit returns the guard to `Idle` when it is dropped, which covers early
//! returns, timeouts, panics and aborted tasks alike.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Capturing,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureGuard {
    capturing: Arc<AtomicBool>,
}

impl CaptureGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<CapturePermit> {
        self.capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CapturePermit {
                capturing: Arc::clone(&self.capturing),
            })
    }

    pub fn state(&self) -> GuardState {
        if self.capturing.load(Ordering::Acquire) {
            GuardState::Capturing
        } else {
            GuardState::Idle
        }
    }
}

#[derive(Debug)]
pub struct CapturePermit {
    capturing: Arc<AtomicBool>,
}

impl Drop for CapturePermit {
    fn drop(&mut self) {
        self.capturing.store(false, Ordering::Release);
    }
}
