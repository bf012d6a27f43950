//! Process-wide run state, modeled as an explicit object instead of file-scope globals:
//! the stop flag (SIGINT, to-host), the halt value, and the snapshot counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Why a run loop returned.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StopReason {
    /// The program wrote to the to-host address; the payload is the written value.
    /// By convention, a value of 1 is a clean finish.
    ToHost(u64),
    /// The configured step limit was reached.
    StepLimit,
    /// The stop flag was raised externally (SIGINT or another thread).
    Interrupted,
}

impl StopReason {
    /// The process exit code this stop maps to: 0 only for a clean to-host finish.
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::ToHost(1) => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    stop: AtomicBool,
    tohost: Mutex<Option<u64>>,
    snapshot_counter: AtomicU64,
}

/// Shared, cloneable session handle. Run threads check [`Session::stopped`] between steps;
/// nothing is interrupted mid-instruction.
#[derive(Debug, Clone, Default)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the run loops to stop at the next step boundary.
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Record a to-host write; the first one wins and stops the run.
    pub fn record_tohost(&self, value: u64) {
        let mut tohost = self.inner.tohost.lock().unwrap();
        if tohost.is_none() {
            *tohost = Some(value);
        }
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn tohost(&self) -> Option<u64> {
        *self.inner.tohost.lock().unwrap()
    }

    /// Monotone counter used to name periodic snapshots.
    pub fn next_snapshot_index(&self) -> u64 {
        self.inner.snapshot_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Reset for a fresh run (keeps the snapshot counter).
    pub fn rearm(&self) {
        self.inner.stop.store(false, Ordering::SeqCst);
        *self.inner.tohost.lock().unwrap() = None;
    }
}
