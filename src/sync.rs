//! Cross-thread state shared between the control thread and the switch
//! callback context, plus the process-wide open-device registry.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::Duration;

use crate::error::{Error, Result};

/// Reentrancy counter value meaning no switch invocation is in flight.
pub(crate) const REENTER_IDLE: i32 = -1;

pub(crate) const FLAG_INPUT_OVERFLOW: u32 = 1 << 0;
pub(crate) const FLAG_OUTPUT_UNDERFLOW: u32 = 1 << 1;

/// Per-stream state touched from both execution contexts.
///
/// Writer/reader roles per field:
/// - `stop_processing`: control writes on stop; the callback also sets it
///   when the processor completes, and reads it every period.
/// - `zero_output`: control writes on abort, callback writes on completion
///   transitions, callback reads every period.
/// - `reenter_count` / `reenter_error`: callback only, except for the reset
///   in `start` and the bounded idle-waits in stop/abort/close.
/// - `callback_flags`: callback accumulates, callback consumes; control only
///   clears it in `start`.
/// - `stop_playout_count` / `silent_periods`: callback counts, control
///   resets while the device is stopped (or at the abort transition).
/// - `active` / `stopped` / `finished_called`: written by whichever side
///   performs the transition, read by both.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub stopped: AtomicBool,
    pub active: AtomicBool,
    pub stop_processing: AtomicBool,
    pub zero_output: AtomicBool,
    pub reenter_count: AtomicI32,
    pub reenter_error: AtomicU32,
    pub callback_flags: AtomicU32,
    pub stop_playout_count: AtomicU32,
    pub silent_periods: AtomicU32,
    pub finished_called: AtomicBool,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(true),
            active: AtomicBool::new(false),
            stop_processing: AtomicBool::new(false),
            zero_output: AtomicBool::new(false),
            reenter_count: AtomicI32::new(REENTER_IDLE),
            reenter_error: AtomicU32::new(0),
            callback_flags: AtomicU32::new(0),
            stop_playout_count: AtomicU32::new(0),
            silent_periods: AtomicU32::new(0),
            finished_called: AtomicBool::new(false),
        }
    }
}

/// One-shot completion signal: the switch engine sets it when draining has
/// played out, the control thread waits on it with a bounded timeout.
#[derive(Debug)]
pub(crate) struct CompletionSignal {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        *self.state.lock().expect("completion signal poisoned") = false;
    }

    pub fn set(&self) {
        let mut done = self.state.lock().expect("completion signal poisoned");
        *done = true;
        self.condvar.notify_all();
    }

    /// Returns true if the signal was set within the timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.state.lock().expect("completion signal poisoned");
        while !*done {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .condvar
                .wait_timeout(done, deadline - now)
                .expect("completion signal poisoned");
            done = guard;
            if result.timed_out() && !*done {
                return false;
            }
        }
        true
    }
}

/// Interior-mutable cell for the switch engine's real-time tables.
///
/// Soundness rests on the reentrancy protocol, not on this type: the
/// callback context is the only holder of a `&mut` while the counter is
/// non-idle, and the control thread only touches the cell while the device
/// is stopped or after waiting the counter back to idle.
#[derive(Debug)]
pub(crate) struct RtCell<T> {
    data: UnsafeCell<T>,
}

impl<T> RtCell<T> {
    pub fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
        }
    }

    /// Callers uphold the single-context invariant described above.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

unsafe impl<T: Send> Send for RtCell<T> {}
unsafe impl<T: Send> Sync for RtCell<T> {}

/// Process-wide single-open policy.
///
/// The underlying driver ABI only supports one initialized device per
/// process, so opens are serialized through this registry: acquired on a
/// successful open, released on close (or stream drop). A second open while
/// the guard is held fails with `DeviceUnavailable`.
#[derive(Debug)]
pub(crate) struct OpenGuard(());

fn open_registry() -> &'static Mutex<bool> {
    static REGISTRY: OnceLock<Mutex<bool>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(false))
}

impl OpenGuard {
    pub fn acquire() -> Result<Self> {
        let mut open = open_registry().lock().expect("open registry poisoned");
        if *open {
            return Err(Error::DeviceUnavailable);
        }
        *open = true;
        Ok(OpenGuard(()))
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        *open_registry().lock().expect("open registry poisoned") = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn completion_signal_times_out_then_delivers() {
        let signal = Arc::new(CompletionSignal::new());
        assert!(!signal.wait(Duration::from_millis(10)));

        let setter = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(signal.wait(Duration::from_secs(2)));
        handle.join().unwrap();

        signal.reset();
        assert!(!signal.wait(Duration::from_millis(5)));
    }

    #[test]
    fn open_guard_is_exclusive() {
        let first = OpenGuard::acquire().unwrap();
        assert!(matches!(OpenGuard::acquire(), Err(Error::DeviceUnavailable)));
        drop(first);
        let second = OpenGuard::acquire().unwrap();
        drop(second);
    }
}
