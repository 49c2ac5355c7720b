use std::{fmt, sync::Arc, time::Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct WakeState {
    woken: bool,
    stopped: bool,
}

/// Sleep/wake rendezvous between a run loop and other threads.
#[derive(Default)]
pub(crate) struct WakeSignal {
    state: Mutex<WakeState>,
    condvar: Condvar,
}

impl WakeSignal {
    /// Blocks until `deadline`, a wake-up or a stop request.
    ///
    /// Returns `true` if interrupted before the deadline. A wake-up sent
    /// while nobody was waiting is not lost; it ends the next wait at once.
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while !state.woken && !state.stopped {
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        let interrupted = state.woken || state.stopped;
        state.woken = false;
        interrupted
    }

    pub(crate) fn wake(&self) {
        self.state.lock().woken = true;
        self.condvar.notify_one();
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stopped = true;
        self.condvar.notify_one();
    }

    /// Consumes a pending stop request.
    pub(crate) fn take_stop(&self) -> bool {
        std::mem::take(&mut self.state.lock().stopped)
    }
}

/// Thread-safe handle that wakes or stops a [`RunLoop`](crate::RunLoop).
///
/// The run loop itself is bound to its thread; this is the only piece of it
/// that may be sent elsewhere.
#[derive(Clone)]
pub struct RunLoopWaker {
    signal: Arc<WakeSignal>,
}

impl RunLoopWaker {
    pub(crate) fn new(signal: Arc<WakeSignal>) -> Self {
        Self { signal }
    }

    /// Interrupts the loop's current (or next) sleep so it re-checks its
    /// timers.
    pub fn wake(&self) {
        self.signal.wake();
    }

    /// Asks the loop to return [`RunResult::Stopped`](crate::RunResult::Stopped)
    /// at its next check.
    pub fn stop(&self) {
        self.signal.stop();
    }
}

impl fmt::Debug for RunLoopWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoopWaker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn test_wait_times_out() {
        let signal = WakeSignal::default();
        let start = Instant::now();

        assert!(!signal.wait_until(start + Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_early_wake_not_lost() {
        let signal = WakeSignal::default();
        signal.wake();

        assert!(signal.wait_until(Instant::now() + Duration::from_secs(10)));
        // Consumed by the first wait
        assert!(!signal.wait_until(Instant::now() + Duration::from_millis(1)));
    }

    #[test]
    fn test_wake_from_other_thread() {
        let signal = Arc::new(WakeSignal::default());
        let waker = RunLoopWaker::new(Arc::clone(&signal));

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let start = Instant::now();
        assert!(signal.wait_until(start + Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_is_sticky_until_taken() {
        let signal = WakeSignal::default();
        signal.stop();

        assert!(signal.wait_until(Instant::now() + Duration::from_secs(10)));
        assert!(signal.wait_until(Instant::now() + Duration::from_secs(10)));
        assert!(signal.take_stop());
        assert!(!signal.take_stop());
    }
}
