mod mode;
mod wake;

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

pub use mode::Mode;
pub use wake::RunLoopWaker;

use wake::WakeSignal;

use crate::{
    queue::{DEFAULT_QUEUE_CAPACITY, TimerQueue},
    timer::{Selector, Timer, UserInfo, WeakTimer},
};

thread_local! {
    static CURRENT: Rc<RunLoop> = Rc::new(RunLoop::new());
}

/// Why a run loop call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// The mode has no valid timers left.
    Finished,
    /// [`RunLoop::stop`] or [`RunLoopWaker::stop`] was called.
    Stopped,
    /// The limit date passed.
    TimedOut,
    /// A [`RunLoopWaker::wake`] ended the wait before anything was due.
    Woken,
    /// This many timers fired.
    Fired(usize),
}

/// Single-threaded timer scheduler.
///
/// Holds one [`TimerQueue`] per [`Mode`]. A pass over a mode fires every timer
/// due at that instant exactly once, earliest first. Between passes the loop
/// sleeps until the next fire date, its limit, or a wake-up from another
/// thread.
///
/// No internal borrow is held while a callback runs, so callbacks may add
/// timers, invalidate or reschedule any timer, and even run the loop again.
pub struct RunLoop {
    queues: RefCell<BTreeMap<Mode, TimerQueue>>,
    current_mode: RefCell<Option<Mode>>,
    capacity: usize,
    signal: Arc<WakeSignal>,
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLoop {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Preallocates room for `capacity` timers in each mode's queue.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: RefCell::new(BTreeMap::new()),
            current_mode: RefCell::new(None),
            capacity,
            signal: Arc::new(WakeSignal::default()),
        }
    }

    /// The calling thread's run loop, created on first use.
    pub fn current() -> Rc<RunLoop> {
        CURRENT.with(Rc::clone)
    }

    /// Registers `timer` under `mode`. The queue takes its own strong
    /// reference; adding the same timer to the same mode twice does nothing.
    ///
    /// Invalid timers are ignored, as are timers a full queue refuses.
    pub fn add_timer(&self, timer: &Timer, mode: &Mode) {
        if !timer.is_valid() {
            tracing::debug!(%mode, "ignoring invalidated timer");
            return;
        }

        let inserted = self
            .queues
            .borrow_mut()
            .entry(mode.clone())
            .or_insert_with(|| TimerQueue::with_capacity(self.capacity))
            .insert(timer);

        match inserted {
            Ok(_) => tracing::debug!(%mode, repeats = timer.repeats(), "timer added"),
            Err(err) => tracing::warn!(%mode, %err, "timer not added"),
        }
    }

    /// Hands `timer` over to the loop, which becomes its only owner.
    pub fn schedule(&self, timer: Timer, mode: &Mode) -> WeakTimer {
        self.add_timer(&timer, mode);
        timer.downgrade()
    }

    pub fn schedule_with_target<T: 'static>(
        &self,
        interval: Duration,
        target: Rc<T>,
        selector: Selector<T>,
        user_info: Option<UserInfo>,
        repeats: bool,
    ) -> WeakTimer {
        let timer = Timer::with_target(interval, target, selector, user_info, repeats);
        self.schedule(timer, &Mode::DEFAULT)
    }

    pub fn schedule_with_block<F>(&self, interval: Duration, repeats: bool, block: F) -> WeakTimer
    where
        F: FnMut(&Timer) + 'static,
    {
        self.schedule(Timer::with_block(interval, repeats, block), &Mode::DEFAULT)
    }

    /// Valid timers registered under `mode`.
    pub fn timer_count(&self, mode: &Mode) -> usize {
        self.queues.borrow_mut().get_mut(mode).map_or(0, |queue| {
            queue.sync();
            queue.len()
        })
    }

    pub fn is_empty(&self, mode: &Mode) -> bool {
        self.timer_count(mode) == 0
    }

    /// Mode of the pass in progress, if a callback is running.
    pub fn current_mode(&self) -> Option<Mode> {
        self.current_mode.borrow().clone()
    }

    /// Earliest fire date among the mode's valid timers.
    pub fn next_fire_date(&self, mode: &Mode) -> Option<Instant> {
        let mut queues = self.queues.borrow_mut();
        queues.get_mut(mode)?.next_fire_date()
    }

    /// Fires every timer of `mode` due at `now`, each at most once, and
    /// returns how many callbacks ran.
    pub fn fire_due(&self, mode: &Mode, now: Instant) -> usize {
        let due = match self.queues.borrow_mut().get_mut(mode) {
            Some(queue) => queue.take_due(now),
            None => return 0,
        };

        if due.is_empty() {
            return 0;
        }

        let previous = self.current_mode.replace(Some(mode.clone()));
        let mut fired = 0;

        for (key, timer) in &due {
            // An earlier callback in this pass may have dropped it.
            let live = self
                .queues
                .borrow()
                .get(mode)
                .is_some_and(|queue| queue.is_in_flight(*key, timer));

            if live && timer.is_valid() {
                tracing::trace!(%mode, repeats = timer.repeats(), "firing timer");
                if timer.fire() {
                    fired += 1;
                }
            }

            if let Some(queue) = self.queues.borrow_mut().get_mut(mode) {
                queue.restore(*key, timer, now);
            }
        }

        self.current_mode.replace(previous);
        fired
    }

    /// Fires what is due now and returns the next fire date.
    pub fn limit_date(&self, mode: &Mode) -> Option<Instant> {
        self.fire_due(mode, Instant::now());
        self.next_fire_date(mode)
    }

    /// One pass: fires due timers, or sleeps until something is due,
    /// `before` passes, or the loop is woken.
    pub fn run_once(&self, mode: &Mode, before: Instant) -> RunResult {
        loop {
            if self.signal.take_stop() {
                return RunResult::Stopped;
            }

            let now = Instant::now();
            let fired = self.fire_due(mode, now);
            if fired > 0 {
                return RunResult::Fired(fired);
            }

            let Some(next) = self.next_fire_date(mode) else {
                return RunResult::Finished;
            };

            if now >= before {
                return RunResult::TimedOut;
            }

            if self.signal.wait_until(next.min(before)) {
                return if self.signal.take_stop() {
                    RunResult::Stopped
                } else {
                    RunResult::Woken
                };
            }
        }
    }

    /// Runs until `limit`, a stop request, or the mode runs out of timers.
    pub fn run_until(&self, mode: &Mode, limit: Instant) -> RunResult {
        self.run_inner(mode, Some(limit))
    }

    /// Runs until a stop request or the mode runs out of timers.
    pub fn run(&self, mode: &Mode) -> RunResult {
        self.run_inner(mode, None)
    }

    pub fn stop(&self) {
        self.signal.stop();
    }

    pub fn waker(&self) -> RunLoopWaker {
        RunLoopWaker::new(Arc::clone(&self.signal))
    }

    fn run_inner(&self, mode: &Mode, limit: Option<Instant>) -> RunResult {
        let result = loop {
            if self.signal.take_stop() {
                break RunResult::Stopped;
            }

            self.fire_due(mode, Instant::now());

            let Some(next) = self.next_fire_date(mode) else {
                break RunResult::Finished;
            };

            let deadline = match limit {
                Some(limit) if Instant::now() >= limit => break RunResult::TimedOut,
                Some(limit) => next.min(limit),
                None => next,
            };

            self.signal.wait_until(deadline);
        };

        tracing::debug!(%mode, ?result, "run loop returned");
        result
    }
}
