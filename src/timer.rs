mod builder;
mod callback;

use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

pub use builder::*;
pub use callback::{CallbackKind, Selector};

pub(crate) use callback::Callback;

use crate::{
    queue::{PendingKeys, PendingSet},
    run_loop::RunLoop,
};

/// Floor applied to the rescheduling interval. A timer configured with a zero
/// interval repeats every 100µs rather than spinning.
pub const MIN_INTERVAL: Duration = Duration::from_micros(100);

/// Longest delay a computed deadline is pushed out by, about 30 years.
/// Longer intervals are treated as this one.
pub const MAX_DELAY: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + delay`, capped at [`MAX_DELAY`] and never overflowing `Instant`.
pub(crate) fn deadline_after(from: Instant, delay: Duration) -> Instant {
    let mut delay = delay.min(MAX_DELAY);
    loop {
        if let Some(deadline) = from.checked_add(delay) {
            return deadline;
        }
        if delay.is_zero() {
            return from;
        }
        delay /= 2;
    }
}

/// Opaque payload handed back verbatim by [`Timer::user_info`].
pub type UserInfo = Rc<dyn Any>;

/// Converts signed seconds into a timer interval.
///
/// Zero, negative and NaN inputs all map to [`Duration::ZERO`], which the timer
/// later treats as [`MIN_INTERVAL`]. Values too large for a `Duration`
/// saturate.
pub fn interval_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Where a queue holding this timer wants change notifications delivered.
struct Registration {
    pending: Weak<RefCell<PendingSet>>,
    key: u32,
}

struct Inner {
    fire_date: Cell<Instant>,
    valid: Cell<bool>,
    repeats: bool,
    interval: Duration,
    kind: CallbackKind,
    callback: RefCell<Option<Callback>>,
    user_info: Option<UserInfo>,
    registrations: RefCell<Vec<Registration>>,
}

/// A deferred, optionally repeating callback.
///
/// A timer never runs by itself. A [`RunLoop`] (or any other driver) waits
/// until [`fire_date`](Timer::fire_date) and calls [`fire`](Timer::fire).
///
/// # Ownership Semantics
///
/// `Timer` is the strong handle and is intentionally not `Clone`. Once a timer
/// is added to a run loop, the loop's queue is expected to be its only owner;
/// callers keep a [`WeakTimer`] to inspect or invalidate it.
///
/// The timer owns its target (or closure) only while it is valid.
/// [`invalidate`](Timer::invalidate), or the single fire of a non-repeating
/// timer, drops the callback so the target can be reclaimed even while a
/// queue still holds the timer itself.
///
/// A block callback receives the timer as its argument, so it can invalidate
/// or reschedule the timer without capturing a strong reference to it.
pub struct Timer {
    inner: Rc<Inner>,
}

impl Timer {
    pub(crate) fn from_parts(
        fire_date: Instant,
        interval: Duration,
        repeats: bool,
        callback: Callback,
        user_info: Option<UserInfo>,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                fire_date: Cell::new(fire_date),
                valid: Cell::new(true),
                repeats,
                interval,
                kind: callback.kind(),
                callback: RefCell::new(Some(callback)),
                user_info,
                registrations: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Unscheduled timer that performs `selector` on `target`, first firing one
    /// interval from now.
    pub fn with_target<T: 'static>(
        interval: Duration,
        target: Rc<T>,
        selector: Selector<T>,
        user_info: Option<UserInfo>,
        repeats: bool,
    ) -> Self {
        let fire_date = deadline_after(Instant::now(), interval.max(MIN_INTERVAL));
        Self::with_fire_date(fire_date, interval, target, selector, user_info, repeats)
    }

    /// Unscheduled timer that runs `block`, first firing one interval from now.
    pub fn with_block<F>(interval: Duration, repeats: bool, block: F) -> Self
    where
        F: FnMut(&Timer) + 'static,
    {
        let fire_date = deadline_after(Instant::now(), interval.max(MIN_INTERVAL));
        Self::from_parts(fire_date, interval, repeats, Callback::block(block), None)
    }

    /// Unscheduled target/selector timer with an explicit first fire date.
    pub fn with_fire_date<T: 'static>(
        fire_date: Instant,
        interval: Duration,
        target: Rc<T>,
        selector: Selector<T>,
        user_info: Option<UserInfo>,
        repeats: bool,
    ) -> Self {
        Self::from_parts(
            fire_date,
            interval,
            repeats,
            Callback::target(target, selector),
            user_info,
        )
    }

    /// Like [`with_target`](Timer::with_target), but registered on the current
    /// thread's run loop in [`Mode::DEFAULT`](crate::Mode::DEFAULT).
    pub fn scheduled_with_target<T: 'static>(
        interval: Duration,
        target: Rc<T>,
        selector: Selector<T>,
        user_info: Option<UserInfo>,
        repeats: bool,
    ) -> WeakTimer {
        RunLoop::current().schedule_with_target(interval, target, selector, user_info, repeats)
    }

    /// Like [`with_block`](Timer::with_block), but registered on the current
    /// thread's run loop in [`Mode::DEFAULT`](crate::Mode::DEFAULT).
    pub fn scheduled_with_block<F>(interval: Duration, repeats: bool, block: F) -> WeakTimer
    where
        F: FnMut(&Timer) + 'static,
    {
        RunLoop::current().schedule_with_block(interval, repeats, block)
    }

    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }

    /// Runs the callback once and returns whether it ran.
    ///
    /// Does nothing if the timer is invalid, or if it is already firing further
    /// up the stack. Afterwards a non-repeating timer is invalid and a repeating
    /// one has moved its fire date forward by the effective interval (unless
    /// the callback moved it already).
    pub fn fire(&self) -> bool {
        if !self.inner.valid.get() {
            return false;
        }

        let taken = self.inner.callback.borrow_mut().take();
        let Some(mut callback) = taken else {
            return false;
        };

        let scheduled = self.inner.fire_date.get();

        // One-shot timers are spent before the callback runs, so a nested
        // pass of the run loop can never fire them twice.
        if !self.inner.repeats {
            self.inner.valid.set(false);
        }

        callback.invoke(self);

        if self.inner.valid.get() {
            if self.inner.fire_date.get() == scheduled {
                self.inner
                    .fire_date
                    .set(deadline_after(scheduled, self.effective_interval()));
                self.notify();
            }
            *self.inner.callback.borrow_mut() = Some(callback);
        } else {
            self.notify();
            drop(callback);
        }

        true
    }

    /// Permanently stops the timer and releases its target or closure.
    ///
    /// Idempotent. Safe to call from inside the timer's own callback.
    pub fn invalidate(&self) {
        if !self.inner.valid.replace(false) {
            return;
        }

        let released = self.inner.callback.borrow_mut().take();
        tracing::debug!(repeats = self.inner.repeats, "timer invalidated");
        self.notify();
        drop(released);
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.inner.valid.get()
    }

    /// Next scheduled fire date. Still readable after invalidation, where it
    /// reports the last known date.
    #[inline]
    pub fn fire_date(&self) -> Instant {
        self.inner.fire_date.get()
    }

    /// Moves the next fire date. Ignored once the timer is invalid.
    ///
    /// Every queue holding the timer re-sorts it before its next poll.
    pub fn set_fire_date(&self, fire_date: Instant) {
        if !self.inner.valid.get() {
            return;
        }

        self.inner.fire_date.set(fire_date);
        self.notify();
    }

    /// The repeat interval, or zero for a non-repeating timer.
    pub fn time_interval(&self) -> Duration {
        if self.inner.repeats {
            self.effective_interval()
        } else {
            Duration::ZERO
        }
    }

    /// Interval actually used to reschedule, never below [`MIN_INTERVAL`].
    #[inline]
    pub fn effective_interval(&self) -> Duration {
        self.inner.interval.max(MIN_INTERVAL)
    }

    #[inline]
    pub fn repeats(&self) -> bool {
        self.inner.repeats
    }

    pub fn user_info(&self) -> Option<&UserInfo> {
        self.inner.user_info.as_ref()
    }

    /// Typed view of the user info payload.
    pub fn user_info_as<T: Any>(&self) -> Option<&T> {
        self.inner.user_info.as_deref()?.downcast_ref::<T>()
    }

    /// Which callback form the timer was built with, or
    /// [`CallbackKind::Released`] once it has been invalidated.
    pub fn callback_kind(&self) -> CallbackKind {
        if self.inner.valid.get() {
            self.inner.kind
        } else {
            CallbackKind::Released
        }
    }

    pub fn downgrade(&self) -> WeakTimer {
        WeakTimer {
            inner: Rc::downgrade(&self.inner),
        }
    }

    #[inline]
    pub(crate) fn share(&self) -> Timer {
        Timer {
            inner: Rc::clone(&self.inner),
        }
    }

    #[inline]
    pub(crate) fn ptr_eq(&self, other: &Timer) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Moves an overdue repeating timer to its first deadline after `now`,
    /// dropping the deadlines it missed.
    pub(crate) fn skip_missed(&self, now: Instant) {
        if !self.inner.repeats || !self.inner.valid.get() {
            return;
        }

        let fire_date = self.inner.fire_date.get();
        if fire_date > now {
            return;
        }

        let step = self.effective_interval().as_nanos();
        let missed = now.duration_since(fire_date).as_nanos() / step + 1;
        let skip = u64::try_from(missed * step).map_or(Duration::MAX, Duration::from_nanos);
        let mut next = deadline_after(fire_date, skip);
        if next <= now {
            next = deadline_after(now, self.effective_interval());
        }

        tracing::trace!(missed = missed - 1, "skipping missed deadlines");
        self.inner.fire_date.set(next);
        self.notify();
    }

    pub(crate) fn attach(&self, pending: &PendingKeys, key: u32) {
        self.inner.registrations.borrow_mut().push(Registration {
            pending: Rc::downgrade(pending),
            key,
        });
    }

    pub(crate) fn detach(&self, pending: &PendingKeys, key: u32) {
        self.inner
            .registrations
            .borrow_mut()
            .retain(|reg| {
                !(reg.key == key && std::ptr::eq(reg.pending.as_ptr(), Rc::as_ptr(pending)))
            });
    }

    /// Key under which the queue owning `pending` holds this timer, if any.
    pub(crate) fn key_in(&self, pending: &PendingKeys) -> Option<u32> {
        self.inner
            .registrations
            .borrow()
            .iter()
            .find(|reg| std::ptr::eq(reg.pending.as_ptr(), Rc::as_ptr(pending)))
            .map(|reg| reg.key)
    }

    fn notify(&self) {
        self.inner.registrations.borrow_mut().retain(|reg| {
            let Some(pending) = reg.pending.upgrade() else {
                return false;
            };
            pending.borrow_mut().mark(reg.key);
            true
        });
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("fire_date", &self.inner.fire_date.get())
            .field("interval", &self.inner.interval)
            .field("repeats", &self.inner.repeats)
            .field("valid", &self.inner.valid.get())
            .field("callback", &self.callback_kind())
            .finish_non_exhaustive()
    }
}

/// Non-owning handle to a [`Timer`].
///
/// Returned by the scheduling helpers, whose run loop keeps the only strong
/// reference. Every operation is a no-op (or `None`) once the timer has been
/// reclaimed.
#[derive(Debug, Clone, Default)]
pub struct WeakTimer {
    inner: Weak<Inner>,
}

impl WeakTimer {
    pub fn upgrade(&self) -> Option<Timer> {
        self.inner.upgrade().map(|inner| Timer { inner })
    }

    pub fn is_valid(&self) -> bool {
        self.upgrade().is_some_and(|timer| timer.is_valid())
    }

    pub fn invalidate(&self) {
        if let Some(timer) = self.upgrade() {
            timer.invalidate();
        }
    }

    /// Whether the callback ran. `false` once the timer is gone.
    pub fn fire(&self) -> bool {
        self.upgrade().is_some_and(|timer| timer.fire())
    }

    pub fn fire_date(&self) -> Option<Instant> {
        self.upgrade().map(|timer| timer.fire_date())
    }

    pub fn set_fire_date(&self, fire_date: Instant) {
        if let Some(timer) = self.upgrade() {
            timer.set_fire_date(fire_date);
        }
    }

    pub fn user_info(&self) -> Option<UserInfo> {
        self.upgrade()?.user_info().cloned()
    }

    pub fn ptr_eq(&self, timer: &Timer) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Rc::as_ptr(&timer.inner))
    }
}
