use std::{
    fmt,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{
    run_loop::{Mode, RunLoop},
    timer::{Callback, MIN_INTERVAL, Selector, Timer, UserInfo, WeakTimer, deadline_after},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer needs either a target/selector pair or a block")]
    MissingCallback,
}

/// Step-by-step timer construction.
///
/// Defaults: fires one interval after [`build`](TimerBuilder::build), zero
/// interval, non-repeating, no user info. Exactly one callback is kept;
/// setting a second one replaces the first.
#[must_use]
#[derive(Default)]
pub struct TimerBuilder {
    fire_date: Option<Instant>,
    interval: Duration,
    repeats: bool,
    user_info: Option<UserInfo>,
    callback: Option<Callback>,
}

impl TimerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire_date(mut self, fire_date: Instant) -> Self {
        self.fire_date = Some(fire_date);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn repeats(mut self, repeats: bool) -> Self {
        self.repeats = repeats;
        self
    }

    pub fn user_info(mut self, user_info: UserInfo) -> Self {
        self.user_info = Some(user_info);
        self
    }

    pub fn target<T: 'static>(mut self, target: Rc<T>, selector: Selector<T>) -> Self {
        self.callback = Some(Callback::target(target, selector));
        self
    }

    pub fn block<F>(mut self, block: F) -> Self
    where
        F: FnMut(&Timer) + 'static,
    {
        self.callback = Some(Callback::block(block));
        self
    }

    pub fn build(self) -> Result<Timer, TimerError> {
        let callback = self.callback.ok_or(TimerError::MissingCallback)?;
        let fire_date = self
            .fire_date
            .unwrap_or_else(|| deadline_after(Instant::now(), self.interval.max(MIN_INTERVAL)));

        Ok(Timer::from_parts(
            fire_date,
            self.interval,
            self.repeats,
            callback,
            self.user_info,
        ))
    }

    /// Builds the timer and hands it to `run_loop` under `mode`.
    pub fn schedule(self, run_loop: &RunLoop, mode: &Mode) -> Result<WeakTimer, TimerError> {
        let timer = self.build()?;
        Ok(run_loop.schedule(timer, mode))
    }
}

impl fmt::Debug for TimerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerBuilder")
            .field("fire_date", &self.fire_date)
            .field("interval", &self.interval)
            .field("repeats", &self.repeats)
            .field("callback", &self.callback.as_ref().map(Callback::kind))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::CallbackKind;
    use std::cell::Cell;

    #[test]
    fn test_missing_callback() {
        let err = TimerBuilder::new()
            .interval(Duration::from_secs(1))
            .repeats(true)
            .build()
            .unwrap_err();

        assert_eq!(err, TimerError::MissingCallback);
        assert_eq!(
            err.to_string(),
            "timer needs either a target/selector pair or a block"
        );
    }

    #[test]
    fn test_missing_callback_not_scheduled() {
        let run_loop = RunLoop::new();
        let result = TimerBuilder::new().schedule(&run_loop, &Mode::DEFAULT);

        assert_eq!(result.unwrap_err(), TimerError::MissingCallback);
        assert!(run_loop.is_empty(&Mode::DEFAULT));
    }

    #[test]
    fn test_full_configuration() {
        let fire_date = Instant::now() + Duration::from_secs(3);
        let info: UserInfo = Rc::new(42u64);

        let timer = Timer::builder()
            .fire_date(fire_date)
            .interval(Duration::from_millis(250))
            .repeats(true)
            .user_info(Rc::clone(&info))
            .block(|_| {})
            .build()
            .unwrap();

        assert_eq!(timer.fire_date(), fire_date);
        assert_eq!(timer.time_interval(), Duration::from_millis(250));
        assert!(timer.repeats());
        assert!(Rc::ptr_eq(timer.user_info().unwrap(), &info));
        assert_eq!(timer.callback_kind(), CallbackKind::Block);
    }

    #[test]
    fn test_last_callback_wins() {
        struct Target(Cell<bool>);

        let target = Rc::new(Target(Cell::new(false)));
        let timer = TimerBuilder::new()
            .block(|_| panic!("replaced block must not run"))
            .target(Rc::clone(&target), |target: &Target, _| target.0.set(true))
            .build()
            .unwrap();

        assert_eq!(timer.callback_kind(), CallbackKind::Target);
        timer.fire();
        assert!(target.0.get());
    }

    #[test]
    fn test_default_fire_date_uses_clamped_interval() {
        let before = Instant::now();
        let timer = TimerBuilder::new().block(|_| {}).build().unwrap();

        assert!(timer.fire_date() >= before + MIN_INTERVAL);
    }

    #[test]
    fn test_schedule_registers_timer() {
        let run_loop = RunLoop::new();
        let mode = Mode::from_static("builder");

        let weak = Timer::builder()
            .interval(Duration::from_secs(60))
            .block(|_| {})
            .schedule(&run_loop, &mode)
            .unwrap();

        assert!(weak.is_valid());
        assert_eq!(run_loop.timer_count(&mode), 1);
    }
}
