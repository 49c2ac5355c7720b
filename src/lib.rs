//! Repeating, cancellable deferred-callback timers.
//!
//! A [`Timer`] is a passive descriptor: a fire date, an interval, a validity
//! flag and one callback (a target/selector pair or a closure). A
//! [`RunLoop`] keeps pending timers per [`Mode`], sleeps until the earliest
//! fire date and fires whatever is due.
//!
//! ```
//! use std::{cell::Cell, rc::Rc, time::Duration};
//! use runtimer::{Mode, RunLoop, RunResult};
//!
//! let run_loop = RunLoop::new();
//! let ticks = Rc::new(Cell::new(0));
//! let seen = Rc::clone(&ticks);
//!
//! run_loop.schedule_with_block(Duration::from_millis(1), true, move |timer| {
//!     seen.set(seen.get() + 1);
//!     if seen.get() == 3 {
//!         timer.invalidate();
//!     }
//! });
//!
//! assert_eq!(run_loop.run(&Mode::DEFAULT), RunResult::Finished);
//! assert_eq!(ticks.get(), 3);
//! ```

mod queue;
mod run_loop;
mod timer;

pub use queue::{DEFAULT_QUEUE_CAPACITY, QueueFull, QueueKey, TimerQueue};
pub use run_loop::*;
pub use timer::*;
