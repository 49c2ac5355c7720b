use std::rc::Rc;

use crate::timer::Timer;

/// Method performed on a timer's target when it fires.
///
/// Receives the firing timer, through which the user info is reachable.
pub type Selector<T> = fn(&T, &Timer);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    /// Target object plus selector.
    Target,
    /// Closure receiving the timer.
    Block,
    /// The timer was invalidated and dropped its callback.
    Released,
}

pub(crate) trait Perform {
    fn perform(&self, timer: &Timer);
}

struct Bound<T> {
    target: Rc<T>,
    selector: Selector<T>,
}

impl<T> Perform for Bound<T> {
    #[inline]
    fn perform(&self, timer: &Timer) {
        (self.selector)(&self.target, timer)
    }
}

/// The two mutually exclusive callback forms.
pub(crate) enum Callback {
    Target(Box<dyn Perform>),
    Block(Box<dyn FnMut(&Timer)>),
}

impl Callback {
    pub(crate) fn target<T: 'static>(target: Rc<T>, selector: Selector<T>) -> Self {
        Self::Target(Box::new(Bound { target, selector }))
    }

    pub(crate) fn block<F>(block: F) -> Self
    where
        F: FnMut(&Timer) + 'static,
    {
        Self::Block(Box::new(block))
    }

    pub(crate) fn kind(&self) -> CallbackKind {
        match self {
            Self::Target(_) => CallbackKind::Target,
            Self::Block(_) => CallbackKind::Block,
        }
    }

    #[inline]
    pub(crate) fn invoke(&mut self, timer: &Timer) {
        match self {
            Self::Target(bound) => bound.perform(timer),
            Self::Block(block) => block(timer),
        }
    }
}
