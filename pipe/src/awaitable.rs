//! Single-slot suspend/resume primitive shared by a waiter and its waker.
//!
//! Each pipe owns two [Awaitable]s: one signalled when data is available to the
//! reader and one signalled when the writer may continue past backpressure.
//!
//! # State
//!
//! ```txt
//! not-completed --begin_operation--> running --complete--> running|completed
//!                                       |                        |
//!                                       +------cancel----> running|canceled
//!                                                                |
//!                          not-completed <--observe_cancellation-+ (clears running, canceled)
//! ```
//!
//! `completed` and `canceled` never run user code: they extract the stored
//! continuation and return it so the caller can schedule it once the pipe's
//! lock has been released.

use crate::{
    cancel::{CancelToken, Registration},
    scheduler::{dispatch, Captured, ContextFlow, Scheduler, Task},
    Error,
};
use std::task::Waker;

const RUNNING: u8 = 1 << 0;
const COMPLETED: u8 = 1 << 1;
const CANCELED: u8 = 1 << 2;

/// A suspended waiter, extracted from an [Awaitable] to be woken.
pub(crate) struct Continuation {
    waker: Waker,
    captured: Option<Captured>,
    owner: u64,
}

impl Continuation {
    fn new(waker: &Waker, owner: u64, flow: Option<&dyn ContextFlow>) -> Self {
        Self {
            waker: waker.clone(),
            captured: flow.and_then(|flow| flow.capture()),
            owner,
        }
    }

    /// Wake the waiter through `scheduler`.
    pub(crate) fn schedule(self, scheduler: &dyn Scheduler) {
        let waker = self.waker;
        let task: Task = Box::new(move || waker.wake());
        dispatch(scheduler, self.captured, task);
    }
}

/// Outcome of [Awaitable::on_completed].
pub(crate) enum Registered {
    /// The continuation is stored until the awaitable resolves.
    Stored,
    /// The awaitable already resolved; the continuation should run now.
    Ready(Continuation),
    /// A different operation's continuation is already stored.
    ///
    /// The new continuation is returned to run now and the stored one is kept.
    Double(Continuation),
}

/// A single-slot future state.
pub(crate) struct Awaitable {
    state: u8,
    continuation: Option<Continuation>,
    token: CancelToken,
    registration: Option<Registration>,
}

impl Awaitable {
    /// Creates an awaitable, optionally already completed.
    pub(crate) fn new(completed: bool) -> Self {
        Self {
            state: if completed { COMPLETED } else { 0 },
            continuation: None,
            token: CancelToken::never(),
            registration: None,
        }
    }

    /// Returns `true` if the awaitable is completed or canceled.
    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.state & (COMPLETED | CANCELED) != 0
    }

    /// Returns `true` if an operation began and its outcome has not been observed.
    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.state & RUNNING != 0
    }

    /// Returns the token attached to the current operation.
    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Start an operation.
    ///
    /// Fails if `token` has already fired. Otherwise, if `token` can fire later,
    /// `on_cancel()` is registered against it so that firing resolves this awaitable.
    pub(crate) fn begin_operation(
        &mut self,
        token: &CancelToken,
        on_cancel: impl FnOnce() -> Task,
    ) -> Result<(), Error> {
        if token.is_canceled() {
            return Err(Error::Canceled);
        }

        // Skip registration if already completed: it would be released
        // immediately when the result is observed.
        if token.can_be_canceled() && !token.same(&self.token) && !self.is_completed() {
            match token.register(on_cancel()) {
                Some(registration) => {
                    self.token = token.clone();
                    self.registration = Some(registration);
                }
                None => return Err(Error::Canceled),
            }
        }
        self.state |= RUNNING;
        Ok(())
    }

    /// Mark the awaitable completed and extract the stored continuation.
    pub(crate) fn complete(&mut self) -> Option<Continuation> {
        let continuation = self.continuation.take();
        self.state |= COMPLETED;
        continuation
    }

    /// Clear `completed`, leaving `canceled` untouched.
    pub(crate) fn set_uncompleted(&mut self) {
        debug_assert!(self.continuation.is_none());
        self.state &= !COMPLETED;
    }

    /// Mark the awaitable canceled and extract the stored continuation.
    pub(crate) fn cancel(&mut self) -> Option<Continuation> {
        let continuation = self.continuation.take();
        self.state |= CANCELED;
        continuation
    }

    /// Cancel on behalf of the attached token.
    ///
    /// Stale callbacks (from a token that is no longer attached or has not
    /// fired) are ignored.
    pub(crate) fn cancellation_fired(&mut self) -> Option<Continuation> {
        if !self.token.is_canceled() {
            return None;
        }
        self.cancel()
    }

    /// Store the continuation of operation `owner`.
    ///
    /// Re-registering the same owner replaces its waker.
    pub(crate) fn on_completed(
        &mut self,
        waker: &Waker,
        owner: u64,
        flow: Option<&dyn ContextFlow>,
    ) -> Registered {
        if let Some(stored) = self.continuation.as_mut() {
            if stored.owner != owner {
                return Registered::Double(Continuation::new(waker, owner, flow));
            }
            if !stored.waker.will_wake(waker) {
                stored.waker = waker.clone();
            }
            return Registered::Stored;
        }
        let continuation = Continuation::new(waker, owner, flow);
        if self.is_completed() {
            return Registered::Ready(continuation);
        }
        self.continuation = Some(continuation);
        Registered::Stored
    }

    /// Consume a pending cancellation.
    ///
    /// Returns whether the operation was canceled and clears both `running` and
    /// `canceled`.
    pub(crate) fn observe_cancellation(&mut self) -> bool {
        let canceled = self.state & CANCELED != 0;
        self.state &= !(CANCELED | RUNNING);
        canceled
    }

    /// Detach the cancellation registration so it can be dropped outside the lock.
    pub(crate) fn release_cancel_registration(&mut self) -> Option<Registration> {
        self.token = CancelToken::never();
        self.registration.take()
    }

    /// Forget operation `owner` without resolving it (its future was dropped).
    ///
    /// A cancellation raised by the operation's own token is forgotten with it.
    pub(crate) fn abandon(&mut self, owner: u64) -> Option<Registration> {
        if let Some(stored) = &self.continuation {
            if stored.owner != owner {
                return None;
            }
            self.continuation = None;
        }
        self.state &= !RUNNING;
        if self.token.is_canceled() {
            self.state &= !CANCELED;
        }
        self.release_cancel_registration()
    }
}
