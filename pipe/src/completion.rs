//! Terminal state of one side of a pipe.

use crate::{scheduler::extract_panic_message, Error, Fault};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Callback invoked once a side completes, with the error it completed with (if any).
pub(crate) type Callback = Box<dyn FnOnce(Option<Fault>) + Send + 'static>;

/// Completion state of one side.
///
/// The first callback is kept inline; additional callbacks spill into an
/// overflow vector.
#[derive(Default)]
pub(crate) struct Completion {
    done: bool,
    error: Option<Fault>,
    first: Option<Callback>,
    overflow: Vec<Callback>,
}

impl Completion {
    /// Returns `true` once the side has completed.
    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.done
    }

    /// Complete the side with an optional error.
    ///
    /// Only the first call records the error. Every call drains the registered
    /// callbacks into a batch for the caller to run outside the lock.
    pub(crate) fn try_complete(&mut self, error: Option<Fault>) -> Option<Callbacks> {
        if !self.done {
            self.done = true;
            self.error = error;
        }
        self.drain()
    }

    /// Register `callback`.
    ///
    /// If the side has already completed, the callback is returned as a batch
    /// to run immediately instead of being stored.
    pub(crate) fn add_callback(&mut self, callback: Callback) -> Option<Callbacks> {
        if self.first.is_none() {
            self.first = Some(callback);
        } else {
            self.overflow.push(callback);
        }
        if self.done {
            return self.drain();
        }
        None
    }

    /// Returns whether the side completed, surfacing its error if it failed.
    pub(crate) fn is_completed_or_err(&self) -> Result<bool, Error> {
        if !self.done {
            return Ok(false);
        }
        match &self.error {
            Some(error) => Err(Error::Faulted(error.clone())),
            None => Ok(true),
        }
    }

    /// Return to the not-completed state, dropping any recorded error and callbacks.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    fn drain(&mut self) -> Option<Callbacks> {
        let first = self.first.take()?;
        let mut callbacks = Vec::with_capacity(1 + self.overflow.len());
        callbacks.push(first);
        callbacks.append(&mut self.overflow);
        Some(Callbacks {
            callbacks,
            error: self.error.clone(),
        })
    }
}

/// A batch of completion callbacks released together.
pub(crate) struct Callbacks {
    callbacks: Vec<Callback>,
    error: Option<Fault>,
}

impl Callbacks {
    /// Returns the number of callbacks in the batch.
    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Run every callback, even if an earlier one panics.
    ///
    /// Panics are collected and reported together.
    pub(crate) fn execute(self) -> Result<(), Error> {
        let mut panics = Vec::new();
        for callback in self.callbacks {
            let error = self.error.clone();
            if let Err(err) = catch_unwind(AssertUnwindSafe(move || callback(error))) {
                panics.push(extract_panic_message(err.as_ref()));
            }
        }
        if panics.is_empty() {
            Ok(())
        } else {
            Err(Error::CallbackPanicked(panics))
        }
    }
}
