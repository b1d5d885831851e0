//! One-time cancellation broadcast for in-flight pipe operations.
//!
//! A [Canceler] fires a [CancelToken] exactly once. Pipe operations that accept
//! a token register a callback against it for as long as they are pending; the
//! callback resolves the operation with [crate::Error::Canceled].
//!
//! Callbacks run on the thread that calls [Canceler::cancel], after the token's
//! internal lock has been released.
//!
//! # Example
//!
//! ```rust
//! use commonware_pipe::{Canceler, CancelToken};
//!
//! let (canceler, token) = Canceler::new();
//! assert!(token.can_be_canceled());
//! assert!(!token.is_canceled());
//!
//! canceler.cancel();
//! assert!(token.is_canceled());
//!
//! // A token that can never fire
//! assert!(!CancelToken::never().can_be_canceled());
//! ```

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Callbacks {
    next: u64,
    pending: BTreeMap<u64, Callback>,
}

#[derive(Default)]
struct Inner {
    canceled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

/// Fires the paired [CancelToken].
pub struct Canceler {
    inner: Arc<Inner>,
}

impl Canceler {
    /// Create a new [Canceler] and the [CancelToken] it controls.
    pub fn new() -> (Self, CancelToken) {
        let inner = Arc::new(Inner::default());
        (
            Self {
                inner: inner.clone(),
            },
            CancelToken { inner: Some(inner) },
        )
    }

    /// Fire the token, running every registered callback.
    ///
    /// Subsequent calls are no-ops.
    pub fn cancel(&self) {
        let pending = {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            if self.inner.canceled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut callbacks.pending)
        };
        for (_, callback) in pending {
            callback();
        }
    }
}

/// Observes a [Canceler].
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Option<Arc<Inner>>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("can_be_canceled", &self.can_be_canceled())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl CancelToken {
    /// Returns a token that is never canceled.
    pub const fn never() -> Self {
        Self { inner: None }
    }

    /// Returns `true` if the token has fired.
    pub fn is_canceled(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.canceled.load(Ordering::Acquire))
    }

    /// Returns `true` if the token is attached to a [Canceler].
    pub fn can_be_canceled(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns `true` if both tokens observe the same [Canceler].
    pub fn same(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Register `callback` to run when the token fires.
    ///
    /// Returns `None` (without running `callback`) if the token cannot be
    /// canceled or has already fired.
    pub(crate) fn register(&self, callback: Callback) -> Option<Registration> {
        let inner = self.inner.as_ref()?;
        let mut callbacks = inner.callbacks.lock().unwrap();
        if inner.canceled.load(Ordering::Acquire) {
            return None;
        }
        let key = callbacks.next;
        callbacks.next += 1;
        callbacks.pending.insert(key, callback);
        Some(Registration {
            inner: Arc::downgrade(inner),
            key,
        })
    }
}

/// A callback registered against a [CancelToken], removed on drop.
pub(crate) struct Registration {
    inner: Weak<Inner>,
    key: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.callbacks.lock().unwrap().pending.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let make = {
            let count = count.clone();
            move || -> Callback {
                let count = count.clone();
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }
        };
        (count, make)
    }

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let (canceler, token) = Canceler::new();
        let (count, make) = counter();
        let _a = token.register(make()).unwrap();
        let _b = token.clone().register(make()).unwrap();

        canceler.cancel();
        canceler.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(token.is_canceled());
    }

    #[test]
    fn test_dropped_registration_does_not_run() {
        let (canceler, token) = Canceler::new();
        let (count, make) = counter();
        let registration = token.register(make()).unwrap();
        drop(registration);

        canceler.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_register_after_cancel() {
        let (canceler, token) = Canceler::new();
        canceler.cancel();
        let (count, make) = counter();
        assert!(token.register(make()).is_none());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_never() {
        let token = CancelToken::never();
        assert!(!token.can_be_canceled());
        assert!(!token.is_canceled());
        let (_, make) = counter();
        assert!(token.register(make()).is_none());
        assert!(token.same(&CancelToken::default()));
    }

    #[test]
    fn test_same() {
        let (_c1, t1) = Canceler::new();
        let (_c2, t2) = Canceler::new();
        assert!(t1.same(&t1.clone()));
        assert!(!t1.same(&t2));
        assert!(!t1.same(&CancelToken::never()));
    }

    #[test]
    fn test_registration_outlives_canceler() {
        let (canceler, token) = Canceler::new();
        let (_, make) = counter();
        let registration = token.register(make()).unwrap();
        drop(canceler);
        drop(token);
        drop(registration);
    }
}
