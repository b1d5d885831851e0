//! Run continuations and callbacks released by the pipe.
//!
//! The pipe never wakes a task or runs a user callback while holding its lock.
//! Instead, it hands the work to a [Scheduler] once the lock is released. Two
//! implementations are provided: [Inline] runs the work on the calling thread and
//! [ThreadPool] moves it to a [rayon] pool.
//!
//! A [ContextFlow] optionally captures ambient state when a continuation is
//! stored and restores it when the continuation runs. [Spans] carries the
//! current [tracing::Span] across the suspension; [Detached] captures nothing.

use rayon::{ThreadPool as RThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::{any::Any, sync::Arc};
use tracing::{error, Span};

/// Work handed to a [Scheduler].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Interface that any executor of pipe continuations must implement.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task`, either before returning or at some later point.
    fn schedule(&self, task: Task);
}

/// Runs every task synchronously on the thread that released it.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl Scheduler for Inline {
    fn schedule(&self, task: Task) {
        task();
    }
}

/// Runs tasks on a [rayon] thread pool.
#[derive(Clone)]
pub struct ThreadPool {
    pool: Arc<RThreadPool>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl ThreadPool {
    /// Creates a pool with `concurrency` worker threads.
    ///
    /// A task that panics is logged instead of aborting the process.
    pub fn new(concurrency: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(|index| format!("pipe-scheduler-{index}"))
            .panic_handler(|err| {
                error!(panic = extract_panic_message(err.as_ref()), "task panicked");
            })
            .build()?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Wraps an existing [rayon] pool.
    pub fn from_pool(pool: Arc<RThreadPool>) -> Self {
        Self { pool }
    }
}

impl Scheduler for ThreadPool {
    fn schedule(&self, task: Task) {
        self.pool.spawn(task);
    }
}

/// Ambient state captured when a continuation is stored.
pub struct Captured(Box<dyn FnOnce(Task) + Send + 'static>);

impl Captured {
    /// Wraps a function that runs a task inside the captured state.
    pub fn new(run: impl FnOnce(Task) + Send + 'static) -> Self {
        Self(Box::new(run))
    }

    /// Run `task` inside the captured state.
    pub fn run(self, task: Task) {
        (self.0)(task)
    }
}

/// Captures and restores ambient state around continuations.
pub trait ContextFlow: Send + Sync + 'static {
    /// Capture the state of the calling thread, if there is any worth restoring.
    fn capture(&self) -> Option<Captured>;
}

/// Captures nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct Detached;

impl ContextFlow for Detached {
    fn capture(&self) -> Option<Captured> {
        None
    }
}

/// Re-enters the [tracing::Span] that was current when the continuation was stored.
#[derive(Clone, Copy, Debug, Default)]
pub struct Spans;

impl ContextFlow for Spans {
    fn capture(&self) -> Option<Captured> {
        let span = Span::current();
        if span.is_disabled() {
            return None;
        }
        Some(Captured::new(move |task| span.in_scope(task)))
    }
}

/// Schedule `task` on `scheduler`, inside `captured` if present.
pub(crate) fn dispatch(scheduler: &dyn Scheduler, captured: Option<Captured>, task: Task) {
    match captured {
        Some(captured) => scheduler.schedule(Box::new(move || captured.run(task))),
        None => scheduler.schedule(task),
    }
}

pub(crate) fn extract_panic_message(err: &(dyn Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{err:?}")
    }
}
