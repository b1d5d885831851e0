//! Shared state of a pipe and the bookkeeping both halves run under its lock.
//!
//! # Layout
//!
//! ```txt
//!   read head                      read tail           write head end
//!      |                               |                      |
//!  [seg 0: consumed | unread ] -> [seg 1: unread | buffered ] -> (free)
//!      ^ chain.front()                                ^ chain.back()
//! ```
//!
//! Every segment carries the absolute stream offset of its first byte, so a
//! [Position] is just an offset (plus the reset generation it belongs to).
//! Bytes between the read head and the read tail are committed and visible to
//! the reader. Bytes between the read tail and the end of the write head are
//! either uncommitted (`write_buffered`) or free.
//!
//! # Locking
//!
//! All bookkeeping happens under a single [Mutex]. Continuations, completion
//! callbacks and cancellation registrations are extracted under the lock and
//! released only after it is dropped.

pub mod reader;
pub mod writer;

use crate::{
    awaitable::{Awaitable, Continuation, Registered},
    cancel::{CancelToken, Registration},
    completion::{Callback, Callbacks, Completion},
    operation::OperationState,
    pool::BufferPool,
    scheduler::{ContextFlow, Scheduler, Task},
    segment::{relink, Segment, SegmentPool},
    Config, Error, Fault,
};
use reader::{Chunk, Position, Reader};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, Weak},
    task::{Poll, Waker},
};
use tracing::{debug, error, trace, warn};
use writer::{FlushResult, Writer};

/// Snapshot of a successful read, resolved into a [reader::ReadResult] by the reader.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReadOutcome {
    pub(crate) generation: u64,
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) canceled: bool,
    pub(crate) completed: bool,
}

struct State {
    chain: VecDeque<Segment>,
    segments: SegmentPool,

    /// Bytes advanced into the write head but not yet folded into its `end`.
    write_buffered: usize,
    /// Offset of the read head within `chain.front()`.
    read_head_index: usize,
    /// Absolute offset one past the last committed byte.
    read_tail: u64,
    /// Absolute offset the reader has examined up to (unset until the first write).
    last_examined: Option<u64>,

    unflushed_bytes: u64,
    unconsumed_bytes: u64,

    reader_awaitable: Awaitable,
    writer_awaitable: Awaitable,
    reader_completion: Completion,
    writer_completion: Completion,
    operation: OperationState,

    disposed: bool,
    generation: u64,
}

impl State {
    fn new(segment_pool_size: usize) -> Self {
        Self {
            chain: VecDeque::new(),
            segments: SegmentPool::new(segment_pool_size),
            write_buffered: 0,
            read_head_index: 0,
            read_tail: 0,
            last_examined: None,
            unflushed_bytes: 0,
            unconsumed_bytes: 0,
            reader_awaitable: Awaitable::new(false),
            writer_awaitable: Awaitable::new(true),
            reader_completion: Completion::default(),
            writer_completion: Completion::default(),
            operation: OperationState::default(),
            disposed: false,
            generation: 0,
        }
    }

    /// Absolute offset of the first unconsumed byte.
    fn read_head(&self) -> u64 {
        self.chain.front().map_or(self.read_tail, |segment| {
            segment.running_index() + self.read_head_index as u64
        })
    }

    /// Bytes still writable in the write head past the buffered ones.
    fn writable_window(&self) -> usize {
        self.chain
            .back()
            .map_or(0, |segment| segment.writable() - self.write_buffered)
    }

    /// Make buffered bytes visible to the reader.
    ///
    /// Returns the number of bytes committed.
    fn commit(&mut self, pause_writer_threshold: u64) -> u64 {
        self.operation.end_write();
        if self.unflushed_bytes == 0 {
            return 0;
        }
        if let Some(head) = self.chain.back_mut() {
            head.commit(self.write_buffered);
            self.read_tail = head.end_index();
        }
        self.write_buffered = 0;

        let committed = self.unflushed_bytes;
        let previous = self.unconsumed_bytes;
        self.unconsumed_bytes += committed;
        self.unflushed_bytes = 0;
        if pause_writer_threshold > 0
            && previous < pause_writer_threshold
            && self.unconsumed_bytes >= pause_writer_threshold
            && !self.reader_completion.is_completed()
        {
            debug!(unconsumed = self.unconsumed_bytes, "pausing writer");
            self.writer_awaitable.set_uncompleted();
        }
        committed
    }

    /// Collect the committed window into `chunks`.
    fn fill(&self, chunks: &mut Vec<Chunk>) {
        chunks.clear();
        let start = self.read_head();
        for segment in &self.chain {
            if segment.running_index() >= self.read_tail {
                break;
            }
            let lo = segment.running_index().max(start);
            let hi = segment.end_index().min(self.read_tail);
            if lo >= hi {
                continue;
            }
            let skip = (lo - segment.running_index()) as usize;
            // SAFETY: `skip < segment.end() <= capacity`, so the pointer stays in the block.
            let ptr = unsafe { segment.as_ptr().add(skip) };
            chunks.push(Chunk::new(ptr, lo, (hi - lo) as usize));
        }
    }

    /// Observe the reader's awaitable and build the result of a read.
    ///
    /// The cancellation registration is returned so it can be dropped outside
    /// the lock.
    fn take_read(
        &mut self,
        chunks: &mut Vec<Chunk>,
    ) -> (Result<ReadOutcome, Error>, Option<Registration>) {
        let canceled = self.reader_awaitable.observe_cancellation();
        let fired = self.reader_awaitable.token().is_canceled();
        let registration = self.reader_awaitable.release_cancel_registration();
        (self.read_outcome(canceled, fired, chunks), registration)
    }

    fn read_outcome(
        &mut self,
        canceled: bool,
        fired: bool,
        chunks: &mut Vec<Chunk>,
    ) -> Result<ReadOutcome, Error> {
        let completed = self.writer_completion.is_completed_or_err()?;
        if canceled {
            self.operation.begin_read_tentative()?;
            if fired {
                return Err(Error::Canceled);
            }
        } else {
            self.operation.begin_read()?;
        }
        self.fill(chunks);
        Ok(ReadOutcome {
            generation: self.generation,
            start: self.read_head(),
            end: self.read_tail,
            canceled,
            completed,
        })
    }

    /// Observe the writer's awaitable and build the result of a flush.
    fn take_flush(&mut self, flushed: u64) -> (Result<FlushResult, Error>, Option<Registration>) {
        let canceled = self.writer_awaitable.observe_cancellation();
        let fired = self.writer_awaitable.token().is_canceled();
        let registration = self.writer_awaitable.release_cancel_registration();
        let result = self
            .reader_completion
            .is_completed_or_err()
            .and_then(|completed| {
                if canceled && fired {
                    return Err(Error::Canceled);
                }
                Ok(FlushResult::new(flushed, canceled, completed))
            });
        (result, registration)
    }

    /// Return every segment to the free list.
    ///
    /// Skipped while either side holds a borrowed window into the chain.
    fn release_chain(&mut self) -> usize {
        if self.operation.is_reading_active() || self.operation.is_writing_active() {
            return 0;
        }
        let released = self.chain.len();
        while let Some(segment) = self.chain.pop_front() {
            self.segments.release(segment);
        }
        self.write_buffered = 0;
        self.read_head_index = 0;
        released
    }
}

/// Which half of a pipe an operation belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Reader,
    Writer,
}

/// State shared by the [Writer] and [Reader] of one pipe.
pub(crate) struct Shared {
    state: Mutex<State>,
    pool: BufferPool,
    minimum_segment_size: usize,
    pause_writer_threshold: u64,
    resume_writer_threshold: u64,
    reader_scheduler: Arc<dyn Scheduler>,
    writer_scheduler: Arc<dyn Scheduler>,
    context: Option<Arc<dyn ContextFlow>>,
}

impl Shared {
    fn new(cfg: Config) -> Self {
        Self {
            state: Mutex::new(State::new(cfg.segment_pool_size)),
            pool: cfg.pool,
            minimum_segment_size: cfg.minimum_segment_size.get(),
            pause_writer_threshold: cfg.pause_writer_threshold,
            resume_writer_threshold: cfg.resume_writer_threshold,
            reader_scheduler: cfg.reader_scheduler,
            writer_scheduler: cfg.writer_scheduler,
            context: cfg.flow_context.then_some(cfg.context),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn context(&self) -> Option<&dyn ContextFlow> {
        self.context.as_deref()
    }

    fn scheduler(&self, side: Side) -> &dyn Scheduler {
        match side {
            Side::Reader => &*self.reader_scheduler,
            Side::Writer => &*self.writer_scheduler,
        }
    }

    fn wake(&self, side: Side, continuation: Option<Continuation>) {
        if let Some(continuation) = continuation {
            continuation.schedule(self.scheduler(side));
        }
    }

    /// Run a batch of completion callbacks on `side`'s scheduler.
    fn run_callbacks(&self, side: Side, callbacks: Option<Callbacks>) {
        let Some(callbacks) = callbacks else {
            return;
        };
        self.scheduler(side).schedule(Box::new(move || {
            let count = callbacks.len();
            if let Err(err) = callbacks.execute() {
                error!(?err, count, "completion callbacks panicked");
            }
        }));
    }

    /// Builds the task a [CancelToken] runs when it fires during an operation on `side`.
    fn canceler(self: &Arc<Self>, side: Side) -> impl FnOnce() -> Task {
        let shared: Weak<Self> = Arc::downgrade(self);
        move || -> Task {
            Box::new(move || {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let continuation = {
                    let mut state = shared.lock();
                    match side {
                        Side::Reader => state.reader_awaitable.cancellation_fired(),
                        Side::Writer => state.writer_awaitable.cancellation_fired(),
                    }
                };
                shared.wake(side, continuation);
            })
        }
    }

    /// Tear down the chain once both sides have completed.
    fn complete_pipe(&self) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        let released = state.release_chain();
        debug!(
            released,
            pooled = state.segments.len(),
            generation = state.generation,
            "both sides completed"
        );
    }

    // ---------- Writer ----------

    /// Expose a writable window of at least `size_hint` bytes (or at least one
    /// byte if `size_hint` is zero).
    pub(crate) fn reserve(&self, size_hint: usize) -> Result<(*mut u8, usize), Error> {
        let mut state = self.lock();
        if state.writer_completion.is_completed() {
            return Err(Error::WritingNotAllowed);
        }
        state.operation.begin_write();

        let state = &mut *state;
        if state.chain.is_empty() {
            let base = state.read_tail;
            let mut segment =
                state
                    .segments
                    .acquire(&self.pool, self.minimum_segment_size, size_hint);
            segment.set_running_index(base);
            state.chain.push_back(segment);
            state.read_head_index = 0;
            state.last_examined.get_or_insert(base);
        } else {
            let window = state.writable_window();
            if window == 0 || window < size_hint {
                let buffered = std::mem::take(&mut state.write_buffered);
                let head = state.chain.back_mut().expect("chain is not empty");
                head.commit(buffered);
                if head.end() == 0 {
                    // Nothing was written into the head: swap its block for a larger one
                    let running_index = head.running_index();
                    if let Some(empty) = state.chain.pop_back() {
                        state.segments.release(empty);
                    }
                    let mut segment =
                        state
                            .segments
                            .acquire(&self.pool, self.minimum_segment_size, size_hint);
                    segment.set_running_index(running_index);
                    state.chain.push_back(segment);
                } else {
                    let segment =
                        state
                            .segments
                            .acquire(&self.pool, self.minimum_segment_size, size_hint);
                    state.chain.push_back(segment);
                    let len = state.chain.len();
                    relink(state.chain.range_mut(len - 2..));
                }
            }
        }

        let head = state.chain.back().expect("write head allocated");
        let start = head.end() + state.write_buffered;
        // SAFETY: `start <= capacity`, so the pointer stays in (or one past) the block.
        let ptr = unsafe { head.as_ptr().add(start) };
        Ok((ptr, head.capacity() - start))
    }

    /// Mark `n` bytes of the writable window as written.
    pub(crate) fn advance(&self, n: usize) -> Result<(), Error> {
        let mut state = self.lock();
        if state.writer_completion.is_completed() {
            return Err(Error::WritingNotAllowed);
        }
        let available = state.writable_window();
        if n > available {
            return Err(Error::AdvanceOutOfRange {
                requested: n,
                available,
            });
        }

        // Writes past a completed reader are dropped
        if state.reader_completion.is_completed() {
            return Ok(());
        }
        state.unflushed_bytes += n as u64;
        state.write_buffered += n;
        Ok(())
    }

    pub(crate) fn unflushed_bytes(&self) -> u64 {
        self.lock().unflushed_bytes
    }

    /// Drive a flush.
    ///
    /// The first poll commits buffered bytes and wakes the reader. Later polls
    /// only check whether backpressure has been released.
    pub(crate) fn poll_flush(
        self: &Arc<Self>,
        waker: &Waker,
        token: &CancelToken,
        owner: u64,
        started: &mut bool,
        flushed: &mut u64,
    ) -> Poll<Result<FlushResult, Error>> {
        let mut state = self.lock();
        let mut wake_reader = None;
        if !*started {
            if state.writer_completion.is_completed() {
                return Poll::Ready(Err(Error::WritingNotAllowed));
            }
            *flushed = state.commit(self.pause_writer_threshold);
            if *flushed > 0 {
                wake_reader = state.reader_awaitable.complete();
            }
            let begun = state
                .writer_awaitable
                .begin_operation(token, self.canceler(Side::Writer));
            if let Err(err) = begun {
                drop(state);
                self.wake(Side::Reader, wake_reader);
                return Poll::Ready(Err(err));
            }
            *started = true;
        }

        if state.writer_awaitable.is_completed() {
            let (result, registration) = state.take_flush(*flushed);
            drop(state);
            drop(registration);
            self.wake(Side::Reader, wake_reader);
            return Poll::Ready(result);
        }

        let registered = state
            .writer_awaitable
            .on_completed(waker, owner, self.context());
        drop(state);
        self.wake(Side::Reader, wake_reader);
        match registered {
            Registered::Stored => {}
            Registered::Ready(continuation) => self.wake(Side::Writer, Some(continuation)),
            Registered::Double(continuation) => {
                warn!(owner, "concurrent flush detected");
                self.fault(Side::Reader);
                self.wake(Side::Writer, Some(continuation));
            }
        }
        Poll::Pending
    }

    /// Forget an in-flight flush whose future was dropped.
    pub(crate) fn abandon_flush(&self, owner: u64) {
        let registration = self.lock().writer_awaitable.abandon(owner);
        drop(registration);
    }

    pub(crate) fn cancel_pending_flush(&self) {
        let continuation = self.lock().writer_awaitable.cancel();
        self.wake(Side::Writer, continuation);
    }

    /// Complete the writer, committing anything it left buffered.
    pub(crate) fn complete_writer(&self, error: Option<Fault>) {
        let (callbacks, continuation, reader_done) = {
            let mut state = self.lock();
            state.commit(self.pause_writer_threshold);
            let callbacks = state.writer_completion.try_complete(error);
            let continuation = state.reader_awaitable.complete();
            (
                callbacks,
                continuation,
                state.reader_completion.is_completed(),
            )
        };
        debug!(reader_done, "writer completed");
        self.run_callbacks(Side::Reader, callbacks);
        self.wake(Side::Reader, continuation);
        if reader_done {
            self.complete_pipe();
        }
    }

    /// Register `callback` to run (on the writer's scheduler) once the reader completes.
    pub(crate) fn on_reader_completed(&self, callback: Callback) {
        let callbacks = self.lock().reader_completion.add_callback(callback);
        self.run_callbacks(Side::Writer, callbacks);
    }

    // ---------- Reader ----------

    /// Drive a read.
    pub(crate) fn poll_read(
        self: &Arc<Self>,
        waker: &Waker,
        token: &CancelToken,
        owner: u64,
        started: &mut bool,
        chunks: &mut Vec<Chunk>,
    ) -> Poll<Result<ReadOutcome, Error>> {
        let mut state = self.lock();
        if !*started {
            if state.reader_completion.is_completed() {
                return Poll::Ready(Err(Error::ReadingNotAllowed));
            }
            state
                .reader_awaitable
                .begin_operation(token, self.canceler(Side::Reader))?;
            *started = true;
        }

        if state.reader_awaitable.is_completed() {
            let (result, registration) = state.take_read(chunks);
            drop(state);
            drop(registration);
            return Poll::Ready(result);
        }

        let registered = state
            .reader_awaitable
            .on_completed(waker, owner, self.context());
        drop(state);
        match registered {
            Registered::Stored => {}
            Registered::Ready(continuation) => self.wake(Side::Reader, Some(continuation)),
            Registered::Double(continuation) => {
                warn!(owner, "concurrent read detected");
                self.fault(Side::Writer);
                self.wake(Side::Reader, Some(continuation));
            }
        }
        Poll::Pending
    }

    /// Read without suspending.
    ///
    /// Returns `None` (and marks a tentative read) if there is nothing new to report.
    pub(crate) fn try_read(&self, chunks: &mut Vec<Chunk>) -> Result<Option<ReadOutcome>, Error> {
        let mut state = self.lock();
        if state.reader_completion.is_completed() {
            return Err(Error::ReadingNotAllowed);
        }
        if state.unconsumed_bytes > 0 || state.reader_awaitable.is_completed() {
            let (result, registration) = state.take_read(chunks);
            drop(state);
            drop(registration);
            return result.map(Some);
        }
        if state.reader_awaitable.is_running() {
            return Err(Error::AlreadyReading);
        }
        state.operation.begin_read_tentative()?;
        Ok(None)
    }

    /// Release the bytes before `consumed` and record that everything before
    /// `examined` has been looked at.
    pub(crate) fn advance_reader(&self, consumed: Position, examined: Position) -> Result<(), Error> {
        if consumed.generation != examined.generation {
            return Err(Error::InvalidCursor);
        }
        if consumed.offset > examined.offset {
            return Err(Error::ConsumedAfterExamined);
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        if consumed.generation != state.generation {
            return Err(Error::InvalidCursor);
        }
        if !state.operation.is_reading_active() {
            return Err(Error::NoReadToComplete);
        }
        if consumed.offset < state.read_head() || examined.offset > state.read_tail {
            return Err(Error::InvalidCursor);
        }
        if state
            .last_examined
            .is_some_and(|last| examined.offset < last)
        {
            return Err(Error::ExaminedRegressed);
        }

        let examined_everything = examined.offset == state.read_tail;
        let mut resume = None;
        if let Some(last) = state.last_examined {
            let previous = state.unconsumed_bytes;
            state.unconsumed_bytes -= examined.offset - last;
            state.last_examined = Some(examined.offset);
            if previous >= self.resume_writer_threshold
                && state.unconsumed_bytes < self.resume_writer_threshold
            {
                debug!(unconsumed = state.unconsumed_bytes, "resuming writer");
                resume = state.writer_awaitable.complete();
            }
        }

        // Free every segment fully behind `consumed`. The write head is kept
        // while the writer has a window into it.
        let mut released = 0;
        while let Some(segment) = state.chain.front() {
            if segment.end_index() > consumed.offset {
                break;
            }
            if state.chain.len() == 1
                && (state.write_buffered > 0 || state.operation.is_writing_active())
            {
                break;
            }
            if let Some(segment) = state.chain.pop_front() {
                state.segments.release(segment);
                released += 1;
            }
        }
        state.read_head_index = state.chain.front().map_or(0, |segment| {
            consumed.offset.saturating_sub(segment.running_index()) as usize
        });
        if released > 0 {
            trace!(released, head = consumed.offset, "released segments");
        }

        if examined_everything && !state.writer_completion.is_completed() {
            state.reader_awaitable.set_uncompleted();
        }
        state.operation.end_read()?;
        drop(guard);

        self.wake(Side::Writer, resume);
        Ok(())
    }

    /// Forget an in-flight read whose future was dropped.
    pub(crate) fn abandon_read(&self, owner: u64) {
        let registration = self.lock().reader_awaitable.abandon(owner);
        drop(registration);
    }

    pub(crate) fn cancel_pending_read(&self) {
        let continuation = self.lock().reader_awaitable.cancel();
        self.wake(Side::Reader, continuation);
    }

    /// Complete the reader, waking a writer parked on backpressure.
    pub(crate) fn complete_reader(&self, error: Option<Fault>) {
        let (callbacks, continuation, writer_done) = {
            let mut state = self.lock();
            state.operation.clear_read();
            let callbacks = state.reader_completion.try_complete(error);
            let continuation = state.writer_awaitable.complete();
            (
                callbacks,
                continuation,
                state.writer_completion.is_completed(),
            )
        };
        debug!(writer_done, "reader completed");
        self.run_callbacks(Side::Writer, callbacks);
        self.wake(Side::Writer, continuation);
        if writer_done {
            self.complete_pipe();
        }
    }

    /// Register `callback` to run (on the reader's scheduler) once the writer completes.
    pub(crate) fn on_writer_completed(&self, callback: Callback) {
        let callbacks = self.lock().writer_completion.add_callback(callback);
        self.run_callbacks(Side::Reader, callbacks);
    }

    /// Fault `side` after the opposite side detected overlapping operations.
    ///
    /// Unlike an ordinary completion, the faulted side's read or write state is
    /// left untouched: it may still hold a window into the chain.
    fn fault(&self, side: Side) {
        let fault: Fault = Arc::new(Error::ConcurrentOperation);
        let (callbacks, continuation, both_done) = {
            let mut state = self.lock();
            let (callbacks, continuation) = match side {
                Side::Reader => (
                    state.reader_completion.try_complete(Some(fault)),
                    state.writer_awaitable.complete(),
                ),
                Side::Writer => (
                    state.writer_completion.try_complete(Some(fault)),
                    state.reader_awaitable.complete(),
                ),
            };
            let both_done =
                state.reader_completion.is_completed() && state.writer_completion.is_completed();
            (callbacks, continuation, both_done)
        };
        let opposite = match side {
            Side::Reader => Side::Writer,
            Side::Writer => Side::Reader,
        };
        self.run_callbacks(opposite, callbacks);
        self.wake(opposite, continuation);
        if both_done {
            self.complete_pipe();
        }
    }

    // ---------- Lifecycle ----------

    /// Return a completed pipe to its initial state.
    fn reset(&self) -> Result<(), Error> {
        let (reader_registration, writer_registration) = {
            let mut state = self.lock();
            if !state.disposed {
                return Err(Error::ResetIncomplete);
            }
            let state = &mut *state;
            while let Some(segment) = state.chain.pop_front() {
                state.segments.release(segment);
            }
            let reader_registration = state.reader_awaitable.release_cancel_registration();
            let writer_registration = state.writer_awaitable.release_cancel_registration();
            state.reader_awaitable = Awaitable::new(false);
            state.writer_awaitable = Awaitable::new(true);
            state.reader_completion.reset();
            state.writer_completion.reset();
            state.operation = OperationState::default();
            state.write_buffered = 0;
            state.read_head_index = 0;
            state.read_tail = 0;
            state.last_examined = None;
            state.unflushed_bytes = 0;
            state.unconsumed_bytes = 0;
            state.disposed = false;
            state.generation += 1;
            debug!(generation = state.generation, "pipe reset");
            (reader_registration, writer_registration)
        };
        drop(reader_registration);
        drop(writer_registration);
        Ok(())
    }
}

/// Cancels the pending operation of one side of a pipe from another task.
///
/// The handle does not keep the pipe alive.
#[derive(Clone)]
pub struct Interrupt {
    shared: Weak<Shared>,
    side: Side,
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt").field("side", &self.side).finish()
    }
}

impl Interrupt {
    fn new(shared: &Arc<Shared>, side: Side) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            side,
        }
    }

    /// Resolve the side's pending (or next) read or flush as canceled.
    pub fn cancel(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match self.side {
            Side::Reader => shared.cancel_pending_read(),
            Side::Writer => shared.cancel_pending_flush(),
        }
    }
}

/// A single-producer, single-consumer byte pipe.
///
/// Dropping a [Writer] or [Reader] completes it (without an error).
pub struct Pipe {
    writer: Writer,
    reader: Reader,
}

impl Pipe {
    /// Create a new pipe.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        cfg.validate()?;
        let shared = Arc::new(Shared::new(cfg));
        Ok(Self {
            writer: Writer::new(shared.clone()),
            reader: Reader::new(shared),
        })
    }

    /// Returns the writing half.
    pub fn writer(&mut self) -> &mut Writer {
        &mut self.writer
    }

    /// Returns the reading half.
    pub fn reader(&mut self) -> &mut Reader {
        &mut self.reader
    }

    /// Borrow both halves at once.
    pub fn split(&mut self) -> (&mut Writer, &mut Reader) {
        (&mut self.writer, &mut self.reader)
    }

    /// Move both halves out, for use from separate tasks.
    pub fn into_split(self) -> (Writer, Reader) {
        (self.writer, self.reader)
    }

    /// Reassemble halves produced by [Pipe::into_split].
    ///
    /// Halves from different pipes are dropped (and so completed) before the
    /// error is returned.
    pub fn unsplit(writer: Writer, reader: Reader) -> Result<Self, Error> {
        if !Arc::ptr_eq(writer.shared(), reader.shared()) {
            return Err(Error::MismatchedHalves);
        }
        Ok(Self { writer, reader })
    }

    /// Return the pipe to a clean state for reuse.
    ///
    /// Both halves must have completed. Positions from before the reset are
    /// rejected afterwards.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.writer.shared().reset()?;
        self.reader.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BufferPoolConfig, Canceler, ErrorKind, ThreadPool};
    use commonware_macros::test_traced;
    use futures::{
        executor::block_on,
        task::{noop_waker, waker, ArcWake},
        FutureExt,
    };
    use std::{
        future::Future,
        io,
        mem,
        pin::pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Mutex,
        },
        task::Context,
    };

    fn small_pool() -> BufferPool {
        BufferPool::new(BufferPoolConfig {
            min_size: NZUsize!(16),
            max_size: NZUsize!(1024),
            max_per_class: NZUsize!(64),
            prefill: false,
            alignment: NZUsize!(16),
        })
    }

    fn config(segment: usize, pause: u64, resume: u64) -> Config {
        Config {
            pool: small_pool(),
            minimum_segment_size: NZUsize!(segment),
            segment_pool_size: 4,
            pause_writer_threshold: pause,
            resume_writer_threshold: resume,
            ..Default::default()
        }
    }

    struct CountingWaker(AtomicUsize);

    impl ArcWake for CountingWaker {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (counter.clone(), waker(counter))
    }

    fn poll_once<F: Future + Unpin>(future: &mut F, waker: &Waker) -> Poll<F::Output> {
        future.poll_unpin(&mut Context::from_waker(waker))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test_traced]
    fn test_round_trip_across_segments() {
        block_on(async {
            let mut pipe = Pipe::new(config(16, 0, 0)).unwrap();
            let (writer, reader) = pipe.split();

            // Write in uneven pieces so the data straddles several segments
            let data = pattern(100);
            for piece in data.chunks(7) {
                let window = writer.reserve(piece.len()).unwrap();
                window[..piece.len()].copy_from_slice(piece);
                writer.advance(piece.len()).unwrap();
            }
            assert_eq!(writer.unflushed_bytes(), 100);
            let result = writer.flush().await.unwrap();
            assert_eq!(result.flushed(), 100);
            assert!(!result.is_canceled());
            assert!(!result.is_completed());
            assert_eq!(writer.unflushed_bytes(), 0);

            let result = reader.read().await.unwrap();
            let buffer = result.buffer();
            assert_eq!(buffer.len(), 100);
            assert!(buffer.chunks().count() > 1);
            assert_eq!(buffer.to_vec(), data);
            let end = buffer.end();
            reader.advance(end).unwrap();
        });
    }

    #[test]
    fn test_incremental_consumption() {
        block_on(async {
            let mut pipe = Pipe::new(config(16, 0, 0)).unwrap();
            let (writer, reader) = pipe.split();
            let data = pattern(50);
            writer.write(&data).await.unwrap();

            let mut received = Vec::new();
            while received.len() < data.len() {
                let result = reader.read().await.unwrap();
                let buffer = result.buffer();
                let take = buffer.len().min(9);
                received.extend_from_slice(&buffer.slice(..take).to_vec());
                let consumed = buffer.position(take);
                reader.advance(consumed).unwrap();
            }
            assert_eq!(received, data);
            assert!(reader.try_read().unwrap().is_none());
        });
    }

    #[test_traced]
    fn test_backpressure_activation_and_release() {
        let mut pipe = Pipe::new(config(64, 100, 50)).unwrap();
        let (writer, reader) = pipe.split();
        let (counter, waker) = counting();

        writer.put_slice(&pattern(150)).unwrap();
        {
            let mut flush = writer.flush();
            assert!(poll_once(&mut flush, &waker).is_pending());

            // Consume 60 bytes: 90 remain, still above resume
            let result = reader.try_read().unwrap().expect("data available");
            assert_eq!(result.buffer().len(), 150);
            let consumed = result.buffer().position(60);
            reader.advance(consumed).unwrap();
            assert_eq!(counter.0.load(Ordering::SeqCst), 0);
            assert!(poll_once(&mut flush, &waker).is_pending());

            // Consume 45 more: 45 remain, below resume
            let result = reader.try_read().unwrap().expect("data available");
            assert_eq!(result.buffer().len(), 90);
            let consumed = result.buffer().position(45);
            reader.advance(consumed).unwrap();
            assert_eq!(counter.0.load(Ordering::SeqCst), 1);

            let Poll::Ready(result) = poll_once(&mut flush, &waker) else {
                panic!("flush should resolve once below resume threshold");
            };
            let result = result.unwrap();
            assert_eq!(result.flushed(), 150);
            assert!(!result.is_canceled());
        }

        // Below the pause threshold the next flush completes immediately
        writer.put_slice(&pattern(10)).unwrap();
        let result = writer.flush().now_or_never().unwrap().unwrap();
        assert_eq!(result.flushed(), 10);
    }

    #[test]
    fn test_peek_without_consuming() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        writer.put_slice(&pattern(20)).unwrap();
        writer.flush().now_or_never().unwrap().unwrap();

        let result = reader.read().now_or_never().unwrap().unwrap();
        let buffer = result.buffer();
        let (start, examined) = (buffer.start(), buffer.position(10));
        reader.advance_to(start, examined).unwrap();

        // Not everything was examined, so the next read does not wait
        let result = reader
            .read()
            .now_or_never()
            .expect("read should not suspend")
            .unwrap();
        assert_eq!(result.buffer().to_vec(), pattern(20));
        let end = result.buffer().end();
        reader.advance_to(start, end).unwrap();

        // Everything was examined: nothing new until the writer commits more
        assert!(reader.read().now_or_never().is_none());
        writer.put_slice(&[1]).unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        let result = reader.read().now_or_never().unwrap().unwrap();
        assert_eq!(result.buffer().len(), 21);
    }

    #[test]
    fn test_cancel_pending_read_preserves_data() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        writer.put_slice(b"kept").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();

        reader.cancel_pending_read();
        let result = reader.read().now_or_never().unwrap().unwrap();
        assert!(result.is_canceled());
        assert_eq!(result.buffer().to_vec(), b"kept");

        // Nothing was consumed and the cancellation was observed once
        let result = reader.read().now_or_never().unwrap().unwrap();
        assert!(!result.is_canceled());
        assert_eq!(result.buffer().to_vec(), b"kept");
    }

    #[test]
    fn test_cancel_suspended_read() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        let (counter, waker) = counting();
        let interrupt = reader.interrupt();
        {
            let mut read = reader.read();
            assert!(poll_once(&mut read, &waker).is_pending());
            interrupt.cancel();
            assert_eq!(counter.0.load(Ordering::SeqCst), 1);
            let Poll::Ready(result) = poll_once(&mut read, &waker) else {
                panic!("canceled read should resolve");
            };
            let result = result.unwrap();
            assert!(result.is_canceled());
            assert!(result.buffer().is_empty());
        }

        // The pipe still works afterwards
        writer.put_slice(b"after").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        let result = reader.read().now_or_never().unwrap().unwrap();
        assert!(!result.is_canceled());
        assert_eq!(result.buffer().to_vec(), b"after");
    }

    #[test]
    fn test_cancel_token_fails_read() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        let (canceler, token) = Canceler::new();
        let (counter, waker) = counting();
        {
            let mut read = reader.read_with(&token);
            assert!(poll_once(&mut read, &waker).is_pending());
            canceler.cancel();
            assert_eq!(counter.0.load(Ordering::SeqCst), 1);
            let Poll::Ready(result) = poll_once(&mut read, &waker) else {
                panic!("canceled read should resolve");
            };
            assert!(matches!(result, Err(Error::Canceled)));
        }

        // A fired token fails new operations immediately
        let err = reader.read_with(&token).now_or_never().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);

        // Buffered data is untouched by cancellation
        writer.put_slice(b"data").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        let result = reader.read().now_or_never().unwrap().unwrap();
        assert_eq!(result.buffer().to_vec(), b"data");
    }

    #[test]
    fn test_cancel_token_fails_flush() {
        let mut pipe = Pipe::new(config(64, 10, 5)).unwrap();
        let (writer, reader) = pipe.split();
        let (canceler, token) = Canceler::new();
        let (_, waker) = counting();

        writer.put_slice(&pattern(20)).unwrap();
        {
            let mut flush = writer.flush_with(&token);
            assert!(poll_once(&mut flush, &waker).is_pending());
            canceler.cancel();
            let Poll::Ready(result) = poll_once(&mut flush, &waker) else {
                panic!("canceled flush should resolve");
            };
            assert!(matches!(result, Err(Error::Canceled)));
        }

        // The bytes were committed before the flush suspended
        let result = reader.try_read().unwrap().unwrap();
        assert_eq!(result.buffer().len(), 20);
    }

    #[test]
    fn test_dropped_canceled_read_is_forgotten() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        let (canceler, token) = Canceler::new();
        let (_, waker) = counting();
        {
            let mut read = reader.read_with(&token);
            assert!(poll_once(&mut read, &waker).is_pending());
            canceler.cancel();
        }

        // The next read was never canceled
        writer.put_slice(b"data").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        let result = reader.read().now_or_never().unwrap().unwrap();
        assert!(!result.is_canceled());
        assert_eq!(result.buffer().to_vec(), b"data");
    }

    #[test_traced]
    fn test_overlapping_flush_faults_reader() {
        let mut pipe = Pipe::new(config(64, 10, 5)).unwrap();
        let (writer, reader) = pipe.split();
        let (counter, waker) = counting();

        writer.put_slice(&pattern(20)).unwrap();
        let mut first = writer.flush();
        assert!(poll_once(&mut first, &waker).is_pending());

        // Leak the suspended flush so its continuation stays registered
        mem::forget(first);
        let mut second = writer.flush();
        assert!(poll_once(&mut second, &waker).is_pending());
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        let Poll::Ready(Err(Error::Faulted(fault))) = poll_once(&mut second, &waker) else {
            panic!("overlapping flush should fault");
        };
        assert!(matches!(
            fault.downcast_ref::<Error>(),
            Some(Error::ConcurrentOperation)
        ));
        drop(second);

        // The reader was completed with the same error
        assert!(matches!(reader.try_read(), Err(Error::ReadingNotAllowed)));
        let err = writer.flush().now_or_never().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Faulted);
    }

    #[test]
    fn test_cancel_pending_flush() {
        let mut pipe = Pipe::new(config(64, 10, 5)).unwrap();
        let (writer, _reader) = pipe.split();
        let (_, waker) = counting();

        writer.put_slice(&pattern(20)).unwrap();
        let interrupt = writer.interrupt();
        let mut flush = writer.flush();
        assert!(poll_once(&mut flush, &waker).is_pending());
        interrupt.cancel();
        let Poll::Ready(result) = poll_once(&mut flush, &waker) else {
            panic!("canceled flush should resolve");
        };
        let result = result.unwrap();
        assert!(result.is_canceled());
        assert_eq!(result.flushed(), 20);
    }

    #[test_traced]
    fn test_writer_error_propagates() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        let (counter, waker) = counting();
        {
            let mut read = reader.read();
            assert!(poll_once(&mut read, &waker).is_pending());
            writer.complete_with_error(io::Error::other("broken"));
            assert_eq!(counter.0.load(Ordering::SeqCst), 1);
            let Poll::Ready(Err(Error::Faulted(err))) = poll_once(&mut read, &waker) else {
                panic!("read should fail with the writer's error");
            };
            assert_eq!(err.to_string(), "broken");
        }

        // Every later attempt re-raises the error
        assert!(matches!(reader.try_read(), Err(Error::Faulted(_))));
        let err = reader.read().now_or_never().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Faulted);
        assert!(matches!(writer.reserve(1), Err(Error::WritingNotAllowed)));
    }

    #[test]
    fn test_writer_completion_is_end_of_stream() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        writer.put_slice(b"tail").unwrap();
        writer.complete();

        // Completing commits buffered bytes
        let result = reader.read().now_or_never().unwrap().unwrap();
        assert!(result.is_completed());
        assert_eq!(result.buffer().to_vec(), b"tail");
        let end = result.buffer().end();
        reader.advance(end).unwrap();

        // Still completed (and empty) after consuming everything
        let result = reader.try_read().unwrap().unwrap();
        assert!(result.is_completed());
        assert!(result.buffer().is_empty());
    }

    #[test]
    fn test_reader_error_propagates() {
        let mut pipe = Pipe::new(config(64, 10, 5)).unwrap();
        let (writer, reader) = pipe.split();
        let (counter, waker) = counting();

        writer.put_slice(&pattern(20)).unwrap();
        {
            let mut flush = writer.flush();
            assert!(poll_once(&mut flush, &waker).is_pending());
            reader.complete_with_error(io::Error::other("gone"));
            assert_eq!(counter.0.load(Ordering::SeqCst), 1);
            let Poll::Ready(Err(Error::Faulted(err))) = poll_once(&mut flush, &waker) else {
                panic!("flush should fail with the reader's error");
            };
            assert_eq!(err.to_string(), "gone");
        }
        assert!(matches!(
            reader.read().now_or_never().unwrap(),
            Err(Error::ReadingNotAllowed)
        ));
    }

    #[test]
    fn test_writes_after_reader_completed_are_dropped() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        reader.complete();

        writer.put_slice(&pattern(10)).unwrap();
        assert_eq!(writer.unflushed_bytes(), 0);
        let result = writer.flush().now_or_never().unwrap().unwrap();
        assert!(result.is_completed());
        assert_eq!(result.flushed(), 0);
    }

    #[test]
    fn test_segment_reclamation_and_reset() {
        let mut pipe = Pipe::new(config(16, 0, 0)).unwrap();
        let pool = pipe.writer().shared().pool.clone();
        {
            let (writer, reader) = pipe.split();
            writer.put_slice(&pattern(100)).unwrap();
            writer.flush().now_or_never().unwrap().unwrap();
            assert!(pool.allocated() > 1);
            let result = reader.read().now_or_never().unwrap().unwrap();
            let middle = result.buffer().position(40);
            reader.advance(middle).unwrap();

            // Both sides complete with data still buffered
            writer.complete();
            reader.complete();
        }
        {
            let state = pipe.writer().shared().lock();
            assert!(state.disposed);
            assert!(state.chain.is_empty());
            assert!(state.segments.len() <= 4);
        }
        assert_eq!(pool.allocated(), 0);

        pipe.reset().unwrap();
        let (writer, reader) = pipe.split();
        writer.put_slice(b"again").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        let result = reader.read().now_or_never().unwrap().unwrap();
        assert_eq!(result.buffer().to_vec(), b"again");
        assert_eq!(result.buffer().start().offset(), 0);
        assert!(!result.is_completed());
    }

    #[test]
    fn test_reset_requires_completion() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        assert!(matches!(pipe.reset(), Err(Error::ResetIncomplete)));
        pipe.writer().complete();
        assert!(matches!(pipe.reset(), Err(Error::ResetIncomplete)));
        pipe.reader().complete();
        pipe.reset().unwrap();
    }

    #[test]
    fn test_stale_position_after_reset() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        writer.put_slice(b"x").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        let start = reader.read().now_or_never().unwrap().unwrap().buffer().start();
        writer.complete();
        reader.complete();
        pipe.reset().unwrap();

        let (writer, reader) = pipe.split();
        writer.put_slice(b"y").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        reader.read().now_or_never().unwrap().unwrap();
        assert!(matches!(reader.advance(start), Err(Error::InvalidCursor)));
    }

    #[test]
    fn test_second_read_fails() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        writer.put_slice(b"once").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();

        let result = reader.read().now_or_never().unwrap().unwrap();
        let start = result.buffer().start();
        let err = reader.read().now_or_never().unwrap().unwrap_err();
        assert!(matches!(err, Error::AlreadyReading));
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert!(matches!(reader.try_read(), Err(Error::AlreadyReading)));

        // Releasing the first result allows reading again
        reader.advance(start).unwrap();
        assert!(reader.read().now_or_never().unwrap().is_ok());
    }

    #[test]
    fn test_advance_validation() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        writer.put_slice(&pattern(30)).unwrap();
        writer.flush().now_or_never().unwrap().unwrap();

        let result = reader.read().now_or_never().unwrap().unwrap();
        let buffer = result.buffer();
        let (start, ten, twenty) = (buffer.start(), buffer.position(10), buffer.position(20));
        assert!(matches!(
            reader.advance_to(twenty, ten),
            Err(Error::ConsumedAfterExamined)
        ));
        reader.advance_to(start, twenty).unwrap();
        assert!(matches!(
            reader.advance_to(start, twenty),
            Err(Error::NoReadToComplete)
        ));

        let result = reader.read().now_or_never().unwrap().unwrap();
        assert_eq!(result.buffer().len(), 30);
        assert!(matches!(
            reader.advance_to(start, ten),
            Err(Error::ExaminedRegressed)
        ));
        reader.advance_to(ten, twenty).unwrap();

        // Consumed bytes can no longer be referenced
        reader.read().now_or_never().unwrap().unwrap();
        assert!(matches!(
            reader.advance(start),
            Err(Error::InvalidCursor)
        ));
    }

    #[test]
    fn test_try_read_tentative() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        assert!(reader.try_read().unwrap().is_none());
        assert!(reader.try_read().unwrap().is_none());

        writer.put_slice(b"ready").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        let result = reader.try_read().unwrap().unwrap();
        assert_eq!(result.buffer().to_vec(), b"ready");
    }

    #[test]
    fn test_advance_out_of_range() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let writer = pipe.writer();
        let window = writer.reserve(8).unwrap().len();
        let err = writer.advance(window + 1).unwrap_err();
        assert!(matches!(
            err,
            Error::AdvanceOutOfRange { requested, available } if requested == window + 1 && available == window
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_large_reservation() {
        let mut pipe = Pipe::new(config(16, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        let data = pattern(4000);
        let window = writer.reserve(data.len()).unwrap();
        assert!(window.len() >= data.len());
        window[..data.len()].copy_from_slice(&data);
        writer.advance(data.len()).unwrap();
        writer.flush().now_or_never().unwrap().unwrap();

        let result = reader.read().now_or_never().unwrap().unwrap();
        assert_eq!(result.buffer().chunks().count(), 1);
        assert_eq!(result.buffer().first(), &data[..]);
    }

    #[test]
    fn test_completion_callbacks() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = seen.clone();
        reader.on_writer_completed(move |err| {
            inner
                .lock()
                .unwrap()
                .push(format!("writer:{}", err.map(|e| e.to_string()).unwrap_or_default()));
        });
        let inner = seen.clone();
        writer.on_reader_completed(move |err| {
            inner.lock().unwrap().push(format!("reader:{}", err.is_some()));
        });

        writer.complete_with_error(io::Error::other("eof"));
        reader.complete();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["writer:eof".to_string(), "reader:false".to_string()]
        );

        // Late registration runs immediately
        let inner = seen.clone();
        reader.on_writer_completed(move |_| inner.lock().unwrap().push("late".into()));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test_traced]
    fn test_panicking_callback_is_contained() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        let count = Arc::new(AtomicUsize::new(0));
        reader.on_writer_completed(|_| panic!("callback failed"));
        let inner = count.clone();
        reader.on_writer_completed(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        writer.complete();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_read_detaches() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        let (counter, waker) = counting();
        {
            let mut read = reader.read();
            assert!(poll_once(&mut read, &waker).is_pending());
        }
        writer.put_slice(b"late").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        let mut read = reader.read();
        let Poll::Ready(Ok(result)) = poll_once(&mut read, &noop_waker()) else {
            panic!("data should be ready");
        };
        assert_eq!(result.buffer().to_vec(), b"late");
    }

    #[test]
    fn test_unsplit() {
        let (writer, reader) = Pipe::new(config(64, 0, 0)).unwrap().into_split();
        let (other_writer, other_reader) = Pipe::new(config(64, 0, 0)).unwrap().into_split();
        assert!(matches!(
            Pipe::unsplit(writer, other_reader),
            Err(Error::MismatchedHalves)
        ));
        assert!(Pipe::unsplit(other_writer, reader).is_err());

        let (writer, reader) = Pipe::new(config(64, 0, 0)).unwrap().into_split();
        let mut pipe = Pipe::unsplit(writer, reader).unwrap();
        pipe.writer().complete();
        pipe.reader().complete();
        pipe.reset().unwrap();
    }

    #[test]
    fn test_dropping_writer_completes() {
        let (writer, mut reader) = Pipe::new(config(64, 0, 0)).unwrap().into_split();
        drop(writer);
        let result = reader.read().now_or_never().unwrap().unwrap();
        assert!(result.is_completed());
    }

    #[test_traced]
    fn test_threaded_transfer() {
        let scheduler = Arc::new(ThreadPool::new(2).unwrap());
        let cfg = Config {
            reader_scheduler: scheduler.clone(),
            writer_scheduler: scheduler,
            flow_context: true,
            ..config(32, 256, 128)
        };
        let (mut writer, mut reader) = Pipe::new(cfg).unwrap().into_split();
        let data = pattern(10_000);

        let expected = data.clone();
        let (tx, rx) = mpsc::channel();
        let consumer = std::thread::spawn(move || {
            block_on(async {
                let mut received = Vec::new();
                loop {
                    let result = reader.read().await.unwrap();
                    let buffer = result.buffer();
                    received.extend(buffer.chunks().flatten().copied());
                    let (end, completed) = (buffer.end(), result.is_completed());
                    reader.advance(end).unwrap();
                    if completed {
                        break;
                    }
                }
                reader.complete();
                tx.send(received).unwrap();
            });
        });

        block_on(async {
            for piece in data.chunks(97) {
                writer.write(piece).await.unwrap();
            }
            writer.complete();
        });
        let received = rx.recv().unwrap();
        consumer.join().unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_read_future_is_pinned_safely() {
        let mut pipe = Pipe::new(config(64, 0, 0)).unwrap();
        let (writer, reader) = pipe.split();
        writer.put_slice(b"pin").unwrap();
        writer.flush().now_or_never().unwrap().unwrap();
        let read = pin!(reader.read());
        let Poll::Ready(Ok(result)) = read.poll(&mut Context::from_waker(&noop_waker())) else {
            panic!("data should be ready");
        };
        assert_eq!(result.buffer().to_vec(), b"pin");
    }
}
