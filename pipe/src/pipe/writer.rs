//! Writing half of a pipe.

use super::{Interrupt, Shared, Side};
use crate::{cancel::CancelToken, Error, Fault};
use std::{
    future::Future,
    pin::Pin,
    slice,
    sync::Arc,
    task::{Context, Poll},
};

/// The outcome of a flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushResult {
    flushed: u64,
    canceled: bool,
    completed: bool,
}

impl FlushResult {
    pub(crate) fn new(flushed: u64, canceled: bool, completed: bool) -> Self {
        Self {
            flushed,
            canceled,
            completed,
        }
    }

    /// Returns the number of bytes this flush made visible to the reader.
    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    /// Returns `true` if the flush was interrupted by [Writer::cancel_pending_flush].
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Returns `true` if the reader has completed (further bytes are dropped).
    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

/// The writing half of a pipe.
pub struct Writer {
    shared: Arc<Shared>,
    operations: u64,
}

impl Writer {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            operations: 0,
        }
    }

    pub(super) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Returns a writable window of at least `size_hint` bytes (and at least one).
    ///
    /// Bytes written into the window are not part of the stream until they are
    /// [Writer::advance]d past.
    pub fn reserve(&mut self, size_hint: usize) -> Result<&mut [u8], Error> {
        let (ptr, len) = self.shared.reserve(size_hint)?;

        // SAFETY: the window lies past every committed and buffered byte of the
        // write head, so only the writer touches it. The write head is not
        // released while the writer holds a window, and the window's lifetime
        // is tied to `&mut self`.
        Ok(unsafe { slice::from_raw_parts_mut(ptr, len) })
    }

    /// Add `n` bytes from the start of the last reserved window to the stream.
    pub fn advance(&mut self, n: usize) -> Result<(), Error> {
        self.shared.advance(n)
    }

    /// Returns the number of bytes advanced but not yet flushed.
    pub fn unflushed_bytes(&self) -> u64 {
        self.shared.unflushed_bytes()
    }

    /// Copy `data` into the pipe, spanning as many segments as needed.
    ///
    /// The bytes are not visible to the reader until the next flush.
    pub fn put_slice(&mut self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let window = self.reserve(0)?;
            let n = window.len().min(data.len());
            window[..n].copy_from_slice(&data[..n]);
            self.advance(n)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Make every advanced byte visible to the reader.
    ///
    /// Resolves once unconsumed bytes are below the pause threshold (or the
    /// reader completes).
    pub fn flush(&mut self) -> Flush<'_> {
        self.flush_with(&CancelToken::never())
    }

    /// Like [Writer::flush], failing with [Error::Canceled] if `token` fires
    /// while waiting on backpressure.
    pub fn flush_with(&mut self, token: &CancelToken) -> Flush<'_> {
        self.operations += 1;
        let owner = self.operations;
        Flush {
            writer: Some(self),
            token: token.clone(),
            owner,
            started: false,
            flushed: 0,
        }
    }

    /// Copy `data` into the pipe and flush.
    pub async fn write(&mut self, data: &[u8]) -> Result<FlushResult, Error> {
        self.put_slice(data)?;
        self.flush().await
    }

    /// Resolve the pending (or next) flush with [FlushResult::is_canceled] set.
    pub fn cancel_pending_flush(&self) {
        self.shared.cancel_pending_flush();
    }

    /// Returns a handle that cancels pending flushes from elsewhere.
    pub fn interrupt(&self) -> Interrupt {
        Interrupt::new(&self.shared, Side::Writer)
    }

    /// Run `callback` (on the writer's scheduler) once the reader completes.
    pub fn on_reader_completed(&self, callback: impl FnOnce(Option<Fault>) + Send + 'static) {
        self.shared.on_reader_completed(Box::new(callback));
    }

    /// Signal end-of-stream, committing any unflushed bytes.
    pub fn complete(&mut self) {
        self.shared.complete_writer(None);
    }

    /// Signal that the stream ended because of `error`.
    ///
    /// The reader receives `error` from its next read.
    pub fn complete_with_error(&mut self, error: impl std::error::Error + Send + Sync + 'static) {
        self.shared.complete_writer(Some(Arc::new(error)));
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.shared.complete_writer(None);
    }
}

/// Future returned by [Writer::flush].
pub struct Flush<'a> {
    writer: Option<&'a mut Writer>,
    token: CancelToken,
    owner: u64,
    started: bool,
    flushed: u64,
}

impl Future for Flush<'_> {
    type Output = Result<FlushResult, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let writer = this.writer.as_ref().expect("`Flush` polled after completion");
        let polled = writer.shared.poll_flush(
            cx.waker(),
            &this.token,
            this.owner,
            &mut this.started,
            &mut this.flushed,
        );
        if polled.is_ready() {
            this.writer = None;
        }
        polled
    }
}

impl Drop for Flush<'_> {
    fn drop(&mut self) {
        if !self.started {
            return;
        }
        if let Some(writer) = &self.writer {
            writer.shared.abandon_flush(self.owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Pipe};
    use futures::FutureExt;

    #[test]
    fn test_reserve_reuses_window() {
        let mut pipe = Pipe::new(Config::default()).unwrap();
        let writer = pipe.writer();
        let first = writer.reserve(10).unwrap();
        assert!(first.len() >= 4096);
        assert!(first.iter().all(|byte| *byte == 0));
        first[..3].copy_from_slice(b"abc");
        let capacity = first.len();
        writer.advance(3).unwrap();

        // The next window starts right after the advanced bytes
        let second = writer.reserve(10).unwrap();
        assert_eq!(second.len(), capacity - 3);
        assert_eq!(writer.unflushed_bytes(), 3);
    }

    #[test]
    fn test_put_slice_spans_segments() {
        let mut pipe = Pipe::new(Config::default()).unwrap();
        let (writer, reader) = pipe.split();
        let data = vec![7u8; 10_000];
        writer.put_slice(&data).unwrap();
        assert_eq!(writer.unflushed_bytes(), 10_000);
        assert_eq!(
            writer.flush().now_or_never().unwrap().unwrap().flushed(),
            10_000
        );

        let result = reader.try_read().unwrap().unwrap();
        assert_eq!(result.buffer().len(), 10_000);
        assert!(result.buffer().chunks().count() >= 3);
    }

    #[test]
    fn test_empty_flush() {
        let mut pipe = Pipe::new(Config::default()).unwrap();
        let (writer, reader) = pipe.split();
        let result = writer.flush().now_or_never().unwrap().unwrap();
        assert_eq!(result, FlushResult::new(0, false, false));

        // Nothing was committed, so the reader has nothing to report
        assert!(reader.try_read().unwrap().is_none());
    }

    #[test]
    fn test_flush_after_complete() {
        let mut pipe = Pipe::new(Config::default()).unwrap();
        let writer = pipe.writer();
        writer.complete();
        assert!(matches!(
            writer.flush().now_or_never().unwrap(),
            Err(Error::WritingNotAllowed)
        ));
        assert!(matches!(writer.advance(0), Err(Error::WritingNotAllowed)));
        assert!(writer.put_slice(b"").is_ok());
        assert!(matches!(
            writer.put_slice(b"x"),
            Err(Error::WritingNotAllowed)
        ));
    }
}
