//! Reading half of a pipe.

use super::{Interrupt, ReadOutcome, Shared, Side};
use crate::{cancel::CancelToken, Error, Fault};
use bytes::Buf;
use std::{
    fmt,
    future::Future,
    ops::{Bound, RangeBounds},
    pin::Pin,
    slice,
    sync::Arc,
    task::{Context, Poll},
};

/// A location in the byte stream.
///
/// Positions are only meaningful for the pipe (and reset generation) that
/// produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Position {
    pub(crate) generation: u64,
    pub(crate) offset: u64,
}

impl Position {
    /// Returns the number of bytes written to the pipe before this position
    /// (since the last reset).
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// A run of committed bytes inside one segment.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Chunk {
    ptr: *const u8,
    offset: u64,
    len: usize,
}

// SAFETY: a chunk is only dereferenced through a [ReadBuf], which borrows the
// [Reader] and so keeps the underlying segment alive and unmodified.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    pub(crate) fn new(ptr: *mut u8, offset: u64, len: usize) -> Self {
        Self {
            ptr: ptr.cast_const(),
            offset,
            len,
        }
    }

    fn end(&self) -> u64 {
        self.offset + self.len as u64
    }

    /// Returns the part of the chunk within `[start, end)`, if any.
    fn clip(&self, start: u64, end: u64) -> Option<&[u8]> {
        let lo = start.max(self.offset);
        let hi = end.min(self.end());
        if lo >= hi {
            return None;
        }
        // SAFETY: `[lo, hi)` lies within the chunk, whose bytes were committed
        // by the writer and are not modified until the reader advances.
        unsafe {
            Some(slice::from_raw_parts(
                self.ptr.add((lo - self.offset) as usize),
                (hi - lo) as usize,
            ))
        }
    }
}

/// A borrowed view of committed bytes, possibly spanning several segments.
#[derive(Clone, Copy)]
pub struct ReadBuf<'a> {
    chunks: &'a [Chunk],
    generation: u64,
    start: u64,
    end: u64,
}

impl fmt::Debug for ReadBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBuf")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("chunks", &self.chunks().count())
            .finish()
    }
}

impl<'a> ReadBuf<'a> {
    /// Returns the number of bytes in the view.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Returns `true` if the view holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns the position of the first byte.
    pub fn start(&self) -> Position {
        Position {
            generation: self.generation,
            offset: self.start,
        }
    }

    /// Returns the position one past the last byte.
    pub fn end(&self) -> Position {
        Position {
            generation: self.generation,
            offset: self.end,
        }
    }

    /// Returns the position `index` bytes into the view.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn position(&self, index: usize) -> Position {
        assert!(
            index <= self.len(),
            "index {index} out of range for buffer of length {}",
            self.len()
        );
        Position {
            generation: self.generation,
            offset: self.start + index as u64,
        }
    }

    /// Returns the sub-view covering `range`.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Self {
        let lo = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => 0,
        };
        let hi = match range.end_bound() {
            Bound::Included(&n) => n + 1,
            Bound::Excluded(&n) => n,
            Bound::Unbounded => self.len(),
        };
        assert!(
            lo <= hi && hi <= self.len(),
            "range {lo}..{hi} out of bounds for buffer of length {}",
            self.len()
        );
        Self {
            chunks: self.chunks,
            generation: self.generation,
            start: self.start + lo as u64,
            end: self.start + hi as u64,
        }
    }

    /// Iterate over the view as contiguous slices, in stream order.
    pub fn chunks(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let chunks: &'a [Chunk] = self.chunks;
        let (start, end) = (self.start, self.end);
        chunks.iter().filter_map(move |chunk| chunk.clip(start, end))
    }

    /// Returns the first contiguous slice (empty if the view is empty).
    pub fn first(&self) -> &'a [u8] {
        self.chunks().next().unwrap_or(&[])
    }

    /// Copy the view into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl Buf for ReadBuf<'_> {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        self.first()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.len(),
            "cannot advance past the end of the buffer"
        );
        self.start += cnt as u64;
        while let Some((first, rest)) = self.chunks.split_first() {
            if first.end() > self.start {
                break;
            }
            self.chunks = rest;
        }
    }
}

/// The outcome of a read.
#[derive(Debug)]
pub struct ReadResult<'a> {
    buffer: ReadBuf<'a>,
    canceled: bool,
    completed: bool,
}

impl<'a> ReadResult<'a> {
    fn new(chunks: &'a [Chunk], outcome: ReadOutcome) -> Self {
        Self {
            buffer: ReadBuf {
                chunks,
                generation: outcome.generation,
                start: outcome.start,
                end: outcome.end,
            },
            canceled: outcome.canceled,
            completed: outcome.completed,
        }
    }

    /// Returns every committed byte not yet consumed.
    pub fn buffer(&self) -> ReadBuf<'a> {
        self.buffer
    }

    /// Returns `true` if the read was interrupted by [Reader::cancel_pending_read].
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Returns `true` if the writer has completed (no more bytes will follow).
    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

/// The reading half of a pipe.
///
/// Every read must be followed by [Reader::advance_to] (or [Reader::advance])
/// before the next read starts.
pub struct Reader {
    shared: Arc<Shared>,
    chunks: Vec<Chunk>,
    operations: u64,
}

impl Reader {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            chunks: Vec::new(),
            operations: 0,
        }
    }

    pub(super) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(super) fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Wait for committed bytes (or completion of the writer).
    pub fn read(&mut self) -> Read<'_> {
        self.read_with(&CancelToken::never())
    }

    /// Wait for committed bytes, failing with [Error::Canceled] if `token` fires first.
    pub fn read_with(&mut self, token: &CancelToken) -> Read<'_> {
        self.operations += 1;
        let owner = self.operations;
        Read {
            reader: Some(self),
            token: token.clone(),
            owner,
            started: false,
        }
    }

    /// Read without waiting.
    ///
    /// Returns `None` if there is nothing new since the last read.
    pub fn try_read(&mut self) -> Result<Option<ReadResult<'_>>, Error> {
        let outcome = self.shared.try_read(&mut self.chunks)?;
        Ok(outcome.map(|outcome| ReadResult::new(&self.chunks, outcome)))
    }

    /// Release everything before `consumed` and mark everything before
    /// `examined` as looked at.
    ///
    /// If `examined` is the end of the last result, the next read waits for
    /// the writer to commit more.
    pub fn advance_to(&mut self, consumed: Position, examined: Position) -> Result<(), Error> {
        self.shared.advance_reader(consumed, examined)?;
        self.chunks.clear();
        Ok(())
    }

    /// Release (and mark as examined) everything before `consumed`.
    pub fn advance(&mut self, consumed: Position) -> Result<(), Error> {
        self.advance_to(consumed, consumed)
    }

    /// Resolve the pending (or next) read with [ReadResult::is_canceled] set.
    pub fn cancel_pending_read(&self) {
        self.shared.cancel_pending_read();
    }

    /// Returns a handle that cancels pending reads from elsewhere.
    pub fn interrupt(&self) -> Interrupt {
        Interrupt::new(&self.shared, Side::Reader)
    }

    /// Run `callback` (on the reader's scheduler) once the writer completes.
    pub fn on_writer_completed(&self, callback: impl FnOnce(Option<Fault>) + Send + 'static) {
        self.shared.on_writer_completed(Box::new(callback));
    }

    /// Signal that no more bytes will be read.
    pub fn complete(&mut self) {
        self.shared.complete_reader(None);
    }

    /// Signal that no more bytes will be read because of `error`.
    ///
    /// The writer receives `error` from its next flush.
    pub fn complete_with_error(&mut self, error: impl std::error::Error + Send + Sync + 'static) {
        self.shared.complete_reader(Some(Arc::new(error)));
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.shared.complete_reader(None);
    }
}

/// Future returned by [Reader::read].
pub struct Read<'a> {
    reader: Option<&'a mut Reader>,
    token: CancelToken,
    owner: u64,
    started: bool,
}

impl<'a> Future for Read<'a> {
    type Output = Result<ReadResult<'a>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let reader = this.reader.take().expect("`Read` polled after completion");
        let polled = reader.shared.poll_read(
            cx.waker(),
            &this.token,
            this.owner,
            &mut this.started,
            &mut reader.chunks,
        );
        match polled {
            Poll::Pending => {
                this.reader = Some(reader);
                Poll::Pending
            }
            Poll::Ready(result) => {
                let reader: &'a Reader = reader;
                Poll::Ready(result.map(|outcome| ReadResult::new(&reader.chunks, outcome)))
            }
        }
    }
}

impl Drop for Read<'_> {
    fn drop(&mut self) {
        if !self.started {
            return;
        }
        if let Some(reader) = &self.reader {
            reader.shared.abandon_read(self.owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(data: &[&'static [u8]], start: u64, end: u64) -> Vec<Chunk> {
        let mut offset = 0;
        data.iter()
            .map(|bytes| {
                let chunk = Chunk::new(bytes.as_ptr().cast_mut(), offset, bytes.len());
                offset += bytes.len() as u64;
                chunk
            })
            .filter(|chunk| chunk.end() > start && chunk.offset < end)
            .collect()
    }

    fn buf(chunks: &[Chunk], start: u64, end: u64) -> ReadBuf<'_> {
        ReadBuf {
            chunks,
            generation: 0,
            start,
            end,
        }
    }

    #[test]
    fn test_chunks_clip_to_window() {
        let chunks = view(&[b"abcd", b"efgh", b"ij"], 2, 9);
        let buffer = buf(&chunks, 2, 9);
        let pieces: Vec<&[u8]> = buffer.chunks().collect();
        assert_eq!(pieces, vec![&b"cd"[..], &b"efgh"[..], &b"i"[..]]);
        assert_eq!(buffer.len(), 7);
        assert_eq!(buffer.first(), b"cd");
        assert_eq!(buffer.to_vec(), b"cdefghi");
    }

    #[test]
    fn test_slice_and_positions() {
        let chunks = view(&[b"abcd", b"efgh"], 0, 8);
        let buffer = buf(&chunks, 0, 8);
        let sliced = buffer.slice(3..6);
        assert_eq!(sliced.to_vec(), b"def");
        assert_eq!(sliced.start().offset(), 3);
        assert_eq!(sliced.end().offset(), 6);
        assert_eq!(sliced.position(2).offset(), 5);
        assert_eq!(buffer.slice(..=1).to_vec(), b"ab");
        assert!(buffer.slice(8..).is_empty());
        assert_eq!(buffer.slice(8..).first(), b"");
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_position_out_of_range() {
        let chunks = view(&[b"abcd"], 0, 4);
        buf(&chunks, 0, 4).position(5);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_slice_out_of_bounds() {
        let chunks = view(&[b"abcd"], 0, 4);
        buf(&chunks, 0, 4).slice(2..5);
    }

    #[test]
    fn test_buf_cursor() {
        let chunks = view(&[b"\x00\x01", b"\x02\x03\x04", b"\x05"], 0, 6);
        let mut buffer = buf(&chunks, 0, 6);
        assert_eq!(buffer.remaining(), 6);
        assert_eq!(buffer.get_u8(), 0);
        // Spans the boundary between the first two chunks
        assert_eq!(buffer.get_u16(), 0x0102);
        assert_eq!(buffer.chunk(), b"\x03\x04");
        assert_eq!(buffer.chunks.len(), 2);
        assert_eq!(buffer.get_u16(), 0x0304);
        assert_eq!(buffer.chunk(), b"\x05");
        buffer.advance(1);
        assert!(!buffer.has_remaining());
        assert_eq!(buffer.chunk(), b"");

        // The cursor is a copy: the original view is unaffected
        let original = buf(&chunks, 0, 6);
        assert_eq!(original.len(), 6);
    }
}
