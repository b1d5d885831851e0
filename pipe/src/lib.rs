//! Decouple a byte producer from a byte consumer with bounded memory.
//!
//! A [Pipe] connects exactly one [Writer] to exactly one [Reader] through a chain
//! of pooled memory segments. The writer reserves a window, fills it, and
//! flushes. The reader borrows committed bytes in place (no copies), examines
//! as much as it needs, and advances past what it consumed. When more than
//! `pause_writer_threshold` bytes sit unconsumed, the writer's next flush waits
//! until the reader drops below `resume_writer_threshold`.
//!
//! # Positions
//!
//! A [ReadBuf] is bounded by two [Position]s. Consuming frees memory; examining
//! without consuming tells the pipe that the reader has looked at the bytes and
//! needs more before it can make progress. A read that examined everything
//! waits for the writer; a read that examined less returns immediately.
//!
//! # Completion
//!
//! Either side may complete, optionally with an error. The opposite side
//! observes completion in its next result (or receives the error as
//! [Error::Faulted]). Once both sides complete, every segment returns to the
//! pool and the pipe may be [Pipe::reset] for reuse.
//!
//! # Example
//!
//! ```rust
//! use commonware_pipe::{Config, Pipe};
//! use futures::executor::block_on;
//!
//! block_on(async {
//!     let mut pipe = Pipe::new(Config::default()).unwrap();
//!     let (writer, reader) = pipe.split();
//!
//!     writer.put_slice(b"hello ").unwrap();
//!     writer.put_slice(b"world").unwrap();
//!     let flushed = writer.flush().await.unwrap();
//!     assert_eq!(flushed.flushed(), 11);
//!     writer.complete();
//!
//!     let result = reader.read().await.unwrap();
//!     assert!(result.is_completed());
//!     let buffer = result.buffer();
//!     assert_eq!(buffer.to_vec(), b"hello world");
//!     let end = buffer.end();
//!     reader.advance(end).unwrap();
//!     reader.complete();
//! });
//! ```
//!
//! # Status
//!
//! `commonware-pipe` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use std::{fmt, num::NonZeroUsize, sync::Arc};
use thiserror::Error;

/// Convert a `usize` into a [NonZeroUsize], panicking if it is zero.
macro_rules! NZUsize {
    ($val:expr) => {
        match std::num::NonZeroUsize::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}

mod awaitable;
mod cancel;
mod completion;
mod operation;
mod pipe;
mod pool;
mod scheduler;
mod segment;

pub use cancel::{CancelToken, Canceler};
pub use pipe::{
    reader::{Position, Read, ReadBuf, ReadResult, Reader},
    writer::{Flush, FlushResult, Writer},
    Interrupt, Pipe,
};
pub use pool::{BufferPool, BufferPoolConfig, PoolError};
pub use scheduler::{Captured, ContextFlow, Detached, Inline, Scheduler, Spans, Task, ThreadPool};

/// Error a side completed with, shared with the opposite side.
pub type Fault = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when interacting with a [Pipe].
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("advance of {requested} bytes exceeds writable window of {available}")]
    AdvanceOutOfRange { requested: usize, available: usize },
    #[error("writer and reader belong to different pipes")]
    MismatchedHalves,
    #[error("writing is not allowed after the writer completed")]
    WritingNotAllowed,
    #[error("reading is not allowed after the reader completed")]
    ReadingNotAllowed,
    #[error("read already in progress")]
    AlreadyReading,
    #[error("no read to complete")]
    NoReadToComplete,
    #[error("concurrent operations on one side are not supported")]
    ConcurrentOperation,
    #[error("consumed position is after examined position")]
    ConsumedAfterExamined,
    #[error("examined position is before the last examined position")]
    ExaminedRegressed,
    #[error("position does not belong to the current buffer")]
    InvalidCursor,
    #[error("pipe cannot be reset until both sides complete")]
    ResetIncomplete,
    #[error("operation canceled")]
    Canceled,
    #[error("faulted: {0}")]
    Faulted(Fault),
    #[error("completion callbacks panicked: {0:?}")]
    CallbackPanicked(Vec<String>),
}

/// Broad classification of an [Error].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed a value the pipe cannot accept.
    InvalidArgument,
    /// The call is not allowed in the pipe's current state.
    InvalidOperation,
    /// The operation was canceled by a [CancelToken].
    Canceled,
    /// A side completed with an error or a callback failed.
    Faulted,
}

impl Error {
    /// Returns the [ErrorKind] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::AdvanceOutOfRange { .. } | Self::MismatchedHalves => {
                ErrorKind::InvalidArgument
            }
            Self::WritingNotAllowed
            | Self::ReadingNotAllowed
            | Self::AlreadyReading
            | Self::NoReadToComplete
            | Self::ConcurrentOperation
            | Self::ConsumedAfterExamined
            | Self::ExaminedRegressed
            | Self::InvalidCursor
            | Self::ResetIncomplete => ErrorKind::InvalidOperation,
            Self::Canceled => ErrorKind::Canceled,
            Self::Faulted(_) | Self::CallbackPanicked(_) => ErrorKind::Faulted,
        }
    }
}

/// Configuration for a [Pipe].
#[derive(Clone)]
pub struct Config {
    /// Pool that segment memory is rented from.
    ///
    /// A pool may be shared by any number of pipes.
    pub pool: BufferPool,

    /// Smallest block bound to a new segment.
    pub minimum_segment_size: NonZeroUsize,

    /// Number of reset segments the pipe keeps for reuse.
    pub segment_pool_size: usize,

    /// Unconsumed bytes at which a flush stops completing immediately.
    ///
    /// Zero disables backpressure.
    pub pause_writer_threshold: u64,

    /// Unconsumed bytes below which a paused writer resumes.
    pub resume_writer_threshold: u64,

    /// Where continuations of the reader (and callbacks registered by it) run.
    pub reader_scheduler: Arc<dyn Scheduler>,

    /// Where continuations of the writer (and callbacks registered by it) run.
    pub writer_scheduler: Arc<dyn Scheduler>,

    /// Captures ambient state when a continuation is stored.
    pub context: Arc<dyn ContextFlow>,

    /// Whether `context` is consulted at all.
    pub flow_context: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: BufferPool::default(),
            minimum_segment_size: NZUsize!(4096),
            segment_pool_size: 256,
            pause_writer_threshold: 65_536,
            resume_writer_threshold: 32_768,
            reader_scheduler: Arc::new(Inline),
            writer_scheduler: Arc::new(Inline),
            context: Arc::new(Spans),
            flow_context: false,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("pool", &self.pool)
            .field("minimum_segment_size", &self.minimum_segment_size)
            .field("segment_pool_size", &self.segment_pool_size)
            .field("pause_writer_threshold", &self.pause_writer_threshold)
            .field("resume_writer_threshold", &self.resume_writer_threshold)
            .field("flow_context", &self.flow_context)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Check that the thresholds are consistent.
    pub fn validate(&self) -> Result<(), Error> {
        if self.resume_writer_threshold > self.pause_writer_threshold {
            return Err(Error::InvalidConfig(
                "resume_writer_threshold must not exceed pause_writer_threshold",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_inverted_thresholds() {
        let cfg = Config {
            pause_writer_threshold: 10,
            resume_writer_threshold: 20,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(Pipe::new(cfg).is_err());
    }

    #[test]
    fn test_backpressure_disabled() {
        let cfg = Config {
            pause_writer_threshold: 0,
            resume_writer_threshold: 0,
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(Error::AlreadyReading.kind(), ErrorKind::InvalidOperation);
        assert_eq!(
            Error::AdvanceOutOfRange {
                requested: 2,
                available: 1
            }
            .kind(),
            ErrorKind::InvalidArgument
        );
        let fault: Fault = Arc::new(io::Error::other("boom"));
        let err = Error::Faulted(fault);
        assert_eq!(err.kind(), ErrorKind::Faulted);
        assert_eq!(err.to_string(), "faulted: boom");
    }
}
