//! Guard against overlapping operations on the same side of a pipe.

use crate::Error;

const READING: u8 = 1 << 0;
const READING_TENTATIVE: u8 = 1 << 1;
const WRITING: u8 = 1 << 2;

/// Flags tracking which side of the pipe has an operation in progress.
///
/// At most one of `reading` and `reading-tentative` is set. `writing` is
/// independent of both.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct OperationState(u8);

impl OperationState {
    /// Marks a read that returned (or suspended for) data.
    pub(crate) fn begin_read(&mut self) -> Result<(), Error> {
        if self.0 & READING != 0 {
            return Err(Error::AlreadyReading);
        }
        self.0 = (self.0 & !READING_TENTATIVE) | READING;
        Ok(())
    }

    /// Marks a read that found nothing (or was canceled) and may be retried.
    pub(crate) fn begin_read_tentative(&mut self) -> Result<(), Error> {
        if self.0 & READING != 0 {
            return Err(Error::AlreadyReading);
        }
        self.0 |= READING_TENTATIVE;
        Ok(())
    }

    /// Ends the current read.
    pub(crate) fn end_read(&mut self) -> Result<(), Error> {
        if !self.is_reading_active() {
            return Err(Error::NoReadToComplete);
        }
        self.clear_read();
        Ok(())
    }

    /// Ends any outstanding read.
    pub(crate) fn clear_read(&mut self) {
        self.0 &= !(READING | READING_TENTATIVE);
    }

    pub(crate) fn begin_write(&mut self) {
        self.0 |= WRITING;
    }

    pub(crate) fn end_write(&mut self) {
        self.0 &= !WRITING;
    }

    /// Returns `true` if a read (tentative or not) is outstanding.
    pub(crate) fn is_reading_active(&self) -> bool {
        self.0 & (READING | READING_TENTATIVE) != 0
    }

    /// Returns `true` if the writer holds a reserved window.
    pub(crate) fn is_writing_active(&self) -> bool {
        self.0 & WRITING != 0
    }
}
