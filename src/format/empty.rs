//! Empty format module.
//!
//! Matches a zero-byte stream and reports end-of-archive immediately. Its
//! probe accepts only an empty peek window, so it must be registered last.

use crate::format::{BodyWindow, FormatCode, FormatNext, FormatReader};
use crate::status::ArchiveError;
use crate::stream::ChainSource;

pub struct EmptyReader {
    window: BodyWindow,
}

impl EmptyReader {
    pub fn new() -> Self {
        Self {
            window: BodyWindow::with_capacity(1),
        }
    }
}

impl Default for EmptyReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatReader for EmptyReader {
    fn code(&self) -> FormatCode {
        FormatCode::EMPTY
    }

    fn next_entry(&mut self, _src: &mut ChainSource) -> Result<FormatNext, ArchiveError> {
        Ok(FormatNext::End)
    }

    fn fill(&mut self, _src: &mut ChainSource) -> Result<usize, ArchiveError> {
        Ok(0)
    }

    fn window(&self) -> &BodyWindow {
        &self.window
    }

    fn window_mut(&mut self) -> &mut BodyWindow {
        &mut self.window
    }

    fn skip_rest(&mut self, _src: &mut ChainSource) -> Result<(), ArchiveError> {
        Ok(())
    }
}
