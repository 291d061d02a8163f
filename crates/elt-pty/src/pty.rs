use std::io::{Read, Write};

use portable_pty::{Child, MasterPty, PtySize};
use serde::{Deserialize, Serialize};

/// Errors from I/O on a live PTY.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY resize failed: {0}")]
    Resize(String),

    #[error("input queue is full")]
    InputFull,

    #[error("PTY input is closed")]
    InputClosed,
}

/// Size of a PTY in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyDimensions {
    pub rows: u16,
    pub cols: u16,
}

impl PtyDimensions {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for PtyDimensions {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<PtyDimensions> for PtySize {
    fn from(size: PtyDimensions) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// The master side of a PTY: the reader, the writer and resize control.
///
/// The reader and writer are taken out and moved to the session's I/O and
/// writer threads, so blocking I/O never happens behind the session lock.
/// Dropping the handle closes the master.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
}

impl PtyHandle {
    pub(crate) fn new(
        master: Box<dyn MasterPty + Send>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            master,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// Resize the PTY. The child receives a window-size-change signal.
    pub fn resize(&self, size: PtyDimensions) -> Result<(), PtyError> {
        self.master
            .resize(size.into())
            .map_err(|e| PtyError::Resize(format!("{e}")))
    }

    /// Take the reader. Reads block until the child writes or the PTY
    /// closes. `None` if it was already taken.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    /// Take the writer (input -> child). Writes block while the child is
    /// not reading. `None` if it was already taken.
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take()
    }
}

/// The child process running on a PTY.
pub struct ProcessHandle {
    child: Box<dyn Child + Send + Sync>,
}

impl ProcessHandle {
    pub(crate) fn new(child: Box<dyn Child + Send + Sync>) -> Self {
        Self { child }
    }

    /// OS process id, if the platform exposes one.
    pub fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Exit code if the process has exited, `None` while it runs.
    pub fn try_wait(&mut self) -> Option<u32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Block until the process exits and reap it.
    pub fn wait(&mut self) -> std::io::Result<u32> {
        self.child.wait().map(|status| status.exit_code())
    }

    /// Ask the process to terminate (SIGHUP, then SIGKILL on unix).
    pub fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }
}
