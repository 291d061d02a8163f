use encoding_rs::Encoding;
use elt_vt::VtTerminal;

/// The emulator a session feeds with PTY output.
///
/// Calls arrive on the session's I/O thread and on caller threads, always
/// serialized by the session lock.
pub trait TerminalEmulator: Send + 'static {
    /// Character encoding of the child's output. Set once before the first
    /// bytes are delivered.
    fn set_encoding(&mut self, encoding: &'static Encoding);

    /// Consume a chunk of raw output from the child.
    fn process_output(&mut self, bytes: &[u8]);

    /// Bytes the emulator wants written back to the child (device status
    /// reports, identification replies). Drained on every call.
    fn take_input(&mut self) -> Vec<u8> {
        Vec::new()
    }

    /// Window title most recently set by the child, if any.
    fn title(&self) -> Option<String> {
        None
    }

    fn resize(&mut self, rows: u16, cols: u16);
}

impl TerminalEmulator for VtTerminal {
    fn set_encoding(&mut self, encoding: &'static Encoding) {
        VtTerminal::set_encoding(self, encoding);
    }

    fn process_output(&mut self, bytes: &[u8]) {
        self.write(bytes);
    }

    fn take_input(&mut self) -> Vec<u8> {
        self.take_replies()
    }

    fn title(&self) -> Option<String> {
        VtTerminal::title(self)
    }

    fn resize(&mut self, rows: u16, cols: u16) {
        VtTerminal::resize(self, cols, rows);
    }
}
