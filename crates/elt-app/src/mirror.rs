//! Emulator that also copies the child's output to a writer.
//!
//! The headless binary has no renderer: the host terminal shows the raw
//! output, and the wrapped `VtTerminal` keeps the screen state for
//! `--dump-screen` and title tracking.

use std::io::Write;

use elt_pty::TerminalEmulator;
use elt_vt::VtTerminal;
use encoding_rs::Encoding;

pub struct MirrorTerminal<W> {
    vt: VtTerminal,
    out: W,
    /// When the output goes to a real terminal, that terminal answers
    /// queries itself, and its replies reach the child through stdin.
    answer_queries: bool,
}

impl<W: Write + Send + 'static> MirrorTerminal<W> {
    pub fn new(vt: VtTerminal, out: W, answer_queries: bool) -> Self {
        Self {
            vt,
            out,
            answer_queries,
        }
    }

    /// The emulated screen as text, trailing blank rows removed.
    pub fn screen_text(&self) -> String {
        self.vt.screen().text()
    }
}

impl<W: Write + Send + 'static> TerminalEmulator for MirrorTerminal<W> {
    fn set_encoding(&mut self, encoding: &'static Encoding) {
        self.vt.set_encoding(encoding);
    }

    fn process_output(&mut self, bytes: &[u8]) {
        if let Err(e) = self.out.write_all(bytes).and_then(|()| self.out.flush()) {
            log::warn!("failed to mirror output: {e}");
        }
        self.vt.write(bytes);
    }

    fn take_input(&mut self) -> Vec<u8> {
        let replies = self.vt.take_replies();
        if self.answer_queries {
            replies
        } else {
            Vec::new()
        }
    }

    fn title(&self) -> Option<String> {
        self.vt.title()
    }

    fn resize(&mut self, rows: u16, cols: u16) {
        self.vt.resize(cols, rows);
    }
}
