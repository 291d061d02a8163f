use std::sync::Arc;

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::term::{Config, Term, TermMode};
use alacritty_terminal::vte::ansi;
use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};
use parking_lot::Mutex;

use crate::screen::{CursorState, ScreenView};

/// Default number of scrollback lines kept above the visible screen.
pub const DEFAULT_SCROLLBACK: usize = 10_000;

/// What the terminal reported back through its event listener.
#[derive(Default)]
struct Captured {
    title: Option<String>,
    replies: Vec<String>,
}

/// `Term` takes its listener by value, so the capture buffer is shared with
/// the owning `VtTerminal`.
#[derive(Clone, Default)]
pub(crate) struct EventCapture(Arc<Mutex<Captured>>);

impl EventListener for EventCapture {
    fn send_event(&self, event: Event) {
        let mut captured = self.0.lock();
        match event {
            Event::Title(title) => captured.title = Some(title),
            Event::ResetTitle => captured.title = None,
            Event::PtyWrite(reply) => captured.replies.push(reply),
            _ => {}
        }
    }
}

/// Grid dimensions without scrollback, as `Term::new` and `Term::resize` expect.
struct GridSize {
    cols: usize,
    rows: usize,
}

impl GridSize {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: usize::from(cols.max(1)),
            rows: usize::from(rows.max(1)),
        }
    }
}

impl Dimensions for GridSize {
    fn total_lines(&self) -> usize {
        self.rows
    }

    fn screen_lines(&self) -> usize {
        self.rows
    }

    fn columns(&self) -> usize {
        self.cols
    }
}

/// The terminal emulator.
///
/// Wraps `alacritty_terminal::Term` and a VTE parser. Output from the child
/// process arrives in the session's character encoding and is decoded to
/// UTF-8 before it reaches the parser; replies the terminal sends back are
/// encoded the same way.
pub struct VtTerminal {
    term: Term<EventCapture>,
    parser: ansi::Processor,
    events: EventCapture,
    encoding: &'static Encoding,
    decoder: Decoder,
}

impl VtTerminal {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_scrollback(cols, rows, DEFAULT_SCROLLBACK)
    }

    /// A terminal keeping `scrollback` lines of history above the screen.
    pub fn with_scrollback(cols: u16, rows: u16, scrollback: usize) -> Self {
        let config = Config {
            scrolling_history: scrollback,
            ..Config::default()
        };
        let events = EventCapture::default();

        Self {
            term: Term::new(config, &GridSize::new(cols, rows), events.clone()),
            parser: ansi::Processor::new(),
            events,
            encoding: UTF_8,
            decoder: UTF_8.new_decoder_without_bom_handling(),
        }
    }

    /// Switch the character encoding used for output and replies.
    ///
    /// Any partially decoded multi-byte sequence is discarded.
    pub fn set_encoding(&mut self, encoding: &'static Encoding) {
        self.encoding = encoding;
        self.decoder = encoding.new_decoder_without_bom_handling();
    }

    /// Feed raw output from the child.
    ///
    /// Multi-byte sequences split across calls are carried over by the
    /// streaming decoder.
    pub fn write(&mut self, bytes: &[u8]) {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len());
        let mut decoded = String::with_capacity(capacity);
        let mut input = bytes;
        loop {
            let (result, read, _) = self.decoder.decode_to_string(input, &mut decoded, false);
            input = &input[read..];
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => decoded.reserve(input.len().max(16)),
            }
        }
        self.parser.advance(&mut self.term, decoded.as_bytes());
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.term.resize(GridSize::new(cols, rows));
    }

    pub fn screen(&self) -> ScreenView<'_> {
        ScreenView::new(&self.term)
    }

    pub fn cursor(&self) -> CursorState {
        let point = self.term.grid().cursor.point;
        CursorState {
            row: u16::try_from(point.line.0).unwrap_or(0),
            col: u16::try_from(point.column.0).unwrap_or(u16::MAX),
            visible: self.term.mode().contains(TermMode::SHOW_CURSOR),
        }
    }

    /// Window title set through OSC 0/2, if any.
    pub fn title(&self) -> Option<String> {
        self.events.0.lock().title.clone()
    }

    /// Drain the replies the terminal wants sent back to the child (device
    /// status reports and the like), encoded in the current encoding.
    pub fn take_replies(&mut self) -> Vec<u8> {
        let replies = std::mem::take(&mut self.events.0.lock().replies);
        replies
            .iter()
            .flat_map(|reply| self.encoding.encode(reply).0.into_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_terminal_dimensions() {
        let term = VtTerminal::new(80, 24);
        let screen = term.screen();
        assert_eq!(screen.cols(), 80);
        assert_eq!(screen.rows(), 24);
    }

    #[test]
    fn test_write_hello() {
        let mut term = VtTerminal::new(80, 24);
        term.write(b"hello");

        let screen = term.screen();
        assert_eq!(screen.cell(0, 0), 'h');
        assert_eq!(screen.cell(0, 4), 'o');
        assert_eq!(screen.cell(0, 5), ' ');
        assert_eq!(screen.row_text(0), "hello");
    }

    #[test]
    fn test_screen_text_multiline() {
        let mut term = VtTerminal::new(20, 5);
        term.write(b"first\r\nsecond\r\n");
        assert_eq!(term.screen().text(), "first\nsecond");
    }

    #[test]
    fn test_out_of_range_cell_is_blank() {
        let term = VtTerminal::new(10, 5);
        assert_eq!(term.screen().cell(50, 50), ' ');
        assert_eq!(term.screen().row_text(99), "");
    }

    #[test]
    fn test_resize_terminal() {
        let mut term = VtTerminal::new(80, 24);
        term.resize(120, 40);
        assert_eq!(term.screen().cols(), 120);
        assert_eq!(term.screen().rows(), 40);
    }

    #[test]
    fn test_cursor_position_multiline() {
        let mut term = VtTerminal::new(10, 5);
        // Fill first line and wrap to second.
        term.write(b"0123456789AB");

        let cursor = term.cursor();
        assert_eq!(cursor.row, 1);
        assert_eq!(cursor.col, 2);
        assert!(cursor.visible);
    }

    #[test]
    fn test_title_change() {
        let mut term = VtTerminal::new(80, 24);
        // OSC 0 sets window title: ESC ] 0 ; title BEL
        term.write(b"\x1b]0;My Terminal\x07");
        assert_eq!(term.title(), Some("My Terminal".to_string()));
    }

    #[test]
    fn test_device_status_reply() {
        let mut term = VtTerminal::new(80, 24);
        // ESC[6n requests a cursor position report.
        term.write(b"\x1b[6n");

        let reply = term.take_replies();
        assert!(reply.starts_with(b"\x1b["), "unexpected reply {reply:?}");
        assert!(term.take_replies().is_empty());
    }

    #[test]
    fn test_latin1_output_is_decoded() {
        let mut term = VtTerminal::new(80, 24);
        term.set_encoding(encoding_rs::WINDOWS_1252);
        term.write(b"caf\xe9");
        assert_eq!(term.screen().row_text(0), "café");
    }

    #[test]
    fn test_utf8_sequence_split_across_writes() {
        let mut term = VtTerminal::new(80, 24);
        let bytes = "é".as_bytes();
        term.write(&bytes[..1]);
        term.write(&bytes[1..]);
        assert_eq!(term.screen().cell(0, 0), 'é');
    }
}
