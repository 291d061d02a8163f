use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line};
use alacritty_terminal::term::cell::Flags as AlacFlags;
use alacritty_terminal::term::Term;

use crate::terminal::EventCapture;

/// Current position and visibility of the cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorState {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
}

/// Borrowed text view of the visible screen.
pub struct ScreenView<'a> {
    term: &'a Term<EventCapture>,
}

impl<'a> ScreenView<'a> {
    pub(crate) fn new(term: &'a Term<EventCapture>) -> Self {
        Self { term }
    }

    pub fn rows(&self) -> u16 {
        u16::try_from(self.term.screen_lines()).unwrap_or(u16::MAX)
    }

    pub fn cols(&self) -> u16 {
        u16::try_from(self.term.columns()).unwrap_or(u16::MAX)
    }

    /// Character at the given row and column.
    ///
    /// Row 0 is the top of the visible screen. Out-of-range positions read
    /// as a blank.
    pub fn cell(&self, row: u16, col: u16) -> char {
        if (row as usize) >= self.term.screen_lines() || (col as usize) >= self.term.columns() {
            return ' ';
        }
        self.term.grid()[Line(row as i32)][Column(col as usize)].c
    }

    /// Text of a single row with trailing blanks removed.
    ///
    /// Spacer cells that follow a double-width character are skipped.
    pub fn row_text(&self, row: u16) -> String {
        if (row as usize) >= self.term.screen_lines() {
            return String::new();
        }
        let line = &self.term.grid()[Line(row as i32)];
        let mut text: String = (0..self.term.columns())
            .map(|col| &line[Column(col)])
            .filter(|cell| !cell.flags.contains(AlacFlags::WIDE_CHAR_SPACER))
            .map(|cell| cell.c)
            .collect();
        text.truncate(text.trim_end().len());
        text
    }

    /// The whole visible screen, one line per row, trailing empty rows dropped.
    pub fn text(&self) -> String {
        let mut lines: Vec<String> = (0..self.rows()).map(|row| self.row_text(row)).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }
}
