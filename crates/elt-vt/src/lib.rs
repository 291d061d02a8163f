//! elt-vt: Terminal emulation engine for the ELT local terminal.
//!
//! Provides a small Rust API over `alacritty_terminal`. This crate decodes
//! child process output from the session's character encoding, maintains the
//! terminal grid state, and exposes the screen as text for headless callers.

pub mod screen;
pub mod terminal;

pub use screen::{CursorState, ScreenView};
pub use terminal::VtTerminal;
