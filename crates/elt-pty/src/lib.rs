//! elt-pty: local PTY sessions for the ELT terminal.
//!
//! This crate launches a process on a pseudo-terminal, streams its output
//! into a terminal emulator, forwards input and emulator replies back, and
//! reports the session's lifecycle to observers.
//!
//! # Architecture
//!
//! - [`arch`]: host CPU architecture detection, correcting what the build
//!   reports.
//! - [`Launcher`]: spawns a process on a PTY using the [`HelperTable`] entry
//!   for the host.
//! - [`TerminalSession`]: the connection state machine pairing a launched
//!   process with a [`TerminalEmulator`].
//! - [`LifecycleBus`]: publish/subscribe for state and title changes.

pub mod arch;
pub mod config;
pub mod emulator;
pub mod helper;
pub mod io_thread;
pub mod launcher;
pub mod lifecycle;
pub mod pty;
pub mod session;

pub use arch::{resolve_architecture, ArchitectureInfo, OsFamily};
pub use config::{ConfigError, SessionConfig};
pub use emulator::TerminalEmulator;
pub use helper::{HelperTable, PtyHelper};
pub use launcher::{LaunchError, LaunchRequest, Launcher};
pub use lifecycle::{
    LifecycleBus, LifecycleObserver, ObserverFault, StateChange, Subscription,
};
pub use pty::{ProcessHandle, PtyDimensions, PtyError, PtyHandle};
pub use session::{
    ConnectError, SessionId, SessionState, TerminalSession, UnsupportedEncodingError,
};
