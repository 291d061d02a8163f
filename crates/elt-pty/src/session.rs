//! Local terminal sessions.
//!
//! A [`TerminalSession`] owns one PTY-backed process and the emulator its
//! output is streamed into. It moves through
//! `Disconnected -> Connecting -> Connected -> Closed` and never leaves
//! `Closed`. Every transition is mirrored into a `watch` cell for lock-free
//! reads and published on the session's [`LifecycleBus`] once the session
//! lock is released.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use encoding_rs::Encoding;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::config::{ConfigError, SessionConfig};
use crate::emulator::TerminalEmulator;
use crate::io_thread::{start_io_thread, start_writer_thread, OutputSink};
use crate::launcher::{LaunchError, LaunchRequest, Launcher};
use crate::lifecycle::{LifecycleBus, LifecycleObserver, StateChange, Subscription};
use crate::pty::{ProcessHandle, PtyDimensions, PtyError, PtyHandle};

/// Unique identifier for a terminal session.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Encoding used when none is configured.
pub const DEFAULT_ENCODING: &str = "UTF-8";

/// How long a child that closed its PTY gets to exit before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported encoding: {0}")]
pub struct UnsupportedEncodingError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Encoding(#[from] UnsupportedEncodingError),

    #[error(transparent)]
    Launch(Arc<LaunchError>),
}

/// Look up an encoding by its WHATWG label.
pub fn lookup_encoding(label: &str) -> Result<&'static Encoding, UnsupportedEncodingError> {
    Encoding::for_label(label.as_bytes()).ok_or_else(|| UnsupportedEncodingError(label.to_string()))
}

/// An encoding a byte-oriented terminal can use in both directions.
///
/// UTF-16 and the replacement encoding decode fine but cannot encode input,
/// so they are rejected at connect time.
fn terminal_encoding(label: &str) -> Result<&'static Encoding, UnsupportedEncodingError> {
    let encoding = lookup_encoding(label)?;
    if encoding.output_encoding() != encoding {
        return Err(UnsupportedEncodingError(label.to_string()));
    }
    Ok(encoding)
}

/// Everything guarded by the session lock.
struct Inner {
    disposed: bool,
    encoding: String,
    request: LaunchRequest,
    process: Option<ProcessHandle>,
    pty: Option<PtyHandle>,
    /// Queue feeding the writer thread while connected.
    input: Option<mpsc::Sender<Vec<u8>>>,
    last_title: Option<String>,
}

enum Notice {
    State(StateChange),
    Title(String),
}

/// Lifecycle events waiting to be delivered, in the order they happened.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<Notice>,
    queued: u64,
    delivered: u64,
    /// Thread currently draining the queue.
    deliverer: Option<ThreadId>,
}

struct Shared<E> {
    id: SessionId,
    /// Serializes connect, disconnect, resize, input and output delivery.
    inner: Mutex<Inner>,
    emulator: Mutex<E>,
    bus: Arc<LifecycleBus>,
    outbox: Mutex<Outbox>,
    /// Signalled whenever the outbox makes progress.
    delivery: Condvar,
    state_tx: watch::Sender<SessionState>,
    launcher: Launcher,
    exit_code: Arc<Mutex<Option<u32>>>,
    reader_active: AtomicBool,
}

impl<E: TerminalEmulator> Shared<E> {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Record a transition and queue it for observers. The caller holds the
    /// session lock, which `_inner` stands for, and calls
    /// [`dispatch`](Self::dispatch) after releasing it.
    fn transition(&self, _inner: &Inner, state: SessionState, cause: Option<Arc<LaunchError>>) {
        self.state_tx.send_replace(state);
        match &cause {
            Some(cause) => log::info!("session {}: {state} ({cause})", self.id),
            None => log::info!("session {}: {state}", self.id),
        }
        self.queue(Notice::State(StateChange {
            session: self.id,
            state,
            cause,
        }));
    }

    fn queue(&self, notice: Notice) {
        let mut outbox = self.outbox.lock();
        outbox.queue.push_back(notice);
        outbox.queued += 1;
    }

    /// Deliver queued events. Must not be called with the session lock held.
    ///
    /// One thread delivers at a time and returns once everything queued
    /// before the call has been delivered. A call made while another thread
    /// is delivering waits for it. A call from inside an observer returns
    /// at once; its events follow when the current callback round ends.
    fn dispatch(&self) {
        let me = thread::current().id();
        let mut outbox = self.outbox.lock();
        let target = outbox.queued;
        loop {
            if outbox.delivered >= target {
                return;
            }
            match outbox.deliverer {
                Some(id) if id == me => return,
                Some(_) => self.delivery.wait(&mut outbox),
                None => break,
            }
        }

        outbox.deliverer = Some(me);
        while let Some(notice) = outbox.queue.pop_front() {
            MutexGuard::unlocked(&mut outbox, || self.publish(notice));
            outbox.delivered += 1;
            self.delivery.notify_all();
        }
        outbox.deliverer = None;
        self.delivery.notify_all();
    }

    fn publish(&self, notice: Notice) {
        match notice {
            Notice::State(change) => {
                self.bus.publish_state(&change);
                if change.state == SessionState::Closed {
                    self.bus.close();
                }
            }
            Notice::Title(title) => self.bus.publish_title(self.id, &title),
        }
    }

    fn connect(self: &Arc<Self>, inner: &mut Inner) -> Result<(), ConnectError> {
        let state = self.state();
        if inner.disposed || state != SessionState::Disconnected {
            log::debug!("session {}: connect ignored while {state}", self.id);
            return Ok(());
        }

        let encoding = terminal_encoding(&inner.encoding)?;
        self.transition(inner, SessionState::Connecting, None);

        let (process, mut pty) = match self.launcher.launch(&inner.request) {
            Ok(handles) => handles,
            Err(e) => {
                let cause = Arc::new(e);
                self.transition(inner, SessionState::Closed, Some(Arc::clone(&cause)));
                return Err(ConnectError::Launch(cause));
            }
        };

        {
            let size = inner.request.size;
            let mut emulator = self.emulator.lock();
            emulator.set_encoding(encoding);
            emulator.resize(size.rows, size.cols);
        }

        let started = self.start_streams(&mut pty);
        let input = match started {
            Ok(input) => input,
            Err(e) => {
                self.reader_active.store(false, Ordering::SeqCst);
                drop(pty);
                spawn_reaper(self.id, process, Duration::ZERO, Arc::clone(&self.exit_code));
                let cause = Arc::new(LaunchError::Io(e));
                self.transition(inner, SessionState::Closed, Some(Arc::clone(&cause)));
                return Err(ConnectError::Launch(cause));
            }
        };

        inner.process = Some(process);
        inner.pty = Some(pty);
        inner.input = Some(input);
        self.transition(inner, SessionState::Connected, None);
        Ok(())
    }

    /// Hand the PTY's writer and reader to their threads.
    fn start_streams(
        self: &Arc<Self>,
        pty: &mut PtyHandle,
    ) -> std::io::Result<mpsc::Sender<Vec<u8>>> {
        let writer = pty
            .take_writer()
            .ok_or_else(|| std::io::Error::other("PTY writer already taken"))?;
        let reader = pty
            .take_reader()
            .ok_or_else(|| std::io::Error::other("PTY reader already taken"))?;
        let input = start_writer_thread(self.id, writer)?;

        self.reader_active.store(true, Ordering::SeqCst);
        let sink: Arc<dyn OutputSink> = Arc::clone(self) as Arc<dyn OutputSink>;
        start_io_thread(self.id, sink, reader)?;
        Ok(input)
    }

    /// Release the PTY and process and move to `Closed`.
    ///
    /// `grace` is how long the child may take to exit on its own before it
    /// is killed. No-op unless connecting or connected.
    fn close(&self, inner: &mut Inner, grace: Duration) {
        match self.state() {
            SessionState::Connecting | SessionState::Connected => {}
            SessionState::Disconnected | SessionState::Closed => return,
        }

        // The writer thread may be stuck on a child that stopped reading; it
        // ends once the reaper kills the child.
        inner.input = None;
        drop(inner.pty.take());
        if let Some(process) = inner.process.take() {
            spawn_reaper(self.id, process, grace, Arc::clone(&self.exit_code));
        }
        self.transition(inner, SessionState::Closed, None);
    }
}

impl<E: TerminalEmulator> OutputSink for Shared<E> {
    fn on_output(&self, bytes: &[u8]) -> bool {
        {
            let mut inner = self.inner.lock();
            if self.state() != SessionState::Connected {
                self.reader_active.store(false, Ordering::SeqCst);
                return false;
            }

            let (replies, title) = {
                let mut emulator = self.emulator.lock();
                emulator.process_output(bytes);
                (emulator.take_input(), emulator.title())
            };

            if !replies.is_empty() {
                if let Some(input) = inner.input.as_ref() {
                    if let Err(e) = input.try_send(replies) {
                        log::debug!("session {}: terminal reply dropped: {e}", self.id);
                    }
                }
            }

            if title != inner.last_title {
                inner.last_title.clone_from(&title);
                if let Some(title) = title {
                    self.queue(Notice::Title(title));
                }
            }
        }
        self.dispatch();
        true
    }

    fn on_closed(&self) {
        {
            let mut inner = self.inner.lock();
            self.reader_active.store(false, Ordering::SeqCst);
            if self.state() == SessionState::Connected {
                log::debug!("session {}: process closed its terminal", self.id);
                self.close(&mut inner, EXIT_GRACE);
            }
        }
        self.dispatch();
    }
}

/// Wait for `process` on a background thread so `disconnect` never blocks,
/// killing it if it is still running after `grace`.
fn spawn_reaper(
    id: SessionId,
    process: ProcessHandle,
    grace: Duration,
    exit_code: Arc<Mutex<Option<u32>>>,
) {
    // The process moves into the closure; keep a slot to recover it if the
    // thread cannot be started.
    let slot = Arc::new(Mutex::new(Some(process)));
    let thread_slot = Arc::clone(&slot);
    let thread_exit_code = Arc::clone(&exit_code);
    let spawned = thread::Builder::new()
        .name(format!("pty-reap-{id}"))
        .spawn(move || {
            if let Some(process) = thread_slot.lock().take() {
                reap(id, process, grace, &thread_exit_code);
            }
        });

    if let Err(e) = spawned {
        log::warn!("session {id}: cannot start reaper thread ({e}), reaping inline");
        if let Some(process) = slot.lock().take() {
            reap(id, process, Duration::ZERO, &exit_code);
        }
    }
}

fn reap(id: SessionId, mut process: ProcessHandle, grace: Duration, exit_code: &Mutex<Option<u32>>) {
    let deadline = Instant::now() + grace;
    let code = loop {
        if let Some(code) = process.try_wait() {
            break Ok(code);
        }
        if Instant::now() >= deadline {
            if let Err(e) = process.kill() {
                log::debug!("session {id}: kill failed: {e}");
            }
            break process.wait();
        }
        thread::sleep(Duration::from_millis(10));
    };

    match code {
        Ok(code) => {
            log::debug!("session {id}: process exited with {code}");
            *exit_code.lock() = Some(code);
        }
        Err(e) => log::warn!("session {id}: failed to reap process: {e}"),
    }
}

/// A single local terminal session.
///
/// Configure it while `Disconnected`, then [`connect`](Self::connect).
/// Dropping the session disposes it, which closes the PTY and reaps the
/// process.
pub struct TerminalSession<E: TerminalEmulator> {
    shared: Arc<Shared<E>>,
}

impl<E: TerminalEmulator> TerminalSession<E> {
    /// A session running the default shell through the host's builtin PTY
    /// support.
    pub fn new(emulator: E) -> Self {
        Self::with_launcher(emulator, Launcher::for_host())
    }

    pub fn with_launcher(emulator: E, launcher: Launcher) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                inner: Mutex::new(Inner {
                    disposed: false,
                    encoding: DEFAULT_ENCODING.to_string(),
                    request: LaunchRequest::default(),
                    process: None,
                    pty: None,
                    input: None,
                    last_title: None,
                }),
                emulator: Mutex::new(emulator),
                bus: Arc::new(LifecycleBus::new()),
                outbox: Mutex::new(Outbox::default()),
                delivery: Condvar::new(),
                state_tx,
                launcher,
                exit_code: Arc::new(Mutex::new(None)),
                reader_active: AtomicBool::new(false),
            }),
        }
    }

    /// A session set up from a configuration file's settings.
    pub fn from_config(config: &SessionConfig, emulator: E) -> Result<Self, ConfigError> {
        let launcher = Launcher::new(
            config.helper_table(),
            crate::arch::resolve_architecture().clone(),
        );
        let session = Self::with_launcher(emulator, launcher);
        session.set_encoding(&config.encoding)?;
        {
            let mut inner = session.shared.inner.lock();
            inner.request = config.launch_request();
        }
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Current state. Does not take the session lock, so observers may call
    /// it from their callbacks.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// A receiver that tracks the state, for async callers.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether the I/O thread is still reading from the PTY.
    pub fn is_reader_active(&self) -> bool {
        self.shared.reader_active.load(Ordering::SeqCst)
    }

    /// Exit code of the process once it has been reaped.
    pub fn exit_code(&self) -> Option<u32> {
        *self.shared.exit_code.lock()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.shared
            .inner
            .lock()
            .process
            .as_ref()
            .and_then(ProcessHandle::process_id)
    }

    /// Register an observer for this session's lifecycle events.
    ///
    /// Once the session has closed and its last event has been delivered,
    /// the returned handle is inert and the observer is never called.
    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) -> Subscription {
        self.shared.bus.subscribe(observer)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.shared.bus.unsubscribe(subscription);
    }

    /// Run `f` with the emulator, e.g. to read the screen.
    pub fn with_emulator<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        let emulator = self.shared.emulator.lock();
        f(&emulator)
    }

    pub fn encoding(&self) -> String {
        self.shared.inner.lock().encoding.clone()
    }

    pub fn working_directory(&self) -> Option<PathBuf> {
        self.shared.inner.lock().request.working_directory.clone()
    }

    pub fn size(&self) -> PtyDimensions {
        self.shared.inner.lock().request.size
    }

    /// Set the character encoding of the child's output and input.
    ///
    /// Unknown labels are rejected in any state. Outside `Disconnected` a
    /// known label is ignored.
    pub fn set_encoding(&self, label: &str) -> Result<(), UnsupportedEncodingError> {
        lookup_encoding(label)?;
        self.configure("encoding", |inner| inner.encoding = label.to_string());
        Ok(())
    }

    pub fn set_working_directory(&self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref().to_path_buf();
        self.configure("working directory", |inner| {
            inner.request.working_directory = Some(dir)
        });
    }

    /// Program to run instead of the default shell.
    pub fn set_command(&self, program: impl Into<String>, args: Vec<String>) {
        let program = program.into();
        self.configure("command", |inner| {
            inner.request.command = Some(program);
            inner.request.args = args;
        });
    }

    /// Set one environment variable for the child, replacing an earlier value.
    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.configure("environment", |inner| {
            let env = &mut inner.request.env;
            match env.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => env.push((key, value)),
            }
        });
    }

    /// Initial PTY size. Zero dimensions are ignored.
    pub fn set_size(&self, rows: u16, cols: u16) {
        if rows == 0 || cols == 0 {
            log::debug!("session {}: ignoring empty size {rows}x{cols}", self.shared.id);
            return;
        }
        self.configure("size", |inner| {
            inner.request.size = PtyDimensions::new(rows, cols)
        });
    }

    fn configure(&self, what: &str, apply: impl FnOnce(&mut Inner)) {
        let mut inner = self.shared.inner.lock();
        let state = self.state();
        if state != SessionState::Disconnected {
            log::warn!(
                "session {}: cannot change {what} while {state}",
                self.shared.id
            );
            return;
        }
        apply(&mut inner);
    }

    /// Launch the process and start streaming its output.
    ///
    /// Only acts from `Disconnected`; otherwise, or after `dispose`, it
    /// returns `Ok` without doing anything. A launch failure closes the
    /// session and is reported both here and to observers.
    pub fn connect(&self) -> Result<(), ConnectError> {
        let result = {
            let mut inner = self.shared.inner.lock();
            self.shared.connect(&mut inner)
        };
        self.shared.dispatch();
        result
    }

    /// Close the PTY and kill the process without waiting for it.
    pub fn disconnect(&self) {
        {
            let mut inner = self.shared.inner.lock();
            self.shared.close(&mut inner, Duration::ZERO);
        }
        self.shared.dispatch();
    }

    /// Disconnect if needed and refuse any later `connect`.
    pub fn dispose(&self) {
        {
            let mut inner = self.shared.inner.lock();
            self.shared.close(&mut inner, Duration::ZERO);
            inner.disposed = true;
        }
        self.shared.dispatch();
    }

    /// Resize the PTY and the emulator. Only acts while connected.
    pub fn resize(&self, rows: u16, cols: u16) {
        let mut inner = self.shared.inner.lock();
        if self.state() != SessionState::Connected || rows == 0 || cols == 0 {
            return;
        }
        let size = PtyDimensions::new(rows, cols);
        if let Some(pty) = inner.pty.as_ref() {
            if let Err(e) = pty.resize(size) {
                log::warn!("session {}: {e}", self.shared.id);
            }
        }
        self.shared.emulator.lock().resize(rows, cols);
        inner.request.size = size;
    }

    /// Queue raw input for the process. Dropped unless connected.
    ///
    /// Never waits on the child: if it has stopped reading and the queue is
    /// full, the input is refused with [`PtyError::InputFull`].
    pub fn send_input(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let input = {
            let inner = self.shared.inner.lock();
            if self.state() != SessionState::Connected {
                return Ok(());
            }
            inner.input.clone()
        };
        let Some(input) = input else {
            return Ok(());
        };
        input.try_send(bytes.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => PtyError::InputFull,
            TrySendError::Closed(_) => PtyError::InputClosed,
        })
    }

    /// Write text to the process in the session's encoding.
    pub fn send_text(&self, text: &str) -> Result<(), PtyError> {
        let label = self.encoding();
        let bytes = match lookup_encoding(&label) {
            Ok(encoding) => encoding.encode(text).0.into_owned(),
            Err(_) => text.as_bytes().to_vec(),
        };
        self.send_input(&bytes)
    }
}

impl<E: TerminalEmulator> Drop for TerminalSession<E> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<E: TerminalEmulator> fmt::Debug for TerminalSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
