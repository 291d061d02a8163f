//! Per-session I/O threads.
//!
//! PTY reads and writes both block, so each connected session gets one OS
//! thread reading output and one writing input. The reader and writer are
//! owned by those threads, not by the session, so blocked I/O never holds
//! the session lock.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::session::SessionId;

/// Input chunks queued for a session's writer before senders are refused.
pub const INPUT_QUEUE_DEPTH: usize = 256;

/// Receives what the I/O thread reads.
pub trait OutputSink: Send + Sync + 'static {
    /// Deliver a chunk of output. Returning `false` stops the thread.
    fn on_output(&self, bytes: &[u8]) -> bool;

    /// The PTY reached end-of-file or failed. Not called when `on_output`
    /// asked the thread to stop.
    fn on_closed(&self);
}

/// Start the read loop for a session on a dedicated OS thread.
pub fn start_io_thread(
    session_id: SessionId,
    sink: Arc<dyn OutputSink>,
    reader: Box<dyn Read + Send>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("pty-io-{session_id}"))
        .spawn(move || io_loop(session_id, sink, reader))
}

fn io_loop(session_id: SessionId, sink: Arc<dyn OutputSink>, mut reader: Box<dyn Read + Send>) {
    let mut buf = [0u8; 65536];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO is how Linux reports a master whose slave side is gone.
            Err(e) => {
                log::debug!("session {session_id}: PTY read ended: {e}");
                break;
            }
        };

        if !sink.on_output(&buf[..n]) {
            log::trace!("session {session_id}: output no longer wanted");
            return;
        }
    }

    sink.on_closed();
}

/// Start the write loop for a session on a dedicated OS thread.
///
/// The thread exits when every sender is dropped or a write fails, which
/// happens once the child is gone.
pub fn start_writer_thread(
    session_id: SessionId,
    writer: Box<dyn Write + Send>,
) -> io::Result<mpsc::Sender<Vec<u8>>> {
    let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
    std::thread::Builder::new()
        .name(format!("pty-write-{session_id}"))
        .spawn(move || write_loop(session_id, rx, writer))?;
    Ok(tx)
}

fn write_loop(
    session_id: SessionId,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut writer: Box<dyn Write + Send>,
) {
    while let Some(bytes) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
            log::debug!("session {session_id}: PTY write ended: {e}");
            return;
        }
    }
    log::trace!("session {session_id}: input closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Cursor;

    #[derive(Default)]
    struct Collector {
        output: Mutex<Vec<u8>>,
        chunks: Mutex<usize>,
        closed: Mutex<bool>,
        stop_after: Option<usize>,
    }

    impl OutputSink for Collector {
        fn on_output(&self, bytes: &[u8]) -> bool {
            self.output.lock().extend_from_slice(bytes);
            let mut chunks = self.chunks.lock();
            *chunks += 1;
            self.stop_after.map_or(true, |limit| *chunks < limit)
        }

        fn on_closed(&self) {
            *self.closed.lock() = true;
        }
    }

    /// Yields one fixed chunk per read, forever.
    struct Endless;

    impl Read for Endless {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let chunk = b"tick";
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(5))
        }
    }

    #[test]
    fn test_delivers_until_eof() {
        let sink = Arc::new(Collector::default());
        let reader = Box::new(Cursor::new(b"hello world".to_vec()));
        start_io_thread(1, sink.clone(), reader)
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(*sink.output.lock(), b"hello world");
        assert!(*sink.closed.lock());
    }

    #[test]
    fn test_read_error_closes() {
        let sink = Arc::new(Collector::default());
        start_io_thread(2, sink.clone(), Box::new(Broken))
            .unwrap()
            .join()
            .unwrap();

        assert!(sink.output.lock().is_empty());
        assert!(*sink.closed.lock());
    }

    #[test]
    fn test_sink_can_stop_the_thread() {
        let sink = Arc::new(Collector {
            stop_after: Some(3),
            ..Collector::default()
        });
        start_io_thread(3, sink.clone(), Box::new(Endless))
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(*sink.chunks.lock(), 3);
        assert!(!*sink.closed.lock());
    }

    #[test]
    fn test_thread_is_named_after_session() {
        struct NameCheck(Mutex<Option<String>>);

        impl OutputSink for NameCheck {
            fn on_output(&self, _bytes: &[u8]) -> bool {
                true
            }

            fn on_closed(&self) {
                *self.0.lock() = std::thread::current().name().map(str::to_string);
            }
        }

        let sink = Arc::new(NameCheck(Mutex::new(None)));
        start_io_thread(42, sink.clone(), Box::new(Cursor::new(Vec::new())))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(sink.0.lock().as_deref(), Some("pty-io-42"));
    }

    /// Records what reaches it and tells the test when it was dropped.
    struct Capture {
        written: Arc<Mutex<Vec<u8>>>,
        dropped: std::sync::mpsc::Sender<()>,
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for Capture {
        fn drop(&mut self) {
            let _ = self.dropped.send(());
        }
    }

    /// Never accepts a byte until the test releases it.
    struct Stuck(std::sync::mpsc::Receiver<()>);

    impl Write for Stuck {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Err(io::Error::from_raw_os_error(5))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_delivers_in_order_and_exits_when_senders_drop() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let (dropped_tx, dropped_rx) = std::sync::mpsc::channel();
        let input = start_writer_thread(
            5,
            Box::new(Capture {
                written: Arc::clone(&written),
                dropped: dropped_tx,
            }),
        )
        .unwrap();

        input.try_send(b"ls ".to_vec()).unwrap();
        input.try_send(b"-l\n".to_vec()).unwrap();
        drop(input);

        dropped_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(*written.lock(), b"ls -l\n");
    }

    #[test]
    fn test_blocked_writer_does_not_block_senders() {
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let input = start_writer_thread(6, Box::new(Stuck(release_rx))).unwrap();

        // One chunk is held by the blocked write, the rest fill the queue.
        let mut refused = false;
        for _ in 0..INPUT_QUEUE_DEPTH + 2 {
            if input.try_send(b"x".to_vec()).is_err() {
                refused = true;
                break;
            }
        }
        assert!(refused);

        release_tx.send(()).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !input.is_closed() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(input.is_closed());
    }
}
