//! `elt`: run a command on a local pseudo-terminal.
//!
//! The child's output is mirrored to stdout and stdin is forwarded to it.
//! `elt` exits with the child's exit code.

mod mirror;

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use elt_pty::{
    resolve_architecture, LifecycleObserver, ObserverFault, PtyError, SessionConfig, SessionId,
    SessionState, StateChange, TerminalSession,
};
use elt_vt::VtTerminal;
use tracing_subscriber::EnvFilter;

use mirror::MirrorTerminal;

/// How long to wait for the reaper to report an exit code after the
/// session closes.
const EXIT_CODE_TIMEOUT: Duration = Duration::from_secs(2);

const INPUT_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Parser)]
#[command(name = "elt", version, about = "Run a command on a local pseudo-terminal")]
struct Args {
    /// Configuration file (default: ~/.elt/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Character encoding of the command's input and output
    #[arg(long)]
    encoding: Option<String>,

    /// Print the emulated screen to stderr after the command exits
    #[arg(long)]
    dump_screen: bool,

    /// Command and arguments; the configured or default shell when omitted
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

type Session = TerminalSession<MirrorTerminal<std::io::Stdout>>;

struct LogObserver;

impl LifecycleObserver for LogObserver {
    fn state_changed(&self, change: &StateChange) -> Result<(), ObserverFault> {
        match &change.cause {
            Some(cause) => log::error!("session {} {}: {cause}", change.session, change.state),
            None => log::info!("session {} {}", change.session, change.state),
        }
        Ok(())
    }

    fn title_changed(&self, session: SessionId, title: &str) -> Result<(), ObserverFault> {
        log::debug!("session {session} title: {title}");
        Ok(())
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("ELT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let mut config = SessionConfig::load_or_default(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(cwd) = &args.cwd {
        config.working_directory = Some(cwd.clone());
    }
    if let Some(encoding) = &args.encoding {
        config.encoding = encoding.clone();
    }
    if let Some((program, rest)) = args.command.split_first() {
        config.shell = Some(program.clone());
        config.args = rest.to_vec();
    }
    Ok(config)
}

/// Forward stdin to the session until stdin closes or the session does.
fn spawn_stdin_forwarder(session: Arc<Session>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin-forward".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 4096];
            loop {
                let n = match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                loop {
                    if !session.is_connected() {
                        return;
                    }
                    match session.send_input(&buf[..n]) {
                        Ok(()) => break,
                        // The child is not reading yet; hold stdin back.
                        Err(PtyError::InputFull) => std::thread::sleep(INPUT_RETRY),
                        Err(e) => {
                            log::warn!("failed to forward input: {e}");
                            return;
                        }
                    }
                }
            }
        })?;
    Ok(())
}

async fn wait_for_exit_code(session: &Session) -> Option<u32> {
    let deadline = tokio::time::Instant::now() + EXIT_CODE_TIMEOUT;
    loop {
        if let Some(code) = session.exit_code() {
            return Some(code);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    let config = load_config(&args)?;

    let arch = resolve_architecture();
    if arch.is_corrected() {
        log::info!(
            "host architecture {}/{} (build reports {})",
            arch.os,
            arch.resolved_arch,
            arch.reported_arch
        );
    } else {
        log::info!("host architecture {}/{}", arch.os, arch.resolved_arch);
    }

    let stdout = std::io::stdout();
    let answer_queries = !stdout.is_terminal();
    let vt = VtTerminal::with_scrollback(config.cols, config.rows, config.scrollback_lines);
    let session = Arc::new(Session::from_config(
        &config,
        MirrorTerminal::new(vt, stdout, answer_queries),
    )?);
    session.subscribe(Arc::new(LogObserver));

    let mut state = session.state_watch();
    session.connect()?;
    spawn_stdin_forwarder(Arc::clone(&session)).context("failed to start input thread")?;

    state
        .wait_for(|state| *state == SessionState::Closed)
        .await
        .context("session state channel closed")?;

    if args.dump_screen {
        let text = session.with_emulator(MirrorTerminal::screen_text);
        eprintln!("{text}");
    }

    let code = wait_for_exit_code(&session).await.unwrap_or_else(|| {
        log::warn!("exit code of session {} not available", session.id());
        1
    });
    std::process::exit(code as i32);
}
