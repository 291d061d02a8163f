//! Spawning processes on a pseudo-terminal.

use std::path::PathBuf;

use portable_pty::{native_pty_system, CommandBuilder};

use crate::arch::{resolve_architecture, ArchitectureInfo};
use crate::helper::{HelperTable, PtyHelper};
use crate::pty::{ProcessHandle, PtyDimensions, PtyHandle};

/// Why a process could not be started on a PTY.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no PTY helper for {os}/{arch}")]
    MissingHelper { os: String, arch: String },

    #[error("PTY helper {} does not exist", .0.display())]
    HelperNotFound(PathBuf),

    #[error("working directory {} does not exist or is not a directory", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    #[error("failed to open PTY: {0}")]
    OpenPty(String),

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("failed to start PTY I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// What to run and how.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Program to run; the user's default shell when `None`.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Overrides applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Defaults to the current directory of this process.
    pub working_directory: Option<PathBuf>,
    pub size: PtyDimensions,
}

impl LaunchRequest {
    pub fn new(command: Option<&str>) -> Self {
        Self {
            command: command.map(str::to_string),
            ..Self::default()
        }
    }
}

/// Starts processes on PTYs using the helper that matches the host.
#[derive(Debug, Clone)]
pub struct Launcher {
    helpers: HelperTable,
    architecture: ArchitectureInfo,
}

impl Launcher {
    pub fn new(helpers: HelperTable, architecture: ArchitectureInfo) -> Self {
        Self {
            helpers,
            architecture,
        }
    }

    /// Builtin helpers for the probed host architecture.
    pub fn for_host() -> Self {
        Self::new(HelperTable::builtin(), resolve_architecture().clone())
    }

    /// Spawn `request` on a fresh PTY.
    ///
    /// Ownership of both handles passes to the caller. The launcher's copy
    /// of the slave side is closed before returning, so the master reader
    /// sees EOF once the child and its descendants have exited.
    pub fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Result<(ProcessHandle, PtyHandle), LaunchError> {
        let helper = self.helpers.resolve(&self.architecture)?;

        let cwd = match &request.working_directory {
            Some(dir) if !dir.is_dir() => {
                return Err(LaunchError::InvalidWorkingDirectory(dir.clone()));
            }
            Some(dir) => Some(dir.clone()),
            // portable-pty falls back to $HOME; keep ours instead.
            None => std::env::current_dir().ok(),
        };

        let program = request.command.clone().unwrap_or_else(default_shell);
        let mut cmd = match helper {
            PtyHelper::Builtin => CommandBuilder::new(&program),
            PtyHelper::Executable(path) => {
                if !path.is_file() {
                    return Err(LaunchError::HelperNotFound(path.clone()));
                }
                let mut cmd = CommandBuilder::new(path);
                cmd.arg(&program);
                cmd
            }
        };
        cmd.args(&request.args);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &cwd {
            cmd.cwd(dir);
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(request.size.into())
            .map_err(|e| LaunchError::OpenPty(format!("{e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| LaunchError::Spawn {
                program: program.clone(),
                reason: format!("{e}"),
            })?;
        drop(pair.slave);
        let mut process = ProcessHandle::new(child);

        let streams = pair
            .master
            .try_clone_reader()
            .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
        let (reader, writer) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(LaunchError::OpenPty(format!("failed to open PTY streams: {e}")));
            }
        };

        log::debug!(
            "launched {program} (pid {:?}) on {}x{} PTY",
            process.process_id(),
            request.size.cols,
            request.size.rows
        );

        Ok((process, PtyHandle::new(pair.master, reader, writer)))
    }
}

/// Returns the user's default shell.
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }

    #[cfg(not(windows))]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}
