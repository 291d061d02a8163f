//! Native PTY helper selection.
//!
//! Each (OS, architecture) pair the launcher can serve has an entry. Most are
//! served by `portable-pty`'s native PTY system directly; others need a
//! bundled helper executable that is started under the PTY and runs the
//! target command itself. A pair with no entry cannot be launched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::arch::{ArchitectureInfo, OsFamily};
use crate::launcher::LaunchError;

/// File name of a bundled helper inside `<bundle>/<os>/<arch>/`.
#[cfg(windows)]
pub const HELPER_FILE_NAME: &str = "pty-helper.exe";
#[cfg(not(windows))]
pub const HELPER_FILE_NAME: &str = "pty-helper";

/// How a process is put on a PTY for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyHelper {
    /// `portable-pty` drives the PTY natively (openpty / ConPTY).
    Builtin,
    /// A helper binary wraps the target command.
    Executable(PathBuf),
}

/// Mapping from (OS, architecture) to the helper that serves it.
#[derive(Debug, Clone, Default)]
pub struct HelperTable {
    entries: HashMap<(OsFamily, String), PtyHelper>,
}

fn builtin_platforms() -> [(OsFamily, &'static [&'static str]); 3] {
    [
        (
            OsFamily::Linux,
            &["x86", "x86_64", "aarch64", "arm", "ppc64", "riscv64", "s390x"],
        ),
        (OsFamily::MacOs, &["x86_64", "aarch64"]),
        (OsFamily::Windows, &["x86", "x86_64", "aarch64"]),
    ]
}

impl HelperTable {
    /// A table with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The platforms `portable-pty` serves without a helper binary.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (os, arches) in builtin_platforms() {
            for arch in arches {
                table.insert(os.clone(), arch, PtyHelper::Builtin);
            }
        }
        table
    }

    /// Add or replace the entry for one platform.
    pub fn insert(&mut self, os: OsFamily, arch: &str, helper: PtyHelper) {
        self.entries.insert((os, arch.to_string()), helper);
    }

    /// Register every helper found under `dir/<os>/<arch>/`.
    ///
    /// Bundled helpers take precedence over builtin entries for the same
    /// platform. Unreadable directories are skipped.
    pub fn with_bundle_dir(mut self, dir: &Path) -> Self {
        let Ok(os_dirs) = std::fs::read_dir(dir) else {
            log::warn!("PTY helper bundle {} is not readable", dir.display());
            return self;
        };
        for os_dir in os_dirs.flatten() {
            let Ok(arch_dirs) = std::fs::read_dir(os_dir.path()) else {
                continue;
            };
            let os = OsFamily::from_tag(&os_dir.file_name().to_string_lossy());
            for arch_dir in arch_dirs.flatten() {
                let helper = arch_dir.path().join(HELPER_FILE_NAME);
                if helper.is_file() {
                    let arch = arch_dir.file_name().to_string_lossy().to_string();
                    log::debug!("found PTY helper for {os}/{arch}: {}", helper.display());
                    self.insert(os.clone(), &arch, PtyHelper::Executable(helper));
                }
            }
        }
        self
    }

    /// Look up the helper for a resolved architecture.
    pub fn resolve(&self, info: &ArchitectureInfo) -> Result<&PtyHelper, LaunchError> {
        self.entries
            .get(&(info.os.clone(), info.resolved_arch.clone()))
            .ok_or_else(|| LaunchError::MissingHelper {
                os: info.os.tag().to_string(),
                arch: info.resolved_arch.clone(),
            })
    }
}
