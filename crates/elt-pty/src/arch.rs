//! Host architecture detection.
//!
//! A binary reports the architecture it was compiled for, which is not always
//! the one the machine runs: a 32-bit x86 build on a 64-bit host reports
//! `x86`, and a `ppc` build may sit on a ppc64 kernel. In those two cases the
//! prober asks the OS, and the answer is cached for the process lifetime.
//! Probing never fails: any problem falls back to the reported value.

use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

pub const ARCH_X86: &str = "x86";
pub const ARCH_X86_64: &str = "x86_64";
pub const ARCH_PPC: &str = "ppc";
pub const ARCH_PPC64: &str = "ppc64";
pub const ARCH_AARCH64: &str = "aarch64";

/// Operating system family, as used to pick a PTY helper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    Other(String),
}

impl OsFamily {
    /// Parse an OS tag. Accepts Rust's `std::env::consts::OS` values and a
    /// few common aliases.
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "linux" => OsFamily::Linux,
            "macos" | "macosx" | "darwin" => OsFamily::MacOs,
            "windows" | "win32" => OsFamily::Windows,
            other => OsFamily::Other(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::MacOs => "macos",
            OsFamily::Windows => "windows",
            OsFamily::Other(tag) => tag,
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Map an architecture name onto the tag set used throughout the crate.
pub fn normalize_arch(raw: &str) -> String {
    match raw.to_ascii_lowercase().as_str() {
        "x86" | "i386" | "i486" | "i586" | "i686" => ARCH_X86.to_string(),
        "x86_64" | "amd64" | "x64" => ARCH_X86_64.to_string(),
        "powerpc" | "ppc" => ARCH_PPC.to_string(),
        "powerpc64" | "ppc64" => ARCH_PPC64.to_string(),
        "aarch64" | "arm64" => ARCH_AARCH64.to_string(),
        other => other.to_string(),
    }
}

/// What the running binary says about its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: OsFamily,
    pub arch: String,
}

impl Platform {
    pub fn new(os: OsFamily, arch: &str) -> Self {
        Self {
            os,
            arch: normalize_arch(arch),
        }
    }

    /// The platform this binary was built for.
    pub fn current() -> Self {
        Self::new(
            OsFamily::from_tag(std::env::consts::OS),
            std::env::consts::ARCH,
        )
    }
}

/// Result of architecture resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchitectureInfo {
    pub os: OsFamily,
    pub reported_arch: String,
    pub resolved_arch: String,
}

impl ArchitectureInfo {
    /// `true` when probing changed the reported value.
    pub fn is_corrected(&self) -> bool {
        self.reported_arch != self.resolved_arch
    }
}

/// Why an external probe produced nothing usable. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProbeFailure {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read output of `{program}`: {source}")]
    Read {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{program}` produced no output")]
    NoOutput { program: String },

    #[error("`{program}` reported an unusable value {value:?}")]
    Unusable { program: String, value: String },
}

/// Runs a probe command and returns the first line of its output.
pub trait ProbeRunner {
    fn first_line(&self, program: &str, args: &[&str]) -> Result<String, ProbeFailure>;
}

/// Probe runner that spawns real processes.
///
/// The child's stdout is read to EOF and closed, and the child is waited on
/// before returning so no zombie is left behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandProbe;

impl ProbeRunner for CommandProbe {
    fn first_line(&self, program: &str, args: &[&str]) -> Result<String, ProbeFailure> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ProbeFailure::Spawn {
                program: program.to_string(),
                source,
            })?;

        let mut line = String::new();
        let read = match child.stdout.take() {
            Some(stdout) => {
                let mut reader = BufReader::new(stdout);
                let read = reader.read_line(&mut line);
                // Drain the rest so the child can never block on a full pipe.
                let _ = io::copy(&mut reader, &mut io::sink());
                read
            }
            None => Ok(0),
        };

        child.wait().map_err(|source| ProbeFailure::Wait {
            program: program.to_string(),
            source,
        })?;
        read.map_err(|source| ProbeFailure::Read {
            program: program.to_string(),
            source,
        })?;

        let line = line.trim();
        if line.is_empty() {
            return Err(ProbeFailure::NoOutput {
                program: program.to_string(),
            });
        }
        Ok(line.to_string())
    }
}

/// Resolve the true architecture for `platform`, asking `probe` when the
/// reported value may be wrong.
pub fn resolve_with(platform: &Platform, probe: &dyn ProbeRunner) -> ArchitectureInfo {
    let reported = platform.arch.clone();

    let resolved = match reported.as_str() {
        ARCH_PPC => match probe_ppc(probe) {
            Ok(arch) => arch,
            Err(e) => {
                log::warn!("PowerPC probe failed, keeping {reported}: {e}");
                reported.clone()
            }
        },
        ARCH_X86 => match probe_x86_64(&platform.os, probe) {
            Ok(true) => ARCH_X86_64.to_string(),
            Ok(false) => reported.clone(),
            Err(e) => {
                log::warn!("x86 probe failed, keeping {reported}: {e}");
                reported.clone()
            }
        },
        _ => reported.clone(),
    };

    if resolved != reported {
        log::info!("host architecture corrected from {reported} to {resolved}");
    }

    ArchitectureInfo {
        os: platform.os.clone(),
        reported_arch: reported,
        resolved_arch: resolved,
    }
}

/// `uname -p` names the processor directly; "unknown" is what some Linux
/// distributions print when they don't know. Other systems spell it
/// `powerpc`, so the answer is normalized like any reported tag.
fn probe_ppc(probe: &dyn ProbeRunner) -> Result<String, ProbeFailure> {
    let value = probe.first_line("uname", &["-p"])?;
    if value.eq_ignore_ascii_case("unknown") {
        return Err(ProbeFailure::Unusable {
            program: "uname".to_string(),
            value,
        });
    }
    Ok(normalize_arch(&value))
}

/// Whether a machine running an x86 build is really 64-bit.
fn probe_x86_64(os: &OsFamily, probe: &dyn ProbeRunner) -> Result<bool, ProbeFailure> {
    let (program, args): (&str, &[&str]) = match os {
        OsFamily::Windows => ("cmd", &["/d", "/c", "set", "PROCESSOR_ARCHITECTURE"]),
        // Not `uname -p`, which prints "unknown" on some Linux systems.
        _ => ("uname", &["-m"]),
    };
    let line = probe.first_line(program, args)?;
    Ok(line.ends_with("64"))
}

/// Caching prober for a given platform and probe runner.
pub struct ArchitectureProber<P> {
    platform: Platform,
    probe: P,
    resolved: OnceLock<ArchitectureInfo>,
}

impl<P: ProbeRunner> ArchitectureProber<P> {
    pub fn new(platform: Platform, probe: P) -> Self {
        Self {
            platform,
            probe,
            resolved: OnceLock::new(),
        }
    }

    /// Resolve once; later calls return the cached value without probing.
    pub fn resolve(&self) -> &ArchitectureInfo {
        self.resolved
            .get_or_init(|| resolve_with(&self.platform, &self.probe))
    }
}

static HOST_ARCHITECTURE: OnceLock<ArchitectureInfo> = OnceLock::new();

/// The host's architecture, probed at most once per process.
pub fn resolve_architecture() -> &'static ArchitectureInfo {
    HOST_ARCHITECTURE.get_or_init(|| resolve_with(&Platform::current(), &CommandProbe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Probe runner that replays a fixed answer and records invocations.
    struct ScriptedProbe {
        answer: Option<&'static str>,
        calls: RefCell<Vec<String>>,
    }

    impl ScriptedProbe {
        fn answering(answer: &'static str) -> Self {
            Self {
                answer: Some(answer),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn missing() -> Self {
            Self {
                answer: None,
                calls: RefCell::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }
    }

    impl ProbeRunner for ScriptedProbe {
        fn first_line(&self, program: &str, args: &[&str]) -> Result<String, ProbeFailure> {
            self.calls
                .borrow_mut()
                .push(format!("{program} {}", args.join(" ")));
            match self.answer {
                Some("") => Err(ProbeFailure::NoOutput {
                    program: program.to_string(),
                }),
                Some(answer) => Ok(answer.to_string()),
                None => Err(ProbeFailure::Spawn {
                    program: program.to_string(),
                    source: io::Error::from(io::ErrorKind::NotFound),
                }),
            }
        }
    }

    fn linux(arch: &str) -> Platform {
        Platform::new(OsFamily::Linux, arch)
    }

    #[test]
    fn test_x86_on_64_bit_host_is_upgraded() {
        let probe = ScriptedProbe::answering("x86_64");
        let info = resolve_with(&linux("x86"), &probe);
        assert_eq!(info.reported_arch, ARCH_X86);
        assert_eq!(info.resolved_arch, ARCH_X86_64);
        assert!(info.is_corrected());
        assert_eq!(probe.calls.borrow().as_slice(), ["uname -m"]);
    }

    #[test]
    fn test_x86_on_32_bit_host_is_kept() {
        let probe = ScriptedProbe::answering("i686");
        let info = resolve_with(&linux("x86"), &probe);
        assert_eq!(info.resolved_arch, ARCH_X86);
        assert!(!info.is_corrected());
    }

    #[test]
    fn test_missing_probe_keeps_reported() {
        let probe = ScriptedProbe::missing();
        let info = resolve_with(&linux("x86"), &probe);
        assert_eq!(info.resolved_arch, ARCH_X86);

        let info = resolve_with(&linux("ppc"), &probe);
        assert_eq!(info.resolved_arch, ARCH_PPC);
    }

    #[test]
    fn test_empty_probe_output_keeps_reported() {
        let probe = ScriptedProbe::answering("");
        let info = resolve_with(&linux("x86"), &probe);
        assert_eq!(info.resolved_arch, ARCH_X86);
    }

    #[test]
    fn test_windows_uses_processor_architecture() {
        let probe = ScriptedProbe::answering("PROCESSOR_ARCHITECTURE=AMD64");
        let info = resolve_with(&Platform::new(OsFamily::Windows, "x86"), &probe);
        assert_eq!(info.resolved_arch, ARCH_X86_64);
        assert_eq!(
            probe.calls.borrow().as_slice(),
            ["cmd /d /c set PROCESSOR_ARCHITECTURE"]
        );
    }

    #[test]
    fn test_ppc_takes_probe_value() {
        let probe = ScriptedProbe::answering("ppc64");
        let info = resolve_with(&linux("powerpc"), &probe);
        assert_eq!(info.reported_arch, ARCH_PPC);
        assert_eq!(info.resolved_arch, ARCH_PPC64);
        assert_eq!(probe.calls.borrow().as_slice(), ["uname -p"]);
    }

    #[test]
    fn test_ppc_uname_answer_is_normalized() {
        let probe = ScriptedProbe::answering("powerpc");
        let info = resolve_with(&Platform::new(OsFamily::MacOs, "ppc"), &probe);
        assert_eq!(info.resolved_arch, ARCH_PPC);
        assert!(!info.is_corrected());

        let mut helpers = crate::helper::HelperTable::empty();
        helpers.insert(OsFamily::MacOs, ARCH_PPC, crate::helper::PtyHelper::Builtin);
        assert!(helpers.resolve(&info).is_ok());

        let probe = ScriptedProbe::answering("powerpc64");
        assert_eq!(resolve_with(&linux("ppc"), &probe).resolved_arch, ARCH_PPC64);
    }

    #[test]
    fn test_ppc_unknown_is_unusable() {
        let probe = ScriptedProbe::answering("unknown");
        let info = resolve_with(&linux("ppc"), &probe);
        assert_eq!(info.resolved_arch, ARCH_PPC);
    }

    #[test]
    fn test_other_architectures_are_not_probed() {
        let probe = ScriptedProbe::answering("whatever");
        for arch in ["x86_64", "aarch64", "riscv64"] {
            let info = resolve_with(&linux(arch), &probe);
            assert_eq!(info.resolved_arch, arch);
        }
        assert_eq!(probe.call_count(), 0);
    }

    #[test]
    fn test_prober_probes_once() {
        let prober = ArchitectureProber::new(linux("x86"), ScriptedProbe::answering("x86_64"));
        let first = prober.resolve().clone();
        let second = prober.resolve().clone();
        assert_eq!(first, second);
        assert_eq!(prober.probe.call_count(), 1);
    }

    #[test]
    fn test_normalize_arch_aliases() {
        assert_eq!(normalize_arch("i686"), ARCH_X86);
        assert_eq!(normalize_arch("AMD64"), ARCH_X86_64);
        assert_eq!(normalize_arch("powerpc64"), ARCH_PPC64);
        assert_eq!(normalize_arch("arm64"), ARCH_AARCH64);
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[test]
    fn test_os_family_tags() {
        assert_eq!(OsFamily::from_tag("macos"), OsFamily::MacOs);
        assert_eq!(OsFamily::from_tag("Win32"), OsFamily::Windows);
        assert_eq!(OsFamily::from_tag("freebsd").tag(), "freebsd");
    }

    #[test]
    fn test_global_resolution_is_stable() {
        let first = resolve_architecture();
        let second = resolve_architecture();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first.os, Platform::current().os);
    }

    #[test]
    #[cfg(unix)]
    fn test_command_probe_reads_first_line() {
        let line = CommandProbe
            .first_line("sh", &["-c", "echo first; echo second"])
            .unwrap();
        assert_eq!(line, "first");
    }

    #[test]
    #[cfg(unix)]
    fn test_command_probe_without_output() {
        let err = CommandProbe.first_line("sh", &["-c", "true"]).unwrap_err();
        assert!(matches!(err, ProbeFailure::NoOutput { .. }));
    }

    #[test]
    fn test_command_probe_missing_binary() {
        let err = CommandProbe
            .first_line("elt-definitely-not-a-command", &[])
            .unwrap_err();
        assert!(matches!(err, ProbeFailure::Spawn { .. }));
    }
}
