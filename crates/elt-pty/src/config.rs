//! Session configuration.
//!
//! Settings are read from `~/.elt/config.toml` unless a path is given:
//!
//! ```toml
//! shell = "/bin/bash"
//! args = ["--login"]
//! encoding = "UTF-8"
//! working_directory = "/home/me/src"
//! rows = 24
//! cols = 80
//! scrollback_lines = 10000
//!
//! [env]
//! LANG = "en_US.UTF-8"
//!
//! [helpers]
//! bundle_dir = "/opt/elt/helpers"
//!
//! [[helpers.overrides]]
//! os = "linux"
//! arch = "ppc"
//! path = "/opt/elt/ppc/pty-helper"
//! ```
//!
//! Every key is optional.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arch::OsFamily;
use crate::helper::{HelperTable, PtyHelper};
use crate::launcher::LaunchRequest;
use crate::pty::PtyDimensions;
use crate::session::{lookup_encoding, UnsupportedEncodingError, DEFAULT_ENCODING};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Encoding(#[from] UnsupportedEncodingError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Program to run; the user's default shell when unset.
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub encoding: String,
    pub working_directory: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
    pub scrollback_lines: usize,
    pub helpers: HelperConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let size = PtyDimensions::default();
        Self {
            shell: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            encoding: DEFAULT_ENCODING.to_string(),
            working_directory: None,
            rows: size.rows,
            cols: size.cols,
            scrollback_lines: elt_vt::terminal::DEFAULT_SCROLLBACK,
            helpers: HelperConfig::default(),
        }
    }
}

/// Where to find native PTY helpers beyond the builtin ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    pub bundle_dir: Option<PathBuf>,
    pub overrides: Vec<HelperOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperOverride {
    pub os: String,
    pub arch: String,
    pub path: PathBuf,
}

impl SessionConfig {
    /// Parse and validate a configuration document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        lookup_encoding(&config.encoding)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `path`, or from the default location when `None`. A
    /// missing default file yields the defaults; an explicit path must exist.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// `~/.elt/config.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".elt").join("config.toml"))
    }

    /// Builtin helpers, then the bundle directory, then explicit overrides.
    pub fn helper_table(&self) -> HelperTable {
        let mut table = HelperTable::builtin();
        if let Some(dir) = &self.helpers.bundle_dir {
            table = table.with_bundle_dir(dir);
        }
        for entry in &self.helpers.overrides {
            table.insert(
                OsFamily::from_tag(&entry.os),
                &entry.arch,
                PtyHelper::Executable(entry.path.clone()),
            );
        }
        table
    }

    pub fn launch_request(&self) -> LaunchRequest {
        LaunchRequest {
            command: self.shell.clone(),
            args: self.args.clone(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            working_directory: self.working_directory.clone(),
            size: PtyDimensions::new(self.rows.max(1), self.cols.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchitectureInfo;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.encoding, "UTF-8");
        assert_eq!((config.rows, config.cols), (24, 80));
    }

    #[test]
    fn test_full_document() {
        let config = SessionConfig::from_toml_str(
            r#"
            shell = "/bin/bash"
            args = ["--login"]
            encoding = "latin1"
            working_directory = "/srv"
            rows = 50
            cols = 132

            [env]
            LANG = "C"

            [helpers]
            bundle_dir = "/opt/elt/helpers"

            [[helpers.overrides]]
            os = "linux"
            arch = "ppc"
            path = "/opt/ppc/pty-helper"
            "#,
        )
        .unwrap();

        let request = config.launch_request();
        assert_eq!(request.command.as_deref(), Some("/bin/bash"));
        assert_eq!(request.args, vec!["--login".to_string()]);
        assert_eq!(request.env, vec![("LANG".to_string(), "C".to_string())]);
        assert_eq!(request.working_directory, Some(PathBuf::from("/srv")));
        assert_eq!(request.size, PtyDimensions::new(50, 132));
        assert_eq!(config.helpers.overrides.len(), 1);
    }

    #[test]
    fn test_overrides_reach_helper_table() {
        let config = SessionConfig::from_toml_str(
            r#"
            [[helpers.overrides]]
            os = "linux"
            arch = "ppc"
            path = "/opt/ppc/pty-helper"
            "#,
        )
        .unwrap();

        let info = ArchitectureInfo {
            os: OsFamily::Linux,
            reported_arch: "ppc".to_string(),
            resolved_arch: "ppc".to_string(),
        };
        assert_eq!(
            config.helper_table().resolve(&info).unwrap(),
            &PtyHelper::Executable(PathBuf::from("/opt/ppc/pty-helper"))
        );
    }

    #[test]
    fn test_bad_encoding_is_rejected() {
        let err = SessionConfig::from_toml_str("encoding = \"klingon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Encoding(_)));
    }

    #[test]
    fn test_malformed_document_is_rejected() {
        let err = SessionConfig::from_toml_str("rows = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "shell = \"/bin/zsh\"").unwrap();

        let config = SessionConfig::load_or_default(Some(file.path())).unwrap();
        assert_eq!(config.shell.as_deref(), Some("/bin/zsh"));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let err = SessionConfig::load_or_default(Some(Path::new("/nonexistent/elt.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_default_path_is_under_home() {
        let path = SessionConfig::default_path();
        match dirs::home_dir() {
            Some(home) => assert_eq!(path, Some(home.join(".elt").join("config.toml"))),
            None => assert_eq!(path, None),
        }
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let config = SessionConfig {
            rows: 0,
            cols: 0,
            ..SessionConfig::default()
        };
        assert_eq!(config.launch_request().size, PtyDimensions::new(1, 1));
    }
}
