//! Application configuration.
//!
//! Configuration lives in a TOML file found via `PAGES_CONFIG`, then
//! `~/.config/pages/config.toml`, then `/etc/pages/config.toml`.

use std::io::IsTerminal as _;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    22
}

fn default_max_clients() -> i32 {
    256
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/bash")
}

fn default_level() -> String {
    "debug".to_owned()
}

/// Application configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub fuse: FuseConfig,

    #[serde(default)]
    pub sshd: SshdConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Settings consumed by the filesystem endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FuseConfig {
    /// Directory holding `user/repo.git` bare repositories.
    pub repo_root: PathBuf,

    /// Trace every FUSE request.
    #[serde(default)]
    pub debug: bool,
}

/// Settings for the SSH command gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SshdConfig {
    pub host: String,
    pub port: u16,

    /// Path to the SSH host key. Must be set.
    pub private_key: PathBuf,

    /// Connections beyond this count are refused.
    pub max_clients: i32,

    /// Shell that runs `exec` commands via `-c`.
    pub shell: PathBuf,
}

impl Default for SshdConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            private_key: PathBuf::new(),
            max_clients: default_max_clients(),
            shell: default_shell(),
        }
    }
}

/// Where log output should be written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogTarget {
    Stdout,
    #[default]
    Stderr,
    /// Append to a file at the given path.
    File(PathBuf),
}

/// Controls whether ANSI color codes are included in log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorMode {
    /// Color for terminals, plain output for files and pipes.
    #[default]
    Auto,
    Always,
    Never,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogConfig {
    pub target: LogTarget,

    /// Default level filter; the `PAGES_LOG` env var overrides it.
    pub level: String,

    pub color: ColorMode,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            target: LogTarget::default(),
            level: default_level(),
            color: ColorMode::default(),
        }
    }
}

fn force_color() -> bool {
    std::env::var_os("FORCE_COLOR").is_some_and(|v| !v.is_empty())
}

fn no_color() -> bool {
    std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty())
}

impl LogConfig {
    /// Whether ANSI color codes should be used for the configured target.
    pub fn should_use_color(&self) -> bool {
        match self.color {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => {
                let terminal = match &self.target {
                    LogTarget::Stdout => std::io::stdout().is_terminal(),
                    LogTarget::Stderr => std::io::stderr().is_terminal(),
                    LogTarget::File(_) => false,
                };
                force_color() || (terminal && !no_color())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "No configuration file found (tried PAGES_CONFIG, \
         ~/.config/pages/config.toml, /etc/pages/config.toml)"
    )]
    NoConfigFile,
}

impl Config {
    /// Validate the correctness of the configuration, collecting every
    /// failure message rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.fuse.repo_root.as_os_str().is_empty() {
            errors.push("fuse.repo-root must be set.".to_owned());
        }
        if self.sshd.private_key.as_os_str().is_empty() {
            errors.push("sshd.private-key must be set.".to_owned());
        }
        if self.sshd.max_clients <= 0 {
            errors.push("sshd.max-clients must be positive.".to_owned());
        }
        if let LogTarget::File(path) = &self.log.target {
            if path.as_os_str().is_empty() {
                errors.push("log file path must not be empty.".to_owned());
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Config file paths in descending priority order.
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(env_path) = std::env::var_os("PAGES_CONFIG") {
            if !env_path.is_empty() {
                paths.push(PathBuf::from(env_path));
            }
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("pages").join("config.toml"));
        }
        paths.push(PathBuf::from("/etc/pages/config.toml"));
        paths
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load from the explicit path if given, otherwise from the first
    /// existing search path.
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = external_config_path {
            return Self::load_from_file(path);
        }
        match Self::config_search_paths().iter().find(|p| p.exists()) {
            Some(path) => Self::load_from_file(path),
            None => Err(ConfigError::NoConfigFile),
        }
    }
}
