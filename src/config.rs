//! Client configuration loading.
//!
//! Loads `hymoctl` settings from `~/.hymoctl/config.toml` (or `$HYMOCTL_CONFIG`).
//! Precedence: env vars > config file > defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How to reach the privileged service (`[service]`).
    pub service: ServiceConfig,
    /// Files read and written on the device (`[paths]`).
    pub paths: PathsConfig,
    /// Log filter (`[logging]`).
    pub logging: LoggingConfig,
}

/// Which service transport to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Structured Unix socket protocol.
    #[default]
    Socket,
    /// Engine CLI through a root shell.
    Shell,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Socket => "socket",
            Self::Shell => "shell",
        })
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socket" => Ok(Self::Socket),
            "shell" => Ok(Self::Shell),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Service connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Transport used for every call.
    pub transport: TransportKind,
    /// Socket address; a leading `@` selects the abstract namespace.
    pub socket: String,
    /// `su` binary used by the shell transport.
    pub su_path: PathBuf,
    /// Engine CLI run through the shell transport.
    pub engine_cli: String,
    /// Per-call timeout.
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Socket,
            socket: "@murasaki".to_owned(),
            su_path: PathBuf::from("su"),
            engine_cli: "hymod".to_owned(),
            timeout_secs: 10,
        }
    }
}

impl ServiceConfig {
    /// Per-call timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Device paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Persisted engine configuration.
    pub engine_config: PathBuf,
    /// Persisted module strategies.
    pub module_modes: PathBuf,
    /// Mount table scanned for ordering problems.
    pub mountinfo: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            engine_config: PathBuf::from("/data/adb/hymo/config.toml"),
            module_modes: PathBuf::from("/data/adb/hymo/module_mode.toml"),
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl ClientConfig {
    /// Load with precedence env vars > TOML file > defaults.
    ///
    /// `explicit` wins over `$HYMOCTL_CONFIG` and the default location.
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    /// [`load`](Self::load) with a custom env resolver.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn load_with(explicit: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => config_path_with(&env)?,
        };
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(env);
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading client config");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no client config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Apply `HYMOCTL_*` environment overrides.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("HYMOCTL_TRANSPORT") {
            match v.parse() {
                Ok(t) => self.service.transport = t,
                Err(_) => tracing::warn!(var = "HYMOCTL_TRANSPORT", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("HYMOCTL_SOCKET") {
            self.service.socket = v;
        }
        if let Some(v) = env("HYMOCTL_SU") {
            self.service.su_path = PathBuf::from(v);
        }
        if let Some(v) = env("HYMOCTL_ENGINE_CLI") {
            self.service.engine_cli = v;
        }
        if let Some(v) = env("HYMOCTL_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.service.timeout_secs = n,
                Err(_) => tracing::warn!(var = "HYMOCTL_TIMEOUT_SECS", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("HYMOCTL_ENGINE_CONFIG") {
            self.paths.engine_config = PathBuf::from(v);
        }
    }

    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or unknown enum values.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }
}

fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(p) = env("HYMOCTL_CONFIG") {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve the default config directory (`~/.hymoctl/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".hymoctl"))
}
