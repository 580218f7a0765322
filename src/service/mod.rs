//! Boundary to the privileged service.
//!
//! Everything past this module is opaque: a [`ServiceBackend`] takes one
//! logical [`Command`] and returns a [`ServiceReply`] or a [`ServiceError`].
//! Two transports exist, a structured socket protocol ([`socket`]) and a
//! root-shell text transport ([`shell`]).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ServiceConfig, TransportKind};
use crate::privilege::PrivilegeTier;
use crate::rules::{RuleFlags, RuleId, RuleKind};

pub mod shell;
pub mod socket;
pub mod wire;

/// Logical operation understood by the privileged service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Probe whether the given tier is achievable. Non-negative value means yes.
    ProbeTier(PrivilegeTier),
    /// Version of the privileged service protocol.
    ServiceVersion,
    /// Version of the overlay engine.
    EngineVersion,
    /// SELinux context of a process (`None` = the service's own process).
    SelinuxContext {
        /// Target process id.
        pid: Option<u32>,
    },
    /// Submit one rule to the overlay engine.
    AddRule {
        /// Rule kind.
        kind: RuleKind,
        /// Source path.
        source: PathBuf,
        /// Target path, if the kind takes one.
        target: Option<PathBuf>,
        /// Rule flags.
        flags: RuleFlags,
    },
    /// Remove one rule by engine-assigned id.
    DeleteRule(RuleId),
    /// Remove every rule.
    ClearRules,
    /// Enumerate the active rules.
    ListRules,
    /// Toggle stealth mode.
    SetStealth(bool),
    /// Toggle kernel debug logging.
    SetDebug(bool),
    /// Toggle AVC log spoofing.
    SetAvcSpoof(bool),
    /// Point the engine at a different mirror directory.
    SetMirrorPath(PathBuf),
    /// Renumber mounts into a canonical sequence.
    FixMounts,
    /// Wipe ext4 sysfs traces left by loop mounts.
    NukeExt4Sysfs,
    /// Enumerate modules and the strategy each is mounted with.
    ListModules,
}

impl Command {
    /// Short stable name used in logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProbeTier(_) => "probe_tier",
            Self::ServiceVersion => "service_version",
            Self::EngineVersion => "engine_version",
            Self::SelinuxContext { .. } => "selinux_context",
            Self::AddRule { .. } => "add_rule",
            Self::DeleteRule(_) => "delete_rule",
            Self::ClearRules => "clear_rules",
            Self::ListRules => "list_rules",
            Self::SetStealth(_) => "set_stealth",
            Self::SetDebug(_) => "set_debug",
            Self::SetAvcSpoof(_) => "set_avc_spoof",
            Self::SetMirrorPath(_) => "set_mirror_path",
            Self::FixMounts => "fix_mounts",
            Self::NukeExt4Sysfs => "nuke_ext4_sysfs",
            Self::ListModules => "list_modules",
        }
    }

    /// Whether the reply text is the payload rather than a diagnostic.
    pub fn returns_payload(&self) -> bool {
        matches!(
            self,
            Self::ListRules | Self::ListModules | Self::SelinuxContext { .. }
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw reply from a backend, already split into typed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReply {
    /// Declared status: result code (socket) or exit status (shell).
    pub status: i32,
    /// Integer carried by the reply (id, version, tier code), if any.
    pub value: Option<i64>,
    /// Payload or diagnostic text.
    pub text: String,
    /// `true` when `status` is authoritative and text heuristics must not be applied.
    pub structured: bool,
}

impl ServiceReply {
    /// Structured reply carrying only a status code.
    pub fn status(status: i32) -> Self {
        Self {
            status,
            value: (status >= 0).then_some(i64::from(status)),
            text: String::new(),
            structured: true,
        }
    }
}

/// Transport-level failures. These never escape the command executor.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The service could not be reached.
    #[error("privileged service unavailable: {0}")]
    Unavailable(String),
    /// The call did not finish within its time budget.
    #[error("service call timed out after {seconds}s")]
    Timeout {
        /// Timeout budget in seconds.
        seconds: u64,
    },
    /// The transport has no encoding for this operation.
    #[error("{command} is not supported by the {transport} transport")]
    Unsupported {
        /// Operation name.
        command: &'static str,
        /// Transport that rejected it.
        transport: TransportKind,
    },
    /// The peer violated the framing protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Request argument cannot be encoded.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Underlying I/O failure.
    #[error("service i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque synchronous request/response channel to the privileged service.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Issue one command and wait for its reply.
    async fn call(&self, command: &Command) -> Result<ServiceReply, ServiceError>;
    /// Tear down any held connection.
    async fn disconnect(&self) -> Result<(), ServiceError>;
    /// Which transport this backend speaks.
    fn transport(&self) -> TransportKind;
}

/// Build the backend selected by client configuration.
pub fn backend_from_config(config: &ServiceConfig) -> Arc<dyn ServiceBackend> {
    match config.transport {
        TransportKind::Socket => Arc::new(socket::SocketBackend::new(
            socket::SocketAddress::parse(&config.socket),
            config.timeout(),
        )),
        TransportKind::Shell => Arc::new(shell::ShellBackend::new(
            config.su_path.clone(),
            config.engine_cli.clone(),
            config.timeout(),
        )),
    }
}
