//! Privilege negotiation with the privileged service.
//!
//! A [`PrivilegeChannel`] probes tiers from most to least capable and keeps
//! the first one that answers as the negotiated [`Connection`]. The
//! connection is replaced as a whole on reconnect, so readers only ever see
//! a fully initialised value.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::service::{Command, ServiceBackend, ServiceReply};

/// Lowest service protocol version this client understands.
pub const MIN_SERVICE_VERSION: i64 = 1;

/// Capability ceiling of a connection. Ordered `Shell < Root < Kernel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeTier {
    /// Shell-user compatible access.
    Shell,
    /// Root access through the service.
    Root,
    /// Kernel-level access, including the overlay engine.
    Kernel,
}

impl PrivilegeTier {
    /// Probe order: most capable first.
    pub const DESCENDING: [Self; 3] = [Self::Kernel, Self::Root, Self::Shell];

    /// Numeric tier code used on the wire.
    pub fn code(self) -> i32 {
        match self {
            Self::Shell => 0,
            Self::Root => 1,
            Self::Kernel => 2,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Shell),
            1 => Some(Self::Root),
            2 => Some(Self::Kernel),
            _ => None,
        }
    }

    /// Every capability available at this tier, including those of lower tiers.
    pub fn capabilities(self) -> Capability {
        match self {
            Self::Shell => Capability::SHELL_EXEC | Capability::SELINUX_QUERY,
            Self::Root => Self::Shell.capabilities() | Capability::ROOT_EXEC | Capability::MODULE_CONFIG,
            Self::Kernel => {
                Self::Root.capabilities()
                    | Capability::OVERLAY_ENGINE
                    | Capability::KERNEL_DEBUG
                    | Capability::SYSFS_CLEANUP
            }
        }
    }
}

impl fmt::Display for PrivilegeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Shell => "shell",
            Self::Root => "root",
            Self::Kernel => "kernel",
        })
    }
}

impl FromStr for PrivilegeTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shell" => Ok(Self::Shell),
            "root" => Ok(Self::Root),
            "kernel" => Ok(Self::Kernel),
            other => Err(format!("unknown privilege tier '{other}'")),
        }
    }
}

bitflags! {
    /// Operations a connection may perform.
    ///
    /// | Capability | Lowest tier |
    /// |------------|-------------|
    /// | [`SHELL_EXEC`](Self::SHELL_EXEC) | shell |
    /// | [`SELINUX_QUERY`](Self::SELINUX_QUERY) | shell |
    /// | [`ROOT_EXEC`](Self::ROOT_EXEC) | root |
    /// | [`MODULE_CONFIG`](Self::MODULE_CONFIG) | root |
    /// | [`OVERLAY_ENGINE`](Self::OVERLAY_ENGINE) | kernel |
    /// | [`KERNEL_DEBUG`](Self::KERNEL_DEBUG) | kernel |
    /// | [`SYSFS_CLEANUP`](Self::SYSFS_CLEANUP) | kernel |
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capability: u16 {
        /// Run unprivileged commands.
        const SHELL_EXEC     = 0b0000_0001;
        /// Query SELinux contexts.
        const SELINUX_QUERY  = 0b0000_0010;
        /// Run commands as root.
        const ROOT_EXEC      = 0b0000_0100;
        /// Change module mount strategies.
        const MODULE_CONFIG  = 0b0000_1000;
        /// Talk to the overlay engine (rules, stealth, mounts).
        const OVERLAY_ENGINE = 0b0001_0000;
        /// Toggle kernel debug and AVC spoofing.
        const KERNEL_DEBUG   = 0b0010_0000;
        /// Wipe ext4 sysfs traces.
        const SYSFS_CLEANUP  = 0b0100_0000;
    }
}

impl Capability {
    /// Lowest tier whose capability set contains all of `self`.
    pub fn min_tier(self) -> PrivilegeTier {
        [PrivilegeTier::Shell, PrivilegeTier::Root, PrivilegeTier::Kernel]
            .into_iter()
            .find(|tier| tier.capabilities().contains(self))
            .unwrap_or(PrivilegeTier::Kernel)
    }
}

/// The negotiated connection. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    /// Negotiated tier.
    pub tier: PrivilegeTier,
    /// Service protocol version (`-1` when the service did not say).
    pub service_version: i64,
    /// Overlay engine version (`-1` when unknown).
    pub engine_version: i64,
    /// SELinux context of the service process, when it could be read.
    pub selinux_context: Option<String>,
}

impl Connection {
    /// Whether this connection grants every capability in `capability`.
    pub fn allows(&self, capability: Capability) -> bool {
        self.tier.capabilities().contains(capability)
    }
}

/// Why a connection could not be established.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// Every tier probe failed.
    #[error("privileged service unavailable: {0}")]
    Unavailable(String),
    /// The service speaks a protocol version this client cannot use.
    #[error("service protocol version {found} is older than the supported minimum {required}")]
    VersionMismatch {
        /// Version reported by the service.
        found: i64,
        /// Minimum version this client accepts.
        required: i64,
    },
}

/// Knobs for connection negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Accept a service whose protocol version is below the minimum.
    pub ignore_protocol_mismatch: bool,
}

/// Owner of the single live [`Connection`].
pub struct PrivilegeChannel {
    backend: Arc<dyn ServiceBackend>,
    options: ConnectOptions,
    current: RwLock<Option<Arc<Connection>>>,
    connecting: Mutex<()>,
}

impl fmt::Debug for PrivilegeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivilegeChannel")
            .field("transport", &self.backend.transport())
            .field("options", &self.options)
            .field("current", &self.current())
            .finish()
    }
}

impl PrivilegeChannel {
    /// Create an unconnected channel over `backend`.
    pub fn new(backend: Arc<dyn ServiceBackend>, options: ConnectOptions) -> Self {
        Self {
            backend,
            options,
            current: RwLock::new(None),
            connecting: Mutex::new(()),
        }
    }

    /// Backend this channel negotiates over.
    pub fn backend(&self) -> &Arc<dyn ServiceBackend> {
        &self.backend
    }

    /// Negotiate a connection, or return the cached one.
    ///
    /// Tiers are probed once each, most capable first; the first
    /// non-negative answer wins. A probe never grants more than the tier it
    /// asked for. Concurrent callers share one negotiation.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Unavailable`] when no tier answers,
    /// [`ConnectError::VersionMismatch`] when the service is too old.
    pub async fn connect(&self) -> Result<Arc<Connection>, ConnectError> {
        if let Some(existing) = self.current() {
            return Ok(existing);
        }
        let _negotiating = self.connecting.lock().await;
        if let Some(existing) = self.current() {
            return Ok(existing);
        }

        let tier = self.negotiate_tier().await?;
        let service_version = self.query_integer(Command::ServiceVersion).await.unwrap_or(-1);
        if service_version >= 0 && service_version < MIN_SERVICE_VERSION {
            if self.options.ignore_protocol_mismatch {
                warn!(
                    found = service_version,
                    required = MIN_SERVICE_VERSION,
                    "service protocol mismatch ignored by configuration"
                );
            } else {
                return Err(ConnectError::VersionMismatch {
                    found: service_version,
                    required: MIN_SERVICE_VERSION,
                });
            }
        }
        let engine_version = self.query_integer(Command::EngineVersion).await.unwrap_or(-1);
        let selinux_context = self.query_selinux().await;

        let connection = Arc::new(Connection {
            tier,
            service_version,
            engine_version,
            selinux_context,
        });
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&connection));
        info!(
            tier = %connection.tier,
            service_version,
            engine_version,
            transport = %self.backend.transport(),
            "connected to privileged service"
        );
        Ok(connection)
    }

    /// Tier of the live connection, if any.
    pub fn current_tier(&self) -> Option<PrivilegeTier> {
        self.current().map(|c| c.tier)
    }

    /// Snapshot of the live connection, if any.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether the live connection grants `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.current().is_some_and(|c| c.allows(capability))
    }

    /// Drop the live connection. Teardown failures are logged, never returned.
    pub async fn disconnect(&self) {
        let previous = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Err(err) = self.backend.disconnect().await {
            warn!(error = %err, "service teardown failed; cached connection cleared anyway");
        }
        if let Some(previous) = previous {
            info!(tier = %previous.tier, "disconnected from privileged service");
        }
    }

    /// Drop the live connection and negotiate a fresh one.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn reconnect(&self) -> Result<Arc<Connection>, ConnectError> {
        self.disconnect().await;
        self.connect().await
    }

    async fn negotiate_tier(&self) -> Result<PrivilegeTier, ConnectError> {
        let mut last_failure = String::from("no tier probe answered");
        for tier in PrivilegeTier::DESCENDING {
            match self.backend.call(&Command::ProbeTier(tier)).await {
                Ok(reply) => match probe_code(&reply) {
                    Some(code) if code >= 0 => {
                        let granted = PrivilegeTier::from_code(code).map_or(tier, |t| t.min(tier));
                        debug!(probed = %tier, granted = %granted, "tier probe succeeded");
                        return Ok(granted);
                    }
                    _ => {
                        debug!(tier = %tier, status = reply.status, "tier probe declined");
                        last_failure = format!("{tier} probe declined (status {})", reply.status);
                    }
                },
                Err(err) => {
                    debug!(tier = %tier, error = %err, "tier probe failed");
                    last_failure = format!("{tier} probe failed: {err}");
                }
            }
        }
        Err(ConnectError::Unavailable(last_failure))
    }

    async fn query_integer(&self, command: Command) -> Option<i64> {
        match self.backend.call(&command).await {
            Ok(reply) if reply.status >= 0 => reply.value,
            Ok(_) => None,
            Err(err) => {
                debug!(command = %command, error = %err, "version query failed");
                None
            }
        }
    }

    async fn query_selinux(&self) -> Option<String> {
        match self.backend.call(&Command::SelinuxContext { pid: None }).await {
            Ok(reply) if reply.status >= 0 => {
                let context = reply.text.trim().trim_end_matches('\0').to_owned();
                (!context.is_empty()).then_some(context)
            }
            Ok(_) => None,
            Err(err) => {
                debug!(error = %err, "selinux context query failed");
                None
            }
        }
    }
}

/// Capability code carried by a probe reply; negative means declined.
fn probe_code(reply: &ServiceReply) -> Option<i64> {
    if reply.status < 0 {
        return None;
    }
    reply.value.or(Some(i64::from(reply.status)))
}
