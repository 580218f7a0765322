//! Persisted engine configuration.
//!
//! [`ConfigManager`] stores the declared configuration as flat TOML and pushes
//! gated toggles to the engine. Declared and applied state are allowed to
//! diverge: a toggle is always persisted, even when the engine side effect is
//! refused or fails. What the engine last acknowledged is kept in a sidecar
//! (`<name>.applied.toml`), and each save pushes the difference between that
//! and the declared document, so skipped effects are retried on the next save.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::executor::CommandExecutor;
use crate::privilege::{Capability, Connection, PrivilegeTier};
use crate::service::Command;

pub mod bindings;

/// Declared engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Verbose engine logging.
    pub verbose: bool,
    /// Force ext4 images for module storage.
    pub force_ext4: bool,
    /// Skip unmounting for denylisted apps.
    pub disable_umount: bool,
    /// Kernel-side debug output.
    pub enable_kernel_debug: bool,
    /// Hide engine traces from inspection.
    pub enable_stealth: bool,
    /// Spoof AVC denial logs.
    pub avc_spoof: bool,
    /// Wipe ext4 sysfs traces after mounting.
    pub enable_nuke: bool,
    /// Connect even if the service protocol is older than supported.
    pub ignore_protocol_mismatch: bool,
    /// Use the built-in mount pipeline.
    pub builtin_mount_enabled: bool,
    /// Engine mirror directory override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_path: Option<PathBuf>,
}

/// Boolean settings in [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Toggle {
    /// `verbose`
    Verbose,
    /// `force_ext4`
    ForceExt4,
    /// `disable_umount`
    DisableUmount,
    /// `enable_kernel_debug`
    KernelDebug,
    /// `enable_stealth`
    Stealth,
    /// `avc_spoof`
    AvcSpoof,
    /// `enable_nuke`
    EnableNuke,
    /// `ignore_protocol_mismatch`
    IgnoreProtocolMismatch,
    /// `builtin_mount_enabled`
    BuiltinMountEnabled,
}

impl Toggle {
    /// Every toggle, in file order.
    pub const ALL: [Self; 9] = [
        Self::Verbose,
        Self::ForceExt4,
        Self::DisableUmount,
        Self::KernelDebug,
        Self::Stealth,
        Self::AvcSpoof,
        Self::EnableNuke,
        Self::IgnoreProtocolMismatch,
        Self::BuiltinMountEnabled,
    ];

    /// Key in the persisted document.
    pub fn key(self) -> &'static str {
        match self {
            Self::Verbose => "verbose",
            Self::ForceExt4 => "force_ext4",
            Self::DisableUmount => "disable_umount",
            Self::KernelDebug => "enable_kernel_debug",
            Self::Stealth => "enable_stealth",
            Self::AvcSpoof => "avc_spoof",
            Self::EnableNuke => "enable_nuke",
            Self::IgnoreProtocolMismatch => "ignore_protocol_mismatch",
            Self::BuiltinMountEnabled => "builtin_mount_enabled",
        }
    }

    /// Capability the engine side effect needs, for gated toggles.
    pub fn gate(self) -> Option<Capability> {
        match self {
            Self::KernelDebug | Self::AvcSpoof => Some(Capability::KERNEL_DEBUG),
            Self::Stealth => Some(Capability::OVERLAY_ENGINE),
            Self::EnableNuke => Some(Capability::SYSFS_CLEANUP),
            _ => None,
        }
    }

    /// Lowest tier allowed to apply this toggle.
    pub fn required_tier(self) -> PrivilegeTier {
        self.gate().map_or(PrivilegeTier::Shell, Capability::min_tier)
    }

    /// Current value in `config`.
    pub fn get(self, config: &EngineConfig) -> bool {
        match self {
            Self::Verbose => config.verbose,
            Self::ForceExt4 => config.force_ext4,
            Self::DisableUmount => config.disable_umount,
            Self::KernelDebug => config.enable_kernel_debug,
            Self::Stealth => config.enable_stealth,
            Self::AvcSpoof => config.avc_spoof,
            Self::EnableNuke => config.enable_nuke,
            Self::IgnoreProtocolMismatch => config.ignore_protocol_mismatch,
            Self::BuiltinMountEnabled => config.builtin_mount_enabled,
        }
    }

    /// Set the value in `config`.
    pub fn set(self, config: &mut EngineConfig, value: bool) {
        let slot = match self {
            Self::Verbose => &mut config.verbose,
            Self::ForceExt4 => &mut config.force_ext4,
            Self::DisableUmount => &mut config.disable_umount,
            Self::KernelDebug => &mut config.enable_kernel_debug,
            Self::Stealth => &mut config.enable_stealth,
            Self::AvcSpoof => &mut config.avc_spoof,
            Self::EnableNuke => &mut config.enable_nuke,
            Self::IgnoreProtocolMismatch => &mut config.ignore_protocol_mismatch,
            Self::BuiltinMountEnabled => &mut config.builtin_mount_enabled,
        };
        *slot = value;
    }

    /// Engine command applying `value`, if this toggle has one.
    pub fn side_effect(self, value: bool) -> Option<Command> {
        match self {
            Self::KernelDebug => Some(Command::SetDebug(value)),
            Self::Stealth => Some(Command::SetStealth(value)),
            Self::AvcSpoof => Some(Command::SetAvcSpoof(value)),
            Self::EnableNuke => value.then_some(Command::NukeExt4Sysfs),
            _ => None,
        }
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Toggle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.key() == normalized || t.key().strip_prefix("enable_") == Some(normalized.as_str()))
            .ok_or_else(|| format!("unknown toggle '{s}'"))
    }
}

/// Engine side effect that was attempted but did not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredEffect {
    /// Setting that changed.
    pub setting: String,
    /// Engine diagnostic.
    pub diagnostic: String,
}

/// Result of a successful save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    /// Settings whose engine side effect was applied.
    pub applied: Vec<String>,
    /// Settings persisted but not applied because the engine call failed.
    pub deferred: Vec<DeferredEffect>,
}

/// Configuration failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Writing the document failed; nothing changed on disk.
    #[error("failed to persist engine config: {0}")]
    PersistFailed(String),
    /// A value was refused before anything was written.
    #[error("invalid setting: {0}")]
    InvalidValue(String),
    /// The connection's tier is too low for the listed settings. Engine
    /// toggles are still persisted; module strategies are not.
    #[error("{} require tier {required} to take effect", settings.join(", "))]
    Gated {
        /// Settings whose side effect was skipped.
        settings: Vec<String>,
        /// Tier those settings need.
        required: PrivilegeTier,
    },
}

/// Setting an [`Effect`] changes.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Toggle(Toggle),
    MirrorPath,
}

impl Slot {
    /// Copy this setting's value from `declared` into `applied`.
    fn settle(self, applied: &mut EngineConfig, declared: &EngineConfig) {
        match self {
            Self::Toggle(toggle) => toggle.set(applied, toggle.get(declared)),
            Self::MirrorPath => applied.mirror_path.clone_from(&declared.mirror_path),
        }
    }
}

/// Pending engine change derived from a config diff.
#[derive(Debug, Clone)]
struct Effect {
    slot: Slot,
    setting: String,
    gate: Capability,
    command: Command,
}

/// Loads and saves [`EngineConfig`], applying gated toggles to the engine.
///
/// Clones share one lock, so saves through the same manager never interleave.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
    engine: Option<(Arc<Connection>, CommandExecutor)>,
    lock: Arc<Mutex<()>>,
}

impl ConfigManager {
    /// Manager for the document at `path`, without engine access.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            engine: None,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Same manager, applying side effects through `executor`.
    pub fn with_engine(mut self, connection: Arc<Connection>, executor: CommandExecutor) -> Self {
        self.engine = Some((connection, executor));
        self
    }

    /// Location of the persisted document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the engine-acknowledged state.
    pub fn applied_path(&self) -> PathBuf {
        self.path.with_extension("applied.toml")
    }

    /// Read the declared configuration. Missing or unreadable documents
    /// yield defaults.
    pub async fn load(&self) -> EngineConfig {
        read_document(&self.path).await
    }

    /// Settings the engine last acknowledged. Only gated settings are
    /// tracked; everything else stays at its default.
    pub async fn applied(&self) -> EngineConfig {
        read_document(&self.applied_path()).await
    }

    /// Replace the persisted configuration with `config` and apply changed
    /// gated settings to the engine.
    ///
    /// # Errors
    ///
    /// [`ConfigError::PersistFailed`] if the document could not be written.
    /// [`ConfigError::Gated`] after persisting, when some side effects need
    /// a higher tier than the connection has.
    pub async fn save(&self, config: &EngineConfig) -> Result<SaveReport, ConfigError> {
        let _serialized = self.lock.lock().await;
        self.persist(config).await?;

        let acknowledged = self.applied().await;
        let mut applied = settled(&acknowledged, config);
        let mut report = SaveReport::default();
        let mut gated = Vec::new();
        let mut required = PrivilegeTier::Shell;

        for effect in effects(&applied, config) {
            let Some((connection, executor)) = self
                .engine
                .as_ref()
                .filter(|(connection, _)| connection.allows(effect.gate))
            else {
                required = required.max(effect.gate.min_tier());
                gated.push(effect.setting);
                continue;
            };
            debug!(setting = %effect.setting, tier = %connection.tier, "applying config side effect");
            let outcome = executor.execute(effect.command).await;
            if outcome.success {
                effect.slot.settle(&mut applied, config);
                report.applied.push(effect.setting);
            } else {
                warn!(
                    setting = %effect.setting,
                    diagnostic = %outcome.text,
                    "engine did not apply setting; kept in declared config"
                );
                report.deferred.push(DeferredEffect {
                    setting: effect.setting,
                    diagnostic: outcome.text,
                });
            }
        }

        if applied != acknowledged {
            self.record_applied(&applied).await;
        }

        if gated.is_empty() {
            Ok(report)
        } else {
            warn!(settings = ?gated, required = %required, "config saved without engine side effects");
            Err(ConfigError::Gated {
                settings: gated,
                required,
            })
        }
    }

    async fn persist(&self, config: &EngineConfig) -> Result<(), ConfigError> {
        let body = toml::to_string_pretty(config).map_err(|e| ConfigError::PersistFailed(e.to_string()))?;
        write_atomic(&self.path, body.as_bytes())
            .await
            .map_err(|e| ConfigError::PersistFailed(format!("{}: {e}", self.path.display())))?;
        info!(path = %self.path.display(), "engine config saved");
        Ok(())
    }

    /// Best effort: a lost record only means effects are re-sent next time.
    async fn record_applied(&self, applied: &EngineConfig) {
        let path = self.applied_path();
        let written = match toml::to_string_pretty(applied) {
            Ok(body) => write_atomic(&path, body.as_bytes()).await,
            Err(err) => Err(std::io::Error::other(err)),
        };
        if let Err(err) = written {
            warn!(path = %path.display(), error = %err, "failed to record applied engine state");
        }
    }
}

async fn read_document(path: &Path) -> EngineConfig {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "engine config absent; using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "engine config unreadable; using defaults");
            return EngineConfig::default();
        }
    };
    match toml::from_str(&raw) {
        Ok(config) => config,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "engine config malformed; using defaults");
            EngineConfig::default()
        }
    }
}

/// `applied` with every gated setting that has no engine command for its
/// declared value (nuke off, mirror path cleared) taken from `declared`.
fn settled(applied: &EngineConfig, declared: &EngineConfig) -> EngineConfig {
    let mut out = applied.clone();
    for toggle in Toggle::ALL {
        if toggle.gate().is_some() && toggle.side_effect(toggle.get(declared)).is_none() {
            Slot::Toggle(toggle).settle(&mut out, declared);
        }
    }
    if declared.mirror_path.is_none() {
        Slot::MirrorPath.settle(&mut out, declared);
    }
    out
}

/// Engine commands implied by moving from `old` to `new`.
fn effects(old: &EngineConfig, new: &EngineConfig) -> Vec<Effect> {
    let mut out: Vec<Effect> = Toggle::ALL
        .into_iter()
        .filter(|t| t.get(old) != t.get(new))
        .filter_map(|t| {
            let command = t.side_effect(t.get(new))?;
            Some(Effect {
                slot: Slot::Toggle(t),
                setting: t.key().to_owned(),
                gate: t.gate()?,
                command,
            })
        })
        .collect();
    if old.mirror_path != new.mirror_path {
        if let Some(path) = &new.mirror_path {
            out.push(Effect {
                slot: Slot::MirrorPath,
                setting: "mirror_path".to_owned(),
                gate: Capability::OVERLAY_ENGINE,
                command: Command::SetMirrorPath(path.clone()),
            });
        }
    }
    out
}

/// Write `bytes` to a uniquely named, owner-only sibling temp file and
/// rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let name = path
        .file_name()
        .map_or_else(|| "config".to_owned(), |n| n.to_string_lossy().into_owned());
    let tmp_path = path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()));

    let written = match write_private(&tmp_path, bytes).await {
        Ok(()) => tokio::fs::rename(&tmp_path, path).await,
        Err(err) => Err(err),
    };
    if written.is_err() {
        if let Err(err) = tokio::fs::remove_file(&tmp_path).await {
            debug!(path = %tmp_path.display(), error = %err, "temp file cleanup failed");
        }
    }
    written
}

async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}
