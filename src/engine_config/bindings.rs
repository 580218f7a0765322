//! Per-module mount strategies.
//!
//! Strategies are declared in a flat `module_mode.toml` and only take effect
//! when the module is remounted, so each binding is reported as a pending
//! (declared) and active (engine-reported) pair.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{write_atomic, ConfigError};
use crate::executor::CommandExecutor;
use crate::privilege::{Capability, Connection};
use crate::service::Command;

/// How a module's files are mounted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountStrategy {
    /// Let the engine pick.
    #[default]
    Auto,
    /// Overlay engine rules.
    Hymofs,
    /// OverlayFS.
    Overlay,
    /// Bind-mount based magic mount.
    Magic,
    /// Not mounted.
    None,
}

impl MountStrategy {
    /// Every strategy, in display order.
    pub const ALL: [Self; 5] = [Self::Auto, Self::Hymofs, Self::Overlay, Self::Magic, Self::None];

    /// Strategies selectable on `connection` (all but `hymofs` without engine access).
    pub fn allowed(connection: Option<&Connection>) -> Vec<Self> {
        let engine = connection.is_some_and(|c| c.allows(Capability::OVERLAY_ENGINE));
        Self::ALL
            .into_iter()
            .filter(|s| engine || *s != Self::Hymofs)
            .collect()
    }
}

impl fmt::Display for MountStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Hymofs => "hymofs",
            Self::Overlay => "overlay",
            Self::Magic => "magic",
            Self::None => "none",
        })
    }
}

impl FromStr for MountStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.to_string() == lowered)
            .ok_or_else(|| format!("unknown mount strategy '{s}'"))
    }
}

/// Declared strategy for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleBinding {
    /// Module identifier.
    pub module_id: String,
    /// Declared strategy.
    pub strategy: MountStrategy,
}

/// Declared and engine-reported strategy for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingView {
    /// Module identifier.
    pub module_id: String,
    /// Declared strategy, applied on next restart.
    pub pending: Option<MountStrategy>,
    /// Strategy currently mounted, when the engine reported one.
    pub active: Option<MountStrategy>,
    /// Whether a restart is needed for `pending` to take effect.
    pub needs_restart: bool,
}

impl BindingView {
    fn new(module_id: String, pending: Option<MountStrategy>, active: Option<MountStrategy>) -> Self {
        let needs_restart = match (pending, active) {
            (Some(MountStrategy::Auto) | None, _) => false,
            (Some(p), Some(a)) => p != a,
            (Some(MountStrategy::None), None) => false,
            (Some(_), None) => true,
        };
        Self {
            module_id,
            pending,
            active,
            needs_restart,
        }
    }
}

/// Reads and writes module strategies.
///
/// Clones share one lock around the read-modify-write in [`set`](Self::set).
/// Independent stores over the same file are not coordinated.
#[derive(Debug, Clone)]
pub struct BindingStore {
    path: PathBuf,
    engine: Option<(Arc<Connection>, CommandExecutor)>,
    lock: Arc<Mutex<()>>,
}

impl BindingStore {
    /// Store for the document at `path`, without engine access.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            engine: None,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Same store, reading active strategies through `executor`.
    pub fn with_engine(mut self, connection: Arc<Connection>, executor: CommandExecutor) -> Self {
        self.engine = Some((connection, executor));
        self
    }

    /// Location of the persisted document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Strategies selectable with the current connection.
    pub fn allowed(&self) -> Vec<MountStrategy> {
        MountStrategy::allowed(self.engine.as_ref().map(|(c, _)| c.as_ref()))
    }

    /// Declared strategies. Missing or malformed documents yield none.
    pub async fn pending(&self) -> BTreeMap<String, MountStrategy> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %err, "module modes unreadable");
                }
                return BTreeMap::new();
            }
        };
        toml::from_str(&raw).unwrap_or_else(|err| {
            warn!(path = %self.path.display(), error = %err, "module modes malformed");
            BTreeMap::new()
        })
    }

    /// Strategies the engine reports as mounted, or `None` when unknown.
    pub async fn active(&self) -> Option<BTreeMap<String, MountStrategy>> {
        let (_, executor) = self.engine.as_ref()?;
        let outcome = executor.execute(Command::ListModules).await;
        if !outcome.success {
            debug!(diagnostic = %outcome.text, "module listing unavailable");
            return None;
        }
        Some(parse_module_listing(&outcome.text))
    }

    /// Declare `strategy` for `module_id`. Takes effect after a restart.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] for a malformed module id,
    /// [`ConfigError::Gated`] when the strategy needs engine access the
    /// connection lacks (nothing is written), or
    /// [`ConfigError::PersistFailed`].
    pub async fn set(&self, binding: ModuleBinding) -> Result<BindingView, ConfigError> {
        validate_module_id(&binding.module_id)?;
        if !self.allowed().contains(&binding.strategy) {
            return Err(ConfigError::Gated {
                settings: vec![format!("{}={}", binding.module_id, binding.strategy)],
                required: Capability::OVERLAY_ENGINE.min_tier(),
            });
        }

        {
            let _serialized = self.lock.lock().await;
            let mut modes = self.pending().await;
            modes.insert(binding.module_id.clone(), binding.strategy);
            let body = toml::to_string(&modes).map_err(|e| ConfigError::PersistFailed(e.to_string()))?;
            write_atomic(&self.path, body.as_bytes())
                .await
                .map_err(|e| ConfigError::PersistFailed(format!("{}: {e}", self.path.display())))?;
        }
        info!(module = %binding.module_id, strategy = %binding.strategy, "module strategy declared");

        let active = self
            .active()
            .await
            .and_then(|mut m| m.remove(&binding.module_id));
        Ok(BindingView::new(binding.module_id, Some(binding.strategy), active))
    }

    /// Pending and active strategy for every known module.
    pub async fn views(&self) -> Vec<BindingView> {
        let pending = self.pending().await;
        let active = self.active().await.unwrap_or_default();
        let mut ids: Vec<&String> = pending.keys().chain(active.keys()).collect();
        ids.sort();
        ids.dedup();
        ids.into_iter()
            .map(|id| BindingView::new(id.clone(), pending.get(id).copied(), active.get(id).copied()))
            .collect()
    }
}

fn validate_module_id(id: &str) -> Result<(), ConfigError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(format!("module id '{id}' is not valid")))
    }
}

/// Parse `"<module id> <strategy>"` lines. Unknown strategies are skipped.
pub fn parse_module_listing(text: &str) -> BTreeMap<String, MountStrategy> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let strategy = parts.next()?.parse().ok()?;
            Some((id.to_owned(), strategy))
        })
        .collect()
}
