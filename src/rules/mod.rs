//! Overlay engine rules and the store that synchronises them.
//!
//! The engine owns the rule set. [`RuleStore`] never patches a local copy:
//! every read is a fresh listing, and callers re-list after mutating.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::executor::{CommandExecutor, Outcome};
use crate::privilege::{Capability, Connection};
use crate::service::Command;

pub mod parser;

pub use parser::{parse_active_rules, ParseError};

/// Engine code for "rule already exists".
const EEXIST: i32 = -17;

/// Directive kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Redirect `source` to `target`.
    Add,
    /// Hide `source`.
    Hide,
    /// Inject content at `source`, optionally from `target`.
    Inject,
    /// Merge `target` directory contents into `source`.
    Merge,
}

impl RuleKind {
    /// Whether rules of this kind must carry a target.
    pub fn requires_target(self) -> bool {
        matches!(self, Self::Add | Self::Merge)
    }

    /// Whether rules of this kind must not carry a target.
    pub fn forbids_target(self) -> bool {
        matches!(self, Self::Hide)
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Hide => "hide",
            Self::Inject => "inject",
            Self::Merge => "merge",
        })
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" | "redirect" => Ok(Self::Add),
            "hide" => Ok(Self::Hide),
            "inject" => Ok(Self::Inject),
            "merge" => Ok(Self::Merge),
            other => Err(format!("unknown rule kind '{other}'")),
        }
    }
}

bitflags! {
    /// Per-rule flags understood by the engine.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RuleFlags: u32 {
        /// Source is a directory.
        const DIRECTORY = 1;
        /// Source is a symlink.
        const SYMLINK = 1 << 1;
    }
}

/// Engine-assigned rule identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(u32);

impl RuleId {
    /// Wrap a raw engine id.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw engine id.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RuleId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// A single engine directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    /// Engine-assigned id. `None` until the engine accepts the rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RuleId>,
    /// Directive kind.
    pub kind: RuleKind,
    /// Path the rule applies to.
    pub source: PathBuf,
    /// Redirect/merge/inject target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    /// Engine flags.
    pub flags: RuleFlags,
}

impl Rule {
    /// Unsubmitted rule with no flags.
    pub fn new(kind: RuleKind, source: impl Into<PathBuf>, target: Option<PathBuf>) -> Self {
        Self {
            id: None,
            kind,
            source: source.into(),
            target,
            flags: RuleFlags::empty(),
        }
    }

    /// Unsubmitted hide rule.
    pub fn hide(source: impl Into<PathBuf>) -> Self {
        Self::new(RuleKind::Hide, source, None)
    }

    /// Same rule with `flags` set.
    pub fn with_flags(mut self, flags: RuleFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Identity used for de-duplication.
    pub fn key(&self) -> RuleKey {
        RuleKey {
            kind: self.kind,
            source: self.source.clone(),
            target: self.target.clone(),
        }
    }

    /// Check the shape constraints for this rule's kind.
    ///
    /// # Errors
    ///
    /// [`RuleError::InvalidShape`] describing the first violation.
    pub fn validate(&self) -> Result<(), RuleError> {
        check_path("source", &self.source)?;
        match (&self.target, self.kind) {
            (None, kind) if kind.requires_target() => Err(RuleError::InvalidShape(format!(
                "{kind} rule requires a target path"
            ))),
            (Some(_), kind) if kind.forbids_target() => Err(RuleError::InvalidShape(format!(
                "{kind} rule must not have a target path"
            ))),
            (Some(target), _) => check_path("target", target),
            (None, _) => Ok(()),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.source.display())?;
        if let Some(target) = &self.target {
            write!(f, " -> {}", target.display())?;
        }
        if let Some(id) = self.id {
            write!(f, " (id {id})")?;
        }
        Ok(())
    }
}

fn check_path(field: &str, path: &Path) -> Result<(), RuleError> {
    if path.as_os_str().is_empty() {
        return Err(RuleError::InvalidShape(format!("{field} path is empty")));
    }
    if !path.is_absolute() {
        return Err(RuleError::InvalidShape(format!(
            "{field} path '{}' is not absolute",
            path.display()
        )));
    }
    if path.to_string_lossy().contains('\0') {
        return Err(RuleError::InvalidShape(format!("{field} path contains a NUL byte")));
    }
    Ok(())
}

/// `(kind, source, target)`: no two rules in a [`RuleSet`] share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    /// Directive kind.
    pub kind: RuleKind,
    /// Source path.
    pub source: PathBuf,
    /// Target path.
    pub target: Option<PathBuf>,
}

/// Per-kind rule counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleSummary {
    /// All rules.
    pub total: usize,
    /// Hide rules.
    pub hide: usize,
    /// Redirect (add) rules.
    pub redirect: usize,
    /// Merge rules.
    pub merge: usize,
    /// Inject rules.
    pub inject: usize,
}

/// Ordered snapshot of the engine's rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleSet {
    rules: Vec<Rule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unavailable: Option<String>,
}

impl RuleSet {
    /// Build a set from engine order, dropping later duplicates.
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut seen = HashSet::new();
        let rules = rules.into_iter().filter(|r| seen.insert(r.key())).collect();
        Self {
            rules,
            unavailable: None,
        }
    }

    /// Empty set standing in for a listing that could not be fetched.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            unavailable: Some(reason.into()),
        }
    }

    /// Why the listing failed, if it did.
    pub fn unavailable_reason(&self) -> Option<&str> {
        self.unavailable.as_deref()
    }

    /// Whether this set reflects a real engine listing.
    pub fn is_authoritative(&self) -> bool {
        self.unavailable.is_none()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in engine order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Rule with the given identity.
    pub fn find(&self, key: &RuleKey) -> Option<&Rule> {
        self.rules.iter().find(|r| r.kind == key.kind && r.source == key.source && r.target == key.target)
    }

    /// Rule with the given engine id.
    pub fn get(&self, id: RuleId) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == Some(id))
    }

    /// Counts per kind.
    pub fn summary(&self) -> RuleSummary {
        self.rules.iter().fold(
            RuleSummary {
                total: self.rules.len(),
                ..RuleSummary::default()
            },
            |mut acc, rule| {
                match rule.kind {
                    RuleKind::Hide => acc.hide += 1,
                    RuleKind::Add => acc.redirect += 1,
                    RuleKind::Merge => acc.merge += 1,
                    RuleKind::Inject => acc.inject += 1,
                }
                acc
            },
        )
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

/// Rule operation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// The rule violates its kind's shape. Nothing was sent.
    #[error("invalid rule: {0}")]
    InvalidShape(String),
    /// The engine refused the operation.
    #[error("engine rejected request (code {code}): {diagnostic}")]
    Rejected {
        /// Engine or exit code.
        code: i32,
        /// Engine diagnostic text.
        diagnostic: String,
    },
    /// The engine could not be reached or the tier has no engine access.
    #[error("overlay engine unreachable: {0}")]
    EngineUnreachable(String),
}

/// Engine-backed rule operations for one connection.
#[derive(Debug, Clone)]
pub struct RuleStore {
    connection: Arc<Connection>,
    executor: CommandExecutor,
}

impl RuleStore {
    /// Store bound to `connection`.
    pub fn new(connection: Arc<Connection>, executor: CommandExecutor) -> Self {
        Self {
            connection,
            executor,
        }
    }

    /// Fetch the engine's rules. Fails closed to an empty, non-authoritative set.
    pub async fn list(&self) -> RuleSet {
        match self.fetch().await {
            Ok(set) => set,
            Err(err) => {
                warn!(error = %err, "rule listing unavailable; reporting empty set");
                RuleSet::unavailable(err.to_string())
            }
        }
    }

    /// Validate and submit one rule, returning the engine-assigned id.
    ///
    /// Submitting a rule that already exists returns the existing id.
    ///
    /// # Errors
    ///
    /// [`RuleError::InvalidShape`] before any command is issued,
    /// [`RuleError::EngineUnreachable`] without engine access, or
    /// [`RuleError::Rejected`] with the engine's diagnostic.
    pub async fn add(&self, rule: Rule) -> Result<RuleId, RuleError> {
        rule.validate()?;
        self.require_engine()?;

        let nonce = Uuid::new_v4();
        let span = info_span!("rule_add", %nonce, kind = %rule.kind, source = %rule.source.display());
        async move {
            let key = rule.key();
            if let Some(id) = self.existing_id(&key).await {
                debug!(%id, "rule already active");
                return Ok(id);
            }

            let outcome = self
                .executor
                .execute(Command::AddRule {
                    kind: rule.kind,
                    source: rule.source.clone(),
                    target: rule.target.clone(),
                    flags: rule.flags,
                })
                .await;

            if outcome.success {
                if let Some(id) = outcome.value.and_then(|v| u32::try_from(v).ok()) {
                    info!(%id, "rule added");
                    return Ok(RuleId::new(id));
                }
                return self.existing_id(&key).await.ok_or_else(|| RuleError::Rejected {
                    code: outcome.status.unwrap_or(0),
                    diagnostic: "engine accepted the rule but did not report an id".to_owned(),
                });
            }

            if outcome.status == Some(EEXIST) {
                if let Some(id) = self.existing_id(&key).await {
                    debug!(%id, "engine reported duplicate; returning existing id");
                    return Ok(id);
                }
            }
            Err(failure(outcome))
        }
        .instrument(span)
        .await
    }

    /// Remove one rule by id.
    ///
    /// # Errors
    ///
    /// See [`RuleError`].
    pub async fn delete(&self, id: RuleId) -> Result<(), RuleError> {
        self.require_engine()?;
        self.run(Command::DeleteRule(id)).await
    }

    /// Remove every rule. On error the caller must re-list before trusting
    /// any earlier snapshot.
    ///
    /// # Errors
    ///
    /// See [`RuleError`].
    pub async fn clear_all(&self) -> Result<(), RuleError> {
        self.require_engine()?;
        self.run(Command::ClearRules).await?;
        info!("all rules cleared");
        Ok(())
    }

    /// Toggle engine stealth mode.
    ///
    /// # Errors
    ///
    /// See [`RuleError`].
    pub async fn set_stealth(&self, enabled: bool) -> Result<(), RuleError> {
        self.require_engine()?;
        self.run(Command::SetStealth(enabled)).await
    }

    /// Toggle engine debug logging.
    ///
    /// # Errors
    ///
    /// See [`RuleError`].
    pub async fn set_debug(&self, enabled: bool) -> Result<(), RuleError> {
        self.require_engine()?;
        self.run(Command::SetDebug(enabled)).await
    }

    /// Point the engine at a different mirror directory.
    ///
    /// # Errors
    ///
    /// See [`RuleError`].
    pub async fn set_mirror_path(&self, path: &Path) -> Result<(), RuleError> {
        check_path("mirror", path)?;
        self.require_engine()?;
        self.run(Command::SetMirrorPath(path.to_path_buf())).await
    }

    fn require_engine(&self) -> Result<(), RuleError> {
        if self.connection.allows(Capability::OVERLAY_ENGINE) {
            Ok(())
        } else {
            Err(RuleError::EngineUnreachable(format!(
                "tier {} has no overlay engine access",
                self.connection.tier
            )))
        }
    }

    async fn fetch(&self) -> Result<RuleSet, RuleError> {
        self.require_engine()?;
        let outcome = self.executor.execute(Command::ListRules).await;
        if !outcome.success {
            return Err(failure(outcome));
        }
        let rules = parse_active_rules(&outcome.text)
            .map_err(|e| RuleError::EngineUnreachable(e.to_string()))?;
        Ok(RuleSet::from_rules(rules))
    }

    async fn existing_id(&self, key: &RuleKey) -> Option<RuleId> {
        match self.fetch().await {
            Ok(set) => set.find(key).and_then(|r| r.id),
            Err(err) => {
                debug!(error = %err, "could not check for an existing rule");
                None
            }
        }
    }

    async fn run(&self, command: Command) -> Result<(), RuleError> {
        let outcome = self.executor.execute(command).await;
        if outcome.success {
            Ok(())
        } else {
            Err(failure(outcome))
        }
    }
}

/// Map a failed outcome onto the rule error taxonomy.
fn failure(outcome: Outcome) -> RuleError {
    match outcome.status {
        Some(code) => RuleError::Rejected {
            code,
            diagnostic: outcome.text,
        },
        None => RuleError::EngineUnreachable(outcome.text),
    }
}
