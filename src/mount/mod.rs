//! Mount ordering checks and repair.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::executor::CommandExecutor;
use crate::privilege::{Capability, Connection, PrivilegeTier};
use crate::rules::RuleStore;
use crate::service::Command;

/// Mount repair failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MountError {
    /// The connection has no overlay engine access. Nothing was sent.
    #[error("mount repair needs overlay engine access; connected at tier {tier}")]
    Unsupported {
        /// Tier of the connection.
        tier: PrivilegeTier,
    },
    /// The engine refused or failed the repair.
    #[error("engine rejected mount repair: {0}")]
    EngineRejected(String),
}

/// A mount whose id is lower than the one listed before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInversion {
    /// Id of the preceding mount.
    pub previous: u32,
    /// Id of this mount.
    pub id: u32,
    /// Where it is mounted.
    pub mount_point: String,
}

/// Ordering problems found in a mountinfo listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountOrderingReport {
    /// Number of mounts scanned.
    pub mounts: usize,
    /// Ids used by more than one mount.
    pub duplicates: Vec<u32>,
    /// Places where ids go backwards.
    pub inversions: Vec<MountInversion>,
}

impl MountOrderingReport {
    /// Whether ids are unique and increasing.
    pub fn is_canonical(&self) -> bool {
        self.duplicates.is_empty() && self.inversions.is_empty()
    }
}

/// Scan `/proc/<pid>/mountinfo` text for duplicated or non-monotonic ids.
/// Lines that do not start with two integers are ignored.
pub fn scan_mountinfo(text: &str) -> MountOrderingReport {
    let mut report = MountOrderingReport::default();
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    let mut previous: Option<u32> = None;

    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(id) = fields.next().and_then(|f| f.parse::<u32>().ok()) else {
            continue;
        };
        if fields.next().and_then(|f| f.parse::<u32>().ok()).is_none() {
            continue;
        }
        let mount_point = fields.nth(2).unwrap_or_default().to_owned();

        report.mounts += 1;
        if !seen.insert(id) {
            duplicates.insert(id);
        }
        if let Some(prev) = previous.filter(|prev| id < *prev) {
            report.inversions.push(MountInversion {
                previous: prev,
                id,
                mount_point,
            });
        }
        previous = Some(id);
    }

    report.duplicates = duplicates.into_iter().collect();
    report
}

/// Outcome of [`MountReconciler::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Scan before repair, when mountinfo was readable.
    pub before: Option<MountOrderingReport>,
    /// Scan after repair; `None` when no repair ran or mountinfo was unreadable.
    pub after: Option<MountOrderingReport>,
    /// Whether the engine was asked to renumber.
    pub repaired: bool,
    /// Active rule count before and after repair, when both listings succeeded.
    pub rule_counts: Option<(usize, usize)>,
}

/// Detects and repairs mount id ordering through the engine.
#[derive(Debug, Clone)]
pub struct MountReconciler {
    connection: Arc<Connection>,
    executor: CommandExecutor,
    rules: RuleStore,
    mountinfo: PathBuf,
}

impl MountReconciler {
    /// Reconciler reading mount state from `mountinfo`.
    pub fn new(
        connection: Arc<Connection>,
        executor: CommandExecutor,
        rules: RuleStore,
        mountinfo: impl Into<PathBuf>,
    ) -> Self {
        Self {
            connection,
            executor,
            rules,
            mountinfo: mountinfo.into(),
        }
    }

    /// Ask the engine to renumber mounts into a canonical sequence.
    ///
    /// # Errors
    ///
    /// [`MountError::Unsupported`] without engine access (no command is
    /// issued), [`MountError::EngineRejected`] with the engine's diagnostic.
    pub async fn fix_mount_ordering(&self) -> Result<(), MountError> {
        if !self.connection.allows(Capability::OVERLAY_ENGINE) {
            return Err(MountError::Unsupported {
                tier: self.connection.tier,
            });
        }
        let outcome = self.executor.execute(Command::FixMounts).await;
        if outcome.success {
            info!("mount ordering repaired");
            Ok(())
        } else {
            Err(MountError::EngineRejected(outcome.text))
        }
    }

    /// Scan the current mount table.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if mountinfo cannot be read.
    pub async fn check(&self) -> std::io::Result<MountOrderingReport> {
        let text = tokio::fs::read_to_string(&self.mountinfo).await?;
        Ok(scan_mountinfo(&text))
    }

    /// Scan, repair only if needed, then confirm.
    ///
    /// # Errors
    ///
    /// Same as [`fix_mount_ordering`](Self::fix_mount_ordering).
    pub async fn reconcile(&self) -> Result<ReconcileReport, MountError> {
        if !self.connection.allows(Capability::OVERLAY_ENGINE) {
            return Err(MountError::Unsupported {
                tier: self.connection.tier,
            });
        }

        let before = self.scan_logged().await;
        if before.as_ref().is_some_and(MountOrderingReport::is_canonical) {
            debug!("mount ordering already canonical");
            return Ok(ReconcileReport {
                before,
                after: None,
                repaired: false,
                rule_counts: None,
            });
        }

        let rules_before = self.rules.list().await;
        self.fix_mount_ordering().await?;
        let rules_after = self.rules.list().await;
        let after = self.scan_logged().await;

        let rule_counts = (rules_before.is_authoritative() && rules_after.is_authoritative())
            .then(|| (rules_before.len(), rules_after.len()));
        if let Some((was, now)) = rule_counts.filter(|(was, now)| was != now) {
            warn!(before = was, after = now, "active rule count changed across mount repair");
        }
        if after.as_ref().is_some_and(|a| !a.is_canonical()) {
            warn!("mount ordering still not canonical after repair");
        }

        Ok(ReconcileReport {
            before,
            after,
            repaired: true,
            rule_counts,
        })
    }

    async fn scan_logged(&self) -> Option<MountOrderingReport> {
        match self.check().await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(path = %self.mountinfo.display(), error = %err, "mountinfo unreadable");
                None
            }
        }
    }
}
